//! Shared helpers for tests that touch the process working directory.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

// The working directory is process-global; tests that chdir must not
// overlap.
fn cwd_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Holds the cwd lock and restores the previous working directory on
/// drop.
pub struct DirGuard {
    previous: PathBuf,
    _lock: MutexGuard<'static, ()>,
}

impl DirGuard {
    /// Locks out other chdir-ing tests and enters `dir`.
    pub fn enter(dir: &Path) -> Self {
        let lock = match cwd_lock().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.previous);
    }
}
