//! Holon name resolution.
//!
//! Maps a short user-facing holon name (`who`, `atlas`) to the binary
//! that implements it and to the implementation language declared in its
//! manifest. Binaries are searched in the conventional sibling directories
//! first, then on PATH.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::identity;

/// Errors raised during holon resolution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// No binary was found in any search location.
    #[error("holon {name:?} not found")]
    NotFound {
        /// The holon name that was looked up.
        name: String,
    },

    /// No manifest declared a language for the holon.
    #[error("holon metadata not found")]
    MetadataNotFound,
}

/// Known short-name → binary-name aliases. Names not listed pass through
/// unchanged.
const ALIASES: &[(&str, &str)] = &[("who", "who"), ("atlas", "atlas"), ("translate", "translate")];

/// The sibling-directory prefixes tried, in order, before PATH.
const DIR_PREFIXES: &[&str] = &["", "sophia-", "rhizome-", "babel-fish-"];

fn binary_name(name: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map_or(name, |(_, bin)| *bin)
}

/// Finds a holon binary by name.
///
/// Search order: `holons/<name>/<bin>`, `holons/sophia-<name>/<bin>`,
/// `holons/rhizome-<name>/<bin>`, `holons/babel-fish-<name>/<bin>`, then
/// the executable search path.
///
/// # Errors
///
/// Returns [`ResolveError::NotFound`] when no candidate exists.
pub fn resolve(name: &str) -> Result<PathBuf, ResolveError> {
    let bin = binary_name(name);

    for prefix in DIR_PREFIXES {
        let candidate = Path::new("holons").join(format!("{prefix}{name}")).join(bin);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    if let Ok(path) = which::which(bin) {
        return Ok(path);
    }

    Err(ResolveError::NotFound {
        name: name.to_string(),
    })
}

/// Reads the declared implementation language for a holon.
///
/// Tries the conventional manifest locations first (the sibling holon
/// directories, the binary's own directory, and one level above it), then
/// falls back to a scan of `holons/` matched by alias, given name, or
/// slug.
///
/// # Errors
///
/// Returns [`ResolveError::MetadataNotFound`] when no manifest declares a
/// language.
pub fn read_lang(name: &str, binary_path: &Path) -> Result<String, ResolveError> {
    for candidate in manifest_candidates(name, binary_path) {
        let Ok(id) = identity::read_manifest(&candidate) else {
            continue;
        };
        if !id.lang.is_empty() {
            return Ok(id.lang);
        }
    }

    let located = identity::find_all_with_paths(Path::new("holons"))
        .map_err(|_| ResolveError::MetadataNotFound)?;
    for l in located {
        if l.identity.matches_name(name) && !l.identity.lang.is_empty() {
            return Ok(l.identity.lang);
        }
    }

    Err(ResolveError::MetadataNotFound)
}

fn manifest_candidates(name: &str, binary_path: &Path) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = DIR_PREFIXES
        .iter()
        .map(|prefix| {
            Path::new("holons")
                .join(format!("{prefix}{name}"))
                .join(identity::MANIFEST_NAME)
        })
        .collect();

    if let Some(dir) = binary_path.parent() {
        candidates.push(dir.join(identity::MANIFEST_NAME));
        if let Some(above) = dir.parent() {
            candidates.push(above.join(identity::MANIFEST_NAME));
        }
    }

    candidates.dedup();
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{write_holon_md, Identity, MANIFEST_NAME};
    use crate::testutil::DirGuard;

    fn seed_binary(root: &Path, dir_name: &str, bin_name: &str) -> PathBuf {
        let dir = root.join("holons").join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(bin_name);
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn seed_manifest(root: &Path, dir_name: &str, name: &str, lang: &str) {
        let dir = root.join("holons").join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        let id = Identity {
            uuid: format!("test-{name}"),
            given_name: name.to_string(),
            family_name: "Holon".to_string(),
            aliases: vec![name.to_string()],
            lang: lang.to_string(),
            ..Identity::default()
        };
        write_holon_md(&id, &dir.join(MANIFEST_NAME)).unwrap();
    }

    #[test]
    fn resolve_prefers_plain_sibling_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());

        seed_binary(tmp.path(), "sophia-who", "who");
        seed_binary(tmp.path(), "who", "who");

        let resolved = resolve("who").unwrap();
        assert_eq!(resolved, Path::new("holons/who/who"));
    }

    #[test]
    fn resolve_falls_back_to_prefixed_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());

        seed_binary(tmp.path(), "sophia-who", "who");
        let resolved = resolve("who").unwrap();
        assert!(resolved.ends_with("sophia-who/who"), "{resolved:?}");
    }

    #[test]
    fn resolve_unknown_holon_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());

        let err = resolve("definitely-not-a-holon-xyz").unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
        assert!(err.to_string().contains("definitely-not-a-holon-xyz"));
    }

    #[test]
    fn read_lang_from_holon_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());

        let binary = seed_binary(tmp.path(), "alpha", "alpha");
        seed_manifest(tmp.path(), "alpha", "alpha", "go");

        let lang = read_lang("alpha", &binary).unwrap();
        assert_eq!(lang, "go");
    }

    #[test]
    fn read_lang_falls_back_to_tree_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());

        // Manifest lives in an unconventional directory; only the scan
        // plus alias matching can find it.
        let binary = seed_binary(tmp.path(), "beta", "beta");
        seed_manifest(tmp.path(), "some-project", "beta", "rust");

        let lang = read_lang("beta", &binary).unwrap();
        assert_eq!(lang, "rust");
    }

    #[test]
    fn read_lang_missing_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());

        let binary = seed_binary(tmp.path(), "gamma", "gamma");
        let err = read_lang("gamma", &binary).unwrap_err();
        assert_eq!(err.to_string(), "holon metadata not found");
    }
}
