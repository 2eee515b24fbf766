//! Transport selection for holon dispatch.
//!
//! Given a holon name, decides which transport scheme to use:
//!
//! 1. A `.holonconfig` override always wins.
//! 2. A resolvable binary whose manifest declares `lang: go` (any case)
//!    gets `mem`; the dispatcher may be able to compose it in-process.
//!    Callers fall through to stdio when the composition registry has no
//!    entry for the holon.
//! 3. A resolvable binary otherwise gets `stdio`.
//! 4. Anything else is unreachable.

use thiserror::Error;

use crate::{config, resolver};

/// Errors raised by transport selection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SelectError {
    /// No override, and no binary could be resolved.
    #[error("holon not reachable")]
    NotReachable,

    /// The override file is malformed.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Selects the transport scheme for `holon_name`.
///
/// # Errors
///
/// Returns [`SelectError::NotReachable`] when the holon has neither an
/// override nor a resolvable binary, or a [`SelectError::Config`] for a
/// malformed override.
pub fn select_transport(holon_name: &str) -> Result<String, SelectError> {
    if let Some(scheme) = config::lookup_override(holon_name)? {
        return Ok(scheme);
    }

    let binary = resolver::resolve(holon_name).map_err(|_| SelectError::NotReachable)?;

    if let Ok(lang) = resolver::read_lang(holon_name, &binary) {
        if lang.eq_ignore_ascii_case("go") {
            return Ok("mem".to_string());
        }
    }

    Ok("stdio".to_string())
}
