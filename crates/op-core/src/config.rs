//! Per-invocation transport overrides.
//!
//! A `.holonconfig` file in the working directory can pin a holon to a
//! specific transport. Two equivalent YAML shapes are accepted:
//!
//! ```yaml
//! transport.who: stdio://
//! ```
//!
//! ```yaml
//! transport:
//!   who: stdio://
//! ```
//!
//! The file is read once per invocation and never cached.

use thiserror::Error;

use crate::transport;

/// Name of the override file, looked up in the working directory.
pub const CONFIG_FILE: &str = ".holonconfig";

/// The closed set of transport schemes an override may name.
pub const SUPPORTED_SCHEMES: &[&str] = &["mem", "stdio", "tcp", "unix", "ws", "wss"];

/// Errors raised while reading transport overrides.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("read {CONFIG_FILE}: {0}")]
    Read(#[source] std::io::Error),

    /// The file is not valid YAML.
    #[error("parse {CONFIG_FILE}: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The override value is empty or names an unknown scheme.
    #[error("invalid transport override {value:?}")]
    InvalidOverride {
        /// The offending value.
        value: String,
    },
}

/// Looks up the transport override for `holon_name`, returning the URI's
/// scheme when one is configured.
///
/// Keys are matched case-insensitively in both the flat
/// (`transport.<name>`) and nested (`transport: {<name>: …}`) shapes. A
/// missing file is not an error.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidOverride`] when a configured value has a
/// scheme outside [`SUPPORTED_SCHEMES`], and read/parse errors for a
/// malformed file.
pub fn lookup_override(holon_name: &str) -> Result<Option<String>, ConfigError> {
    let data = match std::fs::read_to_string(CONFIG_FILE) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ConfigError::Read(err)),
    };

    let doc: serde_yaml::Value = serde_yaml::from_str(&data)?;
    let serde_yaml::Value::Mapping(root) = doc else {
        return Ok(None);
    };

    if let Some(value) = lookup_flat_key(&root, holon_name) {
        return normalize_scheme(&value).map(Some);
    }
    if let Some(value) = lookup_nested_key(&root, holon_name) {
        return normalize_scheme(&value).map(Some);
    }
    Ok(None)
}

fn lookup_flat_key(root: &serde_yaml::Mapping, holon_name: &str) -> Option<String> {
    let wanted = format!("transport.{holon_name}");
    for (key, value) in root {
        let Some(key) = key.as_str() else { continue };
        if key.eq_ignore_ascii_case(&wanted) {
            return Some(value.as_str().unwrap_or_default().trim().to_string());
        }
    }
    None
}

fn lookup_nested_key(root: &serde_yaml::Mapping, holon_name: &str) -> Option<String> {
    let nested = root.iter().find_map(|(key, value)| {
        key.as_str()
            .filter(|k| k.eq_ignore_ascii_case("transport"))
            .map(|_| value)
    })?;
    let serde_yaml::Value::Mapping(entries) = nested else {
        return None;
    };
    for (key, value) in entries {
        let Some(key) = key.as_str() else { continue };
        if key.eq_ignore_ascii_case(holon_name) {
            return Some(value.as_str().unwrap_or_default().trim().to_string());
        }
    }
    None
}

fn normalize_scheme(value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidOverride {
            value: value.to_string(),
        });
    }

    let scheme = transport::scheme(trimmed).trim().to_lowercase();
    if !SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
        return Err(ConfigError::InvalidOverride {
            value: value.to_string(),
        });
    }
    Ok(scheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::DirGuard;

    fn with_config(contents: &str) -> (tempfile::TempDir, DirGuard) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), contents).unwrap();
        let guard = DirGuard::enter(tmp.path());
        (tmp, guard)
    }

    #[test]
    fn missing_file_is_no_override() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = DirGuard::enter(tmp.path());
        assert!(lookup_override("who").unwrap().is_none());
    }

    #[test]
    fn flat_key_override() {
        let (_tmp, _guard) = with_config("transport.who: stdio://\n");
        assert_eq!(lookup_override("who").unwrap().as_deref(), Some("stdio"));
    }

    #[test]
    fn nested_key_override() {
        let (_tmp, _guard) = with_config("transport:\n  atlas: tcp://127.0.0.1:9090\n");
        assert_eq!(lookup_override("atlas").unwrap().as_deref(), Some("tcp"));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let (_tmp, _guard) = with_config("Transport.WHO: WS://localhost:8080\n");
        assert_eq!(lookup_override("who").unwrap().as_deref(), Some("ws"));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let (_tmp, _guard) = with_config("transport.who: smoke-signal://hill\n");
        let err = lookup_override("who").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
        assert!(err.to_string().contains("smoke-signal://hill"));
    }

    #[test]
    fn empty_value_is_rejected() {
        let (_tmp, _guard) = with_config("transport.who: \"\"\n");
        let err = lookup_override("who").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn unrelated_names_are_not_overridden() {
        let (_tmp, _guard) = with_config("transport.who: stdio://\n");
        assert!(lookup_override("atlas").unwrap().is_none());
    }
}
