//! Holon identity manifests.
//!
//! Every holon carries a `HOLON.md` file whose YAML front-matter records
//! its identity: UUID, names, clade, status, implementation language,
//! aliases, and pinned build metadata. This module parses and writes the
//! front-matter and scans directory trees for manifests.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The manifest file name every holon directory carries.
pub const MANIFEST_NAME: &str = "HOLON.md";

/// Errors raised by manifest parsing and lookup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// The file does not start with a `---` front-matter fence.
    #[error("missing front-matter in {path}")]
    MissingFrontmatter {
        /// Offending file path.
        path: String,
    },

    /// The YAML between the fences could not be parsed.
    #[error("parse front-matter: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem failure while reading or writing a manifest.
    #[error("manifest I/O: {0}")]
    Io(#[from] std::io::Error),

    /// No manifest matched the requested UUID.
    #[error("identity {uuid} not found under {root}")]
    NotFound {
        /// The UUID that was looked up.
        uuid: String,
        /// The root that was scanned.
        root: String,
    },
}

/// A holon identity record, mirroring the HOLON.md front-matter fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub uuid: String,
    pub given_name: String,
    pub family_name: String,
    pub motto: String,
    pub composer: String,
    pub clade: String,
    pub status: String,
    pub born: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reproduction: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub binary_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub binary_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub git_tag: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub git_commit: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub wrapped_license: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub generated_by: String,
    pub lang: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proto_status: String,
}

impl Identity {
    /// Creates a fresh identity with a random UUID and draft status.
    #[must_use]
    pub fn new() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            status: "draft".to_string(),
            born: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            ..Self::default()
        }
    }

    /// `given-family` slug used for directory naming and alias matching.
    #[must_use]
    pub fn slug(&self) -> String {
        let family = self.family_name.trim_end_matches('?');
        format!("{} {family}", self.given_name)
            .trim()
            .to_lowercase()
            .replace(' ', "-")
    }

    /// Returns true when `name` matches an alias, the given name, or the
    /// slug (all case-insensitive).
    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        let target = name.trim().to_lowercase();
        if target.is_empty() {
            return false;
        }
        if self
            .aliases
            .iter()
            .any(|a| a.trim().eq_ignore_ascii_case(&target))
        {
            return true;
        }
        if self.given_name.trim().to_lowercase() == target {
            return true;
        }
        self.slug() == target
    }
}

/// An identity together with the manifest path it was parsed from.
#[derive(Debug, Clone)]
pub struct LocatedIdentity {
    /// The parsed identity.
    pub identity: Identity,
    /// Path of the HOLON.md file.
    pub path: PathBuf,
}

/// Splits a manifest into its front-matter identity and the markdown body.
///
/// # Errors
///
/// Returns [`IdentityError::MissingFrontmatter`] when the `---` fences are
/// absent, or [`IdentityError::Yaml`] when the front-matter is not valid
/// YAML.
pub fn parse_frontmatter(data: &str) -> Result<(Identity, String), IdentityError> {
    let rest = data.strip_prefix("---\n").ok_or_else(|| {
        IdentityError::MissingFrontmatter {
            path: "<input>".to_string(),
        }
    })?;
    let (front, body) =
        rest.split_once("\n---")
            .ok_or_else(|| IdentityError::MissingFrontmatter {
                path: "<input>".to_string(),
            })?;
    let identity: Identity = serde_yaml::from_str(front)?;
    Ok((identity, body.trim_start_matches('\n').to_string()))
}

/// Writes `identity` as a HOLON.md file at `path`, preserving nothing of
/// any previous body.
///
/// # Errors
///
/// Returns an error when serialisation or the file write fails.
pub fn write_holon_md(identity: &Identity, path: &Path) -> Result<(), IdentityError> {
    let front = serde_yaml::to_string(identity)?;
    let mut out = String::with_capacity(front.len() + 64);
    out.push_str("---\n");
    out.push_str(&front);
    out.push_str("---\n\n");
    let _ = writeln!(
        out,
        "# {} {}",
        identity.given_name.trim(),
        identity.family_name.trim()
    );
    if !identity.motto.is_empty() {
        let _ = writeln!(out, "\n{}", identity.motto);
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Reads and parses the manifest at `path`.
///
/// # Errors
///
/// Propagates I/O and parse failures.
pub fn read_manifest(path: &Path) -> Result<Identity, IdentityError> {
    let data = std::fs::read_to_string(path)?;
    let (identity, _) = parse_frontmatter(&data)?;
    Ok(identity)
}

/// Scans `root` recursively for HOLON.md manifests. Unreadable or
/// malformed manifests are skipped. Results are sorted by path.
///
/// # Errors
///
/// Returns an error only when `root` itself cannot be walked.
pub fn find_all_with_paths(root: &Path) -> Result<Vec<LocatedIdentity>, IdentityError> {
    if !root.exists() {
        return Err(IdentityError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", root.display()),
        )));
    }

    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() || entry.file_name() != MANIFEST_NAME {
            continue;
        }
        match read_manifest(entry.path()) {
            Ok(identity) => out.push(LocatedIdentity {
                identity,
                path: entry.path().to_path_buf(),
            }),
            Err(err) => {
                tracing::debug!(path = %entry.path().display(), %err, "skipping manifest");
            }
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

/// Scans `root` for manifests, returning identities only.
///
/// # Errors
///
/// See [`find_all_with_paths`].
pub fn find_all(root: &Path) -> Result<Vec<Identity>, IdentityError> {
    Ok(find_all_with_paths(root)?
        .into_iter()
        .map(|l| l.identity)
        .collect())
}

/// Finds the manifest path for the identity with the given UUID.
///
/// # Errors
///
/// Returns [`IdentityError::NotFound`] when no manifest under `root`
/// carries the UUID.
pub fn find_by_uuid(root: &Path, uuid: &str) -> Result<PathBuf, IdentityError> {
    for located in find_all_with_paths(root)? {
        if located.identity.uuid == uuid {
            return Ok(located.path);
        }
    }
    Err(IdentityError::NotFound {
        uuid: uuid.to_string(),
        root: root.display().to_string(),
    })
}
