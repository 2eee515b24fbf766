//! `op discover`: enumerate local holons.
//!
//! Scans the conventional `holons/` directory first, then the whole
//! working tree, de-duplicating by UUID, and probes PATH for the known
//! holon binaries.

use std::collections::HashSet;
use std::path::Path;

use op_core::identity::{self, Identity};
use op_core::server::discover_in_path;
use serde::Serialize;

use crate::format::{render_table, Format};

#[derive(Debug, Clone, Serialize)]
struct DiscoveredHolon {
    uuid: String,
    given_name: String,
    family_name: String,
    motto: String,
    lang: String,
    clade: String,
    status: String,
    origin: String,
    relative_path: String,
}

#[derive(Debug, Serialize)]
struct DiscoverOutput {
    entries: Vec<DiscoveredHolon>,
    path_binaries: Vec<String>,
}

/// Handles `op discover`.
pub fn cmd_discover(format: Format) -> i32 {
    let output = match gather(Path::new(".")) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("op discover: {err}");
            return 1;
        }
    };

    match format {
        Format::Json => match serde_json::to_string_pretty(&output) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(err) => {
                eprintln!("op discover: {err}");
                1
            }
        },
        Format::Text => {
            println!("{}", render_text(&output));
            0
        }
    }
}

fn gather(root: &Path) -> Result<DiscoverOutput, identity::IdentityError> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    // The conventional holons folder wins on duplicates; then the whole
    // tree (standalone projects, examples) is scanned strictly.
    let conventional = root.join("holons");
    if conventional.is_dir() {
        collect(&conventional, root, &mut entries, &mut seen)?;
    }
    collect(root, root, &mut entries, &mut seen)?;

    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    Ok(DiscoverOutput {
        entries,
        path_binaries: discover_in_path(),
    })
}

fn collect(
    scan_root: &Path,
    display_root: &Path,
    entries: &mut Vec<DiscoveredHolon>,
    seen: &mut HashSet<String>,
) -> Result<(), identity::IdentityError> {
    for located in identity::find_all_with_paths(scan_root)? {
        let key = dedup_key(&located.identity, &located.path);
        if !seen.insert(key) {
            continue;
        }
        entries.push(to_entry(&located.identity, display_root, &located.path));
    }
    Ok(())
}

fn dedup_key(id: &Identity, path: &Path) -> String {
    if id.uuid.is_empty() {
        path.display().to_string()
    } else {
        id.uuid.clone()
    }
}

fn to_entry(id: &Identity, root: &Path, manifest_path: &Path) -> DiscoveredHolon {
    let dir = manifest_path.parent().unwrap_or(manifest_path);
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    DiscoveredHolon {
        uuid: id.uuid.clone(),
        given_name: id.given_name.clone(),
        family_name: id.family_name.clone(),
        motto: id.motto.clone(),
        lang: id.lang.clone(),
        clade: id.clade.clone(),
        status: id.status.clone(),
        origin: "local".to_string(),
        relative_path: relative.display().to_string(),
    }
}

fn render_text(output: &DiscoverOutput) -> String {
    let mut out = String::new();

    if !output.entries.is_empty() {
        let header = ["UUID", "NAME", "CLADE", "STATUS", "LANG", "ORIGIN", "PATH"];
        let rows: Vec<Vec<String>> = output
            .entries
            .iter()
            .map(|e| {
                vec![
                    short(&e.uuid),
                    name_of(e),
                    or_dash(&e.clade),
                    or_dash(&e.status),
                    or_dash(&e.lang),
                    or_dash(&e.origin),
                    or_dash(&e.relative_path),
                ]
            })
            .collect();
        out.push_str(&render_table(&header, &rows));
    }

    if !output.path_binaries.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str("PATH binaries:\n");
        for binary in &output.path_binaries {
            out.push_str("- ");
            out.push_str(binary);
            out.push('\n');
        }
    }

    if out.is_empty() {
        return "No holons discovered.".to_string();
    }
    out.trim_end().to_string()
}

fn name_of(entry: &DiscoveredHolon) -> String {
    let mut name = entry.given_name.trim().to_string();
    if !entry.family_name.trim().is_empty() {
        if !name.is_empty() {
            name.push(' ');
        }
        name.push_str(entry.family_name.trim());
    }
    if name.is_empty() {
        "-".to_string()
    } else {
        name
    }
}

fn short(uuid: &str) -> String {
    if uuid.is_empty() {
        "-".to_string()
    } else if uuid.len() > 8 {
        uuid[..8].to_string()
    } else {
        uuid.to_string()
    }
}

fn or_dash(value: &str) -> String {
    if value.trim().is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use op_core::identity::{write_holon_md, MANIFEST_NAME};

    fn seed(root: &Path, name: &str, lang: &str) {
        let dir = root.join("holons").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let id = Identity {
            uuid: format!("discover-test-{name}"),
            given_name: name.to_string(),
            family_name: "Holon".to_string(),
            motto: "Testing.".to_string(),
            clade: "deterministic/pure".to_string(),
            status: "draft".to_string(),
            lang: lang.to_string(),
            ..Identity::default()
        };
        write_holon_md(&id, &dir.join(MANIFEST_NAME)).unwrap();
    }

    #[test]
    fn gather_dedups_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path(), "who", "go");
        seed(tmp.path(), "atlas", "rust");

        let output = gather(tmp.path()).unwrap();
        assert_eq!(output.entries.len(), 2);
        // The double scan (holons/ then the tree) must not duplicate.
        assert_eq!(output.entries[0].given_name, "atlas");
        assert_eq!(output.entries[1].given_name, "who");
        assert_eq!(output.entries[1].relative_path, "holons/who");
        assert_eq!(output.entries[1].origin, "local");
    }

    #[test]
    fn json_shape_matches_contract() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path(), "who", "go");
        seed(tmp.path(), "atlas", "rust");

        let output = gather(tmp.path()).unwrap();
        let json = serde_json::to_string_pretty(&output).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        let entries = parsed["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(parsed.get("path_binaries").is_some());

        let who = entries
            .iter()
            .find(|e| e["given_name"] == "who")
            .expect("who entry present");
        assert_eq!(who["lang"], "go");
        assert_eq!(who["origin"], "local");
        assert_eq!(who["relative_path"], "holons/who");
    }

    #[test]
    fn text_rendering_has_lang_column_and_rows() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path(), "who", "go");
        seed(tmp.path(), "atlas", "rust");

        let output = gather(tmp.path()).unwrap();
        let text = render_text(&output);
        assert!(text.contains("LANG"), "{text}");
        assert!(text.contains("who Holon"), "{text}");
        assert!(text.contains("atlas Holon"), "{text}");
        assert!(text.contains("local"), "{text}");
    }

    #[test]
    fn empty_tree_renders_message() {
        let tmp = tempfile::tempdir().unwrap();
        let output = gather(tmp.path()).unwrap();
        if output.path_binaries.is_empty() {
            assert_eq!(render_text(&output), "No holons discovered.");
        }
        assert!(output.entries.is_empty());
    }
}
