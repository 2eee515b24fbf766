//! CLI output rendering.
//!
//! RPC responses arrive as proto-JSON text. In `json` format the payload
//! is pretty-printed unchanged; in `text` format the handful of response
//! shapes known ahead of time render as tables or field lists, and
//! everything else falls back to pretty JSON. Pretty-printing failures
//! are silent: the raw payload is already correct.

use std::fmt::Write as _;

use op_core::proto::op::v1 as pb;

use crate::client::canonical_method_name;
use crate::proto_json;

/// How to display an RPC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Human tables and field lists for known shapes.
    #[default]
    Text,
    /// Pretty JSON, verbatim payload.
    Json,
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("invalid format {other:?} (expected text or json)")),
        }
    }
}

/// Formats one RPC response payload for the terminal.
#[must_use]
pub fn format_rpc_output(format: Format, method: &str, payload: &str) -> String {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if format == Format::Json {
        return normalize_json(trimmed);
    }

    match canonical_method_name(method) {
        "CreateIdentity" => {
            match proto_json::unmarshal::<pb::CreateIdentityResponse>(
                "op.v1.CreateIdentityResponse",
                trimmed,
            ) {
                Ok(resp) => format_create_identity(&resp),
                Err(_) => normalize_json(trimmed),
            }
        }
        "ListIdentities" => {
            match proto_json::unmarshal::<pb::ListIdentitiesResponse>(
                "op.v1.ListIdentitiesResponse",
                trimmed,
            ) {
                Ok(resp) => format_list_identities(&resp),
                Err(_) => normalize_json(trimmed),
            }
        }
        "ShowIdentity" => {
            match proto_json::unmarshal::<pb::ShowIdentityResponse>(
                "op.v1.ShowIdentityResponse",
                trimmed,
            ) {
                Ok(resp) => format_show_identity(&resp),
                Err(_) => normalize_json(trimmed),
            }
        }
        "PinVersion" => {
            match proto_json::unmarshal::<pb::PinVersionResponse>(
                "op.v1.PinVersionResponse",
                trimmed,
            ) {
                Ok(resp) => format_pin_version(&resp),
                Err(_) => normalize_json(trimmed),
            }
        }
        "Discover" => {
            match proto_json::unmarshal::<pb::DiscoverResponse>("op.v1.DiscoverResponse", trimmed)
            {
                Ok(resp) => format_discover(&resp),
                Err(_) => normalize_json(trimmed),
            }
        }
        _ => normalize_json(trimmed),
    }
}

/// Pretty-prints JSON with two-space indent; returns the input unchanged
/// when it does not parse.
#[must_use]
pub fn normalize_json(value: &str) -> String {
    serde_json::from_str::<serde_json::Value>(value)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| value.to_string())
}

fn format_create_identity(resp: &pb::CreateIdentityResponse) -> String {
    let mut out = String::from("Identity created\n");
    if !resp.file_path.is_empty() {
        let _ = writeln!(out, "File: {}", resp.file_path);
    }
    out.push_str(&identity_table(resp.identity.as_ref()));
    out.trim_end().to_string()
}

fn format_show_identity(resp: &pb::ShowIdentityResponse) -> String {
    let mut out = String::new();
    if !resp.file_path.is_empty() {
        let _ = writeln!(out, "File: {}", resp.file_path);
    }
    out.push_str(&identity_table(resp.identity.as_ref()));
    if !resp.raw_content.is_empty() {
        let _ = write!(out, "Raw content bytes: {}", resp.raw_content.len());
    }
    out.trim_end().to_string()
}

fn format_pin_version(resp: &pb::PinVersionResponse) -> String {
    let mut out = String::from("Version pinned\n");
    out.push_str(&identity_table(resp.identity.as_ref()));
    out.trim_end().to_string()
}

fn format_list_identities(resp: &pb::ListIdentitiesResponse) -> String {
    if resp.entries.is_empty() {
        return "No identities found.".to_string();
    }

    let header = ["UUID", "NAME", "CLADE", "STATUS", "LANG", "ORIGIN", "PATH"];
    let rows: Vec<Vec<String>> = resp
        .entries
        .iter()
        .map(|entry| {
            let id = entry.identity.clone().unwrap_or_default();
            vec![
                short_uuid(&id.uuid),
                display_name(&id),
                dash(&id.clade),
                dash(&id.status),
                dash(&id.lang),
                dash(&entry.origin),
                dash(&entry.relative_path),
            ]
        })
        .collect();
    render_table(&header, &rows)
}

fn format_discover(resp: &pb::DiscoverResponse) -> String {
    let mut out = String::new();

    if !resp.entries.is_empty() {
        let header = ["UUID", "NAME", "CLADE", "STATUS", "LANG", "ORIGIN"];
        let rows: Vec<Vec<String>> = resp
            .entries
            .iter()
            .map(|entry| {
                let id = entry.identity.clone().unwrap_or_default();
                vec![
                    short_uuid(&id.uuid),
                    display_name(&id),
                    dash(&id.clade),
                    dash(&id.status),
                    dash(&id.lang),
                    dash(&entry.origin),
                ]
            })
            .collect();
        out.push_str(&render_table(&header, &rows));
    }

    if !resp.path_binaries.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str("PATH binaries:\n");
        for binary in &resp.path_binaries {
            let _ = writeln!(out, "- {binary}");
        }
    }

    if out.is_empty() {
        return "No holons discovered.".to_string();
    }
    out.trim_end().to_string()
}

fn identity_table(id: Option<&pb::HolonIdentity>) -> String {
    let Some(id) = id else {
        return String::new();
    };

    let mut rows = vec![
        vec!["UUID".to_string(), dash(&id.uuid)],
        vec!["Name".to_string(), display_name(id)],
        vec!["Clade".to_string(), dash(&id.clade)],
        vec!["Status".to_string(), dash(&id.status)],
        vec!["Lang".to_string(), dash(&id.lang)],
    ];
    if !id.aliases.is_empty() {
        rows.push(vec!["Aliases".to_string(), id.aliases.join(", ")]);
    }
    let mut table = render_table(&["FIELD", "VALUE"], &rows);
    table.push('\n');
    table
}

fn display_name(id: &pb::HolonIdentity) -> String {
    let mut parts = Vec::with_capacity(2);
    if !id.given_name.trim().is_empty() {
        parts.push(id.given_name.trim());
    }
    if !id.family_name.trim().is_empty() {
        parts.push(id.family_name.trim());
    }
    if parts.is_empty() {
        return "-".to_string();
    }
    parts.join(" ")
}

fn short_uuid(uuid: &str) -> String {
    if uuid.is_empty() {
        "-".to_string()
    } else if uuid.len() > 8 {
        uuid[..8].to_string()
    } else {
        uuid.to_string()
    }
}

fn dash(value: &str) -> String {
    if value.trim().is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

/// Column-aligned rendering with a two-space gutter.
pub fn render_table(header: &[&str], rows: &[Vec<String>]) -> String {
    let columns = header.len();
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().take(columns).enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    let render_row = |out: &mut String, cells: &[String]| {
        let mut line = String::new();
        for (i, cell) in cells.iter().take(columns).enumerate() {
            if i + 1 == columns {
                line.push_str(cell);
            } else {
                let _ = write!(line, "{cell:<width$}  ", width = widths[i]);
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    };

    let header_cells: Vec<String> = header.iter().map(|h| (*h).to_string()).collect();
    render_row(&mut out, &header_cells);
    for row in rows {
        render_row(&mut out, row);
    }
    out.trim_end().to_string()
}
