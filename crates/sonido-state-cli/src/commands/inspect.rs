//! Saved state inspection command.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use serde_json::Value;
use sonido_state::{FORMAT_VERSION, StateDocument};

#[derive(Args)]
pub struct InspectArgs {
    /// Saved state file (JSON)
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Print the document as indented JSON instead of a table
    #[arg(long)]
    json: bool,
}

pub fn run(args: InspectArgs) -> anyhow::Result<()> {
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let doc = StateDocument::from_slice(&bytes)
        .with_context(|| format!("{} is not a state document", args.file.display()))?;

    tracing::debug!(path = %args.file.display(), bytes = bytes.len(), "state document read");

    if args.json {
        println!("{}", doc.to_string_pretty()?);
    } else {
        print!("{}", render(&doc));
    }
    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "group",
    }
}

/// Human-readable summary of a state document.
fn render(doc: &StateDocument) -> String {
    let mut out = String::new();
    let layout = if doc.is_legacy() {
        " (legacy flat layout)"
    } else if doc.format_version > FORMAT_VERSION {
        " (newer than this tool)"
    } else {
        ""
    };
    let leaves = doc.leaves();

    let _ = writeln!(out, "Format:      {}{layout}", doc.format_version);
    let _ = writeln!(
        out,
        "App version: {}",
        doc.app_version.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(out, "Entries:     {}", leaves.len());
    let _ = writeln!(out);

    let width = leaves
        .iter()
        .map(|(path, _)| path.len())
        .max()
        .unwrap_or(0)
        .max(3);
    let _ = writeln!(out, "  {:width$}  {:8}  {}", "Key", "Type", "Value");
    let _ = writeln!(out, "  {:width$}  {:8}  {}", "---", "----", "-----");
    for (path, value) in leaves {
        let _ = writeln!(out, "  {path:width$}  {:8}  {value}", kind(value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn render_lists_nested_leaves() {
        let doc = StateDocument::from_slice(
            br#"{"format_version":1,"app_version":"1.2.0","tree":{"gain":-6.0,"tone":{"mode":2},"name":"Lead"}}"#,
        )
        .unwrap();
        let text = render(&doc);

        assert!(text.contains("Format:      1\n"));
        assert!(text.contains("App version: 1.2.0"));
        assert!(text.contains("Entries:     3"));
        assert!(text.contains("tone.mode"));
        assert!(text.contains("integer"));
        assert!(text.contains("\"Lead\""));
    }

    #[test]
    fn render_flags_legacy_layout() {
        let doc = StateDocument::from_slice(br#"{"gain":1.0}"#).unwrap();
        assert!(render(&doc).contains("legacy flat layout"));
    }

    #[test]
    fn run_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, br#"{"format_version":1,"tree":{"gain":0.0}}"#).unwrap();

        run(InspectArgs {
            file: path,
            json: true,
        })
        .unwrap();
    }

    #[test]
    fn run_rejects_non_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"[]").unwrap();

        let err = run(InspectArgs {
            file: path,
            json: false,
        })
        .unwrap_err();
        assert!(err.to_string().contains("is not a state document"));
    }
}
