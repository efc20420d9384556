use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::OutputFormat;
use crate::error::ScrapeError;

/// One unit of work: where to fetch and where the record goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: String,
    pub destination: PathBuf,
}

impl Target {
    pub fn new(address: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Target {
            address: address.into(),
            destination: destination.into(),
        }
    }
}

/// Build targets from a directory of JSON descriptor files.
///
/// Each `*.json` file must carry the page address at `pointer`. The output
/// for `foo.json` lands at `<output_dir>/foo.json.<ext>`. Unreadable
/// descriptors are logged and skipped; files are visited in name order.
pub fn load_targets(
    dir: &Path,
    output_dir: &Path,
    pointer: &str,
    format: OutputFormat,
) -> Result<Vec<Target>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read descriptor directory {}", dir.display()))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut targets = Vec::with_capacity(paths.len());
    for path in &paths {
        match read_descriptor(path, pointer) {
            Ok(address) => {
                let Some(name) = path.file_name() else { continue };
                let file_name = format!("{}.{}", name.to_string_lossy(), format.extension());
                targets.push(Target::new(address, output_dir.join(file_name)));
            }
            Err(e) => error!("{}", e),
        }
    }

    info!(
        "Loaded {} targets from {} descriptors in {}",
        targets.len(),
        paths.len(),
        dir.display()
    );
    Ok(targets)
}

fn read_descriptor(path: &Path, pointer: &str) -> Result<String, ScrapeError> {
    let bad = |reason: String| ScrapeError::Descriptor {
        path: path.to_path_buf(),
        reason,
    };

    let raw = std::fs::read_to_string(path).map_err(|e| bad(e.to_string()))?;
    let doc: serde_json::Value = serde_json::from_str(&raw).map_err(|e| bad(e.to_string()))?;

    doc.pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| bad(format!("no address at {}", pointer)))
}

// ── Tests ──
