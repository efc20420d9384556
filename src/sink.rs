use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::OutputFormat;
use crate::error::ScrapeError;
use crate::extractor::{FieldKind, Record};
use crate::target::Target;

/// On-disk shape of a JSON record.
#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    address: String,
    extracted_at: DateTime<Utc>,
    #[serde(flatten)]
    record: Record,
}

/// Persists records, one file per target.
#[derive(Debug, Clone, Copy)]
pub struct OutputSink {
    format: OutputFormat,
}

impl OutputSink {
    pub fn new(format: OutputFormat) -> Self {
        OutputSink { format }
    }

    /// A target whose output file already exists needs no work.
    pub fn should_skip(&self, target: &Target) -> bool {
        target.destination.is_file()
    }

    /// Split targets into (pending, already done).
    pub fn partition(&self, targets: Vec<Target>) -> (Vec<Target>, Vec<Target>) {
        let (skipped, pending): (Vec<_>, Vec<_>) =
            targets.into_iter().partition(|t| self.should_skip(t));
        if !skipped.is_empty() {
            info!("Skipping {} targets with existing output", skipped.len());
        }
        (pending, skipped)
    }

    /// Write the record to the target's destination.
    ///
    /// Goes through a temp file in the same directory and a rename, so the
    /// destination either holds the complete record or does not exist.
    pub fn write(&self, target: &Target, record: &Record) -> Result<(), ScrapeError> {
        let path = &target.destination;
        let fail = |e: io::Error| ScrapeError::write(path, e);

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).map_err(fail)?;

        let body = self.render(target, record).map_err(fail)?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(fail)?;
        tmp.write_all(&body).map_err(fail)?;
        tmp.as_file().sync_all().map_err(fail)?;
        tmp.persist(path).map_err(|e| fail(e.error))?;

        debug!(path = %path.display(), groups = record.len(), "record written");
        Ok(())
    }

    fn render(&self, target: &Target, record: &Record) -> io::Result<Vec<u8>> {
        match self.format {
            OutputFormat::Json => {
                let file = RecordFile {
                    address: target.address.clone(),
                    extracted_at: Utc::now(),
                    record: record.clone(),
                };
                Ok(serde_json::to_vec_pretty(&file)?)
            }
            OutputFormat::Csv => {
                let mut out = Vec::new();
                write_csv_row(&mut out, &["Label", "Value"])?;
                for group in &record.groups {
                    let label = group.label().unwrap_or("");
                    let value = match group.kind {
                        FieldKind::Label => "",
                        _ => group.value().unwrap_or(""),
                    };
                    write_csv_row(&mut out, &[label, value])?;
                }
                Ok(out)
            }
            OutputFormat::Markdown => {
                let mut out = Vec::new();
                writeln!(out, "# {}", target.address)?;
                writeln!(out)?;
                for group in &record.groups {
                    writeln!(out, "- {}", group.values.join(" | "))?;
                }
                Ok(out)
            }
        }
    }
}

fn write_csv_row<W: Write>(mut w: W, row: &[&str]) -> io::Result<()> {
    let mut first = true;
    for cell in row {
        if !first {
            write!(w, ",")?;
        }
        first = false;
        if cell.contains([',', '"', '\n', '\r']) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            write!(w, "{}", cell)?;
        }
    }
    writeln!(w)
}

// ── Tests ──
