//! Output format module implementation

mod csv;
mod json;

pub use self::csv::*;
pub use self::json::*;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::{PatchKind, PatchRecord, Result};

/// Supported output formats for the patch list
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// JSON array (default, matches the external rewriter's input)
    Json,
    /// JSON Lines format (one patch object per line)
    JsonLines,
    /// CSV format (comma-separated values)
    Csv,
    /// Plain text listing
    Text,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Text => write!(f, "text"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            "text" => Ok(OutputFormat::Text),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[
            OutputFormat::Json,
            OutputFormat::JsonLines,
            OutputFormat::Csv,
            OutputFormat::Text,
        ]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn PatchFormatter> {
        match self {
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
            OutputFormat::Text => Box::new(TextFormatter),
        }
    }
}

/// Formatter trait for patch-list output
pub trait PatchFormatter {
    /// Format a patch list
    fn format(&self, patches: &[PatchRecord]) -> Result<String>;
}

/// Format the patch list as plain text
pub struct TextFormatter;

/// Format the patch list as a JSON array
pub struct JsonFormatter;

/// Format the patch list as JSON Lines
pub struct JsonLinesFormatter;

/// Format the patch list as CSV
pub struct CsvFormatter;

pub(crate) fn kind_label(kind: PatchKind) -> &'static str {
    match kind {
        PatchKind::Replace => "replace",
        PatchKind::Move => "move",
        PatchKind::Nop => "nop",
    }
}

impl PatchFormatter for TextFormatter {
    fn format(&self, patches: &[PatchRecord]) -> Result<String> {
        let mut output = String::new();
        output.push_str(&format!("Patch list ({} records):\n\n", patches.len()));
        for patch in patches {
            output.push_str(&format!(
                "0x{:08x}: {:<8} {:<8} {}\n",
                patch.address,
                kind_label(patch.kind),
                patch.mnemonic,
                patch.operands
            ));
        }
        Ok(output)
    }
}
