//! JSON and JSON Lines output formatters

use serde::{Deserialize, Serialize};

use super::{kind_label, PatchFormatter};
use crate::{PatchRecord, Result};

/// Serializable patch record for JSON output
#[derive(Serialize, Deserialize)]
struct PatchJson {
    /// Address to overwrite
    address: String,
    /// Patch kind ("replace", "move", or "nop")
    kind: String,
    /// Mnemonic to assemble at the address
    mnemonic: String,
    /// Operand text
    operands: String,
    /// Known encoding hex, when the bytes are already determined
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding: Option<String>,
}

fn patch_to_json(patch: &PatchRecord) -> PatchJson {
    PatchJson {
        address: format!("0x{:x}", patch.address),
        kind: kind_label(patch.kind).to_string(),
        mnemonic: patch.mnemonic.clone(),
        operands: patch.operands.clone(),
        encoding: patch.encoding.clone(),
    }
}

impl PatchFormatter for super::JsonFormatter {
    fn format(&self, patches: &[PatchRecord]) -> Result<String> {
        let records: Vec<PatchJson> = patches.iter().map(patch_to_json).collect();
        Ok(serde_json::to_string_pretty(&records)?)
    }
}

impl PatchFormatter for super::JsonLinesFormatter {
    fn format(&self, patches: &[PatchRecord]) -> Result<String> {
        let mut output = String::new();
        for patch in patches {
            output.push_str(&serde_json::to_string(&patch_to_json(patch))?);
            output.push('\n');
        }
        Ok(output)
    }
}
