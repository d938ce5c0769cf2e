//! CSV output formatter

use super::{kind_label, PatchFormatter};
use crate::{PatchRecord, Result};

impl PatchFormatter for super::CsvFormatter {
    fn format(&self, patches: &[PatchRecord]) -> Result<String> {
        let mut output = String::new();

        // CSV header
        output.push_str("address,kind,mnemonic,operands,encoding\n");

        for patch in patches {
            let address = format!("0x{:x}", patch.address);

            // Escape fields that might contain commas
            let mnemonic = escape_csv_field(&patch.mnemonic);
            let operands = escape_csv_field(&patch.operands);
            let encoding = patch.encoding.as_deref().unwrap_or("");

            output.push_str(&format!(
                "{},{},{},{},{}\n",
                address,
                kind_label(patch.kind),
                mnemonic,
                operands,
                encoding
            ));
        }

        Ok(output)
    }
}

/// Helper function to escape a field for CSV output
fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('\"') || field.contains('\n') {
        // Need to escape
        let escaped = field.replace('\"', "\"\"");
        format!("\"{}\"", escaped)
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::sample_patches;
    use super::super::CsvFormatter;
    use super::*;

    #[test]
    fn test_csv_formatter() {
        let result = CsvFormatter.format(&sample_patches()).unwrap();
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines[0], "address,kind,mnemonic,operands,encoding");
        assert_eq!(lines[1], "0x1020,nop,NOP,,D503201F");
        assert_eq!(lines[2], "0x101c,replace,B,0x1040,");
        // Operand text with a comma is quoted.
        assert_eq!(lines[3], "0x1040,move,STR,\"W8, [SP,#0x10]\",E80B00B9");
    }

    #[test]
    fn test_escape_csv_field() {
        assert_eq!(escape_csv_field("plain"), "plain");
        assert_eq!(escape_csv_field("a,b"), "\"a,b\"");
        assert_eq!(escape_csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
