//! Ingestion of the disassembler's CFG export.
//!
//! The input is an IDA-style JSON description of one function: blocks
//! with start addresses, successor links, and textual instructions. This
//! module is a thin external-collaborator surface; everything after the
//! conversion into [`Function`] works on the core model only.

use std::path::Path;

use serde::Deserialize;

use crate::{Address, Block, DeflattenError, Function, Instruction, Result};

/// Raw instruction as exported by the disassembler.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInstruction {
    /// Textual address, e.g. `0x181fb0`.
    pub address: String,
    /// Mnemonic text.
    pub mnemonic: String,
    /// Single operand string.
    #[serde(default)]
    pub operands: String,
    /// Machine-code hex of the original encoding.
    pub machine_code: String,
}

/// Raw basic block as exported by the disassembler.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBlock {
    /// Textual start address.
    pub start_address: String,
    /// Successor addresses.
    #[serde(default)]
    pub links: Vec<String>,
    /// Instructions in program order.
    pub instructions: Vec<RawInstruction>,
}

/// Top-level CFG export for one function.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCfg {
    /// Function name, if the exporter recorded one.
    #[serde(default)]
    pub function: Option<String>,
    /// The blocks.
    pub cfg: Vec<RawBlock>,
}

/// Parse a textual address (`0x`-prefixed or bare hex).
pub fn parse_address(text: &str) -> Result<Address> {
    let digits = text
        .trim()
        .strip_prefix("0x")
        .or_else(|| text.trim().strip_prefix("0X"))
        .unwrap_or_else(|| text.trim());
    Address::from_str_radix(digits, 16)
        .map_err(|_| DeflattenError::Format(format!("malformed address {text:?}")))
}

/// Parse a CFG export into the core model.
pub fn load_function(json: &str) -> Result<Function> {
    let raw: RawCfg = serde_json::from_str(json)?;
    if let Some(name) = &raw.function {
        log::info!("loaded CFG for {name} with {} blocks", raw.cfg.len());
    }
    let mut blocks = Vec::with_capacity(raw.cfg.len());
    for raw_block in raw.cfg {
        let start = parse_address(&raw_block.start_address)?;
        let links = raw_block
            .links
            .iter()
            .map(|l| parse_address(l))
            .collect::<Result<Vec<Address>>>()?;
        let instructions = raw_block
            .instructions
            .into_iter()
            .map(|ins| {
                Instruction::new(
                    parse_address(&ins.address)?,
                    ins.mnemonic,
                    ins.operands,
                    ins.machine_code,
                )
            })
            .collect::<Result<Vec<Instruction>>>()?;
        blocks.push(Block::new(start, instructions, links));
    }
    Function::from_blocks(blocks)
}

/// Read and parse a CFG export from disk.
pub fn read_function(path: &Path) -> Result<Function> {
    let json = std::fs::read_to_string(path)?;
    load_function(&json)
}
