//! Core IR, traits, and dispatch for the deflatten engine.
//!
//! This library reverses control-flow flattening on a single AArch64
//! function. The input is a per-function CFG exported by a disassembler
//! (blocks, successor links, textual instructions); the output is a flat
//! list of patch records an external binary rewriter applies to restore
//! direct control flow.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use deflatten::{classify::Strategy, parser, Config};
//!
//! let json = std::fs::read_to_string("cfg_output_0x181fb0.json").unwrap();
//! let function = parser::load_function(&json).unwrap();
//!
//! let patches = deflatten::deflatten(function, Strategy::Smart, Config::default()).unwrap();
//! for patch in &patches {
//!     println!("{:#x}: {} {}", patch.address, patch.mnemonic, patch.operands);
//! }
//! ```

pub mod classify;
pub mod decode;
pub mod format;
pub mod parser;
pub mod patch;
pub mod regs;
pub mod simulation;

mod flow_tests;

use std::collections::BTreeMap;
use std::fmt;

use decode::{Opcode, Operand};

/// Represents an address in memory
pub type Address = u64;

/// Machine-code hex of the AArch64 NOP, used for no-op patches.
pub const NOP_ENCODING: &str = "D503201F";

/// Error type for deflattening operations
#[derive(Debug, thiserror::Error)]
pub enum DeflattenError {
    /// Malformed address, immediate, or label text
    #[error("format error: {0}")]
    Format(String),

    /// Register or block address not found
    #[error("lookup error: {0}")]
    Lookup(String),

    /// An instruction kind the simulator has no semantics for
    #[error("unsupported opcode in dispatcher: {0}")]
    UnsupportedOpcode(String),

    /// No entry/dispatcher found, or a contradictory fix was computed
    #[error("classification error: {0}")]
    Classification(String),

    /// A branch target outside the declared link set, or an exhausted shape
    #[error("structural error: {0}")]
    Structural(String),

    /// A register value of the wrong kind for the requested read
    #[error("type error: {0}")]
    Type(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DeflattenError>;

/// Engine configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// Assume a single dispatcher instead of searching for nested or
    /// child dispatchers.
    pub single_dispatcher: bool,
}

/// A pending rewrite attached to an instruction.
///
/// Write-once: deriving two different fixes for the same instruction
/// means the resolution produced contradictory patches, which is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fix {
    /// Replace the instruction with new mnemonic + operand text.
    Replace {
        /// Replacement mnemonic.
        mnemonic: String,
        /// Replacement operand text.
        operands: String,
    },
    /// Overwrite the instruction with a NOP.
    Nop,
}

/// One decoded instruction as the disassembler printed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Absolute address. Mutated only by the patch synthesizer when
    /// instructions are reordered.
    pub address: Address,
    /// Mnemonic text, e.g. `MOV` or `B.EQ`.
    pub mnemonic: String,
    /// Raw operand text, e.g. `W8, #0x61ED373E`.
    pub operands_str: String,
    /// Original machine-code hex; its length determines the byte size.
    pub machine_code: String,
    operands: Vec<Operand>,
    fix: Option<Fix>,
    moved: bool,
}

impl Instruction {
    /// Build an instruction, classifying its operands once up front.
    pub fn new(
        address: Address,
        mnemonic: impl Into<String>,
        operands_str: impl Into<String>,
        machine_code: impl Into<String>,
    ) -> Result<Self> {
        let operands_str = operands_str.into();
        let operands = decode::parse_operands(&operands_str)?;
        Ok(Instruction {
            address,
            mnemonic: mnemonic.into(),
            operands_str,
            machine_code: machine_code.into(),
            operands,
            fix: None,
            moved: false,
        })
    }

    /// A filler NOP, already fixed, for padding double-width rewrites.
    pub fn nop(address: Address) -> Self {
        Instruction {
            address,
            mnemonic: "NOP".to_string(),
            operands_str: String::new(),
            machine_code: NOP_ENCODING.to_string(),
            operands: Vec::new(),
            fix: Some(Fix::Nop),
            moved: false,
        }
    }

    /// Opcode for this instruction's mnemonic.
    pub fn opcode(&self) -> Opcode {
        Opcode::from_mnemonic(&self.mnemonic)
    }

    /// The operand array classified at construction.
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    /// Byte size derived from the machine-code hex length. IDA merges
    /// MOV/MOVK pairs into one 8-byte pseudo-instruction.
    pub fn size(&self) -> usize {
        self.machine_code.len() / 2
    }

    /// Target of a pc-relative branch operand.
    pub fn branch_target(&self) -> Result<Address> {
        match self.operands.first() {
            Some(Operand::PcRelative(addr)) => Ok(*addr),
            _ => Err(DeflattenError::Format(format!(
                "instruction at {:#x} has no pc-relative target: {self}",
                self.address
            ))),
        }
    }

    /// Attach a fix, failing loudly on a contradictory second write.
    pub fn set_fix(&mut self, fix: Fix) -> Result<()> {
        match &self.fix {
            None => {
                self.fix = Some(fix);
                Ok(())
            }
            Some(existing) if *existing == fix => Ok(()),
            Some(existing) => Err(DeflattenError::Classification(format!(
                "contradictory fix for instruction at {:#x}: {existing:?} vs {fix:?}",
                self.address
            ))),
        }
    }

    /// The fix attached to this instruction, if any.
    pub fn fix(&self) -> Option<&Fix> {
        self.fix.as_ref()
    }

    /// Mark this instruction as relocated to a new address.
    pub(crate) fn mark_moved(&mut self) {
        self.moved = true;
    }

    /// True when the instruction was relocated by a list edit.
    pub fn is_moved(&self) -> bool {
        self.moved
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.mnemonic, self.operands_str)
    }
}

/// Resolution progress marker for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Resolve {
    /// Not reached yet.
    #[default]
    Unvisited,
    /// Children are being computed; revisits return what exists so far.
    InProgress,
    /// Children are final.
    Resolved,
}

/// One basic block of the input CFG.
#[derive(Debug, Clone)]
pub struct Block {
    /// Starting address of the block.
    pub start: Address,
    /// Instructions in program order. The patch synthesizer may insert,
    /// remove, and reorder entries.
    pub instructions: Vec<Instruction>,
    /// Successor addresses as declared by the input graph.
    pub links: Vec<Address>,
    pub(crate) resolve: Resolve,
    pub(crate) real_children: Vec<Address>,
    pub(crate) select: Option<Address>,
    pub(crate) fixed: bool,
}

impl Block {
    /// Create a block from its input-graph description.
    pub fn new(start: Address, instructions: Vec<Instruction>, links: Vec<Address>) -> Self {
        Block {
            start,
            instructions,
            links,
            resolve: Resolve::default(),
            real_children: Vec::new(),
            select: None,
            fixed: false,
        }
    }

    /// Get the last instruction in the block
    pub fn last_instruction(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// The resolved true successors (at most 2), set during simulation.
    pub fn real_children(&self) -> &[Address] {
        &self.real_children
    }

    /// Address of the flattening conditional select driving this block's
    /// two children, if one was found.
    pub fn select_address(&self) -> Option<Address> {
        self.select
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Block] {:#x}", self.start)?;
        for ins in &self.instructions {
            writeln!(f, "  {:#x}   {ins}", ins.address)?;
        }
        Ok(())
    }
}

/// A whole function: every block, keyed by start address.
#[derive(Debug, Clone, Default)]
pub struct Function {
    blocks: BTreeMap<Address, Block>,
}

impl Function {
    /// Build a function from parsed blocks; duplicate start addresses are
    /// a structural error.
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for block in blocks {
            let start = block.start;
            if map.insert(start, block).is_some() {
                return Err(DeflattenError::Structural(format!(
                    "duplicate block start address {start:#x}"
                )));
            }
        }
        Ok(Function { blocks: map })
    }

    /// Look up a block; a missing address is a hard failure.
    pub fn block(&self, addr: Address) -> Result<&Block> {
        self.blocks
            .get(&addr)
            .ok_or_else(|| DeflattenError::Lookup(format!("no block at address {addr:#x}")))
    }

    pub(crate) fn block_mut(&mut self, addr: Address) -> Result<&mut Block> {
        self.blocks
            .get_mut(&addr)
            .ok_or_else(|| DeflattenError::Lookup(format!("no block at address {addr:#x}")))
    }

    /// Look up a block without treating absence as an error.
    pub fn get(&self, addr: Address) -> Option<&Block> {
        self.blocks.get(&addr)
    }

    /// Iterate blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when the function has no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// What a patch record does at its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Overwrite with a newly assembled instruction.
    Replace,
    /// Re-emit an existing instruction at a shifted address.
    Move,
    /// Overwrite with a NOP.
    Nop,
}

/// One address-keyed patch for the external binary rewriter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    /// Address to overwrite.
    pub address: Address,
    /// Mnemonic to assemble (or re-emit) at that address.
    pub mnemonic: String,
    /// Operand text to assemble.
    pub operands: String,
    /// Known encoding hex, when the bytes are already determined.
    pub encoding: Option<String>,
    /// Patch kind.
    pub kind: PatchKind,
}

/// Run the whole engine over one function: classify, simulate, patch.
pub fn deflatten(
    function: Function,
    strategy: classify::Strategy,
    config: Config,
) -> Result<Vec<PatchRecord>> {
    let mut simulation = simulation::Simulation::new(function, strategy.build(config));
    simulation.run()
}
