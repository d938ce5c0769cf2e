//! Dispatcher classification strategies.
//!
//! Telling dispatcher blocks apart from real ones is heuristic pattern
//! recognition over obfuscator idioms, so it lives behind a trait with
//! two interchangeable implementations: the broad [`smart`] variant and
//! the stricter [`legacy`] variant kept for compatibility. One is active
//! per run, chosen at construction.

use std::fmt;

use clap::ValueEnum;

use crate::simulation::SimContext;
use crate::{Address, Config, Instruction, Result};

pub mod legacy;
pub mod smart;

pub use legacy::LegacyClassifier;
pub use smart::SmartClassifier;

/// Capability set every classification strategy provides.
///
/// Methods receive `&SimContext` so heuristics can inspect other blocks
/// and the live register state; each classifier owns its accumulated
/// caches and register-name sets as plain fields.
pub trait Classifier {
    /// One-time analysis pass over the whole function: locate seed and
    /// dispatcher blocks and the compare register sets.
    fn init(&mut self, ctx: &SimContext) -> Result<()>;

    /// True iff `addr` is the discovered entry (lowest-address seed)
    /// block.
    fn is_init_block(&self, ctx: &SimContext, addr: Address) -> bool;

    /// The state-variable ("left") registers the dispatchers compare.
    fn dispatcher_operand_registers(&self) -> &[String];

    /// True iff the block is a known dispatcher or matches a recognized
    /// dispatcher shape. Successful matches are cached.
    fn is_dispatcher_block(&mut self, ctx: &SimContext, addr: Address) -> Result<bool>;

    /// A block is real unless proven otherwise.
    fn is_real_block(&mut self, ctx: &SimContext, addr: Address) -> Result<bool>;

    /// True when a real block's tail falls back into dispatcher logic:
    /// it branches to a known dispatcher, stages the state register
    /// without branching, or links into a secondary dispatcher.
    fn is_real_block_with_dispatch_next(&mut self, ctx: &SimContext, addr: Address)
        -> Result<bool>;

    /// True when a conditional select writes the state register from two
    /// live candidate values — the flattening select, as opposed to an
    /// unrelated CSEL.
    fn is_select_operand_dispatch_register(
        &mut self,
        ctx: &SimContext,
        ins: &Instruction,
    ) -> Result<bool>;
}

/// Available classification strategies.
#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Heuristic shape-pattern recognition (default)
    Smart,
    /// Stricter compare-pattern matching kept for compatibility
    Legacy,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Smart => write!(f, "smart"),
            Strategy::Legacy => write!(f, "legacy"),
        }
    }
}

impl Strategy {
    /// Instantiate the selected classifier.
    pub fn build(&self, config: Config) -> Box<dyn Classifier> {
        match self {
            Strategy::Smart => Box::new(SmartClassifier::new(config)),
            Strategy::Legacy => Box::new(LegacyClassifier::new(config)),
        }
    }

    /// Return all available strategies
    pub fn all() -> &'static [Strategy] {
        &[Strategy::Smart, Strategy::Legacy]
    }
}
