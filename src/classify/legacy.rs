//! Compatibility classifier with stricter compare patterns.
//!
//! This variant predates the shape table in [`super::smart`]. It guesses
//! one main dispatcher from the block with the most MOVK instructions,
//! then recognizes child dispatchers by a small set of compare patterns
//! against that dispatcher's state register. Nested flattening is
//! handled through "child main" dispatchers discovered up front, unless
//! single-dispatcher mode turns that search off.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::classify::Classifier;
use crate::decode::{Opcode, Operand};
use crate::simulation::SimContext;
use crate::{Address, Block, Config, DeflattenError, Instruction, Result};

/// Strict-pattern classifier kept for compatibility.
pub struct LegacyClassifier {
    config: Config,
    seed: Option<Address>,
    main: Option<Address>,
    main_register: String,
    child_mains: Vec<Address>,
    child_operand_regs: Vec<String>,
    operand_regs: Vec<String>,
    children: Vec<Address>,
}

impl LegacyClassifier {
    /// Fresh classifier; all discovery happens in [`Classifier::init`].
    pub fn new(config: Config) -> Self {
        LegacyClassifier {
            config,
            seed: None,
            main: None,
            main_register: String::new(),
            child_mains: Vec::new(),
            child_operand_regs: Vec::new(),
            operand_regs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// The single main dispatcher this variant resolves everything
    /// against.
    pub fn main_dispatcher(&self) -> Option<Address> {
        self.main
    }

    /// Secondary ("child main") dispatchers of nested flattening.
    pub fn child_main_dispatchers(&self) -> &[Address] {
        &self.child_mains
    }

    fn find_main(&mut self, ctx: &SimContext) -> Result<()> {
        let mut movk_counts: BTreeMap<Address, usize> = BTreeMap::new();
        for block in ctx.function.blocks() {
            for ins in &block.instructions {
                if ins.opcode() == Opcode::Movk {
                    *movk_counts.entry(block.start).or_default() += 1;
                }
            }
        }
        let seed_addr = movk_counts
            .iter()
            .max_by_key(|(_, count)| *count)
            .map(|(addr, _)| *addr)
            .ok_or_else(|| {
                DeflattenError::Classification(
                    "no MOVK seeding block found; cannot locate the main dispatcher".to_string(),
                )
            })?;

        let seed = ctx.function.block(seed_addr)?;
        if seed.links.len() != 1 {
            return Err(DeflattenError::Classification(format!(
                "seed block {seed_addr:#x} has {} successors; cannot locate the main dispatcher",
                seed.links.len()
            )));
        }
        let last = seed.last_instruction().ok_or_else(|| {
            DeflattenError::Classification(format!("seed block {seed_addr:#x} is empty"))
        })?;
        // The dispatcher must physically follow the seed.
        let fallthrough = last.address + 4;
        if ctx.function.get(fallthrough).map(|b| b.start) != Some(seed.links[0]) {
            return Err(DeflattenError::Classification(format!(
                "seed block {seed_addr:#x} does not fall through to its successor"
            )));
        }
        let main_addr = seed.links[0];

        // Cross-check against the most-compared register; a mismatch
        // usually means nested flattening.
        if let Some(by_compares) = most_compared_block(ctx) {
            if by_compares != main_addr {
                warn!("function may have multiple main dispatchers");
            }
        }

        let main = ctx.function.block(main_addr)?;
        self.main_register = dispatch_operand_register(main).unwrap_or_default();
        self.seed = Some(seed_addr);
        self.main = Some(main_addr);
        info!("main dispatcher at {main_addr:#x}, state register {}", self.main_register);
        Ok(())
    }

    fn find_child_mains(&mut self, ctx: &SimContext) -> Result<()> {
        let mut counts: BTreeMap<Address, (usize, usize)> = BTreeMap::new();
        for block in ctx.function.blocks() {
            for ins in &block.instructions {
                match ins.opcode() {
                    Opcode::Mov => counts.entry(block.start).or_default().0 += 1,
                    Opcode::Movk => counts.entry(block.start).or_default().1 += 1,
                    _ => {}
                }
            }
        }
        for (addr, (movs, movks)) in counts {
            if movs < movks || movks == 0 {
                continue;
            }
            let block = ctx.function.block(addr)?;
            if block.links.len() != 1 {
                continue;
            }
            let link = block.links[0];
            if Some(link) == self.main {
                continue;
            }
            let linked = ctx.function.block(link)?;
            if self.has_dispatcher_flag(linked) && !self.child_mains.contains(&link) {
                warn!(
                    "found child main dispatcher {link:#x}; rerun with single-dispatcher \
                     mode if this is wrong"
                );
                self.child_mains.push(link);
            }
        }
        for addr in &self.child_mains {
            let block = ctx.function.block(*addr)?;
            for ins in &block.instructions {
                if ins.opcode() != Opcode::Cmp {
                    continue;
                }
                if let Some(reg) = ins.operands().first().and_then(Operand::register) {
                    if !self.child_operand_regs.contains(&reg.to_string()) {
                        self.child_operand_regs.push(reg.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    // A compare on something other than the main state register plus a
    // conditional jump marks a second dispatcher.
    fn has_dispatcher_flag(&self, block: &Block) -> bool {
        let mut has_cmp = false;
        let mut has_cond_jump = false;
        for ins in &block.instructions {
            if ins.opcode() == Opcode::Cmp {
                if let Some(reg) = ins.operands().first().and_then(Operand::register) {
                    if reg != self.main_register {
                        has_cmp = true;
                    }
                }
            }
            if ins.opcode().is_cond_branch() {
                has_cond_jump = true;
            }
        }
        has_cmp && has_cond_jump
    }

    // CMP W8, W9; B.EQ loc — where W9 already holds a live constant and
    // the block is the same size as the main dispatcher.
    fn is_child_dispatch_compare(&self, ctx: &SimContext, block: &Block) -> Result<bool> {
        let Some(main) = self.main else {
            return Ok(false);
        };
        let main_len = ctx.function.block(main)?.instructions.len();
        for ins in &block.instructions {
            if ins.opcode() != Opcode::Cmp {
                continue;
            }
            let ops = ins.operands();
            let Some(left) = ops.first().and_then(Operand::register) else {
                return Ok(false);
            };
            let Some(right) = ops.get(1).and_then(Operand::register) else {
                // An immediate comparison is never dispatcher plumbing.
                return Ok(false);
            };
            let value = ctx.regs.get_long(right)?;
            return Ok(left == self.main_register
                && value != 0
                && block.instructions.len() == main_len);
        }
        Ok(false)
    }

    // MOV W9, #0xD9210058; CMP W8, W9; B.EQ loc
    fn is_child_dispatch_staged(&self, block: &Block) -> bool {
        for ins in &block.instructions {
            if ins.opcode() != Opcode::Cmp {
                continue;
            }
            let ops = ins.operands();
            let (Some(left), Some(right)) = (
                ops.first().and_then(Operand::register),
                ops.get(1).and_then(Operand::register),
            ) else {
                return false;
            };
            if left != self.main_register {
                return false;
            }
            return match staged_register(block) {
                Some(staged) => staged == right,
                None => false,
            };
        }
        false
    }

    fn is_child_main_child(&self, ctx: &SimContext, block: &Block) -> Result<bool> {
        match block.instructions.len() {
            2 => Ok(self.child_main_child_compare(ctx, block)?
                || self.child_main_child_restage(block)),
            3 => Ok(self.child_main_child_staged_compare(block)),
            _ => Ok(false),
        }
    }

    // CMP W8, W23; B.EQ loc — against a child-main state register.
    fn child_main_child_compare(&self, ctx: &SimContext, block: &Block) -> Result<bool> {
        let mut is_compare = false;
        let mut has_cond_jump = false;
        for ins in &block.instructions {
            let ops = ins.operands();
            match ins.opcode() {
                Opcode::Cmp => {
                    if let (Some(left), Some(right)) = (
                        ops.first().and_then(Operand::register),
                        ops.get(1).and_then(Operand::register),
                    ) {
                        if ctx.regs.get_long(left)? != 0
                            && ctx.regs.get_long(right)? != 0
                            && self.child_operand_regs.contains(&left.to_string())
                        {
                            is_compare = true;
                        }
                    }
                }
                op if op.is_cond_branch() => has_cond_jump = true,
                _ => {}
            }
        }
        Ok(is_compare && has_cond_jump)
    }

    // MOV W8, #0x43E7558A; B loc — restage the child-main state register
    // and jump back to its dispatcher.
    fn child_main_child_restage(&self, block: &Block) -> bool {
        let mut is_restage = false;
        let mut jumps_to_child_main = false;
        for ins in &block.instructions {
            let ops = ins.operands();
            match ins.opcode() {
                Opcode::B => {
                    if let Ok(target) = ins.branch_target() {
                        if self.child_mains.contains(&target) {
                            jumps_to_child_main = true;
                        }
                    }
                }
                Opcode::Mov | Opcode::Movk => {
                    if let Some(dest) = ops.first().and_then(Operand::register) {
                        if self.child_operand_regs.contains(&dest.to_string())
                            && matches!(ops.get(1), Some(Operand::Immediate(_)))
                        {
                            is_restage = true;
                        }
                    }
                }
                _ => {}
            }
        }
        is_restage && jumps_to_child_main
    }

    // MOV W23, #0xE123456; CMP W8, W23; B.EQ loc
    fn child_main_child_staged_compare(&self, block: &Block) -> bool {
        let mut is_compare = false;
        let mut has_cond_jump = false;
        let mut staged_imm = false;
        let mut last_move_reg = String::new();
        for ins in &block.instructions {
            let ops = ins.operands();
            match ins.opcode() {
                Opcode::Mov | Opcode::Movk => {
                    if let (Some(dest), Some(imm)) = (
                        ops.first().and_then(Operand::register),
                        ops.get(1).and_then(Operand::immediate),
                    ) {
                        if imm != 0 {
                            staged_imm = true;
                            last_move_reg = dest.to_string();
                        }
                    }
                }
                Opcode::Cmp => {
                    if let (Some(left), Some(right)) = (
                        ops.first().and_then(Operand::register),
                        ops.get(1).and_then(Operand::register),
                    ) {
                        if self.child_operand_regs.contains(&left.to_string())
                            && right == last_move_reg
                        {
                            is_compare = true;
                        }
                    }
                }
                op if op.is_cond_branch() => has_cond_jump = true,
                _ => {}
            }
        }
        is_compare && has_cond_jump && staged_imm
    }
}

// The register a MOV stages a constant into, when the block has one.
fn staged_register(block: &Block) -> Option<String> {
    for ins in &block.instructions {
        if ins.opcode() != Opcode::Mov {
            continue;
        }
        let ops = ins.operands();
        let dest = ops.first().and_then(Operand::register)?;
        return match ops.get(1) {
            Some(Operand::Immediate(0)) => None,
            Some(Operand::Register(_)) => None,
            _ => Some(dest.to_string()),
        };
    }
    None
}

fn dispatch_operand_register(block: &Block) -> Option<String> {
    block
        .instructions
        .iter()
        .find(|ins| ins.opcode() == Opcode::Cmp)
        .and_then(|ins| ins.operands().first().and_then(Operand::register))
        .map(str::to_string)
}

// First block containing a compare on the most-compared register.
fn most_compared_block(ctx: &SimContext) -> Option<Address> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for block in ctx.function.blocks() {
        for ins in &block.instructions {
            if ins.opcode() != Opcode::Cmp {
                continue;
            }
            if let Some(reg) = ins.operands().first().and_then(Operand::register) {
                *counts.entry(reg.to_string()).or_default() += 1;
            }
        }
    }
    let best = counts.into_iter().max_by_key(|(_, count)| *count)?.0;
    for block in ctx.function.blocks() {
        for ins in &block.instructions {
            if ins.opcode() == Opcode::Cmp
                && ins
                    .operands()
                    .first()
                    .and_then(Operand::register)
                    .is_some_and(|r| r == best)
            {
                return Some(block.start);
            }
        }
    }
    None
}

impl Classifier for LegacyClassifier {
    fn init(&mut self, ctx: &SimContext) -> Result<()> {
        self.find_main(ctx)?;
        if !self.config.single_dispatcher {
            self.find_child_mains(ctx)?;
        }
        self.operand_regs = std::iter::once(self.main_register.clone())
            .chain(self.child_operand_regs.iter().cloned())
            .collect();
        Ok(())
    }

    fn is_init_block(&self, _ctx: &SimContext, addr: Address) -> bool {
        self.seed == Some(addr)
    }

    fn dispatcher_operand_registers(&self) -> &[String] {
        &self.operand_regs
    }

    fn is_dispatcher_block(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        if Some(addr) == self.main || self.children.contains(&addr) {
            return Ok(true);
        }
        let block = ctx.function.block(addr)?;
        if self.is_child_dispatch_compare(ctx, block)? || self.is_child_dispatch_staged(block) {
            self.children.push(addr);
            return Ok(true);
        }
        if self.config.single_dispatcher || self.child_mains.is_empty() {
            return Ok(false);
        }
        if self.child_mains.contains(&addr) {
            return Ok(true);
        }
        if self.is_child_main_child(ctx, block)? {
            self.children.push(addr);
            return Ok(true);
        }
        Ok(false)
    }

    fn is_real_block(&mut self, _ctx: &SimContext, _addr: Address) -> Result<bool> {
        Ok(true)
    }

    fn is_real_block_with_dispatch_next(
        &mut self,
        ctx: &SimContext,
        addr: Address,
    ) -> Result<bool> {
        let block = ctx.function.block(addr)?;
        for ins in &block.instructions {
            if ins.opcode() == Opcode::B && ins.branch_target().ok() == self.main {
                return Ok(true);
            }
        }
        for ins in &block.instructions {
            if matches!(ins.opcode(), Opcode::Mov | Opcode::Movk) {
                let ops = ins.operands();
                if ops
                    .first()
                    .and_then(Operand::register)
                    .is_some_and(|r| r == self.main_register)
                    && matches!(ops.get(1), Some(Operand::Immediate(_)))
                {
                    return Ok(true);
                }
            }
        }
        if self.config.single_dispatcher || self.child_mains.is_empty() {
            return Ok(false);
        }
        match block.links.as_slice() {
            [link] => Ok(self.child_mains.contains(link)),
            _ => Ok(false),
        }
    }

    fn is_select_operand_dispatch_register(
        &mut self,
        ctx: &SimContext,
        ins: &Instruction,
    ) -> Result<bool> {
        let ops = ins.operands();
        let (Some(dest), Some(first), Some(second)) = (
            ops.first().and_then(Operand::register),
            ops.get(1).and_then(Operand::register),
            ops.get(2).and_then(Operand::register),
        ) else {
            return Ok(false);
        };
        if dest != self.main_register {
            return Ok(false);
        }
        Ok(ctx.regs.get_long(first)? != 0 && ctx.regs.get_long(second)? != 0)
    }
}
