//! Heuristic dispatcher recognition.
//!
//! The obfuscator leaves a loud signature: one block per flattening
//! region seeds the compare constants with a burst of MOV/MOVK pairs,
//! and every dispatcher block is a short compare-and-branch against the
//! state register. This classifier counts the seeding bursts to find the
//! seed/dispatcher pairs, derives the state ("left") and constant
//! ("right") register sets from them, and then recognizes child
//! dispatchers by a shape table keyed on instruction count (1 through 5
//! instructions). Matching is best effort: an unmatched shape leaves the
//! block classified as real.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::classify::Classifier;
use crate::decode::{Opcode, Operand};
use crate::simulation::SimContext;
use crate::{Address, Block, Config, DeflattenError, Instruction, Result};

#[derive(Debug, Default, Clone, Copy)]
struct MoveCounts {
    movs: usize,
    movks: usize,
}

/// Shape-pattern classifier covering nested and repeated flattening.
pub struct SmartClassifier {
    config: Config,
    left_regs: Vec<String>,
    right_regs: Vec<String>,
    dispatchers: Vec<Address>,
    seeds: Vec<Address>,
    children: Vec<Address>,
    init_block: Option<Address>,
}

impl SmartClassifier {
    /// Fresh classifier; all discovery happens in [`Classifier::init`].
    pub fn new(config: Config) -> Self {
        SmartClassifier {
            config,
            left_regs: Vec::new(),
            right_regs: Vec::new(),
            dispatchers: Vec::new(),
            seeds: Vec::new(),
            children: Vec::new(),
            init_block: None,
        }
    }

    /// The confirmed main dispatcher blocks, lowest address first.
    pub fn main_dispatchers(&self) -> &[Address] {
        &self.dispatchers
    }

    /// The constant ("right") compare registers.
    pub fn right_compare_registers(&self) -> &[String] {
        &self.right_regs
    }

    fn build_dispatchers(&mut self, ctx: &SimContext) -> Result<()> {
        let mut counts: BTreeMap<Address, MoveCounts> = BTreeMap::new();
        for block in ctx.function.blocks() {
            for ins in &block.instructions {
                match ins.opcode() {
                    Opcode::Mov => counts.entry(block.start).or_default().movs += 1,
                    Opcode::Movk => counts.entry(block.start).or_default().movks += 1,
                    _ => {}
                }
            }
        }

        // The seeding burst: at least two of each, MOVs never outnumbered.
        let candidates: Vec<Address> = counts
            .iter()
            .filter(|(_, c)| c.movs >= c.movks && c.movks > 1 && c.movs > 1)
            .map(|(addr, _)| *addr)
            .collect();

        let mut pairs: Vec<(Address, Address, String)> = Vec::new();
        for seed_addr in candidates {
            let seed = ctx.function.block(seed_addr)?;
            let Some(last) = seed.last_instruction() else {
                continue;
            };
            let dispatcher_addr = if last.opcode() == Opcode::B {
                last.branch_target()?
            } else if seed.links.len() == 1 {
                seed.links[0]
            } else {
                continue;
            };
            let Some(compare_reg) = last_movk_register(seed) else {
                continue;
            };
            let dispatcher = ctx.function.block(dispatcher_addr)?;
            if has_dispatcher_shape(dispatcher, &compare_reg) {
                warn!(
                    "found main dispatcher {dispatcher_addr:#x}, seeded by {seed_addr:#x}, \
                     compare register {compare_reg}"
                );
                pairs.push((seed_addr, dispatcher_addr, compare_reg));
            }
        }

        if pairs.is_empty() {
            return Err(DeflattenError::Classification(
                "no dispatcher seed blocks found".to_string(),
            ));
        }
        if self.config.single_dispatcher && pairs.len() > 1 {
            warn!(
                "single-dispatcher mode: ignoring {} secondary dispatcher(s)",
                pairs.len() - 1
            );
            pairs.truncate(1);
        }

        for (seed, dispatcher, left) in &pairs {
            if !self.seeds.contains(seed) {
                self.seeds.push(*seed);
            }
            if !self.dispatchers.contains(dispatcher) {
                self.dispatchers.push(*dispatcher);
            }
            if !self.left_regs.contains(left) {
                self.left_regs.push(left.clone());
            }
        }
        self.dispatchers.sort_unstable();
        self.init_block = self.seeds.iter().min().copied();

        // Right registers carry per-block match constants: written by
        // both a MOV and a MOVK in some seed block.
        let mut mov_regs: Vec<String> = Vec::new();
        let mut movk_regs: Vec<String> = Vec::new();
        for seed in &self.seeds {
            let block = ctx.function.block(*seed)?;
            for ins in &block.instructions {
                let ops = ins.operands();
                let dest = ops.first().and_then(Operand::register);
                let imm = ops.get(1).and_then(Operand::immediate);
                let (Some(dest), Some(imm)) = (dest, imm) else {
                    continue;
                };
                if imm == 0 || !dest.starts_with('W') {
                    continue;
                }
                match ins.opcode() {
                    Opcode::Mov if !mov_regs.iter().any(|r| r == dest) => {
                        mov_regs.push(dest.to_string());
                    }
                    Opcode::Movk if !movk_regs.iter().any(|r| r == dest) => {
                        movk_regs.push(dest.to_string());
                    }
                    _ => {}
                }
            }
        }
        for reg in movk_regs {
            if mov_regs.contains(&reg) && !self.right_regs.contains(&reg) {
                self.right_regs.push(reg);
            }
        }

        info!("left compare registers: {}", self.left_regs.join(","));
        info!("right compare registers: {}", self.right_regs.join(","));
        Ok(())
    }

    fn is_left(&self, name: &str) -> bool {
        self.left_regs.iter().any(|r| r == name)
    }

    fn is_right(&self, name: &str) -> bool {
        self.right_regs.iter().any(|r| r == name)
    }

    fn known_or_matching_dispatcher(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        if ctx.is_known_dispatcher(addr) {
            return Ok(true);
        }
        self.is_dispatcher_block(ctx, addr)
    }

    fn check_child_feature(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        match ctx.function.block(addr)?.instructions.len() {
            1 => self.child_shape_1(ctx, addr),
            2 => self.child_shape_2(ctx, addr),
            3 => self.child_shape_3(ctx, addr),
            4 => self.child_shape_4(ctx, addr),
            5 => self.child_shape_5(ctx, addr),
            _ => Ok(false),
        }
    }

    // MOV W10, #0x8614E721 feeding a known dispatcher. Only constant
    // -register writes count: a lone state-register write is a real
    // block staging its next state.
    fn child_shape_1(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        let (dest, imm, next) = {
            let block = ctx.function.block(addr)?;
            let ins = &block.instructions[0];
            if ins.opcode() != Opcode::Mov {
                return Ok(false);
            }
            let ops = ins.operands();
            let dest = ops.first().and_then(Operand::register).map(str::to_string);
            let imm = ops.get(1).and_then(Operand::immediate);
            (dest, imm, block.links.first().copied())
        };
        let (Some(dest), Some(imm)) = (dest, imm) else {
            return Ok(false);
        };
        if imm == 0 || !self.is_right(&dest) || self.is_left(&dest) {
            return Ok(false);
        }
        match next {
            Some(next) => self.known_or_matching_dispatcher(ctx, next),
            None => Ok(false),
        }
    }

    // CMP W8, W9; B.EQ loc — or — MOV W10, #imm; B loc (into a dispatcher).
    fn child_shape_2(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        if self.child_shape_cmp_bcond(ctx, addr)? {
            return Ok(true);
        }
        self.child_shape_mov_b(ctx, addr)
    }

    fn child_shape_cmp_bcond(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        let block = ctx.function.block(addr)?;
        let mut has_cmp = false;
        let mut has_bcond = false;
        for ins in &block.instructions {
            let ops = ins.operands();
            match ins.opcode() {
                Opcode::Cmp => {
                    if let (Some(left), Some(right)) = (
                        ops.first().and_then(Operand::register),
                        ops.get(1).and_then(Operand::register),
                    ) {
                        if self.is_left(left)
                            && self.is_right(right)
                            && ctx.regs.get_long(left)? != 0
                            && ctx.regs.get_long(right)? != 0
                        {
                            has_cmp = true;
                        }
                    }
                }
                op if op.is_cond_branch() => has_bcond = true,
                _ => {}
            }
        }
        Ok(has_cmp && has_bcond)
    }

    fn child_shape_mov_b(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        let (mut has_mov, b_target) = {
            let block = ctx.function.block(addr)?;
            let mut has_mov = false;
            let mut b_target = None;
            for ins in &block.instructions {
                let ops = ins.operands();
                match ins.opcode() {
                    Opcode::Mov => {
                        if let (Some(left), Some(imm)) = (
                            ops.first().and_then(Operand::register),
                            ops.get(1).and_then(Operand::immediate),
                        ) {
                            if self.is_left(left) && imm != 0 {
                                has_mov = true;
                            }
                        }
                    }
                    Opcode::B => b_target = block.links.first().copied(),
                    _ => {}
                }
            }
            (has_mov, b_target)
        };
        if let Some(next) = b_target {
            has_mov = has_mov && self.known_or_matching_dispatcher(ctx, next)?;
        } else {
            has_mov = false;
        }
        Ok(has_mov)
    }

    fn child_shape_3(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        if self.child_shape_mov_cmp_bcond(ctx, addr)? {
            return Ok(true);
        }
        if self.child_shape_ldr_cmp_bcond(ctx, addr)? {
            return Ok(true);
        }
        self.child_shape_cmp_mov_bcond(ctx, addr)
    }

    // MOV W11, #0xEFF1B6F8; CMP W10, W11; B.NE loc
    fn child_shape_mov_cmp_bcond(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        let block = ctx.function.block(addr)?;
        let mut has_mov = false;
        let mut has_cmp = false;
        let mut has_bcond = false;
        let mut staged_reg = String::new();
        for ins in &block.instructions {
            let ops = ins.operands();
            match ins.opcode() {
                Opcode::Mov => {
                    if let (Some(dest), Some(imm)) = (
                        ops.first().and_then(Operand::register),
                        ops.get(1).and_then(Operand::immediate),
                    ) {
                        if imm != 0 {
                            staged_reg = dest.to_string();
                            has_mov = true;
                        }
                    }
                }
                Opcode::Cmp => {
                    if let (Some(left), Some(right)) = (
                        ops.first().and_then(Operand::register),
                        ops.get(1).and_then(Operand::register),
                    ) {
                        if self.is_left(left) && ctx.regs.get_long(left)? != 0 && right == staged_reg
                        {
                            has_cmp = true;
                        }
                    }
                }
                op if op.is_cond_branch() => has_bcond = true,
                _ => {}
            }
        }
        Ok(has_mov && has_cmp && has_bcond)
    }

    // LDR W9, [SP,#off]; CMP W8, W24; B.EQ loc — the match constant was
    // staged through a stack slot.
    fn child_shape_ldr_cmp_bcond(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        let (is_ldr, has_cmp, ldr_reg, bcond_next) = {
            let block = ctx.function.block(addr)?;
            let mut is_ldr = false;
            let mut has_cmp = false;
            let mut ldr_reg = String::new();
            let mut bcond_next = None;
            for ins in &block.instructions {
                let ops = ins.operands();
                match ins.opcode() {
                    Opcode::Ldr => {
                        if let (Some(dest), Some(Operand::Memory { addend, .. })) =
                            (ops.first().and_then(Operand::register), ops.get(1))
                        {
                            if self.is_right(dest)
                                && ctx.regs.stack_get(addend).is_some_and(|v| v != 0)
                            {
                                ldr_reg = dest.to_string();
                                is_ldr = true;
                            }
                        }
                    }
                    Opcode::Cmp => {
                        if let (Some(left), Some(right)) = (
                            ops.first().and_then(Operand::register),
                            ops.get(1).and_then(Operand::register),
                        ) {
                            if self.is_left(left) && self.is_right(right) && right != ldr_reg {
                                has_cmp = true;
                            }
                        }
                    }
                    op if op.is_cond_branch() => bcond_next = block.links.first().copied(),
                    _ => {}
                }
            }
            (is_ldr, has_cmp, ldr_reg, bcond_next)
        };
        if !(is_ldr && has_cmp) {
            return Ok(false);
        }
        // The fall-through dispatcher must compare the slot-loaded value.
        let Some(next) = bcond_next else {
            return Ok(false);
        };
        if !self.known_or_matching_dispatcher(ctx, next)? {
            return Ok(false);
        }
        let next_block = ctx.function.block(next)?;
        Ok(next_block.instructions.iter().any(|ins| {
            ins.opcode() == Opcode::Cmp
                && ins
                    .operands()
                    .first()
                    .and_then(Operand::register)
                    .is_some_and(|r| r == ldr_reg)
        }))
    }

    // CMP W8, W9; MOV W9, #imm; B.NE loc (into a dispatcher)
    fn child_shape_cmp_mov_bcond(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        let (has_cmp, has_mov, bcond_next) = {
            let block = ctx.function.block(addr)?;
            let mut has_cmp = false;
            let mut has_mov = false;
            let mut bcond_next = None;
            for ins in &block.instructions {
                let ops = ins.operands();
                match ins.opcode() {
                    Opcode::Cmp => {
                        if let (Some(left), Some(right)) = (
                            ops.first().and_then(Operand::register),
                            ops.get(1).and_then(Operand::register),
                        ) {
                            if self.is_left(left)
                                && self.is_right(right)
                                && ctx.regs.get_long(left)? != 0
                                && ctx.regs.get_long(right)? != 0
                            {
                                has_cmp = true;
                            }
                        }
                    }
                    Opcode::Mov => {
                        if ops
                            .first()
                            .and_then(Operand::register)
                            .is_some_and(|r| self.is_right(r))
                        {
                            has_mov = true;
                        }
                    }
                    op if op.is_cond_branch() => bcond_next = block.links.first().copied(),
                    _ => {}
                }
            }
            (has_cmp, has_mov, bcond_next)
        };
        let has_bcond = match bcond_next {
            Some(next) => self.known_or_matching_dispatcher(ctx, next)?,
            None => false,
        };
        Ok(has_cmp && has_mov && has_bcond)
    }

    fn child_shape_4(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        // MOV W9, #imm; CMP W8, W9; MOV W9, W8; B.NE loc
        if self.child_shape_mov_cmp_bcond(ctx, addr)? {
            return Ok(true);
        }
        // MOV W9, #imm; CMP W8, W19; MOVK W9, #imm,LSL#16; B.EQ loc
        self.child_shape_mov_cmp_movk_bcond(ctx, addr)
    }

    fn child_shape_mov_cmp_movk_bcond(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        let (has_cmp, movk_same_reg, branch_links) = {
            let block = ctx.function.block(addr)?;
            let mut has_mov = false;
            let mut has_cmp = false;
            let mut movk_same_reg = false;
            let mut mov_reg = String::new();
            let mut branch_links = None;
            for ins in &block.instructions {
                let ops = ins.operands();
                match ins.opcode() {
                    Opcode::Mov => {
                        if let (Some(dest), Some(imm)) = (
                            ops.first().and_then(Operand::register),
                            ops.get(1).and_then(Operand::immediate),
                        ) {
                            if self.is_left(dest) && imm != 0 {
                                has_mov = true;
                                mov_reg = dest.to_string();
                            }
                        }
                    }
                    Opcode::Movk => {
                        if let (Some(dest), Some(imm)) = (
                            ops.first().and_then(Operand::register),
                            ops.get(1).and_then(Operand::immediate),
                        ) {
                            if has_mov && dest == mov_reg && imm != 0 {
                                movk_same_reg = true;
                            }
                        }
                    }
                    Opcode::Cmp => {
                        if ops
                            .first()
                            .and_then(Operand::register)
                            .is_some_and(|r| self.is_left(r))
                        {
                            has_cmp = true;
                        }
                    }
                    op if op.is_cond_branch() => {
                        branch_links = Some(block.links.clone());
                    }
                    _ => {}
                }
            }
            (has_cmp, movk_same_reg, branch_links)
        };
        // Both arms of the branch must themselves be dispatchers.
        let has_bcond = match branch_links {
            Some(links) if links.len() == 2 => {
                self.known_or_matching_dispatcher(ctx, links[0])?
                    && self.known_or_matching_dispatcher(ctx, links[1])?
            }
            _ => false,
        };
        Ok(has_bcond && has_cmp && movk_same_reg)
    }

    // MOV W9, #imm32; MOV W10, #lo; CMP W8, W9; MOVK W10, #hi,LSL#16;
    // B.NE loc — a 64-bit constant composed around the compare.
    fn child_shape_5(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        let block = ctx.function.block(addr)?;
        let mut has_cmp = false;
        let mut has_bcond = false;
        let mut staged: Vec<String> = Vec::new();
        for ins in &block.instructions {
            let ops = ins.operands();
            match ins.opcode() {
                Opcode::Mov => {
                    if let (Some(dest), Some(imm)) = (
                        ops.first().and_then(Operand::register),
                        ops.get(1).and_then(Operand::immediate),
                    ) {
                        if self.is_right(dest) && imm != 0 {
                            staged.push(dest.to_string());
                        }
                    }
                }
                Opcode::Cmp => {
                    if let (Some(left), Some(right)) = (
                        ops.first().and_then(Operand::register),
                        ops.get(1).and_then(Operand::register),
                    ) {
                        if self.is_left(left)
                            && self.is_right(right)
                            && staged.iter().any(|r| r == right)
                            && ctx.regs.get_long(left)? != 0
                            && ctx.regs.get_long(right)? != 0
                        {
                            has_cmp = true;
                        }
                    }
                }
                op if op.is_cond_branch() => has_bcond = true,
                _ => {}
            }
        }
        Ok(has_cmp && has_bcond)
    }

    // A block that composes constants into compare registers without
    // branching is feeding the dispatcher sequence it falls into.
    fn writes_compare_register(&self, block: &Block) -> bool {
        let mut mov_regs: Vec<String> = Vec::new();
        let mut movk_regs: Vec<String> = Vec::new();
        for ins in &block.instructions {
            let ops = ins.operands();
            let dest = ops.first().and_then(Operand::register);
            let imm = ops.get(1).and_then(Operand::immediate);
            let (Some(dest), Some(imm)) = (dest, imm) else {
                continue;
            };
            if imm == 0 {
                continue;
            }
            match ins.opcode() {
                Opcode::Mov => {
                    if !mov_regs.iter().any(|r| r == dest) {
                        mov_regs.push(dest.to_string());
                    }
                    // IDA merges MOV/MOVK pairs into one 8-byte MOV.
                    if ins.size() == 8 {
                        movk_regs.push(dest.to_string());
                    }
                }
                Opcode::Movk => {
                    if !movk_regs.iter().any(|r| r == dest) {
                        movk_regs.push(dest.to_string());
                    }
                }
                _ => {}
            }
        }
        movk_regs
            .iter()
            .any(|reg| mov_regs.contains(reg) && (self.is_right(reg) || self.is_left(reg)))
    }

    fn writes_state_register_immediate(&self, block: &Block) -> bool {
        block.instructions.iter().any(|ins| {
            matches!(ins.opcode(), Opcode::Mov | Opcode::Movk)
                && ins
                    .operands()
                    .first()
                    .and_then(Operand::register)
                    .is_some_and(|r| self.is_left(r))
                && matches!(ins.operands().get(1), Some(Operand::Immediate(_)))
        })
    }
}

fn last_movk_register(block: &Block) -> Option<String> {
    block
        .instructions
        .iter()
        .rev()
        .find(|ins| ins.opcode() == Opcode::Movk)
        .and_then(|ins| ins.operands().first().and_then(Operand::register))
        .map(str::to_string)
}

// The seed's successor must be a compare-and-branch on the seeded state
// register: either CMP + B.cond, or MOV + CMP + B.cond.
fn has_dispatcher_shape(block: &Block, compare_reg: &str) -> bool {
    let mut has_mov = false;
    let mut has_cmp = false;
    let mut has_bcond = false;
    for ins in &block.instructions {
        match ins.opcode() {
            Opcode::Mov => has_mov = true,
            Opcode::Cmp => {
                if ins
                    .operands()
                    .first()
                    .and_then(Operand::register)
                    .is_some_and(|r| r == compare_reg)
                {
                    has_cmp = true;
                }
            }
            op if op.is_cond_branch() => has_bcond = true,
            _ => {}
        }
    }
    match block.instructions.len() {
        2 => has_cmp && has_bcond,
        3 => has_mov && has_cmp && has_bcond,
        _ => false,
    }
}

impl Classifier for SmartClassifier {
    fn init(&mut self, ctx: &SimContext) -> Result<()> {
        self.build_dispatchers(ctx)
    }

    fn is_init_block(&self, _ctx: &SimContext, addr: Address) -> bool {
        self.init_block == Some(addr)
    }

    fn dispatcher_operand_registers(&self) -> &[String] {
        &self.left_regs
    }

    fn is_dispatcher_block(&mut self, ctx: &SimContext, addr: Address) -> Result<bool> {
        if self.dispatchers.contains(&addr) || self.children.contains(&addr) {
            return Ok(true);
        }
        if self.check_child_feature(ctx, addr)? {
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
        let mut has_branch = false;
        let (targets, writes_compare, writes_state) = {
            let block = ctx.function.block(addr)?;
            let mut targets = Vec::new();
            for ins in &block.instructions {
                if ins.opcode() == Opcode::B {
                    has_branch = true;
                    targets.push(ins.branch_target()?);
                }
            }
            (
                targets,
                self.writes_compare_register(block),
                self.writes_state_register_immediate(block),
            )
        };

        for target in targets {
            if self.dispatchers.contains(&target) {
                return Ok(true);
            }
            // A branch out of the function is not a dispatcher edge.
            if ctx.function.get(target).is_none() {
                continue;
            }
            if self.known_or_matching_dispatcher(ctx, target)? {
                return Ok(true);
            }
            if writes_compare {
                return Ok(true);
            }
        }

        if !has_branch && (writes_state || writes_compare) {
            return Ok(true);
        }
        Ok(false)
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
        if !self.is_left(dest) {
            return Ok(false);
        }
        Ok(ctx.regs.get_long(first)? != 0 && ctx.regs.get_long(second)? != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::RegisterContext;
    use crate::simulation::SimContext;
    use crate::Function;

    fn ins(addr: Address, mnemonic: &str, operands: &str) -> Instruction {
        Instruction::new(addr, mnemonic, operands, "00000000").unwrap()
    }

    fn ctx(blocks: Vec<Block>) -> SimContext {
        SimContext {
            function: Function::from_blocks(blocks).unwrap(),
            regs: RegisterContext::new(),
            dispatchers: Vec::new(),
            reals: Vec::new(),
        }
    }

    fn seed_block(start: Address, regs: &[(&str, i64, i64)], link: Address) -> Block {
        // One MOV + MOVK pair per register, no trailing branch.
        let mut instructions = Vec::new();
        let mut addr = start;
        for (reg, lo, hi) in regs {
            instructions.push(ins(addr, "MOV", &format!("{reg}, #{lo:#x}")));
            instructions.push(ins(addr + 4, "MOVK", &format!("{reg}, #{hi:#x},LSL#16")));
            addr += 8;
        }
        Block::new(start, instructions, vec![link])
    }

    fn two_seed_context() -> SimContext {
        // Two independent flattening regions, each with its own seed and
        // compare-and-branch dispatcher.
        let seed_a = seed_block(
            0x1000,
            &[("W9", 0x2222, 0x1111), ("W8", 0x2222, 0x1111)],
            0x1010,
        );
        let disp_a = Block::new(
            0x1010,
            vec![ins(0x1010, "CMP", "W8, W9"), ins(0x1014, "B.EQ", "loc_1030")],
            vec![0x1030, 0x1018],
        );
        let exit_a = Block::new(0x1018, vec![ins(0x1018, "RET", "")], vec![]);
        let real_a = Block::new(0x1030, vec![ins(0x1030, "RET", "")], vec![]);

        let seed_b = seed_block(
            0x2000,
            &[("W21", 0x4444, 0x3333), ("W20", 0x4444, 0x3333)],
            0x2010,
        );
        let disp_b = Block::new(
            0x2010,
            vec![
                ins(0x2010, "CMP", "W20, W21"),
                ins(0x2014, "B.EQ", "loc_2030"),
            ],
            vec![0x2030, 0x2018],
        );
        let exit_b = Block::new(0x2018, vec![ins(0x2018, "RET", "")], vec![]);
        let real_b = Block::new(0x2030, vec![ins(0x2030, "RET", "")], vec![]);

        ctx(vec![
            seed_a, disp_a, exit_a, real_a, seed_b, disp_b, exit_b, real_b,
        ])
    }

    #[test]
    fn test_two_seeds_are_both_discovered() {
        let ctx = two_seed_context();
        let mut classifier = SmartClassifier::new(Config::default());
        classifier.init(&ctx).unwrap();

        assert_eq!(classifier.main_dispatchers(), &[0x1010, 0x2010]);
        assert_eq!(
            classifier.dispatcher_operand_registers(),
            &["W8".to_string(), "W20".to_string()]
        );
        // The lower-address seed is the function entry.
        assert!(classifier.is_init_block(&ctx, 0x1000));
        assert!(!classifier.is_init_block(&ctx, 0x2000));
        // Blocks feeding only the secondary dispatcher still classify as
        // dispatcher.
        assert!(classifier.is_dispatcher_block(&ctx, 0x2010).unwrap());
    }

    #[test]
    fn test_single_dispatcher_mode_keeps_lowest_pair() {
        let ctx = two_seed_context();
        let mut classifier = SmartClassifier::new(Config {
            single_dispatcher: true,
        });
        classifier.init(&ctx).unwrap();
        assert_eq!(classifier.main_dispatchers(), &[0x1010]);
        assert_eq!(classifier.dispatcher_operand_registers(), &["W8".to_string()]);
    }

    #[test]
    fn test_no_seed_is_classification_error() {
        let ctx = ctx(vec![Block::new(0x1000, vec![ins(0x1000, "RET", "")], vec![])]);
        let mut classifier = SmartClassifier::new(Config::default());
        assert!(matches!(
            classifier.init(&ctx),
            Err(DeflattenError::Classification(_))
        ));
    }

    #[test]
    fn test_state_register_write_is_not_a_dispatcher() {
        let mut ctx = two_seed_context();
        let mut classifier = SmartClassifier::new(Config::default());
        classifier.init(&ctx).unwrap();

        // A lone write of the state register W8 feeding the dispatcher:
        // real block with dispatch-next, not a dispatcher.
        let lone = Block::new(
            0x3000,
            vec![ins(0x3000, "MOV", "W8, #0x1000")],
            vec![0x1010],
        );
        ctx.function = Function::from_blocks(
            ctx.function
                .blocks()
                .cloned()
                .chain(std::iter::once(lone))
                .collect(),
        )
        .unwrap();

        assert!(!classifier.is_dispatcher_block(&ctx, 0x3000).unwrap());
        assert!(classifier
            .is_real_block_with_dispatch_next(&ctx, 0x3000)
            .unwrap());
    }

    #[test]
    fn test_constant_register_write_feeding_dispatcher_is_dispatcher() {
        let mut ctx = two_seed_context();
        let mut classifier = SmartClassifier::new(Config::default());
        classifier.init(&ctx).unwrap();

        // W9 is a constant register in region A, and W9 is not a state
        // register, so this block is dispatcher plumbing.
        let lone = Block::new(
            0x3000,
            vec![ins(0x3000, "MOV", "W9, #0x8614E721")],
            vec![0x1010],
        );
        ctx.function = Function::from_blocks(
            ctx.function
                .blocks()
                .cloned()
                .chain(std::iter::once(lone))
                .collect(),
        )
        .unwrap();

        assert!(classifier.is_dispatcher_block(&ctx, 0x3000).unwrap());
    }

    #[test]
    fn test_cmp_bcond_child_shape_requires_live_values() {
        let mut ctx = two_seed_context();
        let child = Block::new(
            0x3000,
            vec![ins(0x3000, "CMP", "W8, W9"), ins(0x3004, "B.EQ", "loc_1030")],
            vec![0x1030, 0x1018],
        );
        ctx.function = Function::from_blocks(
            ctx.function
                .blocks()
                .cloned()
                .chain(std::iter::once(child))
                .collect(),
        )
        .unwrap();
        let mut classifier = SmartClassifier::new(Config::default());
        classifier.init(&ctx).unwrap();

        // Registers still read as the unknown sentinel: no match.
        assert!(!classifier.is_dispatcher_block(&ctx, 0x3000).unwrap());

        ctx.regs.set_immediate("W8", 0x11112222);
        ctx.regs.set_immediate("W9", 0x11112222);
        assert!(classifier.is_dispatcher_block(&ctx, 0x3000).unwrap());
    }
}
