//! Patch synthesis over the resolved real-block graph.
//!
//! Once every real block knows its true children, each block's exit is
//! rewritten to branch there directly, choosing the cheapest rewrite the
//! block's tail allows: retarget an existing branch, turn a trailing
//! state write into the branch, swap or relocate instructions to make
//! room, or as a last resort push the branch into the successor
//! dispatcher's first instruction. Afterwards every instruction of every
//! discovered dispatcher that did not receive a patch is forced to NOP.
//!
//! Everything here runs strictly after resolution has finished; it is
//! the only code that mutates instruction lists and addresses.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::decode::{self, Opcode, Operand};
use crate::simulation::Simulation;
use crate::{
    Address, DeflattenError, Fix, Instruction, PatchKind, PatchRecord, Result, NOP_ENCODING,
};

/// Build the replacement-branch fix for `target`.
fn build_jump(op: Opcode, target: Address) -> Result<Fix> {
    Ok(Fix::Replace {
        mnemonic: op.mnemonic_text()?.to_string(),
        operands: format!("0x{target:X}"),
    })
}

fn record_for(ins: &Instruction) -> PatchRecord {
    match ins.fix() {
        Some(Fix::Replace { mnemonic, operands }) => PatchRecord {
            address: ins.address,
            mnemonic: mnemonic.clone(),
            operands: operands.clone(),
            encoding: None,
            kind: PatchKind::Replace,
        },
        Some(Fix::Nop) => PatchRecord {
            address: ins.address,
            mnemonic: "NOP".to_string(),
            operands: String::new(),
            encoding: Some(NOP_ENCODING.to_string()),
            kind: PatchKind::Nop,
        },
        None => PatchRecord {
            address: ins.address,
            mnemonic: ins.mnemonic.clone(),
            operands: ins.operands_str.clone(),
            encoding: Some(ins.machine_code.clone()),
            kind: PatchKind::Move,
        },
    }
}

fn push_record(records: &mut Vec<PatchRecord>, seen: &mut HashSet<Address>, record: PatchRecord) {
    if seen.insert(record.address) {
        records.push(record);
    }
}

impl Simulation {
    /// Rewrite every resolved real block and NOP out the dispatchers,
    /// producing the flat patch list.
    pub(crate) fn rebuild(&mut self) -> Result<Vec<PatchRecord>> {
        let mut reals = self.ctx.reals.clone();
        reals.sort_unstable();
        info!(
            "resolution complete: {} real blocks, {} dispatcher blocks",
            reals.len(),
            self.ctx.dispatchers.len()
        );

        for addr in &reals {
            if self.ctx.function.block(*addr)?.fixed {
                continue;
            }
            self.fix_block(*addr)?;
        }

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        self.sweep_dispatchers(&mut records, &mut seen)?;

        for addr in &reals {
            let block = self.ctx.function.block(*addr)?;
            for ins in &block.instructions {
                if ins.fix().is_some() || ins.is_moved() {
                    push_record(&mut records, &mut seen, record_for(ins));
                }
            }
        }

        info!("emitted {} patch records", records.len());
        Ok(records)
    }

    // Every dispatcher instruction must end up in the output: patched
    // where a real-block fix landed there, NOP otherwise. Double-width
    // instructions get a second NOP for their upper half.
    fn sweep_dispatchers(
        &mut self,
        records: &mut Vec<PatchRecord>,
        seen: &mut HashSet<Address>,
    ) -> Result<()> {
        for addr in self.ctx.dispatchers.clone() {
            let block = self.ctx.function.block_mut(addr)?;
            for ins in &mut block.instructions {
                if ins.fix().is_none() {
                    let pad = ins.size() == 8;
                    ins.set_fix(Fix::Nop)?;
                    push_record(records, seen, record_for(ins));
                    if pad {
                        push_record(records, seen, record_for(&Instruction::nop(ins.address + 4)));
                    }
                } else {
                    push_record(records, seen, record_for(ins));
                }
            }
        }
        Ok(())
    }

    /// Rewrite one real block's exit to reach its resolved children
    /// directly.
    pub(crate) fn fix_block(&mut self, addr: Address) -> Result<()> {
        self.ctx.function.block_mut(addr)?.fixed = true;
        debug!("fixing real block {addr:#x}");

        if self.ctx.function.block(addr)?.select.is_some() {
            return self.fix_select_block(addr);
        }

        let links = self.ctx.function.block(addr)?.links.clone();
        if links.len() == 1 && self.is_dispatcher(links[0])? {
            return self.fix_dispatcher_next(addr);
        }

        match links.len() {
            // Terminal blocks, genuine two-way branches, and direct
            // real-to-real falls need no patch.
            0 | 1 | 2 => Ok(()),
            n => Err(DeflattenError::Classification(format!(
                "block {addr:#x} has unsupported successor count {n}"
            ))),
        }
    }

    // The select collapses into a conditional branch to child 0 plus an
    // unconditional branch to child 1. Which instructions carry those
    // two branches depends on what follows the select.
    fn fix_select_block(&mut self, addr: Address) -> Result<()> {
        let (sel_index, count) = {
            let block = self.ctx.function.block(addr)?;
            let sel = block.select.ok_or_else(|| {
                DeflattenError::Classification(format!("block {addr:#x} lost its select marker"))
            })?;
            let index = block
                .instructions
                .iter()
                .position(|i| i.address == sel)
                .ok_or_else(|| {
                    DeflattenError::Lookup(format!(
                        "select instruction {sel:#x} not found in block {addr:#x}"
                    ))
                })?;
            (index, block.instructions.len())
        };
        let last = self
            .ctx
            .function
            .block(addr)?
            .last_instruction()
            .cloned()
            .ok_or_else(|| DeflattenError::Structural(format!("select block {addr:#x} is empty")))?;
        let last_jumps = self.ins_jumps_to_dispatcher(&last)?;

        // CSEL; B <dispatcher>
        if sel_index + 1 == count - 1 && last_jumps {
            return self.fix_select_pair(addr);
        }

        if sel_index + 2 == count - 1 {
            let movk_after =
                self.ctx.function.block(addr)?.instructions[sel_index + 1].opcode() == Opcode::Movk;

            // CSEL; MOVK; B <dispatcher> — the MOVK carries the second
            // branch and the dead dispatcher jump is NOP'd.
            if movk_after && last_jumps {
                self.fix_select_pair(addr)?;
                let block = self.ctx.function.block_mut(addr)?;
                if let Some(tail) = block.instructions.last_mut() {
                    tail.set_fix(Fix::Nop)?;
                }
                warn!("select block {addr:#x}: trailing dispatcher jump NOP'd");
                return Ok(());
            }

            // CSEL; MOVK; STR — no branch to reuse. The trailing
            // instruction moves ahead of the select, the select and MOVK
            // shift down one slot, and the pair rewrite applies.
            if movk_after {
                let block = self.ctx.function.block_mut(addr)?;
                let last_index = block.instructions.len() - 1;
                let offset = ((last_index - sel_index) * 4) as Address;
                let mut tail = block.instructions.remove(last_index);
                tail.address -= offset;
                tail.mark_moved();
                block.instructions.insert(sel_index, tail);
                block.instructions[sel_index + 1].address += 4;
                block.instructions[sel_index + 2].address += 4;
                // The select marker tracks the instruction's address.
                block.select = Some(block.instructions[sel_index + 1].address);
                debug!("select block {addr:#x}: reordered tail ahead of the select");
                return self.fix_select_pair(addr);
            }
        }

        Err(DeflattenError::Structural(format!(
            "unhandled select shape in block {addr:#x} (select at index {sel_index} of {count})"
        )))
    }

    // Replace the select with B.cond to child 0 and the following
    // instruction with B to child 1.
    fn fix_select_pair(&mut self, addr: Address) -> Result<()> {
        let (sel_index, cc, child0, child1) = {
            let block = self.ctx.function.block(addr)?;
            let sel = block.select.ok_or_else(|| {
                DeflattenError::Classification(format!("block {addr:#x} lost its select marker"))
            })?;
            let index = block
                .instructions
                .iter()
                .position(|i| i.address == sel)
                .ok_or_else(|| {
                    DeflattenError::Lookup(format!(
                        "select instruction {sel:#x} not found in block {addr:#x}"
                    ))
                })?;
            let ins = &block.instructions[index];
            let cc = match ins.operands().get(3) {
                Some(Operand::Condition(cc)) => *cc,
                _ => {
                    return Err(DeflattenError::Structural(format!(
                        "select at {sel:#x} has no condition operand"
                    )))
                }
            };
            let [child0, child1] = block.real_children.as_slice() else {
                return Err(DeflattenError::Classification(format!(
                    "select block {addr:#x} resolved without two children"
                )));
            };
            (index, cc, *child0, *child1)
        };

        let cond_jump = build_jump(decode::branch_for_condition(cc)?, child0)?;
        let plain_jump = build_jump(Opcode::B, child1)?;

        let block = self.ctx.function.block_mut(addr)?;
        block.instructions[sel_index].set_fix(cond_jump)?;
        let next = block.instructions.get_mut(sel_index + 1).ok_or_else(|| {
            DeflattenError::Structural(format!(
                "no instruction after the select in block {addr:#x}"
            ))
        })?;
        next.set_fix(plain_jump)?;
        debug!("select block {addr:#x}: rewritten to branch pair {child0:#x}/{child1:#x}");
        Ok(())
    }

    // The block's single successor is a dispatcher; make the block reach
    // its real child directly instead.
    fn fix_dispatcher_next(&mut self, addr: Address) -> Result<()> {
        let single_non_branch = {
            let block = self.ctx.function.block(addr)?;
            block.instructions.len() == 1 && block.instructions[0].opcode() != Opcode::B
        };
        if single_non_branch {
            let writes_state = {
                let block = self.ctx.function.block(addr)?;
                let ins = &block.instructions[0];
                let names = self.classifier.dispatcher_operand_registers();
                matches!(ins.opcode(), Opcode::Mov | Opcode::Movk)
                    && ins
                        .operands()
                        .first()
                        .and_then(Operand::register)
                        .is_some_and(|r| names.iter().any(|n| n == r))
            };
            if writes_state {
                // The state write has no other purpose once the
                // dispatcher is gone; it becomes the branch itself.
                let child0 = self.child0(addr)?;
                let jump = build_jump(Opcode::B, child0)?;
                let block = self.ctx.function.block_mut(addr)?;
                let pad = block.instructions[0].size() == 8;
                let ins_addr = block.instructions[0].address;
                block.instructions[0].set_fix(jump)?;
                if pad {
                    block.instructions.insert(1, Instruction::nop(ins_addr + 4));
                }
                debug!("single state write at {addr:#x} becomes the direct branch");
                return Ok(());
            }
            return self.fix_via_next_dispatcher(addr, false);
        }

        let last = self
            .ctx
            .function
            .block(addr)?
            .last_instruction()
            .cloned()
            .ok_or_else(|| DeflattenError::Structural(format!("block {addr:#x} is empty")))?;

        if last.opcode() != Opcode::B {
            return self.fix_branchless_tail(addr);
        }

        if self.ins_jumps_to_dispatcher(&last)? {
            let child0 = self.child0(addr)?;
            let jump = build_jump(Opcode::B, child0)?;
            let block = self.ctx.function.block_mut(addr)?;
            if let Some(tail) = block.instructions.last_mut() {
                tail.set_fix(jump)?;
            }
            return Ok(());
        }

        Err(DeflattenError::Classification(format!(
            "no rewrite strategy for block {addr:#x}"
        )))
    }

    // The block falls into the dispatcher without a branch instruction.
    // Try, in order: turn a tail state write into the branch, swap the
    // last two instructions to free the tail slot, or carry the branch
    // in the successor dispatcher.
    fn fix_branchless_tail(&mut self, addr: Address) -> Result<()> {
        if let Some(index) = self.self_fix_candidate(addr)? {
            let child0 = self.child0(addr)?;
            let jump = build_jump(Opcode::B, child0)?;
            let count = self.ctx.function.block(addr)?.instructions.len();

            if index + 1 == count {
                let block = self.ctx.function.block_mut(addr)?;
                let pad = block.instructions[index].size() == 8;
                let ins_addr = block.instructions[index].address;
                if pad {
                    block
                        .instructions
                        .insert(index + 1, Instruction::nop(ins_addr + 4));
                }
                block.instructions[index].set_fix(jump)?;
                warn!("state write at the tail of {addr:#x} becomes the direct branch");
                return Ok(());
            }

            // The state write sits mid-block: pull it out, close the
            // gap, and re-emit it at the end as the branch.
            debug!("relocating the state write out of block {addr:#x}");
            let block = self.ctx.function.block_mut(addr)?;
            let mut ins = block.instructions.remove(index);
            let width = ins.size() as Address;
            for item in block.instructions.iter_mut().skip(index) {
                item.address -= width;
                item.mark_moved();
            }
            let last_addr = block
                .instructions
                .last()
                .map(|i| i.address)
                .ok_or_else(|| {
                    DeflattenError::Structural(format!("block {addr:#x} emptied while relocating"))
                })?;
            ins.address = last_addr + 4;
            if let Fix::Replace { mnemonic, operands } = &jump {
                ins.mnemonic = mnemonic.clone();
                ins.operands_str = operands.clone();
            }
            ins.set_fix(jump)?;
            let pad = ins.size() == 8;
            let jump_addr = ins.address;
            block.instructions.push(ins);
            if pad {
                block.instructions.push(Instruction::nop(jump_addr + 4));
            }
            return Ok(());
        }

        if self.can_fix_by_swap(addr)? {
            let child0 = self.child0(addr)?;
            let jump = build_jump(Opcode::B, child0)?;
            let block = self.ctx.function.block_mut(addr)?;
            let count = block.instructions.len();
            let mut pre = block.instructions.remove(count - 2);
            let last = block.instructions.last_mut().ok_or_else(|| {
                DeflattenError::Structural(format!("block {addr:#x} emptied while swapping"))
            })?;
            std::mem::swap(&mut pre.address, &mut last.address);
            last.mark_moved();
            pre.set_fix(jump)?;
            block.instructions.push(pre);
            warn!("swapped the tail of {addr:#x} to place the branch last");
            return Ok(());
        }

        warn!("using the successor dispatcher of {addr:#x} to carry the branch");
        self.fix_via_next_dispatcher(addr, true)
    }

    // A MOV/MOVK into a state register at (or just before) the tail can
    // absorb the branch itself.
    fn self_fix_candidate(&mut self, addr: Address) -> Result<Option<usize>> {
        let block = self.ctx.function.block(addr)?;
        if block.instructions.len() <= 1 {
            return Ok(None);
        }
        let names = self.classifier.dispatcher_operand_registers();
        let writes_state = |ins: &Instruction| {
            matches!(ins.opcode(), Opcode::Mov | Opcode::Movk)
                && ins
                    .operands()
                    .first()
                    .and_then(Operand::register)
                    .is_some_and(|r| names.iter().any(|n| n == r))
        };
        let last_index = block.instructions.len() - 1;
        let last = &block.instructions[last_index];
        if matches!(last.opcode(), Opcode::Mov | Opcode::Movk) {
            return Ok(writes_state(last).then_some(last_index));
        }
        let pre = &block.instructions[last_index - 1];
        if matches!(pre.opcode(), Opcode::Mov | Opcode::Movk) {
            return Ok(writes_state(pre).then_some(last_index - 1));
        }
        Ok(None)
    }

    fn can_fix_by_swap(&mut self, addr: Address) -> Result<bool> {
        let block = self.ctx.function.block(addr)?;
        if block.instructions.len() < 2 {
            return Ok(false);
        }
        let last = &block.instructions[block.instructions.len() - 1];
        let pre = &block.instructions[block.instructions.len() - 2];
        Ok(!matches!(last.opcode(), Opcode::Mov | Opcode::Movk)
            && matches!(pre.opcode(), Opcode::Mov | Opcode::Movk))
    }

    // Last resort: the successor dispatcher's first instruction becomes
    // the direct branch. With `nop_rest` the dispatcher's remaining
    // instructions are NOP'd immediately instead of waiting for the
    // sweep.
    fn fix_via_next_dispatcher(&mut self, addr: Address, nop_rest: bool) -> Result<()> {
        let next = self
            .ctx
            .function
            .block(addr)?
            .links
            .first()
            .copied()
            .ok_or_else(|| {
                DeflattenError::Structural(format!("block {addr:#x} has no successor to fix via"))
            })?;
        let child0 = self.child0(addr)?;
        if nop_rest {
            let first_fixed = self
                .ctx
                .function
                .block(next)?
                .instructions
                .first()
                .is_some_and(|i| i.fix().is_some());
            if first_fixed {
                return Err(DeflattenError::Classification(format!(
                    "first instruction of dispatcher {next:#x} is already fixed"
                )));
            }
        }

        let jump = build_jump(Opcode::B, child0)?;
        let block = self.ctx.function.block_mut(next)?;
        let first = block.instructions.first_mut().ok_or_else(|| {
            DeflattenError::Structural(format!("dispatcher {next:#x} has no instructions"))
        })?;
        let pad = first.size() == 8;
        let first_addr = first.address;
        first.set_fix(jump)?;
        if pad {
            block.instructions.insert(1, Instruction::nop(first_addr + 4));
        }
        if nop_rest {
            for ins in block.instructions.iter_mut() {
                if ins.fix().is_none() {
                    ins.set_fix(Fix::Nop)?;
                }
            }
        }
        debug!("dispatcher {next:#x} now carries the branch for {addr:#x}");
        Ok(())
    }

    fn child0(&self, addr: Address) -> Result<Address> {
        self.ctx
            .function
            .block(addr)?
            .real_children
            .first()
            .copied()
            .ok_or_else(|| {
                DeflattenError::Classification(format!("block {addr:#x} has no resolved child"))
            })
    }

    fn ins_jumps_to_dispatcher(&mut self, ins: &Instruction) -> Result<bool> {
        if ins.opcode() != Opcode::B {
            return Ok(false);
        }
        let target = ins.branch_target()?;
        if self.ctx.function.get(target).is_none() {
            return Ok(false);
        }
        self.is_dispatcher(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::test_support::StubClassifier;
    use crate::{Block, Function};

    fn ins(addr: Address, mnemonic: &str, operands: &str) -> Instruction {
        Instruction::new(addr, mnemonic, operands, "00000000").unwrap()
    }

    fn wide_ins(addr: Address, mnemonic: &str, operands: &str) -> Instruction {
        Instruction::new(addr, mnemonic, operands, "0000000000000000").unwrap()
    }

    fn sim_with(blocks: Vec<Block>, dispatchers: Vec<Address>) -> Simulation {
        let function = Function::from_blocks(blocks).unwrap();
        let mut sim = Simulation::new(
            function,
            Box::new(StubClassifier {
                left: vec!["W8".to_string()],
                dispatchers: dispatchers.clone(),
            }),
        );
        sim.ctx.dispatchers = dispatchers;
        sim
    }

    fn set_children(sim: &mut Simulation, addr: Address, children: Vec<Address>) {
        let block = sim.ctx.function.block_mut(addr).unwrap();
        block.real_children = children;
    }

    fn replace(mnemonic: &str, operands: &str) -> Fix {
        Fix::Replace {
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
        }
    }

    #[test]
    fn test_branch_to_dispatcher_is_retargeted() {
        let real = Block::new(
            0x100,
            vec![ins(0x100, "ADD", "W0, W0, #0x1"), ins(0x104, "B", "loc_900")],
            vec![0x900],
        );
        let disp = Block::new(
            0x900,
            vec![ins(0x900, "CMP", "W8, W9"), ins(0x904, "B.EQ", "loc_100")],
            vec![0x100, 0x908],
        );
        let child = Block::new(0x500, vec![ins(0x500, "RET", "")], vec![]);
        let extra = Block::new(0x908, vec![ins(0x908, "RET", "")], vec![]);
        let mut sim = sim_with(vec![real, disp, child, extra], vec![0x900]);
        set_children(&mut sim, 0x100, vec![0x500]);

        sim.fix_block(0x100).unwrap();
        let block = sim.ctx.function.block(0x100).unwrap();
        assert_eq!(
            block.instructions[1].fix(),
            Some(&replace("B", "0x500"))
        );
    }

    #[test]
    fn test_select_then_branch_becomes_branch_pair() {
        // CSEL W8, W10, W9, EQ; B <dispatcher> turns into
        // B.EQ <child0>; B <child1>.
        let real = Block::new(
            0x100,
            vec![
                ins(0x100, "CSEL", "W8, W10, W9, EQ"),
                ins(0x104, "B", "loc_900"),
            ],
            vec![0x900],
        );
        let disp = Block::new(0x900, vec![ins(0x900, "CMP", "W8, W9")], vec![]);
        let c0 = Block::new(0x500, vec![ins(0x500, "RET", "")], vec![]);
        let c1 = Block::new(0x600, vec![ins(0x600, "RET", "")], vec![]);
        let mut sim = sim_with(vec![real, disp, c0, c1], vec![0x900]);
        set_children(&mut sim, 0x100, vec![0x500, 0x600]);
        sim.ctx.function.block_mut(0x100).unwrap().select = Some(0x100);

        sim.fix_block(0x100).unwrap();
        let block = sim.ctx.function.block(0x100).unwrap();
        assert_eq!(block.instructions[0].fix(), Some(&replace("B.EQ", "0x500")));
        assert_eq!(block.instructions[1].fix(), Some(&replace("B", "0x600")));
    }

    #[test]
    fn test_select_movk_branch_shape_nops_the_tail() {
        let real = Block::new(
            0x100,
            vec![
                ins(0x100, "CSEL", "W8, W22, W21, LT"),
                ins(0x104, "MOVK", "W10, #0x186A,LSL#16"),
                ins(0x108, "B", "loc_900"),
            ],
            vec![0x900],
        );
        let disp = Block::new(0x900, vec![ins(0x900, "CMP", "W8, W9")], vec![]);
        let c0 = Block::new(0x500, vec![ins(0x500, "RET", "")], vec![]);
        let c1 = Block::new(0x600, vec![ins(0x600, "RET", "")], vec![]);
        let mut sim = sim_with(vec![real, disp, c0, c1], vec![0x900]);
        set_children(&mut sim, 0x100, vec![0x500, 0x600]);
        sim.ctx.function.block_mut(0x100).unwrap().select = Some(0x100);

        sim.fix_block(0x100).unwrap();
        let block = sim.ctx.function.block(0x100).unwrap();
        assert_eq!(block.instructions[0].fix(), Some(&replace("B.LT", "0x500")));
        assert_eq!(block.instructions[1].fix(), Some(&replace("B", "0x600")));
        assert_eq!(block.instructions[2].fix(), Some(&Fix::Nop));
    }

    #[test]
    fn test_select_reorder_shape_shifts_addresses() {
        // CSEL; MOVK; STR — the STR moves ahead of the select and every
        // address is renumbered by one slot.
        let real = Block::new(
            0x100,
            vec![
                ins(0x100, "CSEL", "W8, W12, W19, EQ"),
                ins(0x104, "MOVK", "W9, #0x94FC,LSL#16"),
                ins(0x108, "STR", "W8, [SP,#0x10]"),
            ],
            vec![0x900],
        );
        let disp = Block::new(0x900, vec![ins(0x900, "CMP", "W8, W9")], vec![]);
        let c0 = Block::new(0x500, vec![ins(0x500, "RET", "")], vec![]);
        let c1 = Block::new(0x600, vec![ins(0x600, "RET", "")], vec![]);
        let mut sim = sim_with(vec![real, disp, c0, c1], vec![0x900]);
        set_children(&mut sim, 0x100, vec![0x500, 0x600]);
        sim.ctx.function.block_mut(0x100).unwrap().select = Some(0x100);

        sim.fix_block(0x100).unwrap();
        let block = sim.ctx.function.block(0x100).unwrap();
        // New program order: STR @0x100, CSEL @0x104, MOVK @0x108.
        assert_eq!(block.instructions[0].mnemonic, "STR");
        assert_eq!(block.instructions[0].address, 0x100);
        assert!(block.instructions[0].is_moved());
        assert_eq!(block.instructions[1].address, 0x104);
        assert_eq!(block.instructions[1].fix(), Some(&replace("B.EQ", "0x500")));
        assert_eq!(block.instructions[2].address, 0x108);
        assert_eq!(block.instructions[2].fix(), Some(&replace("B", "0x600")));
    }

    #[test]
    fn test_tail_state_write_becomes_branch() {
        let real = Block::new(
            0x100,
            vec![
                ins(0x100, "ADD", "W0, W0, #0x1"),
                ins(0x104, "MOV", "W8, #0x11112222"),
            ],
            vec![0x900],
        );
        let disp = Block::new(0x900, vec![ins(0x900, "CMP", "W8, W9")], vec![]);
        let child = Block::new(0x500, vec![ins(0x500, "RET", "")], vec![]);
        let mut sim = sim_with(vec![real, disp, child], vec![0x900]);
        set_children(&mut sim, 0x100, vec![0x500]);

        sim.fix_block(0x100).unwrap();
        let block = sim.ctx.function.block(0x100).unwrap();
        assert_eq!(block.instructions[1].fix(), Some(&replace("B", "0x500")));
    }

    #[test]
    fn test_mid_block_state_write_is_relocated() {
        // MOV W8 sits before a store; it is pulled out, the store slides
        // up, and the branch lands at the end.
        let real = Block::new(
            0x100,
            vec![
                ins(0x100, "MOV", "W8, #0x11112222"),
                ins(0x104, "STR", "W9, [SP,#0x10]"),
            ],
            vec![0x900],
        );
        let disp = Block::new(0x900, vec![ins(0x900, "CMP", "W8, W9")], vec![]);
        let child = Block::new(0x500, vec![ins(0x500, "RET", "")], vec![]);
        let mut sim = sim_with(vec![real, disp, child], vec![0x900]);
        set_children(&mut sim, 0x100, vec![0x500]);

        sim.fix_block(0x100).unwrap();
        let block = sim.ctx.function.block(0x100).unwrap();
        assert_eq!(block.instructions[0].mnemonic, "STR");
        assert_eq!(block.instructions[0].address, 0x100);
        assert!(block.instructions[0].is_moved());
        assert_eq!(block.instructions[1].mnemonic, "B");
        assert_eq!(block.instructions[1].address, 0x104);
        assert_eq!(block.instructions[1].fix(), Some(&replace("B", "0x500")));
    }

    #[test]
    fn test_swap_places_branch_last() {
        // The second-to-last MOV writes a non-state register, so the two
        // tail instructions swap addresses and the MOV becomes the branch.
        let real = Block::new(
            0x100,
            vec![
                ins(0x100, "MOV", "W9, #0x5"),
                ins(0x104, "STR", "W9, [SP,#0x10]"),
            ],
            vec![0x900],
        );
        let disp = Block::new(0x900, vec![ins(0x900, "CMP", "W8, W9")], vec![]);
        let child = Block::new(0x500, vec![ins(0x500, "RET", "")], vec![]);
        let mut sim = sim_with(vec![real, disp, child], vec![0x900]);
        set_children(&mut sim, 0x100, vec![0x500]);

        sim.fix_block(0x100).unwrap();
        let block = sim.ctx.function.block(0x100).unwrap();
        assert_eq!(block.instructions[0].mnemonic, "STR");
        assert_eq!(block.instructions[0].address, 0x100);
        assert!(block.instructions[0].is_moved());
        assert_eq!(block.instructions[1].mnemonic, "MOV");
        assert_eq!(block.instructions[1].address, 0x104);
        assert_eq!(block.instructions[1].fix(), Some(&replace("B", "0x500")));
    }

    #[test]
    fn test_single_store_fixes_via_next_dispatcher() {
        // STR XZR, [SP,#0x28] cannot carry a branch; the dispatcher's
        // first instruction does instead.
        let real = Block::new(
            0x100,
            vec![ins(0x100, "STR", "XZR, [SP,#0x28]")],
            vec![0x900],
        );
        let disp = Block::new(
            0x900,
            vec![ins(0x900, "CMP", "W8, W9"), ins(0x904, "B.EQ", "loc_100")],
            vec![0x100, 0x908],
        );
        let child = Block::new(0x500, vec![ins(0x500, "RET", "")], vec![]);
        let extra = Block::new(0x908, vec![ins(0x908, "RET", "")], vec![]);
        let mut sim = sim_with(vec![real, disp, child, extra], vec![0x900]);
        set_children(&mut sim, 0x100, vec![0x500]);

        sim.fix_block(0x100).unwrap();
        let disp = sim.ctx.function.block(0x900).unwrap();
        assert_eq!(disp.instructions[0].fix(), Some(&replace("B", "0x500")));
        // The STR itself stays untouched.
        let real = sim.ctx.function.block(0x100).unwrap();
        assert!(real.instructions[0].fix().is_none());
    }

    #[test]
    fn test_single_state_write_is_patched_in_place() {
        let real = Block::new(
            0x100,
            vec![wide_ins(0x100, "MOV", "W8, #0x77778888")],
            vec![0x900],
        );
        let disp = Block::new(
            0x900,
            vec![ins(0x900, "CMP", "W8, W9"), ins(0x904, "B.EQ", "loc_100")],
            vec![0x100, 0x908],
        );
        let child = Block::new(0x500, vec![ins(0x500, "RET", "")], vec![]);
        let extra = Block::new(0x908, vec![ins(0x908, "RET", "")], vec![]);
        let mut sim = sim_with(vec![real, disp, child, extra], vec![0x900]);
        set_children(&mut sim, 0x100, vec![0x500]);

        sim.fix_block(0x100).unwrap();
        let block = sim.ctx.function.block(0x100).unwrap();
        assert_eq!(block.instructions[0].fix(), Some(&replace("B", "0x500")));
        // The 8-byte write needs a filler NOP for its upper half.
        assert_eq!(block.instructions[1].fix(), Some(&Fix::Nop));
        assert_eq!(block.instructions[1].address, 0x104);
    }

    #[test]
    fn test_sweep_nops_every_unfixed_dispatcher_instruction() {
        let disp = Block::new(
            0x900,
            vec![
                wide_ins(0x900, "MOV", "W9, #0x11112222"),
                ins(0x908, "CMP", "W8, W9"),
                ins(0x90c, "B.EQ", "loc_100"),
            ],
            vec![0x100, 0x910],
        );
        let a = Block::new(0x100, vec![ins(0x100, "RET", "")], vec![]);
        let b = Block::new(0x910, vec![ins(0x910, "RET", "")], vec![]);
        let mut sim = sim_with(vec![disp, a, b], vec![0x900]);

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        sim.sweep_dispatchers(&mut records, &mut seen).unwrap();

        let addresses: Vec<Address> = records.iter().map(|r| r.address).collect();
        // The 8-byte MOV produces a pad NOP at 0x904.
        assert_eq!(addresses, vec![0x900, 0x904, 0x908, 0x90c]);
        assert!(records.iter().all(|r| r.kind == PatchKind::Nop));
    }
}
