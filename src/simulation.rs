//! CFG simulation and real-graph reconstruction.
//!
//! Starting from the discovered entry block, the simulation walks the
//! graph: dispatcher blocks are symbolically executed against the live
//! register context to find the one successor they actually select, and
//! real blocks have their true children resolved recursively. A block
//! carrying a flattening conditional select is resolved twice — once per
//! select arm — under a register snapshot so neither exploration leaks
//! state into the other.

use log::{debug, info, warn};

use crate::classify::Classifier;
use crate::decode::{Opcode, Operand};
use crate::regs::RegisterContext;
use crate::{
    Address, DeflattenError, Function, Instruction, PatchRecord, Resolve, Result,
};

/// Mutable engine state shared with the classifier.
///
/// Classifier methods receive `&SimContext` while mutating their own
/// caches, so everything a heuristic may need to inspect lives here.
#[derive(Debug)]
pub struct SimContext {
    /// The function under analysis.
    pub function: Function,
    /// Live register state, mutated in strict program order.
    pub regs: RegisterContext,
    /// Dispatcher blocks, in discovery order.
    pub dispatchers: Vec<Address>,
    /// Resolved real blocks, in discovery order.
    pub reals: Vec<Address>,
}

impl SimContext {
    /// True when the walk already ran this block as a dispatcher.
    pub fn is_known_dispatcher(&self, addr: Address) -> bool {
        self.dispatchers.contains(&addr)
    }
}

/// Drives classification, symbolic execution, and patch synthesis over
/// one function.
pub struct Simulation {
    pub(crate) classifier: Box<dyn Classifier>,
    pub(crate) ctx: SimContext,
}

impl Simulation {
    /// Build a simulation over `function` using the given classifier
    /// strategy.
    pub fn new(function: Function, classifier: Box<dyn Classifier>) -> Self {
        info!("simulation initialized with {} blocks", function.len());
        Simulation {
            classifier,
            ctx: SimContext {
                function,
                regs: RegisterContext::new(),
                dispatchers: Vec::new(),
                reals: Vec::new(),
            },
        }
    }

    /// Engine state, for inspection after a run.
    pub fn context(&self) -> &SimContext {
        &self.ctx
    }

    /// Run the whole pipeline: find the entry, rebuild the real graph,
    /// synthesize patches.
    pub fn run(&mut self) -> Result<Vec<PatchRecord>> {
        self.classifier.init(&self.ctx)?;

        let addrs: Vec<Address> = self.ctx.function.blocks().map(|b| b.start).collect();
        let entry = addrs
            .iter()
            .copied()
            .find(|a| self.classifier.is_init_block(&self.ctx, *a))
            .ok_or_else(|| {
                DeflattenError::Classification("no entry block discovered".to_string())
            })?;
        info!("entry block found at {entry:#x}");

        self.find_real_block(entry)?;
        self.rebuild()
    }

    /// Dispatcher test combining the walk's discoveries with the
    /// classifier's pattern matching.
    pub(crate) fn is_dispatcher(&mut self, addr: Address) -> Result<bool> {
        if self.ctx.is_known_dispatcher(addr) {
            return Ok(true);
        }
        self.classifier.is_dispatcher_block(&self.ctx, addr)
    }

    /// Resolve `addr` to the real block it stands for, executing any
    /// dispatcher blocks along the way.
    pub(crate) fn find_real_block(&mut self, addr: Address) -> Result<Address> {
        if self.is_dispatcher(addr)? {
            debug!("running dispatcher block {addr:#x}");
            let next = self.run_dispatcher_block(addr)?;
            if !self.ctx.dispatchers.contains(&addr) {
                self.ctx.dispatchers.push(addr);
            }
            return self.find_real_block(next);
        }

        if self.classifier.is_real_block(&self.ctx, addr)? {
            self.resolve_children(addr)?;
            if !self.ctx.reals.contains(&addr) {
                self.ctx.reals.push(addr);
            }
            return Ok(addr);
        }

        Err(DeflattenError::Classification(format!(
            "block {addr:#x} is neither dispatcher nor real"
        )))
    }

    /// Symbolically execute one dispatcher block and return the
    /// successor it selects under the current register state.
    pub(crate) fn run_dispatcher_block(&mut self, addr: Address) -> Result<Address> {
        let block = self.ctx.function.block(addr)?;
        let insns = block.instructions.clone();
        let links = block.links.clone();

        for ins in &insns {
            match ins.opcode() {
                Opcode::Mov | Opcode::Movk => self.apply_register_write(ins)?,
                Opcode::Cmp => {
                    let ops = ins.operands();
                    match (
                        ops.first().and_then(Operand::register),
                        ops.get(1).and_then(Operand::register),
                    ) {
                        (Some(left), Some(right)) => {
                            self.ctx.regs.compare(left, right);
                            debug!("compare {left} against {right} at {:#x}", ins.address);
                        }
                        _ => {
                            return Err(DeflattenError::UnsupportedOpcode(format!(
                                "non-register compare at {:#x}: {ins}",
                                ins.address
                            )))
                        }
                    }
                }
                Opcode::B => {
                    let target = ins.branch_target()?;
                    if links.contains(&target) {
                        return Ok(target);
                    }
                    return Err(DeflattenError::Structural(format!(
                        "branch target {target:#x} is not a declared successor of {addr:#x}"
                    )));
                }
                other => {
                    let Some(cc) = other.condition() else {
                        return Err(DeflattenError::UnsupportedOpcode(format!(
                            "{} at {:#x} while running dispatcher {addr:#x}",
                            ins.mnemonic, ins.address
                        )));
                    };
                    let taken = self.ctx.regs.condition_holds(cc)?;
                    let next = if taken {
                        ins.branch_target()?
                    } else {
                        ins.address + 4
                    };
                    debug!(
                        "dispatcher {addr:#x}: {} {} -> {next:#x}",
                        ins.mnemonic,
                        if taken { "taken" } else { "not taken" }
                    );
                    if links.contains(&next) {
                        return Ok(next);
                    }
                    return Err(DeflattenError::Structural(format!(
                        "selected successor {next:#x} is not a declared successor of {addr:#x}"
                    )));
                }
            }
        }

        // A bare state write recurses into its single successor.
        if insns.len() == 1 {
            return links.first().copied().ok_or_else(|| {
                DeflattenError::Structural(format!("dispatcher {addr:#x} has no successor"))
            });
        }

        Err(DeflattenError::Classification(format!(
            "dispatcher {addr:#x} ended without selecting a successor"
        )))
    }

    fn apply_register_write(&mut self, ins: &Instruction) -> Result<()> {
        let ops = ins.operands();
        match ins.opcode() {
            Opcode::Mov => {
                if let (Some(dest), Some(value)) = (
                    ops.first().and_then(Operand::register),
                    ops.get(1).and_then(Operand::immediate),
                ) {
                    debug!("{dest} = {value:#x}");
                    self.ctx.regs.set_immediate(dest, value);
                }
            }
            Opcode::Movk => {
                if let (Some(dest), Some(value)) = (
                    ops.first().and_then(Operand::register),
                    ops.get(1).and_then(Operand::immediate),
                ) {
                    let shift = match ops.get(2) {
                        Some(Operand::ShiftedRegister { amount, .. }) => *amount,
                        _ => 0,
                    };
                    let current = self.ctx.regs.get_long(dest)?;
                    let composed = movk_value(current, value, shift);
                    debug!("{dest} = {composed:#x} (movk)");
                    self.ctx.regs.set_immediate(dest, composed);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Replay a real block's register-affecting instructions so later
    /// dispatcher decisions see its effects.
    fn sync_block(&mut self, addr: Address) -> Result<()> {
        let insns = self.ctx.function.block(addr)?.instructions.clone();
        for ins in &insns {
            let ops = ins.operands();
            match ins.opcode() {
                Opcode::Mov | Opcode::Movk => self.apply_register_write(ins)?,
                Opcode::Str => {
                    if let (Some(src), Some(Operand::Memory { base, addend })) =
                        (ops.first().and_then(Operand::register), ops.get(1))
                    {
                        if base == crate::regs::SP {
                            if let Ok(value) = self.ctx.regs.get_long(src) {
                                self.ctx.regs.stack_put(addend, value);
                            }
                        }
                    }
                }
                Opcode::Ldr => {
                    if let (Some(dest), Some(Operand::Memory { base, addend })) =
                        (ops.first().and_then(Operand::register), ops.get(1))
                    {
                        if base == crate::regs::SP {
                            if let Some(value) = self.ctx.regs.stack_get(addend) {
                                self.ctx.regs.set_immediate(dest, value);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Compute a real block's true children, storing them on the block.
    ///
    /// Re-entering a block whose children are still being computed
    /// returns whatever is recorded so far; a genuine cycle outside the
    /// select construct therefore resolves incompletely rather than
    /// recursing forever.
    fn resolve_children(&mut self, addr: Address) -> Result<Vec<Address>> {
        {
            let block = self.ctx.function.block(addr)?;
            match block.resolve {
                Resolve::InProgress => {
                    warn!("block {addr:#x} revisited while resolving; returning partial children");
                    return Ok(block.real_children.clone());
                }
                Resolve::Resolved => return Ok(block.real_children.clone()),
                Resolve::Unvisited => {}
            }
        }
        self.ctx.function.block_mut(addr)?.resolve = Resolve::InProgress;

        let dispatch_next = self
            .classifier
            .is_real_block_with_dispatch_next(&self.ctx, addr)?;
        if dispatch_next {
            self.sync_block(addr)?;
        }

        let select = self.find_flattening_select(addr)?;
        let links = self.ctx.function.block(addr)?.links.clone();

        let children = if let Some(sel) = select {
            self.ctx.function.block_mut(addr)?.select = Some(sel);
            debug!("block {addr:#x} carries a flattening select at {sel:#x}");
            self.resolve_select_children(addr, sel, &links)?
        } else if dispatch_next {
            if links.len() != 1 {
                return Err(DeflattenError::Classification(format!(
                    "dispatch-next block {addr:#x} has {} successors, expected 1",
                    links.len()
                )));
            }
            vec![self.find_real_block(links[0])?]
        } else {
            match links.len() {
                0 => Vec::new(),
                // A genuine two-way branch the obfuscator left alone.
                2 => {
                    let first = self.find_real_block(links[0])?;
                    let second = self.find_real_block(links[1])?;
                    vec![first, second]
                }
                _ => vec![self.find_real_block(links[0])?],
            }
        };

        let block = self.ctx.function.block_mut(addr)?;
        block.real_children = children.clone();
        block.resolve = Resolve::Resolved;
        Ok(children)
    }

    /// Explore both arms of a flattening select under snapshot/restore.
    fn resolve_select_children(
        &mut self,
        addr: Address,
        sel: Address,
        links: &[Address],
    ) -> Result<Vec<Address>> {
        let (dest, true_src, false_src) = {
            let block = self.ctx.function.block(addr)?;
            let ins = block
                .instructions
                .iter()
                .find(|i| i.address == sel)
                .ok_or_else(|| {
                    DeflattenError::Lookup(format!("no instruction at {sel:#x} in block {addr:#x}"))
                })?;
            let ops = ins.operands();
            let reg = |i: usize| -> Result<String> {
                ops.get(i)
                    .and_then(Operand::register)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        DeflattenError::Structural(format!(
                            "select at {sel:#x} has a non-register operand {i}"
                        ))
                    })
            };
            (reg(0)?, reg(1)?, reg(2)?)
        };
        let next = links.first().copied().ok_or_else(|| {
            DeflattenError::Structural(format!("select block {addr:#x} has no successor"))
        })?;

        self.ctx.regs.snapshot(addr);
        let true_value = self.ctx.regs.value(&true_src);
        self.ctx.regs.set_value(&dest, true_value);
        let left = self.find_real_block(next)?;
        debug!("select block {addr:#x}: true arm leads to {left:#x}");

        self.ctx.regs.restore(addr)?;
        let false_value = self.ctx.regs.value(&false_src);
        self.ctx.regs.set_value(&dest, false_value);
        let right = self.find_real_block(next)?;
        debug!("select block {addr:#x}: false arm leads to {right:#x}");

        Ok(vec![left, right])
    }

    fn find_flattening_select(&mut self, addr: Address) -> Result<Option<Address>> {
        let block = self.ctx.function.block(addr)?;
        for ins in &block.instructions {
            if ins.opcode() == Opcode::Csel
                && self
                    .classifier
                    .is_select_operand_dispatch_register(&self.ctx, ins)?
            {
                return Ok(Some(ins.address));
            }
        }
        Ok(None)
    }
}

/// MOVK: replace one 16-bit lane of the current value.
pub(crate) fn movk_value(current: i64, imm: i64, shift: u32) -> i64 {
    (current & !(0xFFFFi64 << shift)) | ((imm & 0xFFFF) << shift)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Fixed-answer classifier for exercising simulation and patching in
    /// isolation.
    pub(crate) struct StubClassifier {
        pub left: Vec<String>,
        pub dispatchers: Vec<Address>,
    }

    impl Classifier for StubClassifier {
        fn init(&mut self, _ctx: &SimContext) -> Result<()> {
            Ok(())
        }

        fn is_init_block(&self, _ctx: &SimContext, _addr: Address) -> bool {
            false
        }

        fn dispatcher_operand_registers(&self) -> &[String] {
            &self.left
        }

        fn is_dispatcher_block(&mut self, _ctx: &SimContext, addr: Address) -> Result<bool> {
            Ok(self.dispatchers.contains(&addr))
        }

        fn is_real_block(&mut self, _ctx: &SimContext, _addr: Address) -> Result<bool> {
            Ok(true)
        }

        fn is_real_block_with_dispatch_next(
            &mut self,
            _ctx: &SimContext,
            _addr: Address,
        ) -> Result<bool> {
            Ok(false)
        }

        fn is_select_operand_dispatch_register(
            &mut self,
            _ctx: &SimContext,
            ins: &Instruction,
        ) -> Result<bool> {
            Ok(ins
                .operands()
                .first()
                .and_then(Operand::register)
                .is_some_and(|r| self.left.iter().any(|l| l == r)))
        }
    }
}
