//! Register state for dispatcher simulation.
//!
//! The dispatcher decides where control goes by comparing a state
//! register against pre-loaded constants, so the simulator only needs a
//! named-register store of 64-bit immediates, plus a stack-slot store for
//! obfuscations that stage constants through `[SP, offset]` instead of a
//! register. Snapshot/restore (keyed by block address) lets the graph
//! builder explore both arms of a conditional select from the same point
//! without cross-contamination.

use std::collections::HashMap;

use crate::decode::ConditionCode;
use crate::{Address, DeflattenError, Result};

/// Value read from a register the simulation never wrote.
pub const UNKNOWN_VALUE: i64 = 0;

/// Name of the stack-pointer pseudo-register holding the slot store.
pub const SP: &str = "SP";

/// What a register currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterValue {
    /// A concrete 64-bit value.
    Immediate(i64),
    /// Per-slot values addressed relative to the stack pointer, keyed by
    /// the raw offset token from the memory operand.
    StackSlots(HashMap<String, i64>),
}

/// Named-register store with snapshot/restore and comparison state.
#[derive(Debug, Clone, Default)]
pub struct RegisterContext {
    registers: HashMap<String, RegisterValue>,
    snapshots: HashMap<Address, HashMap<String, RegisterValue>>,
    compared: Option<(String, String)>,
}

impl RegisterContext {
    /// Fresh context with no known registers.
    pub fn new() -> Self {
        RegisterContext::default()
    }

    /// Current value of a register; unknown registers read as the zero
    /// sentinel rather than an error.
    pub fn value(&self, name: &str) -> RegisterValue {
        self.registers
            .get(name)
            .cloned()
            .unwrap_or(RegisterValue::Immediate(UNKNOWN_VALUE))
    }

    /// Store a concrete value.
    pub fn set_immediate(&mut self, name: &str, value: i64) {
        self.registers
            .insert(name.to_string(), RegisterValue::Immediate(value));
    }

    /// Store any register value (used when a select copies one register
    /// into another).
    pub fn set_value(&mut self, name: &str, value: RegisterValue) {
        self.registers.insert(name.to_string(), value);
    }

    /// 64-bit read; a stack-slot value is the wrong kind for this.
    pub fn get_long(&self, name: &str) -> Result<i64> {
        match self.registers.get(name) {
            None => Ok(UNKNOWN_VALUE),
            Some(RegisterValue::Immediate(v)) => Ok(*v),
            Some(RegisterValue::StackSlots(_)) => Err(DeflattenError::Type(format!(
                "register {name} does not hold an immediate"
            ))),
        }
    }

    /// 32-bit read, truncating the stored 64-bit value.
    pub fn get_int(&self, name: &str) -> Result<i32> {
        Ok(self.get_long(name)? as i32)
    }

    /// Write a value into a stack slot.
    pub fn stack_put(&mut self, slot: &str, value: i64) {
        let entry = self
            .registers
            .entry(SP.to_string())
            .or_insert_with(|| RegisterValue::StackSlots(HashMap::new()));
        if let RegisterValue::StackSlots(slots) = entry {
            slots.insert(slot.to_string(), value);
        }
    }

    /// Read a stack slot, if it was ever written.
    pub fn stack_get(&self, slot: &str) -> Option<i64> {
        match self.registers.get(SP) {
            Some(RegisterValue::StackSlots(slots)) => slots.get(slot).copied(),
            _ => None,
        }
    }

    /// Record the two operand names of a comparison. No register is
    /// mutated; the names are consulted when a later conditional branch
    /// or select is evaluated.
    pub fn compare(&mut self, left: &str, right: &str) {
        self.compared = Some((left.to_string(), right.to_string()));
    }

    /// The operand names of the last recorded comparison.
    pub fn compared(&self) -> Option<(&str, &str)> {
        self.compared.as_ref().map(|(l, r)| (l.as_str(), r.as_str()))
    }

    /// Evaluate a condition against the last recorded comparison, with
    /// signed semantics: 32-bit when the left operand is a W register,
    /// 64-bit otherwise.
    pub fn condition_holds(&self, cc: ConditionCode) -> Result<bool> {
        let (left, right) = self.compared.as_ref().ok_or_else(|| {
            DeflattenError::Classification(
                "conditional branch evaluated without a prior comparison".to_string(),
            )
        })?;
        if left.starts_with('W') {
            let l = self.get_int(left)?;
            let r = self.get_int(right)?;
            evaluate(cc, i64::from(l), i64::from(r))
        } else {
            let l = self.get_long(left)?;
            let r = self.get_long(right)?;
            evaluate(cc, l, r)
        }
    }

    /// Save a full copy of the register map under `key`.
    pub fn snapshot(&mut self, key: Address) {
        self.snapshots.insert(key, self.registers.clone());
    }

    /// Reinstate the register map saved under `key`, consuming the entry.
    pub fn restore(&mut self, key: Address) -> Result<()> {
        let saved = self.snapshots.remove(&key).ok_or_else(|| {
            DeflattenError::Lookup(format!("no register snapshot for block {key:#x}"))
        })?;
        self.registers = saved;
        Ok(())
    }

    /// The live register map (snapshot-symmetry checks compare this).
    pub fn registers(&self) -> &HashMap<String, RegisterValue> {
        &self.registers
    }
}

fn evaluate(cc: ConditionCode, l: i64, r: i64) -> Result<bool> {
    match cc {
        ConditionCode::Eq => Ok(l == r),
        ConditionCode::Ne => Ok(l != r),
        ConditionCode::Gt => Ok(l > r),
        ConditionCode::Le => Ok(l <= r),
        ConditionCode::Lt => Ok(l < r),
        ConditionCode::Ge => Ok(l >= r),
        other => Err(DeflattenError::Classification(format!(
            "no evaluation semantics for condition {other:?}"
        ))),
    }
}
