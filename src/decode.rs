//! Mnemonic and operand decoding for IDA-style AArch64 text.
//!
//! The engine never sees machine bytes; every instruction arrives as a
//! mnemonic plus one operand string exactly as the disassembler printed
//! it. This module turns that text into typed values: an [`Opcode`], a
//! fixed operand array, and condition codes.

use crate::{DeflattenError, Result};

/// AArch64 opcodes the engine can name.
///
/// Mnemonics outside this table map to [`Opcode::None`] rather than an
/// error: real blocks are free to contain arbitrary instructions, and the
/// simulator only demands known opcodes while running dispatcher blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Adc,
    Adcs,
    Add,
    Adds,
    Adrl,
    Adrp,
    And,
    Asr,
    B,
    BEq,
    BGe,
    BGt,
    BLe,
    BLt,
    BNe,
    Bfi,
    Bic,
    Bl,
    Blr,
    Cbnz,
    Cbz,
    Ccmp,
    Cmn,
    Cmp,
    Csel,
    Cset,
    Csinc,
    Dup,
    Eon,
    Eor,
    Fcmp,
    Ldp,
    Ldr,
    Ldrb,
    Ldrsw,
    Ldur,
    Ldurb,
    Lsl,
    Lsr,
    Madd,
    Mov,
    Movi,
    Movk,
    Mrs,
    Msub,
    Mul,
    Mvn,
    Nop,
    Orr,
    Ret,
    Scvtf,
    Sdiv,
    Stp,
    Str,
    Strb,
    Strh,
    Stur,
    Sturb,
    Sub,
    Subs,
    Sxtw,
    Tbnz,
    Tst,
    None,
}

impl Opcode {
    /// Map a raw mnemonic to an opcode; unknown text maps to `None`.
    pub fn from_mnemonic(mnemonic: &str) -> Opcode {
        match mnemonic {
            "ADC" => Opcode::Adc,
            "ADCS" => Opcode::Adcs,
            "ADD" => Opcode::Add,
            "ADDS" => Opcode::Adds,
            "ADRL" => Opcode::Adrl,
            "ADRP" => Opcode::Adrp,
            "AND" => Opcode::And,
            "ASR" => Opcode::Asr,
            "B" => Opcode::B,
            "B.EQ" => Opcode::BEq,
            "B.GE" => Opcode::BGe,
            "B.GT" => Opcode::BGt,
            "B.LE" => Opcode::BLe,
            "B.LT" => Opcode::BLt,
            "B.NE" => Opcode::BNe,
            "BFI" => Opcode::Bfi,
            "BIC" => Opcode::Bic,
            "BL" => Opcode::Bl,
            "BLR" => Opcode::Blr,
            "CBNZ" => Opcode::Cbnz,
            "CBZ" => Opcode::Cbz,
            "CCMP" => Opcode::Ccmp,
            "CMN" => Opcode::Cmn,
            "CMP" => Opcode::Cmp,
            "CSEL" => Opcode::Csel,
            "CSET" => Opcode::Cset,
            "CSINC" => Opcode::Csinc,
            "DUP" => Opcode::Dup,
            "EON" => Opcode::Eon,
            "EOR" => Opcode::Eor,
            "FCMP" => Opcode::Fcmp,
            "LDP" => Opcode::Ldp,
            "LDR" => Opcode::Ldr,
            "LDRB" => Opcode::Ldrb,
            "LDRSW" => Opcode::Ldrsw,
            "LDUR" => Opcode::Ldur,
            "LDURB" => Opcode::Ldurb,
            "LSL" => Opcode::Lsl,
            "LSR" => Opcode::Lsr,
            "MADD" => Opcode::Madd,
            "MOV" => Opcode::Mov,
            "MOVI" => Opcode::Movi,
            "MOVK" => Opcode::Movk,
            "MRS" => Opcode::Mrs,
            "MSUB" => Opcode::Msub,
            "MUL" => Opcode::Mul,
            "MVN" => Opcode::Mvn,
            "NOP" => Opcode::Nop,
            "ORR" => Opcode::Orr,
            "RET" => Opcode::Ret,
            "SCVTF" => Opcode::Scvtf,
            "SDIV" => Opcode::Sdiv,
            "STP" => Opcode::Stp,
            "STR" => Opcode::Str,
            "STRB" => Opcode::Strb,
            "STRH" => Opcode::Strh,
            "STUR" => Opcode::Stur,
            "STURB" => Opcode::Sturb,
            "SUB" => Opcode::Sub,
            "SUBS" => Opcode::Subs,
            "SXTW" => Opcode::Sxtw,
            "TBNZ" => Opcode::Tbnz,
            "TST" => Opcode::Tst,
            _ => Opcode::None,
        }
    }

    /// True for the B.cond family.
    pub fn is_cond_branch(self) -> bool {
        matches!(
            self,
            Opcode::BEq | Opcode::BNe | Opcode::BGt | Opcode::BLe | Opcode::BLt | Opcode::BGe
        )
    }

    /// The condition a B.cond branch tests, if this is one.
    pub fn condition(self) -> Option<ConditionCode> {
        match self {
            Opcode::BEq => Some(ConditionCode::Eq),
            Opcode::BNe => Some(ConditionCode::Ne),
            Opcode::BGt => Some(ConditionCode::Gt),
            Opcode::BLe => Some(ConditionCode::Le),
            Opcode::BLt => Some(ConditionCode::Lt),
            Opcode::BGe => Some(ConditionCode::Ge),
            _ => None,
        }
    }

    /// Render an opcode back into patchable mnemonic text.
    ///
    /// Only the opcodes the patch synthesizer emits are renderable;
    /// asking for anything else is a structural error.
    pub fn mnemonic_text(self) -> Result<&'static str> {
        match self {
            Opcode::B => Ok("B"),
            Opcode::BEq => Ok("B.EQ"),
            Opcode::BNe => Ok("B.NE"),
            Opcode::BGt => Ok("B.GT"),
            Opcode::BLe => Ok("B.LE"),
            Opcode::BLt => Ok("B.LT"),
            Opcode::BGe => Ok("B.GE"),
            Opcode::Mov => Ok("MOV"),
            Opcode::Movk => Ok("MOVK"),
            Opcode::Nop => Ok("NOP"),
            other => Err(DeflattenError::Structural(format!(
                "opcode {other:?} has no patchable mnemonic"
            ))),
        }
    }
}

/// AArch64 condition codes as spelled in operand text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionCode {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
    Nv,
}

impl ConditionCode {
    fn from_keyword(text: &str) -> Option<ConditionCode> {
        match text {
            "EQ" => Some(ConditionCode::Eq),
            "NE" => Some(ConditionCode::Ne),
            "CS" => Some(ConditionCode::Cs),
            "CC" => Some(ConditionCode::Cc),
            "MI" => Some(ConditionCode::Mi),
            "PL" => Some(ConditionCode::Pl),
            "VS" => Some(ConditionCode::Vs),
            "VC" => Some(ConditionCode::Vc),
            "HI" => Some(ConditionCode::Hi),
            "LS" => Some(ConditionCode::Ls),
            "GE" => Some(ConditionCode::Ge),
            "LT" => Some(ConditionCode::Lt),
            "GT" => Some(ConditionCode::Gt),
            "LE" => Some(ConditionCode::Le),
            "AL" => Some(ConditionCode::Al),
            "NV" => Some(ConditionCode::Nv),
            _ => None,
        }
    }
}

/// The conditional-branch opcode a CSEL condition turns into when the
/// select is rewritten as a branch pair.
///
/// CC maps to B.LT: the obfuscator only emits CC on selects whose
/// operands were staged as signed comparisons.
pub fn branch_for_condition(cc: ConditionCode) -> Result<Opcode> {
    match cc {
        ConditionCode::Eq => Ok(Opcode::BEq),
        ConditionCode::Ne => Ok(Opcode::BNe),
        ConditionCode::Lt => Ok(Opcode::BLt),
        ConditionCode::Gt => Ok(Opcode::BGt),
        ConditionCode::Le => Ok(Opcode::BLe),
        ConditionCode::Ge => Ok(Opcode::BGe),
        ConditionCode::Cc => Ok(Opcode::BLt),
        other => Err(DeflattenError::Structural(format!(
            "no branch rewrite for select condition {other:?}"
        ))),
    }
}

/// Shift suffix kinds. The obfuscator only ever emits LSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
}

/// One classified operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// A general register by name (`X`/`W` prefixed).
    Register(String),
    /// `#`-prefixed immediate.
    Immediate(i64),
    /// SIMD vector element, opaque to the engine.
    VectorElement(String),
    /// Bracketed memory reference; `addend` keeps the raw offset token.
    Memory { base: String, addend: String },
    /// `loc_`-prefixed pc-relative label.
    PcRelative(u64),
    /// `LSL#n` shift suffix.
    ShiftedRegister { kind: ShiftKind, amount: u32 },
    /// Trailing condition-code keyword.
    Condition(ConditionCode),
    /// Anything the classification order does not recognize.
    None,
}

impl Operand {
    /// Register name, if this operand is a register.
    pub fn register(&self) -> Option<&str> {
        match self {
            Operand::Register(name) => Some(name),
            _ => None,
        }
    }

    /// Immediate value, if this operand is an immediate.
    pub fn immediate(&self) -> Option<i64> {
        match self {
            Operand::Immediate(v) => Some(*v),
            _ => None,
        }
    }
}

/// Split an operand string into typed operands.
///
/// Classification order: register, immediate, vector element, memory,
/// pc-relative label, shifted-register suffix, condition code, none.
/// Splitting is bracket-aware so memory operands keep their inner comma.
pub fn parse_operands(text: &str) -> Result<Vec<Operand>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    split_top_level(text)
        .into_iter()
        .map(|token| parse_operand(token.trim()))
        .collect()
}

fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_operand(token: &str) -> Result<Operand> {
    if token.starts_with('X') || token.starts_with('W') {
        return Ok(Operand::Register(token.to_string()));
    }
    if let Some(imm) = token.strip_prefix('#') {
        // Symbolic expressions like #0x2D0+var_2B0 are not immediates the
        // engine can evaluate; they classify as none.
        return Ok(match parse_immediate(imm) {
            Some(value) => Operand::Immediate(value),
            None => Operand::None,
        });
    }
    if token.starts_with('v') {
        return Ok(Operand::VectorElement(token.to_string()));
    }
    if token.starts_with('[') && token.ends_with(']') {
        let inner = &token[1..token.len() - 1];
        return Ok(match inner.split_once(',') {
            Some((base, addend)) => Operand::Memory {
                base: base.trim().to_string(),
                addend: addend.trim().to_string(),
            },
            None => Operand::Memory {
                base: inner.trim().to_string(),
                addend: "0".to_string(),
            },
        });
    }
    if let Some(label) = token.strip_prefix("loc_") {
        let addr = u64::from_str_radix(label, 16).map_err(|_| {
            DeflattenError::Format(format!("malformed pc-relative label {token:?}"))
        })?;
        return Ok(Operand::PcRelative(addr));
    }
    if let Some(amount) = token.strip_prefix("LSL#") {
        let amount: u32 = amount
            .parse()
            .map_err(|_| DeflattenError::Format(format!("malformed shift amount {token:?}")))?;
        return Ok(Operand::ShiftedRegister {
            kind: ShiftKind::Lsl,
            amount,
        });
    }
    if let Some(cc) = ConditionCode::from_keyword(token) {
        return Ok(Operand::Condition(cc));
    }
    Ok(Operand::None)
}

// IDA prints immediates in hex whether or not it writes the 0x prefix, so
// the radix is fixed at 16.
fn parse_immediate(imm: &str) -> Option<i64> {
    if imm == "0" {
        return Some(0);
    }
    let (negative, digits) = match imm.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, imm),
    };
    let digits = digits.strip_prefix("0x").unwrap_or(digits);
    let value = i64::from_str_radix(digits, 16).ok()?;
    Some(if negative { -value } else { value })
}
