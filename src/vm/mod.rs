// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Rule bytecode: the opcode set and the validated [`Code`] form
//!
//! Rule programs arrive as raw big-endian bytecode inside the Silf table. A
//! single decoding pass validates the stream and splits it into a linear
//! opcode array plus a parameter buffer, which the [`Machine`] then executes
//! without further checks. A program that fails validation is *inert*: it
//! carries its failure status, and running it is a no-op.
//!
//! Validation never panics and never unwinds; a hostile font can at worst
//! produce an inert program.

mod machine;

pub use machine::MachineStatus;
pub(crate) use machine::{Machine, SlotMap, INSTRUCTION_BUDGET};

use crate::segment::SlotAttr;
use log::debug;

/// The opcode set
///
/// Numeric values and parameter widths are fixed ABI: they are what Silf
/// tables encode. Multi-byte immediates are MSB-first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    PushByte = 1,
    PushByteU = 2,
    PushShort = 3,
    PushShortU = 4,
    PushLong = 5,
    Add = 6,
    Sub = 7,
    Mul = 8,
    Div = 9,
    Min = 10,
    Max = 11,
    Neg = 12,
    Trunc8 = 13,
    Trunc16 = 14,
    Cond = 15,
    And = 16,
    Or = 17,
    Not = 18,
    Equal = 19,
    NotEq = 20,
    Less = 21,
    Gtr = 22,
    LessEq = 23,
    GtrEq = 24,
    Next = 25,
    NextN = 26,
    CopyNext = 27,
    PutGlyph8bitObs = 28,
    PutSubs8bitObs = 29,
    PutCopy = 30,
    Insert = 31,
    Delete = 32,
    Assoc = 33,
    CntxtItem = 34,
    AttrSet = 35,
    AttrAdd = 36,
    AttrSub = 37,
    AttrSetSlot = 38,
    IAttrSetSlot = 39,
    PushSlotAttr = 40,
    PushGlyphAttrObs = 41,
    PushGlyphMetric = 42,
    PushFeat = 43,
    PushAttToGattrObs = 44,
    PushAttToGlyphMetric = 45,
    PushISlotAttr = 46,
    PushIGlyphAttr = 47,
    PopRet = 48,
    RetZero = 49,
    RetTrue = 50,
    IAttrSet = 51,
    IAttrAdd = 52,
    IAttrSub = 53,
    PushProcState = 54,
    PushVersion = 55,
    PutSubs = 56,
    PutSubs2 = 57,
    PutSubs3 = 58,
    PutGlyph = 59,
    PushGlyphAttr = 60,
    PushAttToGlyphAttr = 61,
}

impl Opcode {
    pub(crate) fn from_u8(op: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match op {
            0 => Nop,
            1 => PushByte,
            2 => PushByteU,
            3 => PushShort,
            4 => PushShortU,
            5 => PushLong,
            6 => Add,
            7 => Sub,
            8 => Mul,
            9 => Div,
            10 => Min,
            11 => Max,
            12 => Neg,
            13 => Trunc8,
            14 => Trunc16,
            15 => Cond,
            16 => And,
            17 => Or,
            18 => Not,
            19 => Equal,
            20 => NotEq,
            21 => Less,
            22 => Gtr,
            23 => LessEq,
            24 => GtrEq,
            25 => Next,
            26 => NextN,
            27 => CopyNext,
            28 => PutGlyph8bitObs,
            29 => PutSubs8bitObs,
            30 => PutCopy,
            31 => Insert,
            32 => Delete,
            33 => Assoc,
            34 => CntxtItem,
            35 => AttrSet,
            36 => AttrAdd,
            37 => AttrSub,
            38 => AttrSetSlot,
            39 => IAttrSetSlot,
            40 => PushSlotAttr,
            41 => PushGlyphAttrObs,
            42 => PushGlyphMetric,
            43 => PushFeat,
            44 => PushAttToGattrObs,
            45 => PushAttToGlyphMetric,
            46 => PushISlotAttr,
            47 => PushIGlyphAttr,
            48 => PopRet,
            49 => RetZero,
            50 => RetTrue,
            51 => IAttrSet,
            52 => IAttrAdd,
            53 => IAttrSub,
            54 => PushProcState,
            55 => PushVersion,
            56 => PutSubs,
            57 => PutSubs2,
            58 => PutSubs3,
            59 => PutGlyph,
            60 => PushGlyphAttr,
            61 => PushAttToGlyphAttr,
            _ => return None,
        })
    }

    /// Declared parameter width in the bytecode stream
    ///
    /// `None` marks the variable-width `assoc` (a count byte followed by
    /// that many displacement bytes).
    pub(crate) fn param_size(self) -> Option<usize> {
        use Opcode::*;
        Some(match self {
            PushByte | PushByteU => 1,
            PushShort | PushShortU => 2,
            PushLong => 4,
            NextN => 1,
            PutGlyph8bitObs => 1,
            PutSubs8bitObs => 3,
            PutCopy => 1,
            Assoc => return None,
            CntxtItem => 2,
            AttrSet | AttrAdd | AttrSub | AttrSetSlot => 1,
            IAttrSetSlot => 2,
            PushSlotAttr => 2,
            PushGlyphAttrObs => 2,
            PushGlyphMetric => 3,
            PushFeat => 2,
            PushAttToGattrObs => 2,
            PushAttToGlyphMetric => 3,
            PushISlotAttr => 3,
            PushIGlyphAttr => 3,
            IAttrSet | IAttrAdd | IAttrSub => 2,
            PushProcState => 1,
            PutSubs => 5,
            PutSubs2 => 4,
            PutSubs3 => 3,
            PutGlyph => 2,
            PushGlyphAttr => 3,
            PushAttToGlyphAttr => 3,
            _ => 0,
        })
    }

    /// Opcodes with no defined behavior in this engine
    pub(crate) fn is_unimplemented(self) -> bool {
        use Opcode::*;
        matches!(self, NextN | PushIGlyphAttr | PutSubs2 | PutSubs3)
    }

    pub(crate) fn is_return(self) -> bool {
        use Opcode::*;
        matches!(self, PopRet | RetZero | RetTrue)
    }

    /// Opcodes that mutate slot state (excluding deletion)
    pub(crate) fn modifies(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            PutGlyph8bitObs
                | PutSubs8bitObs
                | PutCopy
                | Insert
                | Assoc
                | AttrSet
                | AttrAdd
                | AttrSub
                | AttrSetSlot
                | IAttrSetSlot
                | IAttrSet
                | IAttrAdd
                | IAttrSub
                | PutSubs
                | PutGlyph
        )
    }
}

/// Outcome of loading a rule program
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeStatus {
    Loaded,
    /// Buffer allocation failed (kept for ABI parity; Rust allocation
    /// failure aborts before this can be observed)
    AllocFailed,
    InvalidOpcode,
    UnimplementedOpcodeUsed,
    OutOfRangeData,
    JumpPastEnd,
    ArgumentsExhausted,
    MissingReturn,
}

/// Validation context supplied by the enclosing Silf sub-table and face
#[derive(Clone, Copy, Debug, Default)]
pub struct CodeContext {
    pub num_user: u8,
    pub num_classes: u16,
    pub num_attrs: u16,
    pub num_feats: u16,
}

/// A validated rule program
///
/// Owns its opcode array and parameter buffer; the type is move-only (no
/// `Clone`), so buffers have exactly one owner. A failed load is an inert
/// value: [`Code::run`] on it is a no-op.
pub struct Code {
    ops: Box<[Opcode]>,
    data: Box<[u8]>,
    max_ref: u8,
    status: CodeStatus,
    constraint: bool,
    modify: bool,
    delete: bool,
}

impl Code {
    /// Decode and validate a bytecode stream
    ///
    /// `pre_context` and `rule_length` describe the rule's declared match
    /// window; slot displacements are clamped to it and the largest
    /// magnitude is recorded as `max_ref`.
    pub fn load(
        constraint: bool,
        bytecode: &[u8],
        pre_context: u8,
        rule_length: u16,
        ctx: &CodeContext,
    ) -> Code {
        let mut decoder = Decoder {
            constraint,
            bytecode,
            ctx,
            lo: -i32::from(pre_context),
            hi: i32::from(rule_length).max(1) - 1,
            ops: Vec::new(),
            data: Vec::new(),
            stream_offs: Vec::new(),
            data_offs: Vec::new(),
            jumps: Vec::new(),
            max_ref: 0,
            modify: false,
            delete: false,
        };
        let status = match decoder.decode() {
            Ok(()) => CodeStatus::Loaded,
            Err(status) => {
                debug!("rule code rejected: {status:?}");
                status
            }
        };
        let ok = status == CodeStatus::Loaded;
        Code {
            ops: if ok { decoder.ops.into() } else { Box::new([]) },
            data: if ok { decoder.data.into() } else { Box::new([]) },
            max_ref: decoder.max_ref,
            status,
            constraint,
            modify: decoder.modify,
            delete: decoder.delete,
        }
    }

    /// An inert, successfully-empty program
    pub(crate) fn empty(constraint: bool) -> Code {
        Code {
            ops: Box::new([Opcode::RetTrue]),
            data: Box::new([]),
            max_ref: 0,
            status: CodeStatus::Loaded,
            constraint,
            modify: false,
            delete: false,
        }
    }

    #[inline]
    pub fn status(&self) -> CodeStatus {
        self.status
    }

    /// True when loading succeeded
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == CodeStatus::Loaded
    }

    #[inline]
    pub fn instruction_count(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn max_ref(&self) -> u8 {
        self.max_ref
    }

    #[inline]
    pub fn is_constraint(&self) -> bool {
        self.constraint
    }

    /// True when no instruction mutates or deletes slots
    #[inline]
    pub fn immutable(&self) -> bool {
        !(self.modify || self.delete)
    }

    #[inline]
    pub fn deletes(&self) -> bool {
        self.delete
    }

    pub(crate) fn ops(&self) -> &[Opcode] {
        &self.ops
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    /// Execute against a machine positioned at the match origin
    ///
    /// A failed program is a no-op returning 1. When the input position is
    /// too close to the chain ends for this program's `max_ref`, sets
    /// [`MachineStatus::SlotOffsetOutOfBounds`] and returns 1 without
    /// executing.
    pub(crate) fn run(&self, m: &mut Machine) -> i32 {
        if !self.is_ok() {
            return 1;
        }
        if !m.bounds_check(self.max_ref) {
            m.fail(MachineStatus::SlotOffsetOutOfBounds);
            return 1;
        }
        m.exec(self)
    }
}

struct Decoder<'a> {
    constraint: bool,
    bytecode: &'a [u8],
    ctx: &'a CodeContext,
    /// Slot displacement clamp range
    lo: i32,
    hi: i32,
    ops: Vec<Opcode>,
    data: Vec<u8>,
    /// Stream offset of each decoded instruction
    stream_offs: Vec<usize>,
    /// Emitted-data offset of each decoded instruction
    data_offs: Vec<usize>,
    /// Pending `cntxt_item` fixups: (instruction index, target stream offset)
    jumps: Vec<(usize, usize)>,
    max_ref: u8,
    modify: bool,
    delete: bool,
}

impl<'a> Decoder<'a> {
    fn decode(&mut self) -> Result<(), CodeStatus> {
        let mut pos = 0;
        while pos < self.bytecode.len() {
            pos = self.decode_one(pos)?;
        }
        match self.ops.last() {
            Some(op) if op.is_return() => (),
            _ => return Err(CodeStatus::MissingReturn),
        }
        self.fixup_jumps()
    }

    /// Clamp a slot displacement and record it in `max_ref`
    ///
    /// Constraint programs address slots in the pattern-match form (offset
    /// by one forward step), so their displacements are clamped and
    /// measured in that effective space.
    fn slot_ref(&mut self, d: i8) -> u8 {
        let shift = i32::from(self.constraint);
        let eff = (i32::from(d) + shift).clamp(self.lo.max(-128), self.hi.min(127));
        self.max_ref = self.max_ref.max(eff.unsigned_abs() as u8);
        (eff - shift) as i8 as u8
    }

    fn params(&self, pos: usize, n: usize) -> Result<&'a [u8], CodeStatus> {
        self.bytecode
            .get(pos + 1..pos + 1 + n)
            .ok_or(CodeStatus::ArgumentsExhausted)
    }

    fn check_class(&self, cid: u16) -> Result<(), CodeStatus> {
        if cid >= self.ctx.num_classes {
            return Err(CodeStatus::OutOfRangeData);
        }
        Ok(())
    }

    fn check_slot_attr(&self, attr: u8, index: Option<u8>) -> Result<(), CodeStatus> {
        match SlotAttr::from_u8(attr) {
            None => Err(CodeStatus::OutOfRangeData),
            Some(SlotAttr::UserDefn) => match index {
                Some(i) if i >= self.ctx.num_user => Err(CodeStatus::OutOfRangeData),
                _ => Ok(()),
            },
            Some(_) => Ok(()),
        }
    }

    fn decode_one(&mut self, pos: usize) -> Result<usize, CodeStatus> {
        use Opcode::*;

        let op = Opcode::from_u8(self.bytecode[pos]).ok_or(CodeStatus::InvalidOpcode)?;
        if op.is_unimplemented() {
            return Err(CodeStatus::UnimplementedOpcodeUsed);
        }
        if self.constraint && (op.modifies() || op == Delete) {
            // Constraint programs must be side-effect free
            return Err(CodeStatus::InvalidOpcode);
        }
        self.modify |= op.modifies();
        self.delete |= op == Delete;

        let size = match op.param_size() {
            Some(n) => n,
            None => {
                // assoc: count byte + that many displacements
                let count = *self
                    .bytecode
                    .get(pos + 1)
                    .ok_or(CodeStatus::ArgumentsExhausted)?;
                1 + usize::from(count)
            }
        };
        let params = self.params(pos, size)?;

        self.stream_offs.push(pos);
        self.data_offs.push(self.data.len());
        self.ops.push(op);

        // Emit parameters, clamping slot displacements and validating
        // table-indexing arguments.
        match op {
            PutSubs8bitObs => {
                let d = self.slot_ref(params[0] as i8);
                self.check_class(params[1].into())?;
                self.check_class(params[2].into())?;
                self.data.extend_from_slice(&[d, params[1], params[2]]);
            }
            PutGlyph8bitObs => {
                self.check_class(params[0].into())?;
                self.data.push(params[0]);
            }
            PutGlyph => {
                let cid = u16::from_be_bytes([params[0], params[1]]);
                self.check_class(cid)?;
                self.data.extend_from_slice(params);
            }
            PutSubs => {
                let d = self.slot_ref(params[0] as i8);
                let cin = u16::from_be_bytes([params[1], params[2]]);
                let cout = u16::from_be_bytes([params[3], params[4]]);
                self.check_class(cin)?;
                self.check_class(cout)?;
                self.data.push(d);
                self.data.extend_from_slice(&params[1..]);
            }
            PutCopy => {
                let d = self.slot_ref(params[0] as i8);
                self.data.push(d);
            }
            Assoc => {
                self.data.push(params[0]);
                for &p in &params[1..] {
                    let d = self.slot_ref(p as i8);
                    self.data.push(d);
                }
            }
            CntxtItem => {
                let target = pos + 1 + size + usize::from(params[1]);
                if target > self.bytecode.len() {
                    return Err(CodeStatus::JumpPastEnd);
                }
                self.jumps.push((self.ops.len() - 1, target));
                // Re-emitted as (arg, instruction skip, data skip)
                self.data.extend_from_slice(&[params[0], 0, 0]);
            }
            AttrSet | AttrAdd | AttrSub | AttrSetSlot => {
                self.check_slot_attr(params[0], None)?;
                self.data.push(params[0]);
            }
            IAttrSet | IAttrAdd | IAttrSub | IAttrSetSlot => {
                self.check_slot_attr(params[0], Some(params[1]))?;
                self.data.extend_from_slice(params);
            }
            PushSlotAttr => {
                self.check_slot_attr(params[0], None)?;
                let d = self.slot_ref(params[1] as i8);
                self.data.extend_from_slice(&[params[0], d]);
            }
            PushISlotAttr => {
                self.check_slot_attr(params[0], Some(params[2]))?;
                let d = self.slot_ref(params[1] as i8);
                self.data.extend_from_slice(&[params[0], d, params[2]]);
            }
            PushGlyphAttrObs | PushAttToGattrObs => {
                if u16::from(params[0]) >= self.ctx.num_attrs {
                    return Err(CodeStatus::OutOfRangeData);
                }
                let d = self.slot_ref(params[1] as i8);
                self.data.extend_from_slice(&[params[0], d]);
            }
            PushGlyphAttr | PushAttToGlyphAttr => {
                let attr = u16::from_be_bytes([params[0], params[1]]);
                if attr >= self.ctx.num_attrs {
                    return Err(CodeStatus::OutOfRangeData);
                }
                let d = self.slot_ref(params[2] as i8);
                self.data.extend_from_slice(&[params[0], params[1], d]);
            }
            PushGlyphMetric | PushAttToGlyphMetric => {
                if crate::face::GlyphMetric::from_u8(params[0]).is_none() {
                    return Err(CodeStatus::OutOfRangeData);
                }
                let d = self.slot_ref(params[1] as i8);
                self.data.extend_from_slice(&[params[0], d, params[2]]);
            }
            PushFeat => {
                if u16::from(params[0]) >= self.ctx.num_feats {
                    return Err(CodeStatus::OutOfRangeData);
                }
                let d = self.slot_ref(params[1] as i8);
                self.data.extend_from_slice(&[params[0], d]);
            }
            _ => self.data.extend_from_slice(params),
        }

        Ok(pos + 1 + size)
    }

    /// Rewrite `cntxt_item` jumps as (instruction, data) skip counts
    fn fixup_jumps(&mut self) -> Result<(), CodeStatus> {
        for &(index, target) in &self.jumps {
            let skip_to = if target == self.bytecode.len() {
                self.ops.len()
            } else {
                // The jump must land on an opcode boundary
                self.stream_offs
                    .binary_search(&target)
                    .map_err(|_| CodeStatus::JumpPastEnd)?
            };
            let instr_skip = skip_to - (index + 1);
            let data_after = self.data_offs[index] + 3;
            let data_at_target = match skip_to == self.ops.len() {
                true => self.data.len(),
                false => self.data_offs[skip_to],
            };
            let data_skip = data_at_target - data_after;
            if instr_skip > usize::from(u8::MAX) || data_skip > usize::from(u8::MAX) {
                return Err(CodeStatus::JumpPastEnd);
            }
            let off = self.data_offs[index];
            self.data[off + 1] = instr_skip as u8;
            self.data[off + 2] = data_skip as u8;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx() -> CodeContext {
        CodeContext {
            num_user: 4,
            num_classes: 8,
            num_attrs: 16,
            num_feats: 2,
        }
    }

    #[test]
    fn loads_simple_program() {
        // push_byte_u 5; push_byte_u 3; add; ret_zero
        let prog = [2u8, 5, 2, 3, 6, 49];
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::Loaded);
        assert!(code.is_ok());
        assert_eq!(code.instruction_count(), 4);
        assert_eq!(code.data_size(), 2);
        assert!(code.immutable());
    }

    #[test]
    fn missing_return() {
        let prog = [2u8, 5, 2, 3, 6];
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::MissingReturn);
        assert!(!code.is_ok());
    }

    #[test]
    fn arguments_exhausted() {
        // push_short with only one immediate byte
        let prog = [3u8, 1];
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::ArgumentsExhausted);
    }

    #[test]
    fn invalid_opcode() {
        let prog = [200u8, 50];
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::InvalidOpcode);
    }

    #[test]
    fn unimplemented_opcode() {
        // next_n
        let prog = [26u8, 1, 50];
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::UnimplementedOpcodeUsed);
    }

    #[test]
    fn constraint_rejects_mutation() {
        // insert; ret_true as a constraint
        let prog = [31u8, 50];
        let code = Code::load(true, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::InvalidOpcode);
        // ... but the same stream is fine as an action
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::Loaded);
        assert!(!code.immutable());
    }

    #[test]
    fn delete_flags() {
        let prog = [32u8, 50];
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert!(code.deletes());
        assert!(!code.immutable());
    }

    #[test]
    fn class_ids_validated() {
        // put_glyph_8bit_obs with class 200 (>= 8)
        let prog = [28u8, 200, 50];
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::OutOfRangeData);
    }

    #[test]
    fn max_ref_recording_and_clamp() {
        // push_slot_attr(AdvanceX, +2); ret_true, with a rule window of 3 slots
        let prog = [40u8, 0, 2, 50];
        let code = Code::load(false, &prog, 0, 3, &ctx());
        assert_eq!(code.max_ref(), 2);

        // Same, but the rule window only spans 2 slots: ref is clamped
        let code = Code::load(false, &prog, 0, 2, &ctx());
        assert_eq!(code.max_ref(), 1);

        // Backward ref bounded by the pre-context
        let prog = [40u8, 0, (-3i8) as u8, 50];
        let code = Code::load(false, &prog, 1, 1, &ctx());
        assert_eq!(code.max_ref(), 1);
    }

    #[test]
    fn cntxt_item_jump_fixup() {
        // cntxt_item(0, skip over push_byte_u 7) ; push_byte_u 7; ret_true
        let prog = [34u8, 0, 2, 2, 7, 50];
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::Loaded);
        // data = [arg, instr_skip, data_skip, 7]
        assert_eq!(code.data(), &[0, 1, 1, 7]);
    }

    #[test]
    fn cntxt_item_bad_jump() {
        // Jump lands inside the push_short immediate
        let prog = [34u8, 0, 2, 3, 7, 7, 50];
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::JumpPastEnd);

        // Jump past the end of the program
        let prog = [34u8, 0, 99, 50];
        let code = Code::load(false, &prog, 0, 1, &ctx());
        assert_eq!(code.status(), CodeStatus::JumpPastEnd);
    }

    #[test]
    fn assoc_is_variable_width() {
        // assoc 2, 0, 1; ret_true
        let prog = [33u8, 2, 0, 1, 50];
        let code = Code::load(false, &prog, 0, 2, &ctx());
        assert_eq!(code.status(), CodeStatus::Loaded);
        assert_eq!(code.max_ref(), 1);

        let prog = [33u8, 4, 0, 1, 50];
        let code = Code::load(false, &prog, 0, 2, &ctx());
        assert_eq!(code.status(), CodeStatus::ArgumentsExhausted);
    }
}
