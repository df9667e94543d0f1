// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! The rule-code stack machine
//!
//! A [`Machine`] executes one validated [`Code`](super::Code) against a
//! segment. It holds a fixed-size stack of 32-bit words growing downward,
//! an input position `is` into the caller's [`SlotMap`], and a data pointer
//! into the program's parameter buffer. Runtime failures never unwind: they
//! set a status, the program stops, and the caller decides how to continue
//! (for the Silf driver: log and move to the next chain position).
//!
//! Every dispatch step spends one unit of the shaping call's instruction
//! budget, bounding the damage a pathological font can do.

use super::{Code, Opcode};
use crate::segment::{Segment, SlotAttr, SlotFlags, SlotRef};
use smallvec::SmallVec;

/// Default per-shaping-call instruction budget
pub(crate) const INSTRUCTION_BUDGET: u32 = 1_000_000;

const STACK_SIZE: usize = 64;

/// Machine execution status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineStatus {
    Finished,
    StackUnderflow,
    StackOverflow,
    SlotOffsetOutOfBounds,
    DivByZero,
    RuntimeBudgetExhausted,
}

/// The slot-reference window of one rule invocation
///
/// Holds the rule's pre-context slots followed by the slots from the match
/// origin forward. The machine updates it as slots are inserted and
/// deleted, so it always mirrors the chain.
pub(crate) struct SlotMap {
    slots: SmallVec<[SlotRef; 32]>,
    pre_context: usize,
}

impl SlotMap {
    pub fn new(pre_context: usize) -> SlotMap {
        SlotMap {
            slots: SmallVec::new(),
            pre_context,
        }
    }

    #[inline]
    pub fn push(&mut self, sref: SlotRef) {
        self.slots.push(sref);
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<SlotRef> {
        self.slots.get(index).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn pre_context(&self) -> usize {
        self.pre_context
    }

    #[inline]
    pub fn last(&self) -> Option<SlotRef> {
        self.slots.last().copied()
    }

    fn insert(&mut self, index: usize, sref: SlotRef) {
        self.slots.insert(index, sref);
    }

    fn remove(&mut self, index: usize) {
        self.slots.remove(index);
    }

    fn index_of(&self, sref: SlotRef) -> Option<usize> {
        self.slots.iter().position(|&s| s == sref)
    }
}

enum Mode {
    Set,
    Add,
    Sub,
}

/// Stack VM executing rule code against a segment
pub(crate) struct Machine<'m, 'f> {
    seg: &'m mut Segment<'f>,
    map: &'m mut SlotMap,
    budget: &'m mut u32,
    stack: [i32; STACK_SIZE],
    sp: usize,
    is: usize,
    status: MachineStatus,
}

impl<'m, 'f> Machine<'m, 'f> {
    /// Construct positioned at the map's match origin
    pub fn new(
        seg: &'m mut Segment<'f>,
        map: &'m mut SlotMap,
        budget: &'m mut u32,
    ) -> Machine<'m, 'f> {
        let is = map.pre_context();
        Machine {
            seg,
            map,
            budget,
            stack: [0; STACK_SIZE],
            sp: STACK_SIZE,
            is,
            status: MachineStatus::Finished,
        }
    }

    #[inline]
    pub fn status(&self) -> MachineStatus {
        self.status
    }

    /// Final input position, for the driver's walk advance
    #[inline]
    pub fn input_index(&self) -> usize {
        self.is
    }

    pub(crate) fn fail(&mut self, status: MachineStatus) {
        if self.status == MachineStatus::Finished {
            self.status = status;
        }
    }

    /// Verify `max_ref` slots exist around the match origin
    ///
    /// Backward room is bounded by the pre-context (the loader clamps
    /// negative displacements to it and the driver guarantees those slots
    /// exist); forward room must be present in the map.
    pub fn bounds_check(&self, max_ref: u8) -> bool {
        let m = usize::from(max_ref);
        self.is + m < self.map.len() && self.is >= m.min(self.map.pre_context())
    }

    fn push(&mut self, value: i32) {
        if self.sp == 0 {
            self.fail(MachineStatus::StackOverflow);
        } else {
            self.sp -= 1;
            self.stack[self.sp] = value;
        }
    }

    fn pop(&mut self) -> i32 {
        if self.sp == STACK_SIZE {
            self.fail(MachineStatus::StackUnderflow);
            0
        } else {
            let value = self.stack[self.sp];
            self.sp += 1;
            value
        }
    }

    fn set_top(&mut self, value: i32) {
        if self.sp == STACK_SIZE {
            self.fail(MachineStatus::StackUnderflow);
        } else {
            self.stack[self.sp] = value;
        }
    }

    /// Resolve a slot displacement relative to the input position
    ///
    /// Attribute reads in constraint programs use the pattern-match form:
    /// the reference is offset by one extra forward step.
    fn ref_slot(&mut self, d: i8, constrained: bool) -> Option<SlotRef> {
        let base = self.is as isize + isize::from(constrained);
        let index = base + isize::from(d);
        let sref = usize::try_from(index).ok().and_then(|i| self.map.get(i));
        if sref.is_none() {
            self.fail(MachineStatus::SlotOffsetOutOfBounds);
        }
        sref
    }

    /// The slot at the input position
    fn current(&mut self) -> Option<SlotRef> {
        let sref = self.map.get(self.is);
        if sref.is_none() {
            self.fail(MachineStatus::SlotOffsetOutOfBounds);
        }
        sref
    }

    /// Execute a validated program; returns its return-opcode value
    pub fn exec(&mut self, code: &Code) -> i32 {
        let ops = code.ops();
        let data = code.data();
        let constrained = code.is_constraint();
        let mut ip = 0;
        let mut dp = 0;

        macro_rules! byte {
            () => {{
                let b = data.get(dp).copied().unwrap_or(0);
                dp += 1;
                b
            }};
        }

        while ip < ops.len() {
            if self.status != MachineStatus::Finished {
                return 0;
            }
            if *self.budget == 0 {
                self.fail(MachineStatus::RuntimeBudgetExhausted);
                return 0;
            }
            *self.budget -= 1;

            let op = ops[ip];
            ip += 1;

            use Opcode::*;
            match op {
                Nop => (),
                PushByte => {
                    let v = byte!() as i8;
                    self.push(v.into());
                }
                PushByteU => {
                    let v = byte!();
                    self.push(v.into());
                }
                PushShort => {
                    let v = i16::from_be_bytes([byte!(), byte!()]);
                    self.push(v.into());
                }
                PushShortU => {
                    let v = u16::from_be_bytes([byte!(), byte!()]);
                    self.push(v.into());
                }
                PushLong => {
                    let v = i32::from_be_bytes([byte!(), byte!(), byte!(), byte!()]);
                    self.push(v);
                }
                Add => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a.wrapping_add(b));
                }
                Sub => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a.wrapping_sub(b));
                }
                Mul => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a.wrapping_mul(b));
                }
                Div => {
                    let b = self.pop();
                    let a = self.pop();
                    if b == 0 {
                        self.fail(MachineStatus::DivByZero);
                        return 0;
                    }
                    self.push(a.wrapping_div(b));
                }
                Min => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a.min(b));
                }
                Max => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a.max(b));
                }
                Neg => {
                    let a = self.pop();
                    self.push(a.wrapping_neg());
                }
                Trunc8 => {
                    let a = self.pop();
                    self.push((a as u8).into());
                }
                Trunc16 => {
                    let a = self.pop();
                    self.push((a as u16).into());
                }
                Cond => {
                    let c = self.pop();
                    let t = self.pop();
                    if c != 0 {
                        self.set_top(t);
                    }
                }
                And => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push((a != 0 && b != 0) as i32);
                }
                Or => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push((a != 0 || b != 0) as i32);
                }
                Not => {
                    let a = self.pop();
                    self.push((a == 0) as i32);
                }
                Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push((a == b) as i32);
                }
                NotEq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push((a != b) as i32);
                }
                Less => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push((a < b) as i32);
                }
                Gtr => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push((a > b) as i32);
                }
                LessEq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push((a <= b) as i32);
                }
                GtrEq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push((a >= b) as i32);
                }
                Next | CopyNext => {
                    if self.is < self.map.len() {
                        self.is += 1;
                    } else {
                        self.fail(MachineStatus::SlotOffsetOutOfBounds);
                    }
                }
                PutGlyph8bitObs => {
                    let cid = u16::from(byte!());
                    let gid = self.seg.get_class_glyph(cid, 0);
                    if let Some(sref) = self.current() {
                        self.seg.slot_mut(sref).glyph = gid;
                    }
                }
                PutGlyph => {
                    let cid = u16::from_be_bytes([byte!(), byte!()]);
                    let gid = self.seg.get_class_glyph(cid, 0);
                    if let Some(sref) = self.current() {
                        self.seg.slot_mut(sref).glyph = gid;
                    }
                }
                PutSubs8bitObs => {
                    let d = byte!() as i8;
                    let cin = u16::from(byte!());
                    let cout = u16::from(byte!());
                    self.put_subs(d, cin, cout, constrained);
                }
                PutSubs => {
                    let d = byte!() as i8;
                    let cin = u16::from_be_bytes([byte!(), byte!()]);
                    let cout = u16::from_be_bytes([byte!(), byte!()]);
                    self.put_subs(d, cin, cout, constrained);
                }
                PutCopy => {
                    let d = byte!() as i8;
                    if let (Some(src), Some(dst)) = (self.ref_slot(d, false), self.current()) {
                        self.seg.copy_slot_content(dst, src);
                    }
                }
                Insert => {
                    let pos = self.map.get(self.is);
                    let sref = match pos {
                        Some(pos) => self.seg.insert_slot_before(pos),
                        // Past the window: append after the last map slot
                        None => match self.map.last() {
                            Some(last) => self.seg.insert_slot_after(last),
                            None => {
                                self.fail(MachineStatus::SlotOffsetOutOfBounds);
                                continue;
                            }
                        },
                    };
                    self.map.insert(self.is, sref);
                    self.is += 1;
                }
                Delete => {
                    if let Some(sref) = self.current() {
                        self.seg.delete_slot(sref);
                        self.map.remove(self.is);
                    }
                }
                Assoc => {
                    let count = byte!();
                    let mut lo = u32::MAX;
                    let mut hi = 0;
                    for _ in 0..count {
                        let d = byte!() as i8;
                        if let Some(sref) = self.ref_slot(d, false) {
                            let slot = self.seg.slot(sref);
                            lo = lo.min(slot.before);
                            hi = hi.max(slot.after);
                        }
                    }
                    if lo <= hi {
                        if let Some(sref) = self.current() {
                            let slot = self.seg.slot_mut(sref);
                            slot.before = lo;
                            slot.after = hi;
                            slot.original = slot.original.clamp(lo, hi);
                        }
                    }
                }
                CntxtItem => {
                    let arg = byte!() as i8;
                    let iskip = usize::from(byte!());
                    let dskip = usize::from(byte!());
                    let anchor = self.map.pre_context() as isize + isize::from(arg);
                    if self.is as isize != anchor {
                        ip += iskip;
                        dp += dskip;
                        self.push(1);
                    }
                }
                AttrSet | AttrAdd | AttrSub | AttrSetSlot => {
                    let attr = byte!();
                    let value = self.pop();
                    let mode = match op {
                        AttrAdd => Mode::Add,
                        AttrSub => Mode::Sub,
                        _ => Mode::Set,
                    };
                    if let (Some(attr), Some(sref)) = (SlotAttr::from_u8(attr), self.current()) {
                        self.set_slot_attr(sref, attr, 0, value, mode);
                    }
                }
                IAttrSet | IAttrAdd | IAttrSub | IAttrSetSlot => {
                    let attr = byte!();
                    let index = byte!();
                    let value = self.pop();
                    let mode = match op {
                        IAttrAdd => Mode::Add,
                        IAttrSub => Mode::Sub,
                        _ => Mode::Set,
                    };
                    if let (Some(attr), Some(sref)) = (SlotAttr::from_u8(attr), self.current()) {
                        self.set_slot_attr(sref, attr, index, value, mode);
                    }
                }
                PushSlotAttr => {
                    let attr = byte!();
                    let d = byte!() as i8;
                    if let (Some(attr), Some(sref)) =
                        (SlotAttr::from_u8(attr), self.ref_slot(d, constrained))
                    {
                        let v = self.slot_attr(sref, attr, 0);
                        self.push(v);
                    }
                }
                PushISlotAttr => {
                    let attr = byte!();
                    let d = byte!() as i8;
                    let index = byte!();
                    if let (Some(attr), Some(sref)) =
                        (SlotAttr::from_u8(attr), self.ref_slot(d, constrained))
                    {
                        let v = self.slot_attr(sref, attr, index);
                        self.push(v);
                    }
                }
                PushGlyphAttrObs => {
                    let attr = u16::from(byte!());
                    let d = byte!() as i8;
                    if let Some(sref) = self.ref_slot(d, constrained) {
                        let gid = self.seg.slot(sref).gid();
                        self.push(self.seg.face().glyph_attr(gid, attr) as i16 as i32);
                    }
                }
                PushGlyphAttr => {
                    let attr = u16::from_be_bytes([byte!(), byte!()]);
                    let d = byte!() as i8;
                    if let Some(sref) = self.ref_slot(d, constrained) {
                        let gid = self.seg.slot(sref).gid();
                        self.push(self.seg.face().glyph_attr(gid, attr) as i16 as i32);
                    }
                }
                PushAttToGattrObs => {
                    let attr = u16::from(byte!());
                    let d = byte!() as i8;
                    if let Some(sref) = self.ref_slot(d, constrained) {
                        let root = self.seg.find_root(sref);
                        let gid = self.seg.slot(root).gid();
                        self.push(self.seg.face().glyph_attr(gid, attr) as i16 as i32);
                    }
                }
                PushAttToGlyphAttr => {
                    let attr = u16::from_be_bytes([byte!(), byte!()]);
                    let d = byte!() as i8;
                    if let Some(sref) = self.ref_slot(d, constrained) {
                        let root = self.seg.find_root(sref);
                        let gid = self.seg.slot(root).gid();
                        self.push(self.seg.face().glyph_attr(gid, attr) as i16 as i32);
                    }
                }
                PushGlyphMetric => {
                    let metric = byte!();
                    let d = byte!() as i8;
                    let _level = byte!();
                    if let (Some(metric), Some(sref)) = (
                        crate::face::GlyphMetric::from_u8(metric),
                        self.ref_slot(d, constrained),
                    ) {
                        let gid = self.seg.slot(sref).gid();
                        self.push(self.seg.face().glyph_metric(gid, metric));
                    }
                }
                PushAttToGlyphMetric => {
                    let metric = byte!();
                    let d = byte!() as i8;
                    let _level = byte!();
                    if let (Some(metric), Some(sref)) = (
                        crate::face::GlyphMetric::from_u8(metric),
                        self.ref_slot(d, constrained),
                    ) {
                        let root = self.seg.find_root(sref);
                        let gid = self.seg.slot(root).gid();
                        self.push(self.seg.face().glyph_metric(gid, metric));
                    }
                }
                PushFeat => {
                    let feat = u16::from(byte!());
                    let d = byte!() as i8;
                    if let Some(sref) = self.ref_slot(d, constrained) {
                        let v = self.seg.feature_value(sref, feat);
                        self.push(v.into());
                    }
                }
                PushProcState => {
                    let _ = byte!();
                    self.push(1);
                }
                PushVersion => self.push(0x0003_0000),
                PopRet => return self.pop(),
                RetZero => return 0,
                RetTrue => return 1,
                // The loader rejects these before execution
                NextN | PushIGlyphAttr | PutSubs2 | PutSubs3 => return 0,
            }
        }
        // Validation guarantees a trailing return; reaching here means the
        // program was not runnable
        0
    }

    fn put_subs(&mut self, d: i8, cin: u16, cout: u16, constrained: bool) {
        let Some(keyed) = self.ref_slot(d, constrained) else {
            return;
        };
        let gid = self.seg.slot(keyed).gid();
        if let Some(index) = self.seg.find_class_index(cin, gid) {
            let out = self.seg.get_class_glyph(cout, index);
            if let Some(sref) = self.current() {
                self.seg.slot_mut(sref).glyph = out;
            }
        }
    }

    fn slot_attr(&mut self, sref: SlotRef, attr: SlotAttr, index: u8) -> i32 {
        use SlotAttr::*;
        let slot = self.seg.slot(sref);
        match attr {
            AdvanceX => slot.advance_adjust.0 as i32,
            AdvanceY => slot.advance_adjust.1 as i32,
            AttachTo => slot
                .attached_to()
                .and_then(|p| self.map.index_of(p))
                .map(|i| i as i32)
                .unwrap_or(0),
            AttachAt => slot.attach_at.into(),
            AttachWith => slot.attach_with.into(),
            AttachXOffset => slot.attach_offset.0 as i32,
            AttachYOffset => slot.attach_offset.1 as i32,
            Breakweight => self
                .seg
                .char_info(slot.original())
                .map(|ci| ci.breakweight().into())
                .unwrap_or(0),
            Directionality => slot.bidi_level().into(),
            Insert => (!slot.flags.contains(SlotFlags::NO_INSERT)) as i32,
            PosX => slot.origin().0 as i32,
            PosY => slot.origin().1 as i32,
            ShiftX => slot.shift.0 as i32,
            ShiftY => slot.shift.1 as i32,
            Justify => slot.justify as i32,
            UserDefn => slot.user_attr(index.into()).into(),
        }
    }

    fn set_slot_attr(&mut self, sref: SlotRef, attr: SlotAttr, index: u8, value: i32, mode: Mode) {
        use SlotAttr::*;
        let value = match mode {
            Mode::Set => value,
            Mode::Add => self.slot_attr(sref, attr, index).wrapping_add(value),
            Mode::Sub => self.slot_attr(sref, attr, index).wrapping_sub(value),
        };
        if attr == AttachTo {
            // The value names a slot by its position in the rule's window
            if let Ok(i) = usize::try_from(value) {
                if let Some(parent) = self.map.get(i) {
                    self.seg.attach(sref, parent);
                }
            }
            return;
        }
        if attr == Breakweight {
            let original = self.seg.slot(sref).original();
            if let Some(ci) = self.seg.char_info_mut(original) {
                ci.set_breakweight(value.clamp(i8::MIN.into(), i8::MAX.into()) as i8);
            }
            return;
        }
        let slot = self.seg.slot_mut(sref);
        match attr {
            AdvanceX => slot.advance_adjust.0 = value as f32,
            AdvanceY => slot.advance_adjust.1 = value as f32,
            AttachAt => slot.attach_at = value.clamp(0, u16::MAX.into()) as u16,
            AttachWith => slot.attach_with = value.clamp(0, u16::MAX.into()) as u16,
            AttachXOffset => slot.attach_offset.0 = value as f32,
            AttachYOffset => slot.attach_offset.1 = value as f32,
            Directionality => slot.bidi_level = value.clamp(0, u8::MAX.into()) as u8,
            Insert => slot.flags.set(SlotFlags::NO_INSERT, value == 0),
            PosX => slot.origin.0 = value as f32,
            PosY => slot.origin.1 = value as f32,
            ShiftX => slot.shift.0 = value as f32,
            ShiftY => slot.shift.1 = value as f32,
            Justify => slot.justify = value as f32,
            UserDefn => {
                if let Some(u) = slot.user.get_mut(usize::from(index)) {
                    *u = value.clamp(i16::MIN.into(), i16::MAX.into()) as i16;
                }
            }
            AttachTo | Breakweight => unreachable!(),
        }
    }
}
