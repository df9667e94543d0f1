// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Segments: the mutable state of one shaping call
//!
//! A [`Segment`] owns the character-info array (fixed at decode time) and
//! the slot arena. Slots are allocated from the arena in blocks, freed to a
//! free-list, and reused within the same segment only; a [`SlotRef`] is
//! stable for the segment's life. The live slots form a doubly-linked chain
//! in visual order, mutated by shaping passes and finally walked to compute
//! positions.

mod slot;

pub use slot::{Slot, SlotRef};
pub(crate) use slot::{SlotAttr, SlotFlags};

use crate::conv::{to_u32, to_usize};
use crate::data::{Rect, Vec2};
use crate::decode::{Decoder, Encoding};
use crate::face::Features;
use crate::silf::Silf;
use crate::{Direction, Face, Font};
use smallvec::SmallVec;
use unicode_bidi_mirroring::get_mirrored;
use xi_unicode::LineBreakIterator;

/// Slot arena growth quantum
const SLOT_BLOCK: usize = 16;

/// Breakweight classes, exposed through [`CharInfo::breakweight`]
pub mod breakweight {
    pub const NONE: i8 = 0;
    pub const WHITESPACE: i8 = 10;
    pub const WORD: i8 = 15;
    pub const INTRA: i8 = 20;
    pub const LETTER: i8 = 30;
    pub const CLIP: i8 = 40;
}

/// Per-input-character record
#[derive(Clone, Debug)]
pub struct CharInfo {
    ch: char,
    base: u32,
    breakweight: i8,
    feature_index: u32,
    before_slot: Option<SlotRef>,
    after_slot: Option<SlotRef>,
}

impl CharInfo {
    /// The Unicode scalar
    #[inline]
    pub fn unicode_char(&self) -> char {
        self.ch
    }

    /// Byte offset of this character in the original encoded input
    #[inline]
    pub fn base(&self) -> usize {
        to_usize(self.base)
    }

    /// Line-break class (see [`breakweight`])
    #[inline]
    pub fn breakweight(&self) -> i8 {
        self.breakweight
    }

    /// Index into the segment's feature list
    #[inline]
    pub fn feature_index(&self) -> usize {
        to_usize(self.feature_index)
    }

    pub(crate) fn set_breakweight(&mut self, bw: i8) {
        self.breakweight = bw;
    }

    /// First slot representing this character, in visual order
    ///
    /// Valid once shaping completes. `None` if every covering slot was
    /// deleted.
    #[inline]
    pub fn before_slot(&self) -> Option<SlotRef> {
        self.before_slot
    }

    /// Last slot representing this character, in visual order
    #[inline]
    pub fn after_slot(&self) -> Option<SlotRef> {
        self.after_slot
    }
}

/// The mutable state of one shaping call
///
/// Not safe to share between threads while shaping; distinct segments may be
/// shaped concurrently over one shared [`Face`].
pub struct Segment<'f> {
    face: &'f Face<'f>,
    silf: Option<&'f Silf>,
    slots: Vec<Slot>,
    free: Vec<SlotRef>,
    first: Option<SlotRef>,
    last: Option<SlotRef>,
    num_live: u32,
    char_info: Vec<CharInfo>,
    features: SmallVec<[Features; 1]>,
    dir: Direction,
    advance: Vec2,
    bbox: Rect,
    default_original: u32,
    decode_error: Option<usize>,
}

impl<'f> Segment<'f> {
    /// Shape a run of text
    ///
    /// Decodes up to `nchars` scalars from `bytes` (stopping early at a NUL
    /// or a malformed sequence; see [`Segment::decode_error`]), builds the
    /// initial slots, runs the shaping passes of the sub-table chosen for
    /// `script`, and computes positions.
    ///
    /// `dir` is the resolved direction of this run; bidirectional
    /// reordering is the caller's concern.
    pub fn make(
        font: &Font,
        face: &'f Face<'f>,
        script: u32,
        enc: Encoding,
        bytes: &[u8],
        nchars: usize,
        dir: Direction,
    ) -> Segment<'f> {
        let features = face.feature_map().clone_features(0);
        Segment::make_with_features(font, face, script, features, enc, bytes, nchars, dir)
    }

    /// Shape a run of text with an explicit feature-value vector
    #[allow(clippy::too_many_arguments)]
    pub fn make_with_features(
        font: &Font,
        face: &'f Face<'f>,
        script: u32,
        features: Features,
        enc: Encoding,
        bytes: &[u8],
        nchars: usize,
        dir: Direction,
    ) -> Segment<'f> {
        let mut seg = Segment::new(face, face.choose_silf(script), dir);
        seg.add_features(features);
        seg.read_text(enc, bytes, nchars);
        seg.run_graphite();
        seg.finalise(font);
        seg
    }

    pub(crate) fn new(face: &'f Face<'f>, silf: Option<&'f Silf>, dir: Direction) -> Segment<'f> {
        Segment {
            face,
            silf,
            slots: Vec::new(),
            free: Vec::new(),
            first: None,
            last: None,
            num_live: 0,
            char_info: Vec::new(),
            features: SmallVec::new(),
            dir,
            advance: Vec2::ZERO,
            bbox: Rect::EMPTY,
            default_original: 0,
            decode_error: None,
        }
    }

    // --- queries ---

    /// The whole segment's advance
    #[inline]
    pub fn advance(&self) -> Vec2 {
        self.advance
    }

    #[inline]
    pub fn advance_x(&self) -> f32 {
        self.advance.0
    }

    #[inline]
    pub fn advance_y(&self) -> f32 {
        self.advance.1
    }

    /// The segment's ink box (union of positioned glyph boxes)
    #[inline]
    pub fn bbox(&self) -> Rect {
        self.bbox
    }

    /// Number of live slots (one per output glyph)
    #[inline]
    pub fn slot_count(&self) -> usize {
        to_usize(self.num_live)
    }

    /// Number of input characters
    #[inline]
    pub fn char_info_count(&self) -> usize {
        self.char_info.len()
    }

    /// Per-character record
    #[inline]
    pub fn char_info(&self, index: usize) -> Option<&CharInfo> {
        self.char_info.get(index)
    }

    #[inline]
    pub(crate) fn char_info_mut(&mut self, index: usize) -> Option<&mut CharInfo> {
        self.char_info.get_mut(index)
    }

    /// This segment's direction
    #[inline]
    pub fn dir(&self) -> Direction {
        self.dir
    }

    /// Byte offset of the first undecodable input byte, if any
    #[inline]
    pub fn decode_error(&self) -> Option<usize> {
        self.decode_error
    }

    /// First slot of the chain, in visual order
    #[inline]
    pub fn first_slot(&self) -> Option<SlotRef> {
        self.first
    }

    #[inline]
    pub fn last_slot(&self) -> Option<SlotRef> {
        self.last
    }

    /// Access a slot by reference
    #[inline]
    pub fn slot(&self, sref: SlotRef) -> &Slot {
        &self.slots[sref.get()]
    }

    /// Iterate over live slots in visual order
    pub fn slots(&self) -> Slots<'_, 'f> {
        Slots {
            seg: self,
            next: self.first,
        }
    }

    /// CharInfo index used for coverage when every covering slot is deleted
    #[inline]
    pub fn default_original(&self) -> usize {
        to_usize(self.default_original)
    }

    pub(crate) fn face(&self) -> &'f Face<'f> {
        self.face
    }

    /// User attributes per slot, as declared by the active sub-table
    pub fn num_user(&self) -> usize {
        self.silf.map(|s| usize::from(s.num_user())).unwrap_or(0)
    }

    // --- features ---

    /// Add a feature-value vector; returns its index in the feature list
    pub fn add_features(&mut self, feats: Features) -> usize {
        self.features.push(feats);
        self.features.len() - 1
    }

    /// Read the value of feature `findex` for the characters behind `sref`
    pub(crate) fn feature_value(&self, sref: SlotRef, findex: u16) -> u16 {
        let slot = self.slot(sref);
        let fi = self
            .char_info
            .get(to_usize(slot.original))
            .map(|ci| to_usize(ci.feature_index))
            .unwrap_or(0);
        match (self.features.get(fi), self.face.feature_map().feature_ref(findex)) {
            (Some(feats), Some(fref)) => fref.value(feats),
            _ => 0,
        }
    }

    // --- slot pool ---

    pub(crate) fn slot_mut(&mut self, sref: SlotRef) -> &mut Slot {
        &mut self.slots[sref.get()]
    }

    /// Allocate a fresh or recycled slot, zeroed, off the chain
    pub(crate) fn new_slot(&mut self) -> SlotRef {
        let num_user = self.num_user();
        if let Some(sref) = self.free.pop() {
            self.slots[sref.get()].reset(num_user);
            sref
        } else {
            if self.slots.len() == self.slots.capacity() {
                self.slots.reserve(SLOT_BLOCK);
            }
            let sref = SlotRef(to_u32(self.slots.len()));
            self.slots.push(Slot::new(num_user));
            sref
        }
    }

    /// Detach a slot from the chain (if linked) and return it to the pool
    ///
    /// Safe to call on slots already off the chain.
    pub(crate) fn free_slot(&mut self, sref: SlotRef) {
        if self.slot(sref).is_deleted() {
            return; // already in the free-list
        }
        self.unlink(sref);
        let slot = self.slot_mut(sref);
        slot.flags.insert(SlotFlags::DELETED);
        self.free.push(sref);
    }

    /// Append a slot for character `i` during initial segment build
    pub(crate) fn append_slot(&mut self, i: usize, c: char, gid: u16, fid: u32) {
        let level = self.dir.level().number();
        if let Some(ci) = self.char_info.get_mut(i) {
            ci.feature_index = fid;
            debug_assert_eq!(ci.ch, c);
        }
        let sref = self.new_slot();
        let slot = self.slot_mut(sref);
        slot.glyph = gid;
        slot.original = to_u32(i);
        slot.before = to_u32(i);
        slot.after = to_u32(i);
        slot.bidi_level = level;
        self.link_after(self.last, sref);
    }

    // --- chain mutation ---

    fn unlink(&mut self, sref: SlotRef) {
        let (prev, next) = {
            let s = self.slot(sref);
            (s.prev, s.next)
        };
        let linked = prev.is_some() || next.is_some() || self.first == Some(sref);
        if !linked {
            return;
        }
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.last = prev,
        }
        let s = self.slot_mut(sref);
        s.prev = None;
        s.next = None;
        self.num_live -= 1;
    }

    /// Link `sref` into the chain after `pos` (`None` = at the head)
    pub(crate) fn link_after(&mut self, pos: Option<SlotRef>, sref: SlotRef) {
        let next = match pos {
            Some(p) => self.slot(p).next,
            None => self.first,
        };
        {
            let s = self.slot_mut(sref);
            s.prev = pos;
            s.next = next;
        }
        match pos {
            Some(p) => self.slot_mut(p).next = Some(sref),
            None => self.first = Some(sref),
        }
        match next {
            Some(n) => self.slot_mut(n).prev = Some(sref),
            None => self.last = Some(sref),
        }
        self.num_live += 1;
    }

    /// Splice a fresh slot into the chain before `pos`
    ///
    /// The new slot inherits `pos`'s character provenance and is marked
    /// inserted.
    pub(crate) fn insert_slot_before(&mut self, pos: SlotRef) -> SlotRef {
        let sref = self.new_slot();
        let (prev, before, after, original, level) = {
            let p = self.slot(pos);
            (p.prev, p.before, p.after, p.original, p.bidi_level)
        };
        {
            let s = self.slot_mut(sref);
            s.before = before;
            s.after = after;
            s.original = original;
            s.bidi_level = level;
            s.flags.insert(SlotFlags::INSERTED);
        }
        self.link_after(prev, sref);
        sref
    }

    /// Splice a fresh slot into the chain after `pos`
    pub(crate) fn insert_slot_after(&mut self, pos: SlotRef) -> SlotRef {
        let sref = self.new_slot();
        let (before, after, original, level) = {
            let p = self.slot(pos);
            (p.before, p.after, p.original, p.bidi_level)
        };
        {
            let s = self.slot_mut(sref);
            s.before = before;
            s.after = after;
            s.original = original;
            s.bidi_level = level;
            s.flags.insert(SlotFlags::INSERTED);
        }
        self.link_after(Some(pos), sref);
        sref
    }

    /// Copy rule-visible content between two slots
    pub(crate) fn copy_slot_content(&mut self, dst: SlotRef, src: SlotRef) {
        if dst == src {
            return;
        }
        let (di, si) = (dst.get(), src.get());
        if di < si {
            let (head, tail) = self.slots.split_at_mut(si);
            head[di].copy_content(&tail[0]);
        } else {
            let (head, tail) = self.slots.split_at_mut(di);
            tail[0].copy_content(&head[si]);
        }
    }

    /// Delete a slot: its character coverage folds into a neighbor
    pub(crate) fn delete_slot(&mut self, sref: SlotRef) {
        let (prev, next, before, after) = {
            let s = self.slot(sref);
            (s.prev, s.next, s.before, s.after)
        };
        if let Some(p) = prev {
            let p = self.slot_mut(p);
            p.after = p.after.max(after);
        } else if let Some(n) = next {
            let n = self.slot_mut(n);
            n.before = n.before.min(before);
        } else {
            self.default_original = before;
        }
        self.free_slot(sref);
    }

    // --- attachment ---

    /// Attach `child` to `parent`
    ///
    /// Rejected (returning false) when it would create a cycle or a
    /// self-attachment.
    pub(crate) fn attach(&mut self, child: SlotRef, parent: SlotRef) -> bool {
        if child == parent || self.in_parent_chain(parent, child) {
            return false;
        }
        self.detach(child);
        let first_child = self.slot(parent).child;
        {
            let c = self.slot_mut(child);
            c.parent = Some(parent);
            c.sibling = first_child;
        }
        self.slot_mut(parent).child = Some(child);
        true
    }

    fn in_parent_chain(&self, mut from: SlotRef, target: SlotRef) -> bool {
        loop {
            if from == target {
                return true;
            }
            match self.slot(from).parent {
                Some(p) => from = p,
                None => return false,
            }
        }
    }

    fn detach(&mut self, child: SlotRef) {
        let Some(parent) = self.slot(child).parent else {
            return;
        };
        let sibling = self.slot(child).sibling;
        // Remove from the parent's child list
        if self.slot(parent).child == Some(child) {
            self.slot_mut(parent).child = sibling;
        } else {
            let mut cur = self.slot(parent).child;
            while let Some(c) = cur {
                if self.slot(c).sibling == Some(child) {
                    self.slot_mut(c).sibling = sibling;
                    break;
                }
                cur = self.slot(c).sibling;
            }
        }
        let c = self.slot_mut(child);
        c.parent = None;
        c.sibling = None;
    }

    /// Resolve the root of a slot's attachment chain
    pub(crate) fn find_root(&self, mut sref: SlotRef) -> SlotRef {
        while let Some(p) = self.slot(sref).parent {
            sref = p;
        }
        sref
    }

    // --- segment build ---

    pub(crate) fn read_text(&mut self, enc: Encoding, bytes: &[u8], nchars: usize) {
        let rtl = self.dir.is_rtl();
        let mut decoder = Decoder::new(enc, bytes);
        for (c, offset) in decoder.by_ref().take(nchars) {
            let i = self.char_info.len();
            self.char_info.push(CharInfo {
                ch: c,
                base: to_u32(offset),
                breakweight: breakweight::NONE,
                feature_index: 0,
                before_slot: None,
                after_slot: None,
            });
            let mapped = match rtl {
                true => get_mirrored(c).unwrap_or(c),
                false => c,
            };
            let gid = self.face.gid_for_char(mapped);
            self.append_slot(i, c, gid, 0);
        }
        self.decode_error = decoder.error();
        self.compute_breakweights();
    }

    /// Assign line-break classes to the character infos
    fn compute_breakweights(&mut self) {
        let text: String = self.char_info.iter().map(|ci| ci.ch).collect();
        // Map the iterator's byte positions back to char indices
        let mut byte_to_char = std::collections::HashMap::new();
        for (ci, (b, _)) in text.char_indices().enumerate() {
            byte_to_char.insert(b, ci);
        }
        byte_to_char.insert(text.len(), self.char_info.len());

        for ci in self.char_info.iter_mut() {
            if ci.ch.is_whitespace() {
                ci.breakweight = breakweight::WHITESPACE;
            }
        }
        for (pos, hard) in LineBreakIterator::new(&text) {
            let Some(&ci) = byte_to_char.get(&pos) else {
                continue;
            };
            // The break applies after the preceding character
            let Some(info) = ci.checked_sub(1).and_then(|i| self.char_info.get_mut(i)) else {
                continue;
            };
            if hard {
                info.breakweight = breakweight::CLIP;
            } else if info.breakweight == breakweight::NONE {
                info.breakweight = breakweight::WORD;
            }
        }
    }

    /// Run the shaping passes of the chosen sub-table
    pub(crate) fn run_graphite(&mut self) {
        if let Some(silf) = self.silf {
            crate::silf::run_graphite(self, silf);
        }
    }

    // --- positioning ---

    /// Compute positions, the total advance and the ink box
    pub(crate) fn finalise(&mut self, font: &Font) {
        self.position_slots(font);
        self.update_char_slots();
    }

    pub(crate) fn position_slots(&mut self, font: &Font) {
        let scale = font.scale();
        let rtl = self.dir.is_rtl();

        // Base slots: accumulate advances along the chain in visual order.
        let mut accum = Vec2::ZERO;
        let mut cur = if rtl { self.last } else { self.first };
        while let Some(sref) = cur {
            let slot = self.slot(sref);
            cur = if rtl { slot.prev } else { slot.next };
            if slot.parent.is_some() {
                continue;
            }
            let advance = Vec2(font.advance(slot.glyph), 0.0)
                + slot.advance_adjust * scale
                + Vec2(slot.justify, 0.0);
            let shift = slot.shift * scale;
            let slot = self.slot_mut(sref);
            slot.origin = accum + shift;
            slot.advance = advance;
            accum += advance;
        }
        self.advance = accum;

        // Attached slots: resolve each against its (already positioned or
        // recursively resolved) parent.
        let mut cur = self.first;
        while let Some(sref) = cur {
            cur = self.slot(sref).next;
            if self.slot(sref).parent.is_some() {
                self.resolve_attached(sref, scale);
            }
        }

        self.bbox = self.compute_bbox(scale);
    }

    fn resolve_attached(&mut self, sref: SlotRef, scale: f32) -> Vec2 {
        let Some(parent) = self.slot(sref).parent else {
            return self.slot(sref).origin;
        };
        // The parent chain is acyclic (enforced by attach), so this
        // recursion terminates.
        let parent_origin = match self.slot(parent).parent {
            Some(_) => self.resolve_attached(parent, scale),
            None => self.slot(parent).origin,
        };
        let (parent_gid, slot) = (self.slot(parent).glyph, self.slot(sref));
        let at = self.anchor(parent_gid, slot.attach_at);
        let with = self.anchor(slot.glyph, slot.attach_with);
        let origin =
            parent_origin + (at - with + slot.attach_offset + slot.shift) * scale;
        let slot = self.slot_mut(sref);
        slot.origin = origin;
        slot.advance = Vec2::ZERO;
        origin
    }

    /// Resolve an anchor point stored as a pair of glyph attributes
    fn anchor(&self, gid: u16, attr_base: u16) -> Vec2 {
        if attr_base == 0 {
            return Vec2::ZERO;
        }
        let x = self.face.glyph_attr(gid, attr_base) as i16;
        let y = self.face.glyph_attr(gid, attr_base + 1) as i16;
        Vec2(x.into(), y.into())
    }

    fn compute_bbox(&self, scale: f32) -> Rect {
        let mut bbox = Rect::EMPTY;
        for slot in self.slots() {
            if let Some((x_min, y_min, x_max, y_max)) = self.face.glyph_bbox(slot.glyph) {
                let min = slot.origin + Vec2(x_min.into(), y_min.into()) * scale;
                let max = slot.origin + Vec2(x_max.into(), y_max.into()) * scale;
                bbox = bbox.union(Rect { min, max });
            }
        }
        bbox
    }

    /// Refresh each character's first/last covering slot
    pub(crate) fn update_char_slots(&mut self) {
        for ci in self.char_info.iter_mut() {
            ci.before_slot = None;
            ci.after_slot = None;
        }
        let mut cur = self.first;
        while let Some(sref) = cur {
            let (before, after) = {
                let s = self.slot(sref);
                (to_usize(s.before), to_usize(s.after))
            };
            cur = self.slot(sref).next;
            for i in before..=after {
                if let Some(ci) = self.char_info.get_mut(i) {
                    if ci.before_slot.is_none() {
                        ci.before_slot = Some(sref);
                    }
                    ci.after_slot = Some(sref);
                }
            }
        }
    }

    // --- class map delegation ---

    pub(crate) fn get_class_glyph(&self, cid: u16, index: u16) -> u16 {
        self.silf.map(|s| s.get_class_glyph(cid, index)).unwrap_or(0)
    }

    pub(crate) fn find_class_index(&self, cid: u16, gid: u16) -> Option<u16> {
        self.silf.and_then(|s| s.find_class_index(cid, gid))
    }

    // --- test support ---

    /// Verify the structural invariants of the slot graph
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        // Chain terminates and is doubly consistent
        let mut count = 0usize;
        let mut prev: Option<SlotRef> = None;
        let mut cur = self.first;
        while let Some(sref) = cur {
            let slot = self.slot(sref);
            assert!(!slot.is_deleted(), "deleted slot on chain");
            assert_eq!(slot.prev, prev, "chain prev link broken");
            assert!(slot.before <= slot.original && slot.original <= slot.after);
            assert!(to_usize(slot.after) < self.char_info.len().max(1));
            prev = cur;
            cur = slot.next;
            count += 1;
            assert!(count <= self.slots.len(), "chain cycle");
        }
        assert_eq!(self.last, prev);
        assert_eq!(count, self.slot_count());
        // Every allocated slot is live or free
        assert_eq!(count + self.free.len(), self.slots.len());
        // Coverage: every char index is covered by at least one live slot
        if count > 0 {
            for i in 0..self.char_info.len() {
                let i = to_u32(i);
                assert!(
                    self.slots()
                        .any(|s| s.before <= i && i <= s.after),
                    "char {i} uncovered"
                );
            }
        }
        // Attachment forest is acyclic
        for sref in (0..self.slots.len()).map(|i| SlotRef(to_u32(i))) {
            if self.slot(sref).is_deleted() {
                continue;
            }
            let mut steps = 0;
            let mut cur = sref;
            while let Some(p) = self.slot(cur).parent {
                cur = p;
                steps += 1;
                assert!(steps <= self.slots.len(), "attachment cycle");
            }
        }
    }
}

/// Iterator over a segment's live slots in visual order
pub struct Slots<'s, 'f> {
    seg: &'s Segment<'f>,
    next: Option<SlotRef>,
}

impl<'s, 'f> Iterator for Slots<'s, 'f> {
    type Item = &'s Slot;

    fn next(&mut self) -> Option<&'s Slot> {
        let sref = self.next?;
        let slot = self.seg.slot(sref);
        self.next = slot.next;
        Some(slot)
    }
}
