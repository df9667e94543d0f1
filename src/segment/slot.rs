// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Slots: the nodes of the shaping graph
//!
//! A slot is one shaping unit. Slots live in the owning segment's arena and
//! refer to each other by [`SlotRef`], a stable index that survives
//! insertion and deletion of other slots. The doubly-linked chain
//! (`prev`/`next`) is the segment's visual order; `parent`/`child`/`sibling`
//! form the attachment forest used for diacritic positioning.

use crate::conv::to_usize;
use crate::data::Vec2;
use bitflags::bitflags;

/// Stable reference to a slot within its segment
///
/// The index remains valid for the life of the segment; a freed slot's
/// index may be reused by a later insertion within the same segment only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRef(pub(crate) u32);

impl SlotRef {
    /// Get as `usize`
    #[inline]
    pub fn get(self) -> usize {
        to_usize(self.0)
    }
}

bitflags! {
    /// Slot state flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub(crate) struct SlotFlags: u8 {
        /// Off the chain, awaiting reuse
        const DELETED = 0x01;
        /// Created by a rule rather than segment build
        const INSERTED = 0x02;
        /// Contents copied from another slot by a copy rule
        const COPIED = 0x04;
        /// Insertion before this slot is blocked by a rule
        const NO_INSERT = 0x08;
    }
}

/// Slot attributes addressable from rule bytecode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotAttr {
    AdvanceX = 0,
    AdvanceY = 1,
    AttachTo = 2,
    /// Glyph-attribute index of the attach point on the parent
    AttachAt = 3,
    /// Glyph-attribute index of the anchor point on this glyph
    AttachWith = 4,
    AttachXOffset = 5,
    AttachYOffset = 6,
    Breakweight = 7,
    Directionality = 8,
    Insert = 9,
    PosX = 10,
    PosY = 11,
    ShiftX = 12,
    ShiftY = 13,
    Justify = 14,
    /// Indexed user attribute; the index is the op's second argument
    UserDefn = 15,
}

impl SlotAttr {
    pub(crate) fn from_u8(attr: u8) -> Option<SlotAttr> {
        use SlotAttr::*;
        Some(match attr {
            0 => AdvanceX,
            1 => AdvanceY,
            2 => AttachTo,
            3 => AttachAt,
            4 => AttachWith,
            5 => AttachXOffset,
            6 => AttachYOffset,
            7 => Breakweight,
            8 => Directionality,
            9 => Insert,
            10 => PosX,
            11 => PosY,
            12 => ShiftX,
            13 => ShiftY,
            14 => Justify,
            15 => UserDefn,
            _ => return None,
        })
    }
}

/// One shaping unit
///
/// Fields are mutated through the owning [`Segment`](super::Segment), which
/// maintains the chain and attachment invariants.
pub struct Slot {
    pub(crate) prev: Option<SlotRef>,
    pub(crate) next: Option<SlotRef>,
    pub(crate) glyph: u16,
    /// Position relative to segment start (pixels, set by positioning)
    pub(crate) origin: Vec2,
    /// Final advance (pixels, set by positioning)
    pub(crate) advance: Vec2,
    /// Rule-set advance adjustment (design units)
    pub(crate) advance_adjust: Vec2,
    /// Rule-set displacement (design units)
    pub(crate) shift: Vec2,
    /// Inclusive range of character-info indices this slot represents
    pub(crate) before: u32,
    pub(crate) after: u32,
    /// Character-info index the slot was born from
    pub(crate) original: u32,
    pub(crate) parent: Option<SlotRef>,
    /// First attached child
    pub(crate) child: Option<SlotRef>,
    /// Next child of the same parent
    pub(crate) sibling: Option<SlotRef>,
    /// Glyph-attribute index of the attach point on the parent's glyph
    pub(crate) attach_at: u16,
    /// Glyph-attribute index of the anchor point on this slot's glyph
    pub(crate) attach_with: u16,
    /// Additional attachment offset (design units)
    pub(crate) attach_offset: Vec2,
    pub(crate) bidi_level: u8,
    pub(crate) justify: f32,
    pub(crate) flags: SlotFlags,
    pub(crate) user: Box<[i16]>,
}

impl Slot {
    pub(crate) fn new(num_user: usize) -> Slot {
        Slot {
            prev: None,
            next: None,
            glyph: 0,
            origin: Vec2::ZERO,
            advance: Vec2::ZERO,
            advance_adjust: Vec2::ZERO,
            shift: Vec2::ZERO,
            before: 0,
            after: 0,
            original: 0,
            parent: None,
            child: None,
            sibling: None,
            attach_at: 0,
            attach_with: 0,
            attach_offset: Vec2::ZERO,
            bidi_level: 0,
            justify: 0.0,
            flags: SlotFlags::default(),
            user: vec![0; num_user].into_boxed_slice(),
        }
    }

    /// Reset all fields for reuse from the free-list
    pub(crate) fn reset(&mut self, num_user: usize) {
        let mut user = std::mem::take(&mut self.user);
        if user.len() == num_user {
            user.fill(0);
        } else {
            user = vec![0; num_user].into_boxed_slice();
        }
        *self = Slot::new(0);
        self.user = user;
    }

    /// Copy rule-visible content from another slot
    ///
    /// Chain links are not copied; attachment and character provenance are.
    pub(crate) fn copy_content(&mut self, other: &Slot) {
        self.glyph = other.glyph;
        self.origin = other.origin;
        self.advance_adjust = other.advance_adjust;
        self.shift = other.shift;
        self.before = other.before;
        self.after = other.after;
        self.original = other.original;
        self.parent = other.parent;
        self.attach_at = other.attach_at;
        self.attach_with = other.attach_with;
        self.attach_offset = other.attach_offset;
        self.bidi_level = other.bidi_level;
        self.justify = other.justify;
        self.user = other.user.clone();
        self.flags = (other.flags & !SlotFlags::DELETED) | SlotFlags::COPIED;
    }

    /// The glyph this slot currently carries
    #[inline]
    pub fn gid(&self) -> u16 {
        self.glyph
    }

    /// Position relative to the segment origin, in pixels
    ///
    /// Valid once the segment has been positioned.
    #[inline]
    pub fn origin(&self) -> Vec2 {
        self.origin
    }

    /// This slot's advance in pixels
    ///
    /// Valid once the segment has been positioned.
    #[inline]
    pub fn advance(&self) -> Vec2 {
        self.advance
    }

    /// First character-info index this slot represents
    #[inline]
    pub fn before(&self) -> usize {
        to_usize(self.before)
    }

    /// Last character-info index this slot represents (inclusive)
    #[inline]
    pub fn after(&self) -> usize {
        to_usize(self.after)
    }

    /// The character-info index the slot was born from
    #[inline]
    pub fn original(&self) -> usize {
        to_usize(self.original)
    }

    /// The slot this one is attached to, if any
    #[inline]
    pub fn attached_to(&self) -> Option<SlotRef> {
        self.parent
    }

    /// True for slots created by rules rather than by segment build
    #[inline]
    pub fn is_inserted(&self) -> bool {
        self.flags.contains(SlotFlags::INSERTED)
    }

    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        self.flags.contains(SlotFlags::DELETED)
    }

    /// Bidi embedding level
    #[inline]
    pub fn bidi_level(&self) -> u8 {
        self.bidi_level
    }

    /// Read a user attribute (0 when out of range)
    #[inline]
    pub fn user_attr(&self, index: usize) -> i16 {
        self.user.get(index).copied().unwrap_or(0)
    }
}
