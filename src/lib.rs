// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Graphite smart-font shaping engine
//!
//! Given a run of Unicode text, a font carrying Graphite tables, a script
//! tag and a direction, this library produces a positioned sequence of
//! glyphs with per-glyph advances, attachment offsets and back-references
//! to the originating characters:
//!
//! ```no_run
//! # fn tables() -> std::collections::HashMap<kas_graphite::Tag, Vec<u8>> { unimplemented!() }
//! use kas_graphite::{Direction, Encoding, Face, Font, Segment, Tag, TableProvider};
//! use std::collections::HashMap;
//!
//! struct Tables(HashMap<Tag, Vec<u8>>);
//! impl<'a> TableProvider<'a> for &'a Tables {
//!     fn table(&self, tag: Tag) -> Option<&'a [u8]> {
//!         self.0.get(&tag).map(|v| &v[..])
//!     }
//! }
//!
//! let tables = Tables(tables());
//! let face = Face::new(&&tables).expect("valid font");
//! let font = Font::new(16.0, &face);
//! let text = "example";
//! let seg = Segment::make(
//!     &font,
//!     &face,
//!     0,
//!     Encoding::Utf8,
//!     text.as_bytes(),
//!     text.len(),
//!     Direction::LeftToRight,
//! );
//! for slot in seg.slots() {
//!     let _ = (slot.gid(), slot.origin());
//! }
//! ```
//!
//! This library *does not* perform bidirectional reordering, line breaking
//! or rasterization: callers pass a final directional run and receive
//! positioned glyphs.

pub(crate) mod conv;

mod data;
pub use data::{Rect, Vec2};

mod decode;
pub use decode::{count_unicode_characters, Encoding};

mod tables;
pub use tables::{Error, TableProvider, Tag};

mod face;
pub use face::{Face, FeatureMap, FeatureRef, Features, GlyphMetric};

mod font;
pub use font::Font;

mod segment;
pub use segment::{breakweight, CharInfo, Segment, Slot, SlotRef, Slots};

mod silf;
pub use silf::Silf;

mod vm;
pub use vm::{Code, CodeContext, CodeStatus, MachineStatus, Opcode};

#[cfg(test)]
pub(crate) mod testfont;

use unicode_bidi::{Level, LTR_LEVEL, RTL_LEVEL};

/// Direction of one shaping run
///
/// Callers resolve bidirectional text before shaping (Unicode TR9) and pass
/// each maximal directional run separately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    LeftToRight,
    RightToLeft,
}

impl Direction {
    /// True for right-to-left runs
    #[inline]
    pub fn is_rtl(self) -> bool {
        matches!(self, Direction::RightToLeft)
    }

    /// The base bidi embedding level of this run
    #[inline]
    pub(crate) fn level(self) -> Level {
        match self {
            Direction::LeftToRight => LTR_LEVEL,
            Direction::RightToLeft => RTL_LEVEL,
        }
    }
}

impl From<Level> for Direction {
    fn from(level: Level) -> Direction {
        match level.is_rtl() {
            false => Direction::LeftToRight,
            true => Direction::RightToLeft,
        }
    }
}
