// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Font table access
//!
//! A [`Face`](crate::Face) is constructed over a [`TableProvider`]: a
//! capability returning read-only views of the font's tables. The views must
//! remain valid and unchanged for the provider's lifetime `'a`; the `Face`
//! borrows them directly.
//!
//! The [`Bytes`] reader is the only way table bytes are dereferenced during
//! parsing. Every read is bounds-checked; parsing code maps a failed read to
//! [`Error::Malformed`] for the offending table.

use thiserror::Error;

/// A four-byte table identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u32);

impl Tag {
    pub const CMAP: Tag = Tag::new(b"cmap");
    pub const FEAT: Tag = Tag::new(b"Feat");
    pub const GLAT: Tag = Tag::new(b"Glat");
    pub const GLOC: Tag = Tag::new(b"Gloc");
    pub const GLYF: Tag = Tag::new(b"glyf");
    pub const HEAD: Tag = Tag::new(b"head");
    pub const HHEA: Tag = Tag::new(b"hhea");
    pub const HMTX: Tag = Tag::new(b"hmtx");
    pub const LOCA: Tag = Tag::new(b"loca");
    pub const MAXP: Tag = Tag::new(b"maxp");
    pub const SILF: Tag = Tag::new(b"Silf");
    pub const SILL: Tag = Tag::new(b"Sill");

    /// Construct from four bytes
    pub const fn new(bytes: &[u8; 4]) -> Tag {
        Tag(u32::from_be_bytes(*bytes))
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let b = self.0.to_be_bytes();
        for c in b {
            if c.is_ascii_graphic() || c == b' ' {
                write!(f, "{}", c as char)?;
            } else {
                write!(f, "\\x{c:02x}")?;
            }
        }
        Ok(())
    }
}

/// Capability supplying font tables
///
/// Implementations return a stable, read-only view of the named table, or
/// `None` when the font has no such table. Views are borrowed for `'a` and
/// must not change while any [`Face`](crate::Face) built over them is alive.
pub trait TableProvider<'a> {
    /// Get the raw bytes of table `tag`
    fn table(&self, tag: Tag) -> Option<&'a [u8]>;
}

/// Face construction errors
///
/// Construction is all-or-nothing: any error here means no `Face` value
/// exists (spoiled tables are never half-parsed into a usable state).
#[derive(Error, Debug)]
pub enum Error {
    #[error("required table {0:?} is missing")]
    MissingTable(Tag),
    #[error("table {0:?} is malformed")]
    Malformed(Tag),
    #[error("table {table:?} has unsupported version {version:#010x}")]
    UnsupportedVersion { table: Tag, version: u32 },
}

/// A bounds-checked big-endian reader
///
/// All multi-byte reads are MSB-first, matching the encoding of every
/// Graphite and OpenType table. Reads return `None` past the end; they
/// never panic.
#[derive(Clone, Copy)]
pub(crate) struct Bytes<'a>(pub &'a [u8]);

impl<'a> Bytes<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn u8(&self, offset: usize) -> Option<u8> {
        self.0.get(offset).copied()
    }

    #[inline]
    pub fn u16(&self, offset: usize) -> Option<u16> {
        let b = self.0.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    #[inline]
    pub fn i16(&self, offset: usize) -> Option<i16> {
        self.u16(offset).map(|x| x as i16)
    }

    #[inline]
    pub fn u32(&self, offset: usize) -> Option<u32> {
        let b = self.0.get(offset..offset + 4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// A sub-reader over `offset..offset + len`
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> Option<Bytes<'a>> {
        let end = offset.checked_add(len)?;
        self.0.get(offset..end).map(Bytes)
    }

    /// A sub-reader over `offset..`
    #[inline]
    pub fn slice_from(&self, offset: usize) -> Option<Bytes<'a>> {
        self.0.get(offset..).map(Bytes)
    }
}
