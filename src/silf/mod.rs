// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! The Silf table: script-specific shaping programs
//!
//! A Silf table holds one sub-table per script family. Each sub-table
//! declares the number of per-slot user attributes, a glyph class map
//! (shared by substitution opcodes), and an ordered list of passes whose
//! rule code is validated up front: a sub-table that parses successfully
//! contains only inert or runnable programs, never undefined ones.
//!
//! Table layout (all big-endian):
//!
//! ```none
//! Silf:      version u32, numSub u16, reserved u16, offsets u32[numSub]
//! Sub-table: scriptTag u32, flags u8, numUser u8, maxPreContext u8,
//!            direction u8, classOffset u32, passOffset u32
//! Classes:   numClasses u16, numLinear u16, offsets u32[numClasses + 1];
//!            linear: glyph u16 list;
//!            lookup: numIDs u16, searchRange u16, entrySelector u16,
//!                    rangeShift u16, (glyph u16, index u16)[numIDs]
//! Passes:    numPasses u8, reserved u8[3], offsets u32[numPasses]
//! ```
//!
//! Offsets within a sub-table are relative to the sub-table start; the
//! class-map offsets are relative to the class-map start.

mod pass;

pub(crate) use pass::{run_graphite, Pass};

use crate::tables::{Bytes, Error, Tag};
use crate::vm::CodeContext;

enum Class {
    /// Glyphs addressed by position
    Linear(Vec<u16>),
    /// `(glyph, index)` pairs sorted by glyph
    Lookup(Vec<(u16, u16)>),
}

/// One script family's shaping programs
pub struct Silf {
    script: u32,
    flags: u8,
    num_user: u8,
    max_pre_context: u8,
    direction: u8,
    classes: Vec<Class>,
    passes: Vec<Pass>,
}

impl Silf {
    /// The script tag this sub-table serves
    #[inline]
    pub fn script(&self) -> u32 {
        self.script
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// User attributes carried by every slot shaped with this sub-table
    #[inline]
    pub fn num_user(&self) -> u8 {
        self.num_user
    }

    /// The longest pre-context any rule in this sub-table declares
    #[inline]
    pub fn max_pre_context(&self) -> u8 {
        self.max_pre_context
    }

    /// Declared direction (bit 0: right-to-left)
    #[inline]
    pub fn rtl(&self) -> bool {
        self.direction & 1 != 0
    }

    #[inline]
    pub fn num_passes(&self) -> usize {
        self.passes.len()
    }

    #[inline]
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub(crate) fn passes(&self) -> &[Pass] {
        &self.passes
    }

    /// The glyph at `index` within class `cid` (0 when out of range)
    pub fn get_class_glyph(&self, cid: u16, index: u16) -> u16 {
        match self.classes.get(usize::from(cid)) {
            Some(Class::Linear(glyphs)) => glyphs.get(usize::from(index)).copied().unwrap_or(0),
            Some(Class::Lookup(pairs)) => pairs
                .iter()
                .find(|&&(_, i)| i == index)
                .map(|&(g, _)| g)
                .unwrap_or(0),
            None => 0,
        }
    }

    /// The position of `gid` within class `cid`
    pub fn find_class_index(&self, cid: u16, gid: u16) -> Option<u16> {
        match self.classes.get(usize::from(cid))? {
            Class::Linear(glyphs) => glyphs
                .iter()
                .position(|&g| g == gid)
                .map(|i| i as u16),
            Class::Lookup(pairs) => pairs
                .binary_search_by_key(&gid, |&(g, _)| g)
                .ok()
                .map(|i| pairs[i].1),
        }
    }
}

/// Parse the Silf table into its sub-tables
pub(crate) fn parse(b: Bytes, num_attrs: u16, num_feats: u16) -> Result<Vec<Silf>, Error> {
    let bad = || Error::Malformed(Tag::SILF);
    let version = b.u32(0).ok_or_else(bad)?;
    if version >> 16 != 3 {
        return Err(Error::UnsupportedVersion {
            table: Tag::SILF,
            version,
        });
    }
    let num_sub = b.u16(4).ok_or_else(bad)?;
    let mut subs = Vec::with_capacity(num_sub.into());
    for i in 0..usize::from(num_sub) {
        let offset = b.u32(8 + i * 4).ok_or_else(bad)?;
        let sub = b.slice_from(offset as usize).ok_or_else(bad)?;
        subs.push(parse_subtable(sub, num_attrs, num_feats)?);
    }
    Ok(subs)
}

fn parse_subtable(b: Bytes, num_attrs: u16, num_feats: u16) -> Result<Silf, Error> {
    let bad = || Error::Malformed(Tag::SILF);
    let script = b.u32(0).ok_or_else(bad)?;
    let flags = b.u8(4).ok_or_else(bad)?;
    let num_user = b.u8(5).ok_or_else(bad)?;
    let max_pre_context = b.u8(6).ok_or_else(bad)?;
    let direction = b.u8(7).ok_or_else(bad)?;
    let class_offset = b.u32(8).ok_or_else(bad)?;
    let pass_offset = b.u32(12).ok_or_else(bad)?;

    let classes = parse_classes(b.slice_from(class_offset as usize).ok_or_else(bad)?)?;

    let ctx = CodeContext {
        num_user,
        num_classes: classes.len() as u16,
        num_attrs,
        num_feats,
    };

    let pass_dir = b.slice_from(pass_offset as usize).ok_or_else(bad)?;
    let num_passes = pass_dir.u8(0).ok_or_else(bad)?;
    let mut passes = Vec::with_capacity(num_passes.into());
    for i in 0..usize::from(num_passes) {
        let offset = pass_dir.u32(4 + i * 4).ok_or_else(bad)?;
        let data = b.slice_from(offset as usize).ok_or_else(bad)?;
        passes.push(pass::parse(data, &ctx)?);
    }

    Ok(Silf {
        script,
        flags,
        num_user,
        max_pre_context,
        direction,
        classes,
        passes,
    })
}

fn parse_classes(b: Bytes) -> Result<Vec<Class>, Error> {
    let bad = || Error::Malformed(Tag::SILF);
    let num_classes = b.u16(0).ok_or_else(bad)?;
    let num_linear = b.u16(2).ok_or_else(bad)?;
    if num_linear > num_classes {
        return Err(bad());
    }
    let offset_at = |i: usize| b.u32(4 + i * 4).map(|o| o as usize).ok_or_else(bad);

    let mut classes = Vec::with_capacity(num_classes.into());
    for cid in 0..usize::from(num_classes) {
        let start = offset_at(cid)?;
        let end = offset_at(cid + 1)?;
        if end < start || end > b.len() {
            return Err(bad());
        }
        if cid < usize::from(num_linear) {
            let count = (end - start) / 2;
            let mut glyphs = Vec::with_capacity(count);
            for g in 0..count {
                glyphs.push(b.u16(start + g * 2).ok_or_else(bad)?);
            }
            classes.push(Class::Linear(glyphs));
        } else {
            let num_ids = b.u16(start).ok_or_else(bad)?;
            let mut pairs = Vec::with_capacity(num_ids.into());
            for p in 0..usize::from(num_ids) {
                let at = start + 8 + p * 4;
                if at + 4 > end {
                    return Err(bad());
                }
                let glyph = b.u16(at).ok_or_else(bad)?;
                let index = b.u16(at + 2).ok_or_else(bad)?;
                pairs.push((glyph, index));
            }
            if !pairs.windows(2).all(|w| w[0].0 <= w[1].0) {
                return Err(bad());
            }
            classes.push(Class::Lookup(pairs));
        }
    }
    Ok(classes)
}

#[cfg(test)]
mod test {
    use super::*;

    fn be16(v: &mut Vec<u8>, x: u16) {
        v.extend_from_slice(&x.to_be_bytes());
    }
    fn be32(v: &mut Vec<u8>, x: u32) {
        v.extend_from_slice(&x.to_be_bytes());
    }

    /// Class map: class 0 linear [5, 9], class 1 lookup {5: 0, 9: 1}
    fn sample_classes() -> Vec<u8> {
        let mut v = Vec::new();
        be16(&mut v, 2); // numClasses
        be16(&mut v, 1); // numLinear
        let header = 4 + 3 * 4;
        be32(&mut v, header as u32);
        be32(&mut v, (header + 4) as u32);
        be32(&mut v, (header + 4 + 8 + 8) as u32);
        // linear class 0
        be16(&mut v, 5);
        be16(&mut v, 9);
        // lookup class 1
        be16(&mut v, 2); // numIDs
        be16(&mut v, 4); // searchRange
        be16(&mut v, 1); // entrySelector
        be16(&mut v, 0); // rangeShift
        be16(&mut v, 5);
        be16(&mut v, 0);
        be16(&mut v, 9);
        be16(&mut v, 1);
        v
    }

    /// One sub-table, sample classes, no passes
    fn sample_silf() -> Vec<u8> {
        let mut v = Vec::new();
        be32(&mut v, 0x0003_0000);
        be16(&mut v, 1); // numSub
        be16(&mut v, 0);
        be32(&mut v, 12); // subtable offset
        // subtable
        let sub = v.len();
        be32(&mut v, 0x6C617466); // "latf"
        v.push(0); // flags
        v.push(2); // numUser
        v.push(1); // maxPreContext
        v.push(0); // direction
        let fixup = v.len();
        be32(&mut v, 0); // classOffset
        be32(&mut v, 0); // passOffset
        let class_off = (v.len() - sub) as u32;
        v.extend_from_slice(&sample_classes());
        let pass_off = (v.len() - sub) as u32;
        v.push(0); // numPasses
        v.extend_from_slice(&[0, 0, 0]);
        v[fixup..fixup + 4].copy_from_slice(&class_off.to_be_bytes());
        v[fixup + 4..fixup + 8].copy_from_slice(&pass_off.to_be_bytes());
        v
    }

    #[test]
    fn parse_subtable_and_classes() {
        let data = sample_silf();
        let subs = parse(Bytes(&data), 0, 0).unwrap();
        assert_eq!(subs.len(), 1);
        let silf = &subs[0];
        assert_eq!(silf.script(), 0x6C617466);
        assert_eq!(silf.num_user(), 2);
        assert_eq!(silf.num_passes(), 0);
        assert_eq!(silf.num_classes(), 2);

        // Linear class
        assert_eq!(silf.get_class_glyph(0, 0), 5);
        assert_eq!(silf.get_class_glyph(0, 1), 9);
        assert_eq!(silf.get_class_glyph(0, 2), 0);
        assert_eq!(silf.find_class_index(0, 9), Some(1));
        assert_eq!(silf.find_class_index(0, 7), None);

        // Lookup class
        assert_eq!(silf.find_class_index(1, 5), Some(0));
        assert_eq!(silf.find_class_index(1, 9), Some(1));
        assert_eq!(silf.find_class_index(1, 6), None);
        assert_eq!(silf.get_class_glyph(1, 1), 9);

        // Out-of-range class
        assert_eq!(silf.get_class_glyph(9, 0), 0);
        assert_eq!(silf.find_class_index(9, 5), None);
    }

    #[test]
    fn rejects_bad_version() {
        let mut data = sample_silf();
        data[0] = 0;
        data[1] = 2;
        assert!(matches!(
            parse(Bytes(&data), 0, 0),
            Err(Error::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn rejects_truncated_table() {
        let data = sample_silf();
        assert!(parse(Bytes(&data[..20]), 0, 0).is_err());
    }

    #[test]
    fn rejects_unsorted_lookup_class() {
        let mut data = sample_silf();
        // The lookup pairs are the last 8 bytes before the pass directory;
        // swap them so glyph order is descending
        let pass_dir = data.len() - 4;
        let (a, b) = (pass_dir - 8, pass_dir - 4);
        let first: Vec<u8> = data[a..b].to_vec();
        data.copy_within(b..pass_dir, a);
        data[b..pass_dir].copy_from_slice(&first);
        assert!(parse(Bytes(&data), 0, 0).is_err());
    }
}
