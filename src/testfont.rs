// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! In-memory font construction for unit tests

use crate::tables::{TableProvider, Tag};
use std::collections::HashMap;

pub(crate) fn be16(v: &mut Vec<u8>, x: u16) {
    v.extend_from_slice(&x.to_be_bytes());
}

pub(crate) fn be32(v: &mut Vec<u8>, x: u32) {
    v.extend_from_slice(&x.to_be_bytes());
}

/// A table map standing in for a font file
pub(crate) struct TestFont(pub HashMap<Tag, Vec<u8>>);

impl<'a> TableProvider<'a> for &'a TestFont {
    fn table(&self, tag: Tag) -> Option<&'a [u8]> {
        self.0.get(&tag).map(|v| &v[..])
    }
}

/// Font description assembled into tables by [`FontSpec::build`]
pub(crate) struct FontSpec {
    pub upem: u16,
    /// One advance per glyph; the length fixes the glyph count
    pub advances: Vec<u16>,
    /// `(codepoint, glyph)` pairs, any order
    pub cmap: Vec<(u32, u16)>,
    /// A complete Silf table (see [`SilfSpec`])
    pub silf: Vec<u8>,
    /// Per-glyph `(first attr, values)` runs for Gloc/Glat
    pub attrs: Vec<Vec<(u8, Vec<i16>)>>,
}

impl Default for FontSpec {
    fn default() -> Self {
        FontSpec {
            upem: 1000,
            advances: vec![0, 500],
            cmap: Vec::new(),
            silf: SilfSpec::default().build(),
            attrs: Vec::new(),
        }
    }
}

impl FontSpec {
    pub fn build(&self) -> TestFont {
        let mut tables = HashMap::new();
        let num_glyphs = self.advances.len() as u16;

        let mut head = vec![0u8; 54];
        head[18..20].copy_from_slice(&self.upem.to_be_bytes());
        tables.insert(Tag::HEAD, head);

        let mut maxp = Vec::new();
        be32(&mut maxp, 0x0000_5000);
        be16(&mut maxp, num_glyphs);
        tables.insert(Tag::MAXP, maxp);

        let mut hhea = vec![0u8; 36];
        hhea[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
        hhea[4..6].copy_from_slice(&800i16.to_be_bytes());
        hhea[6..8].copy_from_slice(&(-200i16).to_be_bytes());
        hhea[34..36].copy_from_slice(&num_glyphs.to_be_bytes());
        tables.insert(Tag::HHEA, hhea);

        let mut hmtx = Vec::new();
        for &advance in &self.advances {
            be16(&mut hmtx, advance);
            be16(&mut hmtx, 0);
        }
        tables.insert(Tag::HMTX, hmtx);

        tables.insert(Tag::CMAP, build_cmap(&self.cmap));
        tables.insert(Tag::SILF, self.silf.clone());

        if !self.attrs.is_empty() {
            let (gloc, glat) = build_attrs(&self.attrs, num_glyphs);
            tables.insert(Tag::GLOC, gloc);
            tables.insert(Tag::GLAT, glat);
        }

        TestFont(tables)
    }
}

fn build_cmap(pairs: &[(u32, u16)]) -> Vec<u8> {
    let mut pairs: Vec<_> = pairs.to_vec();
    pairs.sort_unstable();

    let mut v = Vec::new();
    be16(&mut v, 0); // version
    be16(&mut v, 1); // numTables
    be16(&mut v, 3); // platform: Windows
    be16(&mut v, 10); // encoding: full Unicode
    be32(&mut v, 12); // subtable offset
    // format 12 subtable, one group per mapping
    be16(&mut v, 12);
    be16(&mut v, 0);
    be32(&mut v, 16 + pairs.len() as u32 * 12);
    be32(&mut v, 0); // language
    be32(&mut v, pairs.len() as u32);
    for &(cp, gid) in &pairs {
        be32(&mut v, cp);
        be32(&mut v, cp);
        be32(&mut v, gid.into());
    }
    v
}

fn build_attrs(attrs: &[Vec<(u8, Vec<i16>)>], num_glyphs: u16) -> (Vec<u8>, Vec<u8>) {
    let mut glat = Vec::new();
    be32(&mut glat, 0x0001_0000);
    let mut offsets = Vec::with_capacity(usize::from(num_glyphs) + 1);
    let mut max_attr = 0u16;
    for g in 0..usize::from(num_glyphs) {
        offsets.push(glat.len() as u16);
        for (first, values) in attrs.get(g).map(|v| &v[..]).unwrap_or(&[]) {
            glat.push(*first);
            glat.push(values.len() as u8);
            for &value in values {
                be16(&mut glat, value as u16);
            }
            max_attr = max_attr.max(u16::from(*first) + values.len() as u16);
        }
    }
    offsets.push(glat.len() as u16);

    let mut gloc = Vec::new();
    be32(&mut gloc, 0x0001_0000);
    be16(&mut gloc, 0); // short offsets
    be16(&mut gloc, max_attr);
    for off in offsets {
        be16(&mut gloc, off);
    }
    (gloc, glat)
}

/// One rule: a (constraint, action) bytecode pair with its match window
#[derive(Default)]
pub(crate) struct RuleSpec {
    pub sort_key: u16,
    pub pre_context: u8,
    pub constraint: Vec<u8>,
    pub action: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct PassSpec {
    pub flags: u8,
    pub max_rule_loop: u8,
    pub constraint: Vec<u8>,
    pub rules: Vec<RuleSpec>,
}

pub(crate) enum ClassSpec {
    Linear(Vec<u16>),
    Lookup(Vec<(u16, u16)>),
}

/// A Silf table with a single sub-table
pub(crate) struct SilfSpec {
    pub script: u32,
    pub num_user: u8,
    pub direction: u8,
    pub classes: Vec<ClassSpec>,
    pub passes: Vec<PassSpec>,
}

impl Default for SilfSpec {
    fn default() -> Self {
        SilfSpec {
            script: 0x6C617466, // "latf"
            num_user: 2,
            direction: 0,
            classes: Vec::new(),
            passes: Vec::new(),
        }
    }
}

impl SilfSpec {
    pub fn build(&self) -> Vec<u8> {
        let mut v = Vec::new();
        be32(&mut v, 0x0003_0000);
        be16(&mut v, 1);
        be16(&mut v, 0);
        be32(&mut v, 12); // sub-table offset

        let sub = v.len();
        be32(&mut v, self.script);
        v.push(0); // flags
        v.push(self.num_user);
        let max_pre = self
            .passes
            .iter()
            .flat_map(|p| p.rules.iter())
            .map(|r| r.pre_context)
            .max()
            .unwrap_or(0);
        v.push(max_pre);
        v.push(self.direction);
        let fixup = v.len();
        be32(&mut v, 0); // classOffset
        be32(&mut v, 0); // passOffset

        let class_off = (v.len() - sub) as u32;
        self.build_classes(&mut v);

        let pass_off = (v.len() - sub) as u32;
        v.push(self.passes.len() as u8);
        v.extend_from_slice(&[0, 0, 0]);
        let pass_fixup = v.len();
        for _ in &self.passes {
            be32(&mut v, 0);
        }
        for (i, pass) in self.passes.iter().enumerate() {
            let off = (v.len() - sub) as u32;
            v[pass_fixup + i * 4..pass_fixup + i * 4 + 4].copy_from_slice(&off.to_be_bytes());
            build_pass(&mut v, pass);
        }

        v[fixup..fixup + 4].copy_from_slice(&class_off.to_be_bytes());
        v[fixup + 4..fixup + 8].copy_from_slice(&pass_off.to_be_bytes());
        v
    }

    fn build_classes(&self, v: &mut Vec<u8>) {
        let num_linear = self
            .classes
            .iter()
            .take_while(|c| matches!(c, ClassSpec::Linear(_)))
            .count();
        be16(v, self.classes.len() as u16);
        be16(v, num_linear as u16);
        let offsets_at = v.len();
        for _ in 0..=self.classes.len() {
            be32(v, 0);
        }
        let base = offsets_at - 4;
        for (i, class) in self.classes.iter().enumerate() {
            let off = (v.len() - base) as u32;
            v[offsets_at + i * 4..offsets_at + i * 4 + 4].copy_from_slice(&off.to_be_bytes());
            match class {
                ClassSpec::Linear(glyphs) => {
                    for &g in glyphs {
                        be16(v, g);
                    }
                }
                ClassSpec::Lookup(pairs) => {
                    let mut pairs = pairs.clone();
                    pairs.sort_unstable();
                    be16(v, pairs.len() as u16);
                    be16(v, 0);
                    be16(v, 0);
                    be16(v, 0);
                    for (g, idx) in pairs {
                        be16(v, g);
                        be16(v, idx);
                    }
                }
            }
        }
        let end = (v.len() - base) as u32;
        let last = offsets_at + self.classes.len() * 4;
        v[last..last + 4].copy_from_slice(&end.to_be_bytes());
    }
}

fn build_pass(v: &mut Vec<u8>, pass: &PassSpec) {
    v.push(pass.flags);
    v.push(pass.max_rule_loop);
    be16(v, pass.rules.len() as u16);
    be32(v, pass.constraint.len() as u32);

    // Rule records, then the pass constraint, then the code blob
    let mut blob = Vec::new();
    for rule in &pass.rules {
        be16(v, rule.sort_key);
        v.push(rule.pre_context);
        v.push(0);
        let c_off = blob.len() as u32;
        blob.extend_from_slice(&rule.constraint);
        let a_off = blob.len() as u32;
        blob.extend_from_slice(&rule.action);
        be32(v, c_off);
        be32(v, rule.constraint.len() as u32);
        be32(v, a_off);
        be32(v, rule.action.len() as u32);
    }
    v.extend_from_slice(&pass.constraint);
    v.extend_from_slice(&blob);
}
