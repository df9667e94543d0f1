// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Per-glyph data: attributes and metrics
//!
//! Graphite attributes live in `Gloc`/`Glat`: `Gloc` maps a glyph id to a
//! byte range of `Glat`, which stores runs of consecutive attribute values.
//! Metrics come from the standard OpenType tables (`hmtx`, `hhea`, and the
//! `loca`/`glyf` bounding-box header).

use crate::tables::{Bytes, Error, TableProvider, Tag};
use ttf_parser::GlyphId;

/// A glyph metric, as addressed by rule bytecode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlyphMetric {
    LeftSideBearing = 0,
    RightSideBearing = 1,
    BoundingTop = 2,
    BoundingBottom = 3,
    BoundingLeft = 4,
    BoundingRight = 5,
    BoundingHeight = 6,
    BoundingWidth = 7,
    AdvanceWidth = 8,
    AdvanceHeight = 9,
    Ascent = 10,
    Descent = 11,
}

impl GlyphMetric {
    pub(crate) fn from_u8(m: u8) -> Option<GlyphMetric> {
        use GlyphMetric::*;
        Some(match m {
            0 => LeftSideBearing,
            1 => RightSideBearing,
            2 => BoundingTop,
            3 => BoundingBottom,
            4 => BoundingLeft,
            5 => BoundingRight,
            6 => BoundingHeight,
            7 => BoundingWidth,
            8 => AdvanceWidth,
            9 => AdvanceHeight,
            10 => Ascent,
            11 => Descent,
            _ => return None,
        })
    }
}

struct Attributes<'a> {
    /// Long (u32) Gloc offsets
    long: bool,
    /// Offset array region of Gloc (`num_glyphs + 1` entries)
    offsets: Bytes<'a>,
    glat: Bytes<'a>,
    /// Glat 1.x uses byte run headers; 2.x uses u16
    short_runs: bool,
    num_attrs: u16,
}

struct BboxSource<'a> {
    long: bool,
    loca: Bytes<'a>,
    glyf: Bytes<'a>,
}

/// Parsed per-glyph data for one face
pub(crate) struct GlyphData<'a> {
    num_glyphs: u16,
    upem: u16,
    ascent: i16,
    descent: i16,
    hmtx: ttf_parser::hmtx::Table<'a>,
    attrs: Option<Attributes<'a>>,
    bboxes: Option<BboxSource<'a>>,
}

impl<'a> GlyphData<'a> {
    pub fn parse(provider: &impl TableProvider<'a>) -> Result<GlyphData<'a>, Error> {
        let required = |tag| provider.table(tag).ok_or(Error::MissingTable(tag));

        let head = ttf_parser::head::Table::parse(required(Tag::HEAD)?)
            .ok_or(Error::Malformed(Tag::HEAD))?;
        let maxp = ttf_parser::maxp::Table::parse(required(Tag::MAXP)?)
            .ok_or(Error::Malformed(Tag::MAXP))?;
        let hhea = ttf_parser::hhea::Table::parse(required(Tag::HHEA)?)
            .ok_or(Error::Malformed(Tag::HHEA))?;
        let hmtx = ttf_parser::hmtx::Table::parse(
            hhea.number_of_metrics,
            maxp.number_of_glyphs,
            required(Tag::HMTX)?,
        )
        .ok_or(Error::Malformed(Tag::HMTX))?;

        let num_glyphs = maxp.number_of_glyphs.get();

        let attrs = match (provider.table(Tag::GLOC), provider.table(Tag::GLAT)) {
            (Some(gloc), Some(glat)) => Some(parse_attributes(gloc, glat, num_glyphs)?),
            _ => None,
        };

        let long_loca = matches!(
            head.index_to_location_format,
            ttf_parser::head::IndexToLocationFormat::Long
        );
        let bboxes = match (provider.table(Tag::LOCA), provider.table(Tag::GLYF)) {
            (Some(loca), Some(glyf)) => {
                let entry = if long_loca { 4 } else { 2 };
                let need = (usize::from(num_glyphs) + 1) * entry;
                if loca.len() < need {
                    return Err(Error::Malformed(Tag::LOCA));
                }
                Some(BboxSource {
                    long: long_loca,
                    loca: Bytes(loca),
                    glyf: Bytes(glyf),
                })
            }
            _ => None,
        };

        Ok(GlyphData {
            num_glyphs,
            upem: head.units_per_em,
            ascent: hhea.ascender,
            descent: hhea.descender,
            hmtx,
            attrs,
            bboxes,
        })
    }

    #[inline]
    pub fn num_glyphs(&self) -> u16 {
        self.num_glyphs
    }

    #[inline]
    pub fn units_per_em(&self) -> u16 {
        self.upem
    }

    /// Number of attributes declared by `Gloc` (0 without attribute tables)
    #[inline]
    pub fn num_attrs(&self) -> u16 {
        self.attrs.as_ref().map(|a| a.num_attrs).unwrap_or(0)
    }

    /// Horizontal advance in design units
    pub fn advance(&self, gid: u16) -> u16 {
        self.hmtx.advance(GlyphId(gid)).unwrap_or(0)
    }

    /// Read one Graphite glyph attribute; 0 when absent
    pub fn glyph_attr(&self, gid: u16, attr: u16) -> u16 {
        self.attrs
            .as_ref()
            .and_then(|a| a.get(gid, attr))
            .unwrap_or(0) as u16
    }

    /// Design-space bounding box `(x_min, y_min, x_max, y_max)`
    ///
    /// `None` for empty glyphs and fonts without outline tables.
    pub fn bbox(&self, gid: u16) -> Option<(i16, i16, i16, i16)> {
        let src = self.bboxes.as_ref()?;
        if gid >= self.num_glyphs {
            return None;
        }
        let (start, end) = if src.long {
            let g = usize::from(gid) * 4;
            (src.loca.u32(g)?, src.loca.u32(g + 4)?)
        } else {
            let g = usize::from(gid) * 2;
            (
                u32::from(src.loca.u16(g)?) * 2,
                u32::from(src.loca.u16(g + 2)?) * 2,
            )
        };
        if end <= start {
            return None; // no outline
        }
        let glyph = src.glyf.slice(start as usize, (end - start) as usize)?;
        // Bounds follow the contour count in the glyf entry header
        Some((glyph.i16(2)?, glyph.i16(4)?, glyph.i16(6)?, glyph.i16(8)?))
    }

    /// Read one metric in design units
    pub fn metric(&self, gid: u16, metric: GlyphMetric) -> i32 {
        use GlyphMetric::*;
        let bbox = || self.bbox(gid).unwrap_or((0, 0, 0, 0));
        match metric {
            AdvanceWidth => self.advance(gid).into(),
            AdvanceHeight => self.upem.into(),
            LeftSideBearing => self
                .hmtx
                .side_bearing(GlyphId(gid))
                .unwrap_or(0)
                .into(),
            RightSideBearing => {
                let (_, _, x_max, _) = bbox();
                i32::from(self.advance(gid)) - i32::from(x_max)
            }
            BoundingTop => bbox().3.into(),
            BoundingBottom => bbox().1.into(),
            BoundingLeft => bbox().0.into(),
            BoundingRight => bbox().2.into(),
            BoundingHeight => {
                let (_, y_min, _, y_max) = bbox();
                i32::from(y_max) - i32::from(y_min)
            }
            BoundingWidth => {
                let (x_min, _, x_max, _) = bbox();
                i32::from(x_max) - i32::from(x_min)
            }
            Ascent => self.ascent.into(),
            Descent => self.descent.into(),
        }
    }
}

fn parse_attributes<'a>(
    gloc: &'a [u8],
    glat: &'a [u8],
    num_glyphs: u16,
) -> Result<Attributes<'a>, Error> {
    let gloc = Bytes(gloc);
    let version = gloc.u32(0).ok_or(Error::Malformed(Tag::GLOC))?;
    if version >> 16 != 1 {
        return Err(Error::UnsupportedVersion {
            table: Tag::GLOC,
            version,
        });
    }
    let flags = gloc.u16(4).ok_or(Error::Malformed(Tag::GLOC))?;
    let num_attrs = gloc.u16(6).ok_or(Error::Malformed(Tag::GLOC))?;
    let long = flags & 1 != 0;

    let entry = if long { 4 } else { 2 };
    let need = (usize::from(num_glyphs) + 1) * entry;
    let offsets = gloc
        .slice(8, need)
        .ok_or(Error::Malformed(Tag::GLOC))?;

    let glat = Bytes(glat);
    let glat_version = glat.u32(0).ok_or(Error::Malformed(Tag::GLAT))?;
    let short_runs = match glat_version >> 16 {
        1 => true,
        2 => false,
        _ => {
            return Err(Error::UnsupportedVersion {
                table: Tag::GLAT,
                version: glat_version,
            })
        }
    };

    Ok(Attributes {
        long,
        offsets,
        glat,
        short_runs,
        num_attrs,
    })
}

impl<'a> Attributes<'a> {
    fn range(&self, gid: u16) -> Option<(usize, usize)> {
        let g = usize::from(gid);
        if self.long {
            let start = self.offsets.u32(g * 4)?;
            let end = self.offsets.u32(g * 4 + 4)?;
            Some((start as usize, end as usize))
        } else {
            let start = self.offsets.u16(g * 2)?;
            let end = self.offsets.u16(g * 2 + 2)?;
            Some((start.into(), end.into()))
        }
    }

    fn get(&self, gid: u16, attr: u16) -> Option<i16> {
        if attr >= self.num_attrs {
            return None;
        }
        let (start, end) = self.range(gid)?;
        if end < start {
            return None;
        }
        let run = self.glat.slice(start, end - start)?;
        let mut pos = 0;
        while pos < run.len() {
            let (first, count, header) = if self.short_runs {
                (
                    u16::from(run.u8(pos)?),
                    u16::from(run.u8(pos + 1)?),
                    2,
                )
            } else {
                (run.u16(pos)?, run.u16(pos + 2)?, 4)
            };
            if attr >= first && attr < first.checked_add(count)? {
                return run.i16(pos + header + usize::from(attr - first) * 2);
            }
            pos += header + usize::from(count) * 2;
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    struct Map(HashMap<Tag, Vec<u8>>);

    impl<'a> TableProvider<'a> for &'a Map {
        fn table(&self, tag: Tag) -> Option<&'a [u8]> {
            self.0.get(&tag).map(|v| &v[..])
        }
    }

    fn be16(v: &mut Vec<u8>, x: u16) {
        v.extend_from_slice(&x.to_be_bytes());
    }
    fn be32(v: &mut Vec<u8>, x: u32) {
        v.extend_from_slice(&x.to_be_bytes());
    }

    fn base_tables(num_glyphs: u16, advances: &[u16]) -> Map {
        let mut tables = HashMap::new();

        let mut head = vec![0u8; 54];
        head[18..20].copy_from_slice(&1000u16.to_be_bytes()); // unitsPerEm
        tables.insert(Tag::HEAD, head);

        let mut maxp = Vec::new();
        be32(&mut maxp, 0x00005000);
        be16(&mut maxp, num_glyphs);
        tables.insert(Tag::MAXP, maxp);

        let mut hhea = vec![0u8; 36];
        hhea[0..4].copy_from_slice(&0x00010000u32.to_be_bytes());
        hhea[4..6].copy_from_slice(&800i16.to_be_bytes()); // ascender
        hhea[6..8].copy_from_slice(&(-200i16).to_be_bytes()); // descender
        hhea[34..36].copy_from_slice(&(advances.len() as u16).to_be_bytes());
        tables.insert(Tag::HHEA, hhea);

        let mut hmtx = Vec::new();
        for &adv in advances {
            be16(&mut hmtx, adv);
            be16(&mut hmtx, 10); // lsb
        }
        tables.insert(Tag::HMTX, hmtx);

        Map(tables)
    }

    #[test]
    fn metrics_without_attr_tables() {
        let tables = base_tables(2, &[500, 640]);
        let data = GlyphData::parse(&&tables).unwrap();
        assert_eq!(data.num_glyphs(), 2);
        assert_eq!(data.num_attrs(), 0);
        assert_eq!(data.advance(1), 640);
        assert_eq!(data.glyph_attr(1, 3), 0);
        assert_eq!(data.metric(0, GlyphMetric::AdvanceWidth), 500);
        assert_eq!(data.metric(0, GlyphMetric::Ascent), 800);
        assert_eq!(data.metric(0, GlyphMetric::Descent), -200);
        assert_eq!(data.bbox(0), None);
    }

    #[test]
    fn glat_runs() {
        let mut tables = base_tables(2, &[500, 640]);

        // Glat 1.0: glyph 0 has attrs {1: 7, 2: -3}; glyph 1 has {4: 100}
        let mut glat = Vec::new();
        be32(&mut glat, 0x00010000);
        glat.push(1); // first attr
        glat.push(2); // count
        be16(&mut glat, 7);
        be16(&mut glat, (-3i16) as u16);
        let g1 = glat.len() as u16;
        glat.push(4);
        glat.push(1);
        be16(&mut glat, 100);
        let end = glat.len() as u16;

        let mut gloc = Vec::new();
        be32(&mut gloc, 0x00010000);
        be16(&mut gloc, 0); // short offsets
        be16(&mut gloc, 8); // numAttribs
        be16(&mut gloc, 4);
        be16(&mut gloc, g1);
        be16(&mut gloc, end);

        tables.0.insert(Tag::GLAT, glat);
        tables.0.insert(Tag::GLOC, gloc);

        let data = GlyphData::parse(&&tables).unwrap();
        assert_eq!(data.num_attrs(), 8);
        assert_eq!(data.glyph_attr(0, 1), 7);
        assert_eq!(data.glyph_attr(0, 2), (-3i16) as u16);
        assert_eq!(data.glyph_attr(0, 3), 0);
        assert_eq!(data.glyph_attr(1, 4), 100);
        assert_eq!(data.glyph_attr(1, 1), 0);
        assert_eq!(data.glyph_attr(5, 1), 0); // gid out of range
    }

    #[test]
    fn bad_gloc_fails_parse() {
        let mut tables = base_tables(2, &[500, 640]);
        let mut gloc = Vec::new();
        be32(&mut gloc, 0x00010000);
        be16(&mut gloc, 0);
        be16(&mut gloc, 8);
        be16(&mut gloc, 4); // only one offset; needs numGlyphs + 1
        tables.0.insert(Tag::GLOC, gloc);
        tables.0.insert(Tag::GLAT, vec![0, 1, 0, 0]);
        assert!(matches!(
            GlyphData::parse(&&tables),
            Err(Error::Malformed(Tag::GLOC))
        ));
    }

    #[test]
    fn bbox_reads() {
        let mut tables = base_tables(2, &[500, 640]);
        // glyph 0: empty; glyph 1: bbox (10, -20, 410, 390)
        let mut glyf = Vec::new();
        be16(&mut glyf, 1); // numberOfContours
        be16(&mut glyf, 10u16);
        be16(&mut glyf, (-20i16) as u16);
        be16(&mut glyf, 410);
        be16(&mut glyf, 390);
        let mut loca = Vec::new();
        be16(&mut loca, 0);
        be16(&mut loca, 0);
        be16(&mut loca, (glyf.len() / 2) as u16);
        tables.0.insert(Tag::GLYF, glyf);
        tables.0.insert(Tag::LOCA, loca);

        let data = GlyphData::parse(&&tables).unwrap();
        assert_eq!(data.bbox(0), None);
        assert_eq!(data.bbox(1), Some((10, -20, 410, 390)));
        assert_eq!(data.metric(1, GlyphMetric::BoundingWidth), 400);
        assert_eq!(data.metric(1, GlyphMetric::RightSideBearing), 640 - 410);
    }
}
