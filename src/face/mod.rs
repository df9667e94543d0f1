// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Font face: parsed, immutable shaping data
//!
//! A [`Face`] is constructed once per font over a
//! [`TableProvider`](crate::tables::TableProvider) and owns every structure
//! shaping needs: the Silf sub-tables (passes, rules, loaded rule code),
//! glyph attributes and metrics, and the feature map. Construction is
//! all-or-nothing; a malformed required table yields a typed error and no
//! `Face`.
//!
//! A `Face` is immutable after construction and may be shared freely between
//! threads shaping distinct segments.

mod features;
mod glyphs;

pub use features::{FeatureMap, FeatureRef, Features};
pub use glyphs::GlyphMetric;

pub(crate) use glyphs::GlyphData;

use crate::segment::Segment;
use crate::silf::{self, Silf};
use crate::tables::{Bytes, Error, TableProvider, Tag};

/// Parsed view of a Graphite font's tables
pub struct Face<'a> {
    glyphs: GlyphData<'a>,
    features: FeatureMap,
    cmap: ttf_parser::cmap::Subtable<'a>,
    silf: Vec<Silf>,
}

impl<'a> Face<'a> {
    /// Construct from a table provider
    ///
    /// Required tables: `head`, `maxp`, `hhea`, `hmtx`, `cmap`, `Silf`.
    /// `Gloc`/`Glat`, `Feat`/`Sill` and `loca`/`glyf` are optional; when
    /// absent, glyph attributes read as 0, the feature map is empty and
    /// bounding boxes are empty.
    pub fn new(provider: &impl TableProvider<'a>) -> Result<Face<'a>, Error> {
        let glyphs = GlyphData::parse(provider)?;

        let cmap_data = provider
            .table(Tag::CMAP)
            .ok_or(Error::MissingTable(Tag::CMAP))?;
        let cmap = ttf_parser::cmap::Table::parse(cmap_data)
            .ok_or(Error::Malformed(Tag::CMAP))?;
        let mut chosen = None;
        for i in 0..cmap.subtables.len() {
            if let Some(subtable) = cmap.subtables.get(i) {
                if subtable.is_unicode() {
                    chosen = Some(subtable);
                    break;
                }
            }
        }
        let cmap = chosen.ok_or(Error::Malformed(Tag::CMAP))?;

        let features = FeatureMap::parse(
            provider.table(Tag::FEAT).map(Bytes),
            provider.table(Tag::SILL).map(Bytes),
        )?;

        let silf_data = provider
            .table(Tag::SILF)
            .ok_or(Error::MissingTable(Tag::SILF))?;
        let silf = silf::parse(
            Bytes(silf_data),
            glyphs.num_attrs(),
            features.num_features() as u16,
        )?;

        Ok(Face {
            glyphs,
            features,
            cmap,
            silf,
        })
    }

    /// Map a character to a glyph id (0 for missing glyphs)
    pub fn gid_for_char(&self, c: char) -> u16 {
        self.cmap
            .glyph_index(c.into())
            .map(|gid| gid.0)
            .unwrap_or(0)
    }

    /// Read one Graphite glyph attribute
    #[inline]
    pub fn glyph_attr(&self, gid: u16, attr: u16) -> u16 {
        self.glyphs.glyph_attr(gid, attr)
    }

    /// Read one glyph metric in design units
    #[inline]
    pub fn glyph_metric(&self, gid: u16, metric: GlyphMetric) -> i32 {
        self.glyphs.metric(gid, metric)
    }

    /// Horizontal advance, scaled
    ///
    /// `scale` is typically [`Font::scale`](crate::Font::scale); pass 1.0
    /// for design units.
    #[inline]
    pub fn advance(&self, gid: u16, scale: f32) -> f32 {
        f32::from(self.glyphs.advance(gid)) * scale
    }

    /// Design-space bounding box; `None` for glyphs without outlines
    #[inline]
    pub fn glyph_bbox(&self, gid: u16) -> Option<(i16, i16, i16, i16)> {
        self.glyphs.bbox(gid)
    }

    #[inline]
    pub fn num_glyphs(&self) -> u16 {
        self.glyphs.num_glyphs()
    }

    #[inline]
    pub fn units_per_em(&self) -> u16 {
        self.glyphs.units_per_em()
    }

    /// The font's feature definitions
    #[inline]
    pub fn feature_map(&self) -> &FeatureMap {
        &self.features
    }

    /// Choose the Silf sub-table for a script
    ///
    /// Falls back to the first sub-table when no tag matches; `None` only
    /// for fonts whose Silf table defines no sub-tables.
    pub fn choose_silf(&self, script: u32) -> Option<&Silf> {
        self.silf
            .iter()
            .find(|s| s.script() == script)
            .or_else(|| self.silf.first())
    }

    /// Run the shaping passes of `silf` over a segment
    ///
    /// The segment must have been built against this face.
    pub fn run_graphite(&self, seg: &mut Segment, silf: &Silf) {
        silf::run_graphite(seg, silf);
    }
}
