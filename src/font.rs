// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Per-size font state
//!
//! A [`Font`] pairs a [`Face`] with a pixels-per-em size and caches glyph
//! advances. The cache is monotonic: entries are filled on first read and
//! never invalidated. Reads mutate the cache, so a `Font` shared between
//! threads must either be pre-populated or externally synchronized
//! (shaping itself never blocks).

use crate::Face;
use std::cell::RefCell;

/// Sentinel for a not-yet-computed advance
const INVALID_ADVANCE: f32 = -1e38;

enum AdvanceSource<'a> {
    /// Scale the face's design-unit advances
    Face(&'a Face<'a>),
    /// Host-supplied advances in pixels (e.g. hinted by the rasterizer)
    Callback(Box<dyn Fn(u16) -> f32 + 'a>),
}

/// A [`Face`] at a specific pixels-per-em size
pub struct Font<'a> {
    ppm: f32,
    scale: f32,
    advances: RefCell<Box<[f32]>>,
    source: AdvanceSource<'a>,
}

impl<'a> Font<'a> {
    /// Construct with advances computed from the face
    pub fn new(ppm: f32, face: &'a Face<'a>) -> Self {
        Font::with_source(ppm, face, AdvanceSource::Face(face))
    }

    /// Construct with a host advance callback
    ///
    /// The callback receives a glyph id and returns its advance in pixels;
    /// use this when the host rasterizer hints advances.
    pub fn with_advance_fn(
        ppm: f32,
        face: &'a Face<'a>,
        advance: impl Fn(u16) -> f32 + 'a,
    ) -> Self {
        Font::with_source(ppm, face, AdvanceSource::Callback(Box::new(advance)))
    }

    fn with_source(ppm: f32, face: &Face, source: AdvanceSource<'a>) -> Self {
        let upem = f32::from(face.units_per_em().max(1));
        let advances = vec![INVALID_ADVANCE; face.num_glyphs().into()].into_boxed_slice();
        Font {
            ppm,
            scale: ppm / upem,
            advances: RefCell::new(advances),
            source,
        }
    }

    /// Pixels per em
    #[inline]
    pub fn ppm(&self) -> f32 {
        self.ppm
    }

    /// Scale from design units to pixels
    #[inline]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// True when advances come from a host callback
    #[inline]
    pub fn is_hinted(&self) -> bool {
        matches!(self.source, AdvanceSource::Callback(_))
    }

    /// The advance of `gid` in pixels
    ///
    /// Cached after the first read. Out-of-range glyph ids yield 0.
    pub fn advance(&self, gid: u16) -> f32 {
        let mut advances = self.advances.borrow_mut();
        match advances.get_mut(usize::from(gid)) {
            Some(entry) => {
                if *entry == INVALID_ADVANCE {
                    *entry = match &self.source {
                        AdvanceSource::Face(face) => face.advance(gid, self.scale),
                        AdvanceSource::Callback(f) => f(gid),
                    };
                }
                *entry
            }
            None => 0.0,
        }
    }

    /// Fill the advance cache for all glyphs
    ///
    /// After this, [`Font::advance`] no longer writes and the `Font` may be
    /// shared behind a read lock.
    pub fn populate_cache(&self) {
        let n = self.advances.borrow().len();
        for gid in 0..n {
            self.advance(gid as u16);
        }
    }
}
