// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Feature definitions and feature-value vectors
//!
//! The `Feat` table defines the features a font exposes; the `Sill` table
//! overrides feature defaults per language. A [`Features`] value is one
//! active feature-value vector, indexed in `Feat` declaration order.

use crate::conv::to_usize;
use crate::tables::{Bytes, Error, Tag};
use smallvec::SmallVec;

/// An active feature-value vector
///
/// One value per feature, in the order features are declared by the font.
/// Obtain an instance via [`FeatureMap::clone_features`], adjust values via
/// [`FeatureRef::set_value`], then pass it to segment construction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Features(pub(crate) SmallVec<[u16; 8]>);

/// One feature definition
#[derive(Clone, Debug)]
pub struct FeatureRef {
    id: u32,
    index: u16,
    default: u16,
    flags: u16,
    label: u16,
    settings: Vec<(i16, u16)>,
}

impl FeatureRef {
    /// The font's identifier for this feature
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name-table label for this feature
    #[inline]
    pub fn label(&self) -> u16 {
        self.label
    }

    #[inline]
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Number of declared settings
    #[inline]
    pub fn num_settings(&self) -> usize {
        self.settings.len()
    }

    /// A declared setting: `(value, name label)`
    #[inline]
    pub fn setting(&self, index: usize) -> Option<(i16, u16)> {
        self.settings.get(index).copied()
    }

    /// Read this feature's value from a vector
    pub fn value(&self, feats: &Features) -> u16 {
        feats
            .0
            .get(to_usize(self.index.into()))
            .copied()
            .unwrap_or(self.default)
    }

    /// Write this feature's value into a vector
    ///
    /// A no-op if `feats` was built for a different font (too short).
    pub fn set_value(&self, feats: &mut Features, value: u16) {
        if let Some(slot) = feats.0.get_mut(to_usize(self.index.into())) {
            *slot = value;
        }
    }
}

struct LangDefaults {
    tag: u32,
    settings: Vec<(u32, u16)>,
}

/// The font's feature definitions
///
/// Parsed from `Feat` and `Sill`; empty when the font carries neither.
#[derive(Default)]
pub struct FeatureMap {
    refs: Vec<FeatureRef>,
    langs: Vec<LangDefaults>,
}

impl FeatureMap {
    /// Number of features defined by the font
    #[inline]
    pub fn num_features(&self) -> usize {
        self.refs.len()
    }

    /// Get a feature by declaration index
    #[inline]
    pub fn feature_ref(&self, findex: u16) -> Option<&FeatureRef> {
        self.refs.get(to_usize(findex.into()))
    }

    /// Find a feature by its font identifier
    pub fn find_id(&self, id: u32) -> Option<&FeatureRef> {
        self.refs.iter().find(|f| f.id == id)
    }

    /// Build a feature-value vector for `lang`
    ///
    /// Starts from each feature's default and applies the `Sill` overrides
    /// for `lang` (a language tag, or 0 for no language).
    pub fn clone_features(&self, lang: u32) -> Features {
        let mut feats = Features(self.refs.iter().map(|f| f.default).collect());
        if lang != 0 {
            if let Some(defaults) = self.langs.iter().find(|l| l.tag == lang) {
                for &(id, value) in &defaults.settings {
                    if let Some(fref) = self.find_id(id) {
                        fref.set_value(&mut feats, value);
                    }
                }
            }
        }
        feats
    }

    pub(crate) fn parse(feat: Option<Bytes>, sill: Option<Bytes>) -> Result<FeatureMap, Error> {
        let mut map = FeatureMap::default();
        if let Some(feat) = feat {
            map.refs = parse_feat(feat)?;
        }
        if let Some(sill) = sill {
            map.langs = parse_sill(sill)?;
        }
        Ok(map)
    }
}

fn parse_feat(b: Bytes) -> Result<Vec<FeatureRef>, Error> {
    let bad = || Error::Malformed(Tag::FEAT);
    let version = b.u32(0).ok_or_else(bad)?;
    if version >> 16 == 0 || version >> 16 > 2 {
        return Err(Error::UnsupportedVersion {
            table: Tag::FEAT,
            version,
        });
    }
    let num_feat = b.u16(4).ok_or_else(bad)?;
    let mut refs = Vec::with_capacity(num_feat.into());
    for i in 0..usize::from(num_feat) {
        let rec = 12 + i * 16;
        let id = b.u32(rec).ok_or_else(bad)?;
        let num_settings = b.u16(rec + 4).ok_or_else(bad)?;
        let offset = b.u32(rec + 8).ok_or_else(bad)?;
        let flags = b.u16(rec + 12).ok_or_else(bad)?;
        let label = b.u16(rec + 14).ok_or_else(bad)?;

        let mut settings = Vec::with_capacity(num_settings.into());
        for s in 0..usize::from(num_settings) {
            let at = to_usize(offset) + s * 4;
            let value = b.i16(at).ok_or_else(bad)?;
            let name = b.u16(at + 2).ok_or_else(bad)?;
            settings.push((value, name));
        }

        let default = settings.first().map(|s| s.0 as u16).unwrap_or(0);
        refs.push(FeatureRef {
            id,
            index: i as u16,
            default,
            flags,
            label,
            settings,
        });
    }
    Ok(refs)
}

fn parse_sill(b: Bytes) -> Result<Vec<LangDefaults>, Error> {
    let bad = || Error::Malformed(Tag::SILL);
    let version = b.u32(0).ok_or_else(bad)?;
    if version >> 16 != 1 {
        return Err(Error::UnsupportedVersion {
            table: Tag::SILL,
            version,
        });
    }
    let num_langs = b.u16(4).ok_or_else(bad)?;
    let mut langs = Vec::with_capacity(num_langs.into());
    for i in 0..usize::from(num_langs) {
        let rec = 12 + i * 8;
        let tag = b.u32(rec).ok_or_else(bad)?;
        let num_settings = b.u16(rec + 4).ok_or_else(bad)?;
        let offset = b.u16(rec + 6).ok_or_else(bad)?;

        let mut settings = Vec::with_capacity(num_settings.into());
        for s in 0..usize::from(num_settings) {
            let at = usize::from(offset) + s * 8;
            let id = b.u32(at).ok_or_else(bad)?;
            let value = b.u16(at + 4).ok_or_else(bad)?;
            settings.push((id, value));
        }
        langs.push(LangDefaults { tag, settings });
    }
    Ok(langs)
}

#[cfg(test)]
mod test {
    use super::*;

    fn push16(v: &mut Vec<u8>, x: u16) {
        v.extend_from_slice(&x.to_be_bytes());
    }
    fn push32(v: &mut Vec<u8>, x: u32) {
        v.extend_from_slice(&x.to_be_bytes());
    }

    /// One feature id=0x6C696768 ("ligh"), two settings (0: off, 1: on)
    fn sample_feat() -> Vec<u8> {
        let mut v = Vec::new();
        push32(&mut v, 0x0002_0000);
        push16(&mut v, 1); // numFeat
        push16(&mut v, 0);
        push32(&mut v, 0);
        push32(&mut v, 0x6C696768);
        push16(&mut v, 2); // numSettings
        push16(&mut v, 0);
        push32(&mut v, 28); // settings offset
        push16(&mut v, 0); // flags
        push16(&mut v, 300); // label
        // settings
        push16(&mut v, 0);
        push16(&mut v, 301);
        push16(&mut v, 1);
        push16(&mut v, 302);
        v
    }

    fn sample_sill() -> Vec<u8> {
        let mut v = Vec::new();
        push32(&mut v, 0x0001_0000);
        push16(&mut v, 1); // numLangs
        push16(&mut v, 0);
        push16(&mut v, 0);
        push16(&mut v, 0);
        push32(&mut v, 0x656E2020); // "en  "
        push16(&mut v, 1);
        push16(&mut v, 20); // settings offset
        push32(&mut v, 0x6C696768);
        push16(&mut v, 1);
        push16(&mut v, 0);
        v
    }

    #[test]
    fn feat_defaults() {
        let feat = sample_feat();
        let map = FeatureMap::parse(Some(Bytes(&feat)), None).unwrap();
        assert_eq!(map.num_features(), 1);
        let fref = map.find_id(0x6C696768).unwrap();
        assert_eq!(fref.num_settings(), 2);
        assert_eq!(fref.setting(1), Some((1, 302)));

        let feats = map.clone_features(0);
        assert_eq!(fref.value(&feats), 0);
    }

    #[test]
    fn sill_overrides() {
        let feat = sample_feat();
        let sill = sample_sill();
        let map = FeatureMap::parse(Some(Bytes(&feat)), Some(Bytes(&sill))).unwrap();

        let feats = map.clone_features(0x656E2020);
        assert_eq!(map.find_id(0x6C696768).unwrap().value(&feats), 1);

        // Unknown language falls back to defaults
        let feats = map.clone_features(0x66722020);
        assert_eq!(map.find_id(0x6C696768).unwrap().value(&feats), 0);
    }

    #[test]
    fn set_value() {
        let feat = sample_feat();
        let map = FeatureMap::parse(Some(Bytes(&feat)), None).unwrap();
        let fref = map.find_id(0x6C696768).unwrap();
        let mut feats = map.clone_features(0);
        fref.set_value(&mut feats, 1);
        assert_eq!(fref.value(&feats), 1);
    }

    #[test]
    fn truncated_feat_is_rejected() {
        let feat = sample_feat();
        assert!(FeatureMap::parse(Some(Bytes(&feat[..20])), None).is_err());
    }
}
