// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-layer scale maps.
//!
//! A [`ScaleMap`] is the `index → multiplier` table every taxonomy
//! reduces to: group sliders are pushed through the value transform,
//! composed with the global base multiplier under an explicit
//! [`BaseComposition`] law, and fanned out to the indices each group
//! governs. Absent indices default to identity.
//!
//! Two composition laws are observed in the historical tuners and both
//! are preserved as explicit, separately configured behaviors (their
//! divergence may be an inconsistency in the originals, but intent is
//! unclear, so neither is unified away). Each target architecture pins
//! one law and keeps it consistent.

use std::collections::BTreeMap;

use crate::curve::{Mode, ValueTransform};
use crate::taxonomy::LayerTaxonomy;

/// Scales within this distance of identity are treated as no-ops: the
/// tensor is left untouched and no patch is registered. Keeps export
/// diffs minimal and avoids wasted work.
pub const IDENTITY_EPSILON: f64 = 1e-4;

/// Whether a scale is close enough to identity to be skipped.
#[must_use]
pub fn is_identity(scale: f64) -> bool {
    (scale - 1.0).abs() <= IDENTITY_EPSILON
}

// ---------------------------------------------------------------------------
// BaseComposition
// ---------------------------------------------------------------------------

/// How the global base multiplier combines with per-group values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseComposition {
    /// `transform(group) * transform(base)` in both modes.
    ///
    /// Used by the live diffusion tuner and all text-encoder variants.
    TransformedBase,
    /// `transform(group) * base` with the raw base in Real mode; in Soft
    /// mode the base is not applied at all.
    ///
    /// Used by the block-based diffusion variants.
    RawBaseInReal,
}

impl BaseComposition {
    /// The base factor under this law.
    #[must_use]
    pub fn base_factor(self, transform: &ValueTransform, base_raw: f64) -> f64 {
        match self {
            Self::TransformedBase => transform.apply(base_raw),
            Self::RawBaseInReal => match transform.mode {
                Mode::Real => base_raw,
                Mode::Soft => 1.0,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// ScaleMap
// ---------------------------------------------------------------------------

/// Mapping from layer index to effective multiplier.
#[derive(Debug, Clone, Default)]
pub struct ScaleMap {
    scales: BTreeMap<usize, f64>,
}

impl ScaleMap {
    /// Create an empty map (every index at identity).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The multiplier for `index`; absent indices are identity.
    #[must_use]
    pub fn get(&self, index: usize) -> f64 {
        self.scales.get(&index).copied().unwrap_or(1.0)
    }

    /// The patch strength for `index` (`scale - 1.0`).
    #[must_use]
    pub fn strength(&self, index: usize) -> f64 {
        self.get(index) - 1.0
    }

    /// Set the multiplier for `index`.
    pub fn set(&mut self, index: usize, scale: f64) {
        self.scales.insert(index, scale);
    }

    /// Whether `index` has an explicit (non-default) entry.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.scales.contains_key(&index)
    }

    /// Number of explicit entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scales.len()
    }

    /// Whether the map has no explicit entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }

    /// Iterate explicit `(index, scale)` entries in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.scales.iter().map(|(i, s)| (*i, *s))
    }
}

// ---------------------------------------------------------------------------
// ScaleMapBuilder
// ---------------------------------------------------------------------------

/// Builds a [`ScaleMap`] from a taxonomy, user control values, and the
/// global base multiplier.
///
/// # Example
///
/// ```
/// use candle_tune::{
///     BaseComposition, LayerTaxonomy, Mode, ScaleMapBuilder, SoftCurve,
///     ValueTransform,
/// };
///
/// let taxonomy = LayerTaxonomy::encoder_zones();
/// let transform = ValueTransform::new(Mode::Soft, SoftCurve::TextEncoder);
/// let map = ScaleMapBuilder::new(&taxonomy, transform, BaseComposition::TransformedBase)
///     .base(1.0)
///     .value("Zone_2_Syntax_Low_06_11", 1.5)
///     .build();
/// assert!((map.get(6) - 1.10).abs() < 1e-9);
/// assert!((map.get(0) - 1.0).abs() < 1e-9);
/// ```
#[derive(Debug)]
#[must_use]
pub struct ScaleMapBuilder<'a> {
    taxonomy: &'a LayerTaxonomy,
    transform: ValueTransform,
    composition: BaseComposition,
    base_raw: f64,
    values: BTreeMap<String, f64>,
}

impl<'a> ScaleMapBuilder<'a> {
    /// Start a builder with every control at its default (1.0).
    pub fn new(
        taxonomy: &'a LayerTaxonomy,
        transform: ValueTransform,
        composition: BaseComposition,
    ) -> Self {
        Self {
            taxonomy,
            transform,
            composition,
            base_raw: 1.0,
            values: BTreeMap::new(),
        }
    }

    /// Set the global base multiplier (raw, pre-transform).
    pub fn base(mut self, base_raw: f64) -> Self {
        self.base_raw = base_raw;
        self
    }

    /// Set one control value by slider name. Unknown names are ignored
    /// at build time (the taxonomy drives iteration).
    pub fn value(mut self, name: impl Into<String>, raw: f64) -> Self {
        self.values.insert(name.into(), raw);
        self
    }

    /// Set many control values at once.
    pub fn values<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        for (name, raw) in entries {
            self.values.insert(name.into(), raw);
        }
        self
    }

    /// Compose an auxiliary (non-indexed) raw value under the same law
    /// as the group sliders. Used for embedder/refiner/component inputs.
    #[must_use]
    pub fn compose(&self, raw: f64) -> f64 {
        let base = self.composition.base_factor(&self.transform, self.base_raw);
        self.transform.apply(raw) * base
    }

    /// Build the per-index scale map.
    #[must_use]
    pub fn build(&self) -> ScaleMap {
        let base = self.composition.base_factor(&self.transform, self.base_raw);
        let mut map = ScaleMap::new();
        for group in self.taxonomy.groups() {
            let raw = self.values.get(&group.name).copied().unwrap_or(1.0);
            let scale = self.transform.apply(raw) * base;
            for index in group.range.clone() {
                map.set(index, scale);
            }
        }
        map
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::curve::SoftCurve;

    fn soft_te() -> ValueTransform {
        ValueTransform::new(Mode::Soft, SoftCurve::TextEncoder)
    }

    #[test]
    fn absent_index_defaults_to_identity() {
        let map = ScaleMap::new();
        assert_eq!(map.get(17), 1.0);
        assert_eq!(map.strength(17), 0.0);
    }

    #[test]
    fn epsilon_threshold() {
        assert!(is_identity(1.0));
        assert!(is_identity(1.0 + 5e-5));
        assert!(is_identity(1.0 - 5e-5));
        assert!(!is_identity(1.0 + 2e-4));
    }

    #[test]
    fn six_zone_soft_scenario() {
        // base 1.0, one zone at 1.5 under the text-encoder curve:
        // (0.8 + 0.2*1.5) * (0.8 + 0.2*1.0) = 1.1 * 1.0 = 1.10
        let taxonomy = LayerTaxonomy::encoder_zones();
        let map = ScaleMapBuilder::new(&taxonomy, soft_te(), BaseComposition::TransformedBase)
            .base(1.0)
            .value("Zone_4_Semantics_18_23", 1.5)
            .build();
        for index in 18..24 {
            assert!((map.get(index) - 1.10).abs() < 1e-9);
            assert!((map.strength(index) - 0.10).abs() < 1e-9);
        }
        for index in (0..18).chain(24..36) {
            assert!((map.get(index) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn raw_base_only_applies_in_real_mode() {
        let taxonomy = LayerTaxonomy::diffusion_blocks();
        let real = ValueTransform::new(Mode::Real, SoftCurve::DiffusionLinear);
        let map = ScaleMapBuilder::new(&taxonomy, real, BaseComposition::RawBaseInReal)
            .base(2.0)
            .value("block_3_mid_10_14", 1.5)
            .build();
        // Real mode: raw value times raw base.
        assert_eq!(map.get(10), 3.0);
        // Untouched groups still carry the base.
        assert_eq!(map.get(0), 2.0);

        let soft = ValueTransform::new(Mode::Soft, SoftCurve::DiffusionLinear);
        let map = ScaleMapBuilder::new(&taxonomy, soft, BaseComposition::RawBaseInReal)
            .base(2.0)
            .value("block_3_mid_10_14", 1.5)
            .build();
        // Soft mode ignores the base under this law.
        assert!((map.get(10) - 1.1).abs() < 1e-9);
        assert_eq!(map.get(0), 1.0);
    }

    #[test]
    fn transformed_base_composes_in_soft_mode() {
        let taxonomy = LayerTaxonomy::encoder_bands();
        let map = ScaleMapBuilder::new(&taxonomy, soft_te(), BaseComposition::TransformedBase)
            .base(1.5)
            .value("LLM_Abstract_Concept", 1.5)
            .build();
        // transform(1.5) * transform(1.5) = 1.1 * 1.1
        assert!((map.get(30) - 1.21).abs() < 1e-9);
        // Groups at default still multiply by the transformed base.
        assert!((map.get(0) - 1.1).abs() < 1e-9);
    }

    #[test]
    fn compose_matches_group_law() {
        let taxonomy = LayerTaxonomy::diffusion_blocks();
        let real = ValueTransform::new(Mode::Real, SoftCurve::DiffusionLinear);
        let builder = ScaleMapBuilder::new(&taxonomy, real, BaseComposition::RawBaseInReal)
            .base(2.0);
        assert!((builder.compose(1.5) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn per_layer_map_covers_all_indices() {
        let taxonomy = LayerTaxonomy::per_layer(30);
        let transform = ValueTransform::new(Mode::Soft, SoftCurve::DiffusionLinear);
        let map = ScaleMapBuilder::new(&taxonomy, transform, BaseComposition::RawBaseInReal)
            .value("Layer_29", 2.0)
            .build();
        assert_eq!(map.len(), 30);
        assert!((map.get(29) - 1.2).abs() < 1e-9);
    }
}
