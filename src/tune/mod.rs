// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tuning engines.
//!
//! Two engines share the vocabulary of taxonomies, curves, and scale
//! maps but differ in mutation strategy:
//!
//! - [`DiffusionTuner`] mutates a [`BackboneHandle`] destructively,
//!   under [`BackupStore`] snapshot protection (restore before every
//!   re-apply, so repeated runs never compound).
//! - [`EncoderTuner`] never mutates its input: it clones the
//!   [`EncoderHandle`] and registers additive [`WeightPatch`] entries
//!   on the clone, applied lazily by the consumer.
//!
//! Each engine variant pins a taxonomy, a soft curve, and a base
//! composition law; the mode (Soft or Real) is the caller's choice.
//!
//! [`BackboneHandle`]: crate::BackboneHandle
//! [`BackupStore`]: crate::BackupStore
//! [`EncoderHandle`]: crate::EncoderHandle
//! [`WeightPatch`]: crate::WeightPatch

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::curve::{Mode, SoftCurve, ValueTransform};
use crate::keys::KeyClassifier;
use crate::scale::BaseComposition;
use crate::taxonomy::LayerTaxonomy;

mod destructive;
mod patch;

// ---------------------------------------------------------------------------
// TuneOptions
// ---------------------------------------------------------------------------

/// User control values for one tuning run.
///
/// Everything defaults to identity; only the controls the caller sets
/// deviate. Group values are keyed by the taxonomy's slider names.
#[derive(Debug, Clone)]
#[must_use]
pub struct TuneOptions {
    pub(crate) base: f64,
    pub(crate) values: BTreeMap<String, f64>,
    pub(crate) attention: f64,
    pub(crate) feed_forward: f64,
    pub(crate) embedder: f64,
    pub(crate) refiner: f64,
    pub(crate) noise_refiner: f64,
    pub(crate) context_refiner: f64,
    pub(crate) tune_normalization: bool,
}

impl Default for TuneOptions {
    fn default() -> Self {
        Self {
            base: 1.0,
            values: BTreeMap::new(),
            attention: 1.0,
            feed_forward: 1.0,
            embedder: 1.0,
            refiner: 1.0,
            noise_refiner: 1.0,
            context_refiner: 1.0,
            tune_normalization: false,
        }
    }
}

impl TuneOptions {
    /// Start from all-identity defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Global base multiplier (raw, pre-transform).
    pub fn base(mut self, raw: f64) -> Self {
        self.base = raw;
        self
    }

    /// Set one group control by slider name.
    pub fn value(mut self, name: impl Into<String>, raw: f64) -> Self {
        self.values.insert(name.into(), raw);
        self
    }

    /// Set many group controls at once.
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

    /// Extra multiplier for attention sub-modules within governed layers.
    pub fn attention(mut self, raw: f64) -> Self {
        self.attention = raw;
        self
    }

    /// Extra multiplier for feed-forward sub-modules within governed layers.
    pub fn feed_forward(mut self, raw: f64) -> Self {
        self.feed_forward = raw;
        self
    }

    /// Scale for input embedders.
    pub fn embedder(mut self, raw: f64) -> Self {
        self.embedder = raw;
        self
    }

    /// Scale for generic refiner blocks.
    pub fn refiner(mut self, raw: f64) -> Self {
        self.refiner = raw;
        self
    }

    /// Scale for noise refiner blocks.
    pub fn noise_refiner(mut self, raw: f64) -> Self {
        self.noise_refiner = raw;
        self
    }

    /// Scale for context refiner blocks.
    pub fn context_refiner(mut self, raw: f64) -> Self {
        self.context_refiner = raw;
        self
    }

    /// Opt in to scaling normalization parameters. Off by default;
    /// scaling them reliably produces artifacts.
    pub fn tune_normalization(mut self, enabled: bool) -> Self {
        self.tune_normalization = enabled;
        self
    }
}

// ---------------------------------------------------------------------------
// TuneReport
// ---------------------------------------------------------------------------

/// Outcome of one tuning run.
#[derive(Debug, Clone)]
pub struct TuneReport {
    /// Value mode the run used.
    pub mode: Mode,
    /// Tensors actually scaled or patched.
    pub tensors_tuned: usize,
    /// Governed tensors skipped (identity scale or exclusion rules).
    pub tensors_skipped: usize,
    /// Present when the run soft-failed (e.g. unrecognized structure);
    /// the model was returned unchanged.
    pub diagnostic: Option<String>,
    /// Machine-readable run detail (mode, base strength, per-layer
    /// strengths) for host-side display.
    pub debug: Value,
}

impl TuneReport {
    /// A soft-failure report: nothing was touched, `diagnostic` says why.
    #[must_use]
    pub fn soft_failure(mode: Mode, diagnostic: impl Into<String>) -> Self {
        let diagnostic = diagnostic.into();
        Self {
            mode,
            tensors_tuned: 0,
            tensors_skipped: 0,
            debug: serde_json::json!({ "error": &diagnostic }),
            diagnostic: Some(diagnostic),
        }
    }

    /// Whether anything was modified.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.tensors_tuned > 0
    }
}

impl fmt::Display for TuneReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.diagnostic {
            Some(diagnostic) => write!(f, "Mode: {} | {diagnostic}", self.mode),
            None => write!(
                f,
                "Mode: {} | Tuned: {} | Skipped: {}",
                self.mode, self.tensors_tuned, self.tensors_skipped
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tuners
// ---------------------------------------------------------------------------

/// Destructive tuner for diffusion backbones.
#[derive(Debug, Clone)]
pub struct DiffusionTuner {
    pub(crate) classifier: KeyClassifier,
    pub(crate) transform: ValueTransform,
    pub(crate) composition: BaseComposition,
    pub(crate) taxonomy: LayerTaxonomy,
}

impl DiffusionTuner {
    /// Positional variant: 30 layers in 6 blocks, linear soft curve,
    /// raw base applied in Real mode only.
    #[must_use]
    pub fn blocks(mode: Mode) -> Self {
        Self {
            classifier: KeyClassifier::diffusion(),
            transform: ValueTransform::new(mode, SoftCurve::DiffusionLinear),
            composition: BaseComposition::RawBaseInReal,
            taxonomy: LayerTaxonomy::diffusion_blocks(),
        }
    }

    /// Semantic variant: 30 layers in 5 generation stages, quadratic
    /// soft curve, base composed through the transform.
    #[must_use]
    pub fn stages(mode: Mode) -> Self {
        Self {
            classifier: KeyClassifier::diffusion(),
            transform: ValueTransform::new(mode, SoftCurve::DiffusionQuadratic),
            composition: BaseComposition::TransformedBase,
            taxonomy: LayerTaxonomy::diffusion_stages(),
        }
    }

    /// Lab variant: one control per layer for exploratory sweeps.
    #[must_use]
    pub fn lab(mode: Mode) -> Self {
        Self {
            classifier: KeyClassifier::diffusion(),
            transform: ValueTransform::new(mode, SoftCurve::DiffusionLinear),
            composition: BaseComposition::RawBaseInReal,
            taxonomy: LayerTaxonomy::per_layer(30),
        }
    }

    /// The taxonomy this variant exposes (slider names and ranges).
    #[must_use]
    pub fn taxonomy(&self) -> &LayerTaxonomy {
        &self.taxonomy
    }
}

/// Non-destructive, patch-based tuner for text encoders.
#[derive(Debug, Clone)]
pub struct EncoderTuner {
    pub(crate) classifier: KeyClassifier,
    pub(crate) transform: ValueTransform,
    pub(crate) composition: BaseComposition,
    pub(crate) taxonomy: LayerTaxonomy,
}

impl EncoderTuner {
    fn with_taxonomy(mode: Mode, taxonomy: LayerTaxonomy) -> Self {
        Self {
            classifier: KeyClassifier::text_encoder(),
            transform: ValueTransform::new(mode, SoftCurve::TextEncoder),
            composition: BaseComposition::TransformedBase,
            taxonomy,
        }
    }

    /// 36 layers in 6 semantic zones.
    #[must_use]
    pub fn zones(mode: Mode) -> Self {
        Self::with_taxonomy(mode, LayerTaxonomy::encoder_zones())
    }

    /// 36 layers in 4 semantic bands.
    #[must_use]
    pub fn bands(mode: Mode) -> Self {
        Self::with_taxonomy(mode, LayerTaxonomy::encoder_bands())
    }

    /// Lab variant: one control per layer, band-prefixed names.
    #[must_use]
    pub fn lab(mode: Mode) -> Self {
        Self::with_taxonomy(mode, LayerTaxonomy::encoder_lab())
    }

    /// The taxonomy this variant exposes (slider names and ranges).
    #[must_use]
    pub fn taxonomy(&self) -> &LayerTaxonomy {
        &self.taxonomy
    }
}
