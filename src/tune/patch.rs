// SPDX-License-Identifier: MIT OR Apache-2.0

//! Non-destructive patch registration for text encoders.

use tracing::info;

use crate::error::Result;
use crate::model::{EncoderHandle, WeightPatch};
use crate::scale::{ScaleMapBuilder, IDENTITY_EPSILON};
use crate::tune::{EncoderTuner, TuneOptions, TuneReport};

impl EncoderTuner {
    /// Register patches for `opts` on a clone of `encoder`.
    ///
    /// The input handle is never modified; the returned clone shares
    /// the pristine base weights and carries the accumulated patch
    /// registry, so chaining tuners composes additively.
    ///
    /// Normalization and bias parameters are skipped unconditionally;
    /// scaling either in an LLM collapses its token distribution.
    ///
    /// # Errors
    ///
    /// Currently infallible in practice; the `Result` covers future
    /// tensor work in the registration path.
    pub fn tune(
        &self,
        encoder: &EncoderHandle,
        opts: &TuneOptions,
    ) -> Result<(EncoderHandle, TuneReport)> {
        let builder = ScaleMapBuilder::new(&self.taxonomy, self.transform, self.composition)
            .base(opts.base)
            .values(opts.values.iter().map(|(n, v)| (n.clone(), *v)));
        let map = builder.build();
        let base_strength = builder.compose(1.0) - 1.0;

        let mut tuned = encoder.clone();
        let mut patched = 0usize;
        let mut skipped = 0usize;
        let keys: Vec<String> = encoder.keys().map(str::to_string).collect();
        for key in keys {
            if !self.classifier.is_param(&key) {
                continue;
            }
            // No normalization opt-in on this path; norm and bias stay
            // locked regardless of the flag.
            if self.classifier.is_excluded(&key, false) {
                skipped += 1;
                continue;
            }
            let Some(index) = self.classifier.resolve(&key) else {
                continue;
            };
            let strength = map.strength(index);
            if strength.abs() <= IDENTITY_EPSILON {
                skipped += 1;
                continue;
            }
            let Some(reference) = encoder.base_tensor(&key) else {
                continue;
            };
            tuned.add_patch(&key, WeightPatch::new(reference.clone(), strength));
            patched += 1;
        }

        let layers: serde_json::Map<String, serde_json::Value> = map
            .iter()
            .filter(|(_, scale)| (scale - 1.0).abs() > IDENTITY_EPSILON)
            .map(|(index, scale)| (index.to_string(), serde_json::json!(scale - 1.0)))
            .collect();
        let debug = serde_json::json!({
            "mode": self.transform.mode.to_string(),
            "taxonomy": self.taxonomy.name(),
            "base_strength": base_strength,
            "layers": layers,
        });

        info!(
            taxonomy = self.taxonomy.name(),
            patched, skipped, "registered encoder patches"
        );
        let report = TuneReport {
            mode: self.transform.mode,
            tensors_tuned: patched,
            tensors_skipped: skipped,
            diagnostic: None,
            debug,
        };
        Ok((tuned, report))
    }
}
