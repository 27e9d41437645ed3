// SPDX-License-Identifier: MIT OR Apache-2.0

//! Destructive tuning pass for diffusion backbones.

use tracing::{info, warn};

use crate::backup::BackupStore;
use crate::error::Result;
use crate::keys::{ComponentKind, KeyClass};
use crate::model::{BackboneHandle, ContainerKind};
use crate::scale::{is_identity, ScaleMapBuilder};
use crate::tune::{DiffusionTuner, TuneOptions, TuneReport};

impl DiffusionTuner {
    /// Apply `opts` to `model` in place.
    ///
    /// The pass is restore-before-apply: the store's pristine snapshot
    /// (captured on first contact with this model) is written back
    /// before the new scales go on, so repeated runs with changed
    /// sliders never compound.
    ///
    /// An unrecognized layer-container structure is a soft failure:
    /// the model is left untouched and the report carries a diagnostic
    /// instead of an error, since the host keeps the handle usable.
    ///
    /// # Errors
    ///
    /// Returns a tensor error if a scale multiplication fails.
    pub fn tune(
        &self,
        model: &mut BackboneHandle,
        store: &mut BackupStore,
        opts: &TuneOptions,
    ) -> Result<TuneReport> {
        let Some(container) = ContainerKind::probe(model.keys()) else {
            let diagnostic = format!(
                "no known layer container (layers/joint_blocks/blocks) among {} tensors",
                model.len()
            );
            warn!(model = %model.id(), "{diagnostic}");
            return Ok(TuneReport::soft_failure(self.transform.mode, diagnostic));
        };

        let classifier = &self.classifier;
        store.ensure_snapshot(model, |key| {
            classifier.is_param(key) && classifier.classify(key) != KeyClass::Other
        });
        store.restore(model);

        let builder = ScaleMapBuilder::new(&self.taxonomy, self.transform, self.composition)
            .base(opts.base)
            .values(opts.values.iter().map(|(n, v)| (n.clone(), *v)));
        let map = builder.build();
        let last_scale = self
            .taxonomy
            .last_group()
            .map_or(1.0, |group| map.get(group.range.start));

        let attention = self.transform.apply(opts.attention);
        let feed_forward = self.transform.apply(opts.feed_forward);

        let mut tuned = 0usize;
        let mut skipped = 0usize;
        let keys: Vec<String> = model.keys().map(str::to_string).collect();
        for key in &keys {
            if !self.classifier.is_param(key) {
                continue;
            }
            if self.classifier.is_excluded(key, opts.tune_normalization) {
                skipped += 1;
                continue;
            }
            let scale = match self.classifier.classify(key) {
                KeyClass::Layer(index) => {
                    let mut scale = map.get(index);
                    if self.classifier.is_attention(key) {
                        scale *= attention;
                    } else if self.classifier.is_feed_forward(key) {
                        scale *= feed_forward;
                    }
                    scale
                }
                KeyClass::Component(kind) => match kind {
                    ComponentKind::Embedder => builder.compose(opts.embedder),
                    ComponentKind::Refiner => builder.compose(opts.refiner),
                    ComponentKind::NoiseRefiner => builder.compose(opts.noise_refiner),
                    ComponentKind::ContextRefiner => builder.compose(opts.context_refiner),
                    // The output head tracks the last transformer block.
                    ComponentKind::FinalLayer => last_scale,
                },
                KeyClass::Other => continue,
            };
            if is_identity(scale) {
                skipped += 1;
                continue;
            }
            if let Some(tensor) = model.tensor(key) {
                let scaled = (tensor * scale)?;
                model.set_tensor(key, scaled);
                tuned += 1;
            }
        }

        let layers: serde_json::Map<String, serde_json::Value> = map
            .iter()
            .filter(|(_, scale)| !is_identity(*scale))
            .map(|(index, scale)| (index.to_string(), serde_json::json!(scale - 1.0)))
            .collect();
        let debug = serde_json::json!({
            "mode": self.transform.mode.to_string(),
            "taxonomy": self.taxonomy.name(),
            "container": container.to_string(),
            "base": opts.base,
            "layers": layers,
        });

        info!(
            model = %model.id(),
            %container,
            tuned,
            skipped,
            "applied destructive tuning pass"
        );
        Ok(TuneReport {
            mode: self.transform.mode,
            tensors_tuned: tuned,
            tensors_skipped: skipped,
            diagnostic: None,
            debug,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::curve::Mode;
    use candle_core::{Device, Tensor};
    use std::collections::BTreeMap;

    fn backbone() -> BackboneHandle {
        let mut tensors = BTreeMap::new();
        for layer in 0..30 {
            for (module, param) in [
                ("attention.q_proj", "weight"),
                ("feed_forward.w1", "weight"),
                ("attention_norm", "weight"),
            ] {
                let key = format!("layers.{layer}.{module}.{param}");
                let t = Tensor::from_vec(vec![1.0f32, 2.0], 2, &Device::Cpu).unwrap();
                tensors.insert(key, t);
            }
        }
        tensors.insert(
            "x_embedder.proj.weight".to_string(),
            Tensor::from_vec(vec![1.0f32], 1, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "final_layer.linear.weight".to_string(),
            Tensor::from_vec(vec![1.0f32], 1, &Device::Cpu).unwrap(),
        );
        BackboneHandle::new(tensors)
    }

    fn first(model: &BackboneHandle, key: &str) -> f32 {
        model.tensor(key).unwrap().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn real_mode_scales_governed_block() {
        let tuner = DiffusionTuner::blocks(Mode::Real);
        let mut model = backbone();
        let mut store = BackupStore::new();
        let opts = TuneOptions::new().value("block_3_mid_10_14", 1.5);

        let report = tuner.tune(&mut model, &mut store, &opts).unwrap();
        assert!(report.changed());
        assert!(report.diagnostic.is_none());
        assert!((first(&model, "layers.12.attention.q_proj.weight") - 1.5).abs() < 1e-6);
        // Other blocks untouched.
        assert!((first(&model, "layers.0.attention.q_proj.weight") - 1.0).abs() < 1e-6);
        // Norm weights locked by default.
        assert!((first(&model, "layers.12.attention_norm.weight") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rerun_is_idempotent() {
        let tuner = DiffusionTuner::blocks(Mode::Real);
        let mut model = backbone();
        let mut store = BackupStore::new();
        let opts = TuneOptions::new().value("block_1_start_00_04", 2.0);

        tuner.tune(&mut model, &mut store, &opts).unwrap();
        tuner.tune(&mut model, &mut store, &opts).unwrap();
        assert!((first(&model, "layers.2.attention.q_proj.weight") - 2.0).abs() < 1e-6);
    }

    #[test]
    fn rerun_with_new_values_replaces_old_ones() {
        let tuner = DiffusionTuner::blocks(Mode::Real);
        let mut model = backbone();
        let mut store = BackupStore::new();

        let a = TuneOptions::new().value("block_1_start_00_04", 2.0);
        tuner.tune(&mut model, &mut store, &a).unwrap();

        let b = TuneOptions::new().value("block_2_early_05_09", 3.0);
        tuner.tune(&mut model, &mut store, &b).unwrap();

        // Block 1's earlier scaling must have been restored away.
        assert!((first(&model, "layers.2.attention.q_proj.weight") - 1.0).abs() < 1e-6);
        assert!((first(&model, "layers.7.attention.q_proj.weight") - 3.0).abs() < 1e-6);
    }

    #[test]
    fn near_identity_scale_is_skipped() {
        let tuner = DiffusionTuner::blocks(Mode::Real);
        let mut model = backbone();
        let mut store = BackupStore::new();
        let opts = TuneOptions::new().value("block_1_start_00_04", 1.0 + 5e-5);

        let report = tuner.tune(&mut model, &mut store, &opts).unwrap();
        assert_eq!(report.tensors_tuned, 0);
        assert!((first(&model, "layers.0.attention.q_proj.weight") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_structure_soft_fails() {
        let tuner = DiffusionTuner::blocks(Mode::Real);
        let mut tensors = BTreeMap::new();
        tensors.insert(
            "encoder.stack.0.weight".to_string(),
            Tensor::from_vec(vec![1.0f32], 1, &Device::Cpu).unwrap(),
        );
        let mut model = BackboneHandle::new(tensors);
        let mut store = BackupStore::new();
        let opts = TuneOptions::new().value("block_1_start_00_04", 2.0);

        let report = tuner.tune(&mut model, &mut store, &opts).unwrap();
        assert!(!report.changed());
        assert!(report.diagnostic.is_some());
        assert!((first(&model, "encoder.stack.0.weight") - 1.0).abs() < 1e-9);
        assert!(store.is_empty());
    }

    #[test]
    fn final_layer_tracks_last_group() {
        let tuner = DiffusionTuner::blocks(Mode::Real);
        let mut model = backbone();
        let mut store = BackupStore::new();
        let opts = TuneOptions::new().value("block_6_end_25_29", 2.0);

        tuner.tune(&mut model, &mut store, &opts).unwrap();
        assert!((first(&model, "final_layer.linear.weight") - 2.0).abs() < 1e-6);
    }

    #[test]
    fn attention_multiplier_composes_with_layer_scale() {
        let tuner = DiffusionTuner::blocks(Mode::Real);
        let mut model = backbone();
        let mut store = BackupStore::new();
        let opts = TuneOptions::new()
            .value("block_1_start_00_04", 2.0)
            .attention(1.5);

        tuner.tune(&mut model, &mut store, &opts).unwrap();
        assert!((first(&model, "layers.0.attention.q_proj.weight") - 3.0).abs() < 1e-6);
        assert!((first(&model, "layers.0.feed_forward.w1.weight") - 2.0).abs() < 1e-6);
    }

    #[test]
    fn normalization_opt_in() {
        let tuner = DiffusionTuner::blocks(Mode::Real);
        let mut model = backbone();
        let mut store = BackupStore::new();
        let opts = TuneOptions::new()
            .value("block_1_start_00_04", 2.0)
            .tune_normalization(true);

        tuner.tune(&mut model, &mut store, &opts).unwrap();
        assert!((first(&model, "layers.0.attention_norm.weight") - 2.0).abs() < 1e-6);
    }
}
