// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-tune
//!
//! Layer-addressed weight tuning for diffusion and text-encoder
//! checkpoints in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! candle-tune scales the weights of individual transformer layers (or
//! named groups of layers) to strengthen or mute what those layers
//! contribute, without retraining. It covers both mutation styles the
//! two model families need:
//!
//! - **Diffusion backbones** are tuned destructively in place, under
//!   snapshot protection ([`BackupStore`]) so repeated runs restore
//!   before re-applying and never compound.
//! - **Text encoders** are tuned non-destructively: the handle is
//!   cloned and additive [`WeightPatch`] entries are registered on the
//!   clone, applied lazily at use time and bakeable to a checkpoint via
//!   [`Exporter`].
//!
//! Layer addressing is shared vocabulary: a [`LayerTaxonomy`] partitions
//! the layer-index space into named control groups, a [`ValueTransform`]
//! compresses raw slider values toward identity (Soft mode) or passes
//! them through (Real mode), and a [`ScaleMap`] is the resulting
//! `index → multiplier` table.
//!
//! ## Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use candle_core::{Device, Tensor};
//! use candle_tune::{EncoderHandle, EncoderTuner, Mode, TuneOptions};
//!
//! # fn main() -> candle_tune::Result<()> {
//! let mut tensors = BTreeMap::new();
//! tensors.insert(
//!     "model.layers.20.self_attn.q_proj.weight".to_string(),
//!     Tensor::ones(4, candle_core::DType::F32, &Device::Cpu)?,
//! );
//! let encoder = EncoderHandle::new(tensors);
//!
//! let tuner = EncoderTuner::zones(Mode::Soft);
//! let opts = TuneOptions::new().value("Zone_4_Semantics_18_23", 1.5);
//! let (tuned, report) = tuner.tune(&encoder, &opts)?;
//! assert_eq!(report.tensors_tuned, 1);
//!
//! let weight = tuned.resolve("model.layers.20.self_attn.q_proj.weight")?;
//! assert!((weight.to_vec1::<f32>()?[0] - 1.10).abs() < 1e-6);
//! # Ok(())
//! # }
//! ```

#![deny(warnings)]
#![warn(missing_docs)]

pub mod backup;
pub mod curve;
pub mod error;
pub mod export;
pub mod keys;
pub mod loader;
pub mod model;
pub mod scale;
pub mod taxonomy;
pub mod tune;

pub use backup::BackupStore;
pub use curve::{Mode, SoftCurve, ValueTransform};
pub use error::{Result, TuneError};
pub use export::{ExportSummary, Exporter, SavePrecision};
pub use keys::{ComponentKind, KeyClass, KeyClassifier, Matcher};
pub use loader::{CheckpointLoader, WeightDType};
pub use model::{BackboneHandle, ContainerKind, EncoderHandle, ModelId, WeightPatch};
pub use scale::{
    is_identity, BaseComposition, ScaleMap, ScaleMapBuilder, IDENTITY_EPSILON,
};
pub use taxonomy::{ControlGroup, LayerTaxonomy};
pub use tune::{DiffusionTuner, EncoderTuner, TuneOptions, TuneReport};
