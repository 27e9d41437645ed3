// SPDX-License-Identifier: MIT OR Apache-2.0

//! Checkpoint export: bake live state and accumulated patches back
//! into a safetensors file.
//!
//! The live model's key namespace rarely matches the on-disk reference
//! checkpoint exactly (loaders strip or add wrapper prefixes), so keys
//! are reconciled by suffix after stripping the known wrapper prefixes
//! from both sides. Patch accumulation happens in f32; the precision
//! cast is the last step before serialization.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::{info, warn};

use crate::error::{Result, TuneError};
use crate::model::{BackboneHandle, EncoderHandle};

/// Wrapper prefixes stripped before suffix reconciliation, most
/// specific first.
const STRIP_PREFIXES: &[&str] = &["qwen3_4b.transformer.", "model."];

/// Metadata key stamped into every exported checkpoint.
const TUNED_BY_KEY: &str = "tuned_by";
const TUNED_BY_VALUE: &str = "candle-tune";

// ---------------------------------------------------------------------------
// SavePrecision
// ---------------------------------------------------------------------------

/// On-disk precision of an exported checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePrecision {
    /// IEEE half precision.
    #[default]
    F16,
    /// bfloat16.
    Bf16,
    /// Full single precision.
    F32,
}

impl SavePrecision {
    fn dtype(self) -> Dtype {
        match self {
            Self::F16 => Dtype::F16,
            Self::Bf16 => Dtype::BF16,
            Self::F32 => Dtype::F32,
        }
    }
}

impl fmt::Display for SavePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F16 => write!(f, "fp16"),
            Self::Bf16 => write!(f, "bf16"),
            Self::F32 => write!(f, "fp32"),
        }
    }
}

// ---------------------------------------------------------------------------
// ExportSummary
// ---------------------------------------------------------------------------

/// Result of one export run.
#[derive(Debug, Clone)]
pub struct ExportSummary {
    /// Path of the written checkpoint.
    pub path: PathBuf,
    /// Reference tensors matched to a live tensor by suffix.
    pub matched: usize,
    /// Matched tensors that had at least one patch baked in.
    pub patched: usize,
    /// Reference tensors with no live counterpart, dropped from the
    /// output. A large count usually means a namespace mismatch the
    /// prefix table does not cover.
    pub unmatched_keys: usize,
}

// ---------------------------------------------------------------------------
// Exporter
// ---------------------------------------------------------------------------

/// Writes tuned checkpoints under a category subdirectory of an output
/// root (`text_encoders/` or `diffusion_models/`).
#[derive(Debug, Clone)]
pub struct Exporter {
    dir: PathBuf,
}

impl Exporter {
    /// Exporter writing under `<root>/text_encoders/`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn text_encoders(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_subdir(root.as_ref(), "text_encoders")
    }

    /// Exporter writing under `<root>/diffusion_models/`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn diffusion_models(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_subdir(root.as_ref(), "diffusion_models")
    }

    fn with_subdir(root: &Path, subdir: &str) -> Result<Self> {
        let dir = root.join(subdir);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory exports are written into.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bake `encoder`'s patches onto the `reference` checkpoint and
    /// write the result as `<dir>/<name>.safetensors`.
    ///
    /// Only reference tensors with a live counterpart are written, with
    /// their patches applied at the requested precision; unmatched
    /// reference keys are dropped (counted in the summary and logged).
    /// The reference file's own metadata is carried over, plus a
    /// `tuned_by` stamp.
    ///
    /// # Errors
    ///
    /// Fails if the reference cannot be read or parsed, on tensor math
    /// errors, or if the output cannot be written.
    pub fn export(
        &self,
        reference: &Path,
        encoder: &EncoderHandle,
        precision: SavePrecision,
        name: &str,
    ) -> Result<ExportSummary> {
        if !reference.is_file() {
            return Err(TuneError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("reference checkpoint not found: {}", reference.display()),
            )));
        }
        let bytes = fs::read(reference)?;
        let (_, header) = SafeTensors::read_metadata(&bytes)
            .map_err(|e| TuneError::Export(format!("unreadable reference header: {e}")))?;
        let mut metadata = header.metadata().clone().unwrap_or_default();
        metadata.insert(TUNED_BY_KEY.to_string(), TUNED_BY_VALUE.to_string());

        let reference_tensors = candle_core::safetensors::load(reference, &Device::Cpu)?;

        // Live keys indexed by wrapper-stripped suffix.
        let live_by_suffix: HashMap<&str, &str> = encoder
            .keys()
            .map(|key| (strip_wrapper(key), key))
            .collect();

        let mut matched = 0usize;
        let mut patched = 0usize;
        let mut unmatched = 0usize;
        let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        for (ref_key, ref_tensor) in &reference_tensors {
            let Some(live_key) = live_by_suffix.get(strip_wrapper(ref_key)) else {
                unmatched += 1;
                warn!(key = ref_key, "no live tensor for reference key, dropping");
                continue;
            };
            matched += 1;
            let patches = encoder.patches(live_key);
            if !patches.is_empty() {
                patched += 1;
            }
            let mut acc = ref_tensor.to_dtype(DType::F32)?;
            for patch in patches {
                let delta = align_reference(&patch.reference, &acc)?;
                let delta = (&delta * (patch.strength * patch.extra_factor))?;
                acc = (&acc + &delta)?;
            }
            let shape = acc.dims().to_vec();
            entries.push((ref_key.clone(), shape, encode(&acc, precision)?));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let path = self.write(&entries, precision, &metadata, name)?;
        info!(
            path = %path.display(),
            %precision,
            matched,
            patched,
            unmatched,
            "exported tuned checkpoint"
        );
        Ok(ExportSummary {
            path,
            matched,
            patched,
            unmatched_keys: unmatched,
        })
    }

    /// Write a backbone's live tensors as `<dir>/<name>.safetensors`.
    ///
    /// Destructive tuning already baked its scales into the handle, so
    /// this is a straight precision-cast dump with the `tuned_by` stamp.
    ///
    /// # Errors
    ///
    /// Fails on tensor conversion errors or if the output cannot be
    /// written.
    pub fn export_backbone(
        &self,
        model: &BackboneHandle,
        precision: SavePrecision,
        name: &str,
    ) -> Result<ExportSummary> {
        let mut metadata = HashMap::new();
        metadata.insert(TUNED_BY_KEY.to_string(), TUNED_BY_VALUE.to_string());

        let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        for (key, tensor) in model.tensors() {
            let tensor = tensor.to_dtype(DType::F32)?;
            entries.push((key.to_string(), tensor.dims().to_vec(), encode(&tensor, precision)?));
        }

        let path = self.write(&entries, precision, &metadata, name)?;
        info!(path = %path.display(), %precision, tensors = entries.len(), "exported backbone");
        Ok(ExportSummary {
            path,
            matched: entries.len(),
            patched: 0,
            unmatched_keys: 0,
        })
    }

    fn write(
        &self,
        entries: &[(String, Vec<usize>, Vec<u8>)],
        precision: SavePrecision,
        metadata: &HashMap<String, String>,
        name: &str,
    ) -> Result<PathBuf> {
        let path = self.dir.join(format!("{name}.safetensors"));
        let views = entries
            .iter()
            .map(|(key, shape, bytes)| {
                TensorView::new(precision.dtype(), shape.clone(), bytes)
                    .map(|view| (key.as_str(), view))
                    .map_err(|e| TuneError::Export(format!("tensor view for `{key}`: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        safetensors::serialize_to_file(views, &Some(metadata.clone()), &path)
            .map_err(|e| TuneError::Export(format!("writing {}: {e}", path.display())))?;
        Ok(path)
    }
}

/// Strip the first matching wrapper prefix.
fn strip_wrapper(key: &str) -> &str {
    for prefix in STRIP_PREFIXES {
        if let Some(stripped) = key.strip_prefix(prefix) {
            return stripped;
        }
    }
    key
}

/// Bring a patch reference into the accumulator's dtype and shape.
/// Loaders occasionally reshape fused projections; a total-element
/// match is accepted via reshape, anything else passes through and
/// fails loudly in the add.
fn align_reference(reference: &Tensor, acc: &Tensor) -> Result<Tensor> {
    let reference = reference.to_dtype(acc.dtype())?;
    if reference.dims() != acc.dims() && reference.elem_count() == acc.elem_count() {
        return Ok(reference.reshape(acc.dims())?);
    }
    Ok(reference)
}

/// Flatten to f32 and encode at the target precision, little-endian.
fn encode(tensor: &Tensor, precision: SavePrecision) -> Result<Vec<u8>> {
    let values: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
    let bytes = match precision {
        SavePrecision::F16 => values
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect(),
        SavePrecision::Bf16 => values
            .iter()
            .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
            .collect(),
        SavePrecision::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    };
    Ok(bytes)
}
