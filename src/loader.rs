// SPDX-License-Identifier: MIT OR Apache-2.0

//! Checkpoint loading for tuning targets.

use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::error::Result;
use crate::model::BackboneHandle;

/// Requested in-memory precision of loaded weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightDType {
    /// Keep whatever the checkpoint stores.
    #[default]
    Default,
    /// Cast everything to f16.
    F16,
    /// Cast everything to bf16.
    Bf16,
}

impl fmt::Display for WeightDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::F16 => write!(f, "fp16"),
            Self::Bf16 => write!(f, "bf16"),
        }
    }
}

/// Loads diffusion backbones from safetensors checkpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointLoader;

impl CheckpointLoader {
    /// Load a checkpoint into a fresh [`BackboneHandle`].
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed, or if a dtype cast
    /// fails.
    pub fn load(path: impl AsRef<Path>, dtype: WeightDType) -> Result<BackboneHandle> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let tensors = tensors
            .into_iter()
            .map(|(key, tensor)| Ok((key, Self::cast(tensor, dtype)?)))
            .collect::<Result<_>>()?;
        let handle = BackboneHandle::new(tensors);
        info!(
            path = %path.display(),
            %dtype,
            tensors = handle.len(),
            "loaded checkpoint"
        );
        Ok(handle)
    }

    fn cast(tensor: Tensor, dtype: WeightDType) -> Result<Tensor> {
        Ok(match dtype {
            WeightDType::Default => tensor,
            WeightDType::F16 => tensor.to_dtype(DType::F16)?,
            WeightDType::Bf16 => tensor.to_dtype(DType::BF16)?,
        })
    }

    /// Cache-bypass token for host integrations that cache on input
    /// equality: `NaN` never compares equal to itself, so every
    /// evaluation reloads from disk. Tuning mutates loaded weights in
    /// place, and a cached mutated handle would silently become the
    /// next run's "pristine" state.
    #[must_use]
    pub fn is_changed() -> f64 {
        f64::NAN
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn change_token_defeats_equality_caching() {
        let token = CheckpointLoader::is_changed();
        assert!(token.is_nan());
        #[allow(clippy::eq_op)]
        {
            assert!(token != token);
        }
    }
}
