// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model handles: the two shapes of tuning target.
//!
//! - [`BackboneHandle`] — a directly mutable model (diffusion backbone)
//!   whose layer container is located by an explicit capability probe
//!   ([`ContainerKind::probe`]) rather than ad hoc attribute sniffing.
//!   Mutated destructively by the engine, under
//!   [`BackupStore`](crate::BackupStore) protection.
//! - [`EncoderHandle`] — a clonable handle (text encoder) whose pristine
//!   base weights are shared and whose per-clone patch registry records
//!   additive [`WeightPatch`] entries, applied lazily by the consumer.
//!
//! The engine never owns tensors; candle tensors are cheap `Arc`-backed
//! views, so snapshots and patch references hold the original storage
//! without copying it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{Result, TuneError};

// ---------------------------------------------------------------------------
// ModelId
// ---------------------------------------------------------------------------

/// Opaque, stable model identity used to key backup snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(u64);

impl ModelId {
    /// Mint a fresh identity from a process-wide counter.
    #[must_use]
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ContainerKind
// ---------------------------------------------------------------------------

/// Known layer-container naming conventions for diffusion backbones.
///
/// A handle's keys are probed once against these conventions; an
/// unknown structure is a typed not-found result, which the engine
/// turns into a soft failure (original handle returned unchanged).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// `layers.{i}.…`
    Layers,
    /// `joint_blocks.{i}.…`
    JointBlocks,
    /// `blocks.{i}.…`
    Blocks,
}

impl ContainerKind {
    /// Key prefix for this convention.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Layers => "layers.",
            Self::JointBlocks => "joint_blocks.",
            Self::Blocks => "blocks.",
        }
    }

    /// Probe a key set for a known container convention.
    ///
    /// Conventions are tried in declaration order; the first one with at
    /// least one matching key wins.
    pub fn probe<'a>(keys: impl Iterator<Item = &'a str> + Clone) -> Option<Self> {
        [Self::Layers, Self::JointBlocks, Self::Blocks]
            .into_iter()
            .find(|kind| keys.clone().any(|key| key.starts_with(kind.prefix())))
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Layers => write!(f, "layers"),
            Self::JointBlocks => write!(f, "joint_blocks"),
            Self::Blocks => write!(f, "blocks"),
        }
    }
}

// ---------------------------------------------------------------------------
// BackboneHandle
// ---------------------------------------------------------------------------

/// A directly mutable model: named tensors plus a stable identity.
///
/// Iteration order is deterministic (keys sorted), which keeps reports
/// and tests stable across runs.
#[derive(Debug, Clone)]
pub struct BackboneHandle {
    id: ModelId,
    tensors: BTreeMap<String, Tensor>,
}

impl BackboneHandle {
    /// Wrap a named-tensor state under a fresh identity.
    #[must_use]
    pub fn new(tensors: BTreeMap<String, Tensor>) -> Self {
        Self {
            id: ModelId::fresh(),
            tensors,
        }
    }

    /// Stable identity for backup keying.
    #[must_use]
    pub const fn id(&self) -> ModelId {
        self.id
    }

    /// Iterate tensor keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> + Clone {
        self.tensors.keys().map(String::as_str)
    }

    /// Number of named tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the handle holds no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Look up a tensor by key.
    #[must_use]
    pub fn tensor(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    /// Iterate `(key, tensor)` pairs in sorted key order.
    pub fn tensors(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, t)| (k.as_str(), t))
    }

    /// Replace a tensor. Used by the mutation engine and the restore
    /// phase; inserting a key the handle does not already hold is a
    /// programming error upstream and is ignored here.
    pub(crate) fn set_tensor(&mut self, key: &str, tensor: Tensor) {
        if let Some(slot) = self.tensors.get_mut(key) {
            *slot = tensor;
        }
    }
}

// ---------------------------------------------------------------------------
// WeightPatch / EncoderHandle
// ---------------------------------------------------------------------------

/// One additive weight delta: `effective += reference * strength * extra_factor`.
///
/// The tagged structure is produced at registration time so the export
/// path never has to shape-sniff nested containers.
#[derive(Debug, Clone)]
pub struct WeightPatch {
    /// Reference tensor the delta is computed from (usually the
    /// pristine weight itself).
    pub reference: Tensor,
    /// Delta strength (`final_scale - 1.0` for multiplicative tuning).
    pub strength: f64,
    /// Secondary factor applied by the consumer at use time.
    pub extra_factor: f64,
}

impl WeightPatch {
    /// Create a patch with the default extra factor of 1.0.
    #[must_use]
    pub const fn new(reference: Tensor, strength: f64) -> Self {
        Self {
            reference,
            strength,
            extra_factor: 1.0,
        }
    }
}

/// A clonable tuning target with lazy additive patches.
///
/// Clones share the pristine base weights (`Arc`) and copy the patch
/// registry, so chaining tuners accumulates patches additively while
/// the handle passed in is never mutated.
#[derive(Debug, Clone)]
pub struct EncoderHandle {
    base: Arc<BTreeMap<String, Tensor>>,
    patches: BTreeMap<String, Vec<WeightPatch>>,
}

impl EncoderHandle {
    /// Wrap a named-tensor state with an empty patch registry.
    #[must_use]
    pub fn new(tensors: BTreeMap<String, Tensor>) -> Self {
        Self {
            base: Arc::new(tensors),
            patches: BTreeMap::new(),
        }
    }

    /// Iterate base tensor keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> + Clone {
        self.base.keys().map(String::as_str)
    }

    /// Look up a pristine base tensor by key.
    #[must_use]
    pub fn base_tensor(&self, key: &str) -> Option<&Tensor> {
        self.base.get(key)
    }

    /// Append a patch for `key`. Records are append-only; resetting is
    /// the consumer's job via [`reset_patches`](Self::reset_patches).
    pub fn add_patch(&mut self, key: impl Into<String>, patch: WeightPatch) {
        self.patches.entry(key.into()).or_default().push(patch);
    }

    /// Accumulated patches for `key` (empty slice when none).
    #[must_use]
    pub fn patches(&self, key: &str) -> &[WeightPatch] {
        self.patches.get(key).map_or(&[], Vec::as_slice)
    }

    /// Total number of registered patch entries across all keys.
    #[must_use]
    pub fn patch_count(&self) -> usize {
        self.patches.values().map(Vec::len).sum()
    }

    /// Drop all accumulated patches, returning to the pristine base.
    pub fn reset_patches(&mut self) {
        self.patches.clear();
    }

    /// Compute the effective tensor for `key`:
    /// `base + Σ reference_i * strength_i * extra_factor_i`.
    ///
    /// This is the apply-at-use-time convention a host consumer follows;
    /// it is exposed here for tests and for the export reconciler.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Structure`] if `key` is unknown, or a tensor
    /// error from the accumulation math.
    pub fn resolve(&self, key: &str) -> Result<Tensor> {
        let base = self
            .base
            .get(key)
            .ok_or_else(|| TuneError::Structure(format!("unknown tensor key `{key}`")))?;
        let mut effective = base.clone();
        for patch in self.patches(key) {
            let reference = patch.reference.to_dtype(effective.dtype())?;
            let delta = (&reference * (patch.strength * patch.extra_factor))?;
            effective = (&effective + &delta)?;
        }
        Ok(effective)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
