// SPDX-License-Identifier: MIT OR Apache-2.0

//! Snapshot/restore protection for destructive tuning.
//!
//! A [`BackupStore`] holds one pristine snapshot per model identity,
//! captured before the first mutation and reused for every later
//! restore. Restore before re-apply keeps destructive tuning
//! idempotent: re-running with the same scales lands on the same
//! weights, not compounded ones.
//!
//! The store is single-threaded and unsynchronized; hosts that tune
//! from multiple threads must wrap it in their own lock.

use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;
use tracing::info;

use crate::model::{BackboneHandle, ModelId};

/// Pristine-weight snapshots keyed by model identity.
///
/// Snapshots hold the original tensor handles (cheap `Arc`-backed
/// views), so restore is bit-identical by construction.
#[derive(Debug, Default)]
pub struct BackupStore {
    snapshots: HashMap<ModelId, BTreeMap<String, Tensor>>,
}

impl BackupStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the governed tensors of `model` if no snapshot exists
    /// for its identity yet, and return the snapshot's tensor count.
    ///
    /// `governed` selects the keys the tuning engine may mutate; only
    /// those are captured. A second call for the same identity is a
    /// no-op that returns the existing snapshot's size.
    pub fn ensure_snapshot(
        &mut self,
        model: &BackboneHandle,
        governed: impl Fn(&str) -> bool,
    ) -> usize {
        if let Some(existing) = self.snapshots.get(&model.id()) {
            return existing.len();
        }
        let snapshot: BTreeMap<String, Tensor> = model
            .tensors()
            .filter(|(key, _)| governed(key))
            .map(|(key, tensor)| (key.to_string(), tensor.clone()))
            .collect();
        let count = snapshot.len();
        info!(model = %model.id(), tensors = count, "captured pristine snapshot");
        self.snapshots.insert(model.id(), snapshot);
        count
    }

    /// Write the snapshot for `model` back into it, returning the
    /// number of tensors restored (0 when no snapshot exists).
    pub fn restore(&self, model: &mut BackboneHandle) -> usize {
        let Some(snapshot) = self.snapshots.get(&model.id()) else {
            return 0;
        };
        for (key, tensor) in snapshot {
            model.set_tensor(key, tensor.clone());
        }
        snapshot.len()
    }

    /// Whether a snapshot exists for `id`.
    #[must_use]
    pub fn contains(&self, id: ModelId) -> bool {
        self.snapshots.contains_key(&id)
    }

    /// Number of snapshotted models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the store holds no snapshots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn handle(pairs: &[(&str, &[f32])]) -> BackboneHandle {
        let tensors = pairs
            .iter()
            .map(|(key, values)| {
                let t = Tensor::from_vec(values.to_vec(), values.len(), &Device::Cpu).unwrap();
                ((*key).to_string(), t)
            })
            .collect();
        BackboneHandle::new(tensors)
    }

    #[test]
    fn snapshot_is_taken_at_most_once() {
        let model = handle(&[("layers.0.q.weight", &[1.0]), ("norm.weight", &[1.0])]);
        let mut store = BackupStore::new();

        let first = store.ensure_snapshot(&model, |key| key.starts_with("layers."));
        assert_eq!(first, 1);
        // Second call must not re-capture, even with a wider filter.
        let second = store.ensure_snapshot(&model, |_| true);
        assert_eq!(second, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn restore_returns_pristine_values() {
        let mut model = handle(&[("layers.0.q.weight", &[2.0, 4.0])]);
        let mut store = BackupStore::new();
        store.ensure_snapshot(&model, |_| true);

        let scaled = (model.tensor("layers.0.q.weight").unwrap() * 1.5).unwrap();
        model.set_tensor("layers.0.q.weight", scaled);

        let restored = store.restore(&mut model);
        assert_eq!(restored, 1);
        let values: Vec<f32> = model
            .tensor("layers.0.q.weight")
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(values, vec![2.0, 4.0]);
    }

    #[test]
    fn restore_without_snapshot_is_a_noop() {
        let mut model = handle(&[("layers.0.q.weight", &[1.0])]);
        let store = BackupStore::new();
        assert_eq!(store.restore(&mut model), 0);
    }
}
