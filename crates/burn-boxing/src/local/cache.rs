use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::OpDescriptor;
use crate::layout::Placement;

/// Structural parameters that determine an eager boxing operator.
///
/// Two keys compare equal exactly when the operators they describe behave identically.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DescriptorKey {
    /// Operator type.
    pub op_type: &'static str,
    /// Placement the operator reads from.
    pub in_placement: Placement,
    /// Placement the operator writes to.
    pub out_placement: Placement,
    /// Split axis of the input, if split.
    pub in_split_axis: Option<usize>,
    /// Split axis of the output, if split.
    pub out_split_axis: Option<usize>,
    /// Logical shape of the tensor.
    pub shape: Vec<usize>,
}

/// Process-wide cache of operator descriptors, keyed by value.
///
/// Exactly one descriptor is built per key, even when several threads race on the first use;
/// every caller observes that same instance.
#[derive(Default)]
pub struct DescriptorCache {
    descriptors: DashMap<DescriptorKey, Arc<OpDescriptor>>,
    builds: AtomicUsize,
}

impl DescriptorCache {
    /// Returns the descriptor cached for `key`, building it with `build` on first use.
    pub fn get_or_build<F>(&self, key: DescriptorKey, build: F) -> Arc<OpDescriptor>
    where
        F: FnOnce(&DescriptorKey) -> OpDescriptor,
    {
        if let Some(descriptor) = self.descriptors.get(&key) {
            return descriptor.value().clone();
        }

        // The vacant entry keeps its shard locked until the descriptor is inserted.
        match self.descriptors.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                log::trace!("Building `{}` descriptor", entry.key().op_type);
                let descriptor = Arc::new(build(entry.key()));
                self.builds.fetch_add(1, Ordering::Relaxed);
                entry.insert(descriptor).value().clone()
            }
        }
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no descriptor is cached.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Number of descriptors built since creation.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}
