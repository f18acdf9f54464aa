use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{ArrayD, Axis, Slice, Zip, concatenate};
use rayon::prelude::*;
use thiserror::Error;

use super::{CollectiveIssuer, ReduceOp};
use crate::layout::{Layout, PlacedLayout, balanced_split};
use crate::{BoxingError, DistributedTensor, Result, StreamKind};

/// Failures of the in-memory collective backend.
#[derive(Error, Debug)]
pub enum CollectiveFault {
    /// A device of the group cannot run collectives.
    #[error("{stream:?} cannot run `{primitive}`")]
    UnsupportedStream {
        /// Primitive being issued.
        primitive: &'static str,
        /// Offending stream.
        stream: StreamKind,
    },

    /// The input is not distributed the way the primitive consumes it.
    #[error("`{primitive}` expects a one-dimensional {expected} input, got {layout}")]
    UnexpectedLayout {
        /// Primitive being issued.
        primitive: &'static str,
        /// Expected distribution.
        expected: &'static str,
        /// Actual layout.
        layout: Layout,
    },

    /// Device buffers cannot be combined.
    #[error("`{primitive}` got incompatible buffers: {reason}")]
    Buffers {
        /// Primitive being issued.
        primitive: &'static str,
        /// What is incompatible.
        reason: alloc::string::String,
    },
}

impl From<CollectiveFault> for BoxingError {
    fn from(fault: CollectiveFault) -> Self {
        BoxingError::CollectiveExecution(Box::new(fault))
    }
}

/// Collective backend over host memory: every device buffer lives in this process and each
/// primitive computes all devices' outputs at once.
///
/// Only accelerator placements are accepted, matching a hardware collective library.
#[derive(Debug, Default)]
pub struct HostCollectives {
    issued: AtomicUsize,
}

impl HostCollectives {
    /// Number of primitives issued so far.
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }

    fn prepare<'a>(
        &self,
        primitive: &'static str,
        tensor: &'a DistributedTensor,
    ) -> Result<&'a [ArrayD<f32>]> {
        if let Some(stream) = tensor
            .placement()
            .streams()
            .find(|stream| !stream.supports_collectives())
        {
            return Err(CollectiveFault::UnsupportedStream { primitive, stream }.into());
        }
        if tensor.layout().len() != 1 {
            return Err(unexpected(primitive, "single-axis", tensor.layout()));
        }

        tensor.shards()
    }

    fn issue(&self, primitive: &'static str, tensor: &DistributedTensor) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        log::trace!("Issuing `{primitive}` over {}", tensor.placement());
    }

    fn split_axis(primitive: &'static str, layout: &Layout) -> Result<usize> {
        layout
            .first()
            .split_axis()
            .ok_or_else(|| unexpected(primitive, "split", layout))
    }
}

fn unexpected(primitive: &'static str, expected: &'static str, layout: &Layout) -> BoxingError {
    CollectiveFault::UnexpectedLayout {
        primitive,
        expected,
        layout: layout.clone(),
    }
    .into()
}

fn check_axis(primitive: &'static str, axis: usize, rank: usize) -> Result<()> {
    if axis >= rank {
        return Err(CollectiveFault::Buffers {
            primitive,
            reason: format!("axis {axis} out of range for rank {rank}"),
        }
        .into());
    }
    Ok(())
}

fn reduce(primitive: &'static str, shards: &[ArrayD<f32>], op: ReduceOp) -> Result<ArrayD<f32>> {
    let (first, rest) = shards.split_first().ok_or_else(|| CollectiveFault::Buffers {
        primitive,
        reason: "empty device group".into(),
    })?;

    let mut acc = first.clone();
    for shard in rest {
        if shard.shape() != acc.shape() {
            return Err(CollectiveFault::Buffers {
                primitive,
                reason: format!("shapes {:?} and {:?}", acc.shape(), shard.shape()),
            }
            .into());
        }
        match op {
            ReduceOp::Sum => acc += shard,
            ReduceOp::Max => Zip::from(&mut acc).and(shard).for_each(|a, &b| *a = (*a).max(b)),
        }
    }
    Ok(acc)
}

fn on_same_placement(tensor: &DistributedTensor, layout: Layout) -> Result<PlacedLayout> {
    Ok(PlacedLayout::new(tensor.placement().clone(), layout)?)
}

impl CollectiveIssuer for HostCollectives {
    fn all_reduce(&self, tensor: &DistributedTensor, op: ReduceOp) -> Result<DistributedTensor> {
        let shards = self.prepare("all_reduce", tensor)?;
        let reduced = reduce("all_reduce", shards, op)?;
        self.issue("all_reduce", tensor);

        let outputs = vec![reduced; shards.len()];
        tensor.with_shards(on_same_placement(tensor, Layout::broadcast())?, outputs)
    }

    fn reduce_scatter(
        &self,
        tensor: &DistributedTensor,
        op: ReduceOp,
        axis: usize,
    ) -> Result<DistributedTensor> {
        let shards = self.prepare("reduce_scatter", tensor)?;
        check_axis("reduce_scatter", axis, tensor.shape().len())?;
        let reduced = reduce("reduce_scatter", shards, op)?;
        self.issue("reduce_scatter", tensor);

        let outputs = balanced_split(reduced.shape()[axis], shards.len())
            .into_par_iter()
            .map(|range| reduced.slice_axis(Axis(axis), Slice::from(range)).to_owned())
            .collect();
        tensor.with_shards(on_same_placement(tensor, Layout::split(axis))?, outputs)
    }

    fn all_gather(&self, tensor: &DistributedTensor) -> Result<DistributedTensor> {
        let shards = self.prepare("all_gather", tensor)?;
        let axis = Self::split_axis("all_gather", tensor.layout())?;
        self.issue("all_gather", tensor);

        let views: Vec<_> = shards.iter().map(|shard| shard.view()).collect();
        let gathered = concatenate(Axis(axis), &views)?;
        let outputs = vec![gathered; shards.len()];
        tensor.with_shards(on_same_placement(tensor, Layout::broadcast())?, outputs)
    }

    fn all_to_all(&self, tensor: &DistributedTensor, layout: &Layout) -> Result<DistributedTensor> {
        let shards = self.prepare("all_to_all", tensor)?;
        let in_axis = Self::split_axis("all_to_all", tensor.layout())?;
        let out_axis = Self::split_axis("all_to_all", layout)?;
        check_axis("all_to_all", out_axis, tensor.shape().len())?;
        self.issue("all_to_all", tensor);

        // Peer `p` receives the `p`-th slice along the new axis from every peer, in rank order.
        let peers = shards.len();
        let outputs = (0..peers)
            .into_par_iter()
            .map(|peer| {
                let pieces: Vec<_> = shards
                    .iter()
                    .map(|shard| {
                        let range =
                            balanced_split(shard.shape()[out_axis], peers).swap_remove(peer);
                        shard.slice_axis(Axis(out_axis), Slice::from(range))
                    })
                    .collect();
                concatenate(Axis(in_axis), &pieces)
            })
            .collect::<core::result::Result<Vec<_>, _>>()?;

        tensor.with_shards(on_same_placement(tensor, Layout::split(out_axis))?, outputs)
    }
}
