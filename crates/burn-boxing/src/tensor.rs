use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use ndarray::{ArrayD, Axis, Slice, concatenate};

use crate::layout::{
    AxisDistribution, DeviceId, Layout, PlacedLayout, Placement, balanced_split,
    validate_split_axes,
};
use crate::{BoxingError, ExecutionContext, Result};

/// Identifies the logical value a tensor holds: the producing operator and its output name.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogicalBlobId {
    op_name: String,
    blob_name: String,
}

impl LogicalBlobId {
    /// Creates a blob id from the producing operator name and output name.
    pub fn new<O: Into<String>, B: Into<String>>(op_name: O, blob_name: B) -> Self {
        Self {
            op_name: op_name.into(),
            blob_name: blob_name.into(),
        }
    }

    /// Name of the producing operator.
    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    /// Name of the output.
    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }
}

impl fmt::Display for LogicalBlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.op_name, self.blob_name)
    }
}

#[derive(Clone, Debug)]
enum Storage {
    Eager(Arc<Vec<ArrayD<f32>>>),
    Lazy,
}

/// Represents a logical tensor distributed over the devices of a placement.
///
/// A `DistributedTensor` holds one local shard per device, in parallel-id order, along with the
/// [`PlacedLayout`] describing how those shards combine into the logical value. Interpreting the
/// shards under the placed layout always yields the same logical value; only the boxing
/// interpreter changes the placed layout, and always as a whole.
///
/// Lazy tensors carry the metadata without shards and cannot be redistributed eagerly.
#[derive(Clone, Debug)]
pub struct DistributedTensor {
    /// Logical value identity
    blob: LogicalBlobId,
    /// Current distribution, shared with every structurally equal placed layout
    placed: Arc<PlacedLayout>,
    /// Global shape of the tensor (across all devices)
    shape: Vec<usize>,
    /// Local shards, if materialized
    storage: Storage,
}

impl DistributedTensor {
    /// Distributes a logical value according to `placed`.
    ///
    /// Split dimensions receive balanced slices; partial-sum dimensions place the value on the
    /// first device of each group and zeros elsewhere.
    pub fn from_logical(
        blob: LogicalBlobId,
        value: ArrayD<f32>,
        placed: PlacedLayout,
    ) -> Result<Self> {
        let shape = value.shape().to_vec();
        validate_split_axes(placed.layout(), shape.len())?;

        let hierarchy = placed.placement().hierarchy();
        let mut shards = vec![value];
        for (dim, distribution) in placed.layout().iter().enumerate() {
            let parts = hierarchy[dim];
            let mut next = Vec::with_capacity(shards.len() * parts);
            for shard in &shards {
                match distribution {
                    AxisDistribution::Split(axis) => {
                        for range in balanced_split(shard.shape()[axis], parts) {
                            next.push(shard.slice_axis(Axis(axis), Slice::from(range)).to_owned());
                        }
                    }
                    AxisDistribution::Broadcast => {
                        next.extend((0..parts).map(|_| shard.clone()));
                    }
                    AxisDistribution::PartialSum => {
                        next.push(shard.clone());
                        next.extend((1..parts).map(|_| ArrayD::zeros(shard.raw_dim())));
                    }
                }
            }
            shards = next;
        }

        Ok(Self {
            blob,
            placed: placed.intern(),
            shape,
            storage: Storage::Eager(Arc::new(shards)),
        })
    }

    /// Wraps already distributed shards, one per device in parallel-id order.
    ///
    /// Fails if a shard does not have the shape `placed` assigns to its device.
    pub fn from_shards(
        blob: LogicalBlobId,
        shape: Vec<usize>,
        placed: PlacedLayout,
        shards: Vec<ArrayD<f32>>,
    ) -> Result<Self> {
        validate_split_axes(placed.layout(), shape.len())?;

        let expected = shard_shapes(&shape, &placed);
        if shards.len() != expected.len() {
            return Err(BoxingError::InvalidTensor(format!(
                "Got {} shard(s) for {} device(s) of {}",
                shards.len(),
                expected.len(),
                placed.placement()
            )));
        }
        for (parallel_id, (shard, expected)) in shards.iter().zip(&expected).enumerate() {
            if shard.shape() != expected.as_slice() {
                return Err(BoxingError::InvalidTensor(format!(
                    "Shard {parallel_id} has shape {:?}, expected {expected:?} under {placed}",
                    shard.shape()
                )));
            }
        }

        Ok(Self {
            blob,
            placed: placed.intern(),
            shape,
            storage: Storage::Eager(Arc::new(shards)),
        })
    }

    /// Creates a tensor whose shards are not materialized yet.
    pub fn lazy(blob: LogicalBlobId, shape: Vec<usize>, placed: PlacedLayout) -> Result<Self> {
        validate_split_axes(placed.layout(), shape.len())?;

        Ok(Self {
            blob,
            placed: placed.intern(),
            shape,
            storage: Storage::Lazy,
        })
    }

    /// Same logical value under a new placed layout, backed by `shards`.
    pub(crate) fn with_shards(
        &self,
        placed: PlacedLayout,
        shards: Vec<ArrayD<f32>>,
    ) -> Result<Self> {
        Self::from_shards(self.blob.clone(), self.shape.clone(), placed, shards)
    }

    /// Checks that the tensor is materialized and currently distributed as `src`.
    pub(crate) fn ensure_eager_as(&self, src: &PlacedLayout) -> Result<()> {
        if !self.is_eager() {
            return Err(BoxingError::NotEager {
                blob: self.blob.clone(),
            });
        }
        if self.placed_layout() != src {
            return Err(BoxingError::PlacementMismatch {
                expected: src.clone(),
                actual: self.placed_layout().clone(),
            });
        }
        Ok(())
    }

    /// Combines the shards back into the logical value.
    pub fn to_logical(&self) -> Result<ArrayD<f32>> {
        let hierarchy = self.placement().hierarchy();
        let mut shards = self.shards()?.to_vec();

        for (dim, distribution) in self.layout().iter().enumerate().rev() {
            shards = shards
                .chunks(hierarchy[dim])
                .map(|group| combine(group, distribution))
                .collect::<Result<Vec<_>>>()?;
        }

        match shards.pop() {
            Some(value) if shards.is_empty() => Ok(value),
            _ => Err(BoxingError::InvalidTensor(format!(
                "Shards of `{}` do not reduce to a single value",
                self.blob
            ))),
        }
    }

    /// Logical value identity.
    pub fn blob(&self) -> &LogicalBlobId {
        &self.blob
    }

    /// Current placed layout.
    pub fn placed_layout(&self) -> &PlacedLayout {
        &self.placed
    }

    /// Current placement.
    pub fn placement(&self) -> &Placement {
        self.placed.placement()
    }

    /// Current layout.
    pub fn layout(&self) -> &Layout {
        self.placed.layout()
    }

    /// Logical shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Whether the shards are materialized.
    pub fn is_eager(&self) -> bool {
        matches!(self.storage, Storage::Eager(_))
    }

    /// Local shards in parallel-id order.
    pub fn shards(&self) -> Result<&[ArrayD<f32>]> {
        match &self.storage {
            Storage::Eager(shards) => Ok(shards.as_slice()),
            Storage::Lazy => Err(BoxingError::NotEager {
                blob: self.blob.clone(),
            }),
        }
    }

    /// Shards held by devices the current process drives.
    pub fn local_shards(&self, ctx: &ExecutionContext) -> Result<Vec<(DeviceId, &ArrayD<f32>)>> {
        let devices = self.placement().devices();
        Ok(devices
            .iter()
            .zip(self.shards()?)
            .filter(|(device, _)| ctx.is_local(**device))
            .map(|(device, shard)| (*device, shard))
            .collect())
    }

    /// Whether both tensors share the same shard buffers.
    pub fn shares_storage(&self, other: &Self) -> bool {
        match (&self.storage, &other.storage) {
            (Storage::Eager(a), Storage::Eager(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Local shape of every device's shard, in parallel-id order.
pub fn shard_shapes(shape: &[usize], placed: &PlacedLayout) -> Vec<Vec<usize>> {
    let hierarchy = placed.placement().hierarchy();
    let mut shapes = vec![shape.to_vec()];

    for (dim, distribution) in placed.layout().iter().enumerate() {
        let parts = hierarchy[dim];
        shapes = shapes
            .into_iter()
            .flat_map(|local| match distribution {
                AxisDistribution::Split(axis) => balanced_split(local[axis], parts)
                    .into_iter()
                    .map(|range| {
                        let mut sliced = local.clone();
                        sliced[axis] = range.len();
                        sliced
                    })
                    .collect::<Vec<_>>(),
                AxisDistribution::Broadcast | AxisDistribution::PartialSum => vec![local; parts],
            })
            .collect();
    }

    shapes
}

fn combine(group: &[ArrayD<f32>], distribution: AxisDistribution) -> Result<ArrayD<f32>> {
    let (first, rest) = group
        .split_first()
        .ok_or_else(|| BoxingError::InvalidTensor("Empty shard group".into()))?;

    match distribution {
        AxisDistribution::Split(axis) => {
            let views: Vec<_> = group.iter().map(|shard| shard.view()).collect();
            Ok(concatenate(Axis(axis), &views)?)
        }
        AxisDistribution::Broadcast => Ok(first.clone()),
        AxisDistribution::PartialSum => {
            Ok(rest.iter().fold(first.clone(), |acc, shard| acc + shard))
        }
    }
}
