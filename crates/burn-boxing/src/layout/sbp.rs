use core::fmt;
use core::iter::Copied;
use core::ops::Range;
use core::slice;

use serde::{Deserialize, Serialize};

use crate::CheckError;

/// Describes how a logical tensor is distributed along one parallelism dimension.
///
/// This is the per-axis building block of a [`Layout`], often called an SBP signature
/// (split, broadcast, partial-sum).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisDistribution {
    /// The tensor is partitioned along the given tensor axis.
    Split(usize),
    /// Every device holds the full tensor.
    Broadcast,
    /// Every device holds a partial contribution; the logical value is their sum.
    PartialSum,
}

impl AxisDistribution {
    /// Returns the split axis, or `None` if this is not a split.
    pub fn split_axis(&self) -> Option<usize> {
        match self {
            Self::Split(axis) => Some(*axis),
            _ => None,
        }
    }

    /// Whether this distribution is a split along any axis.
    pub fn is_split(&self) -> bool {
        matches!(self, Self::Split(_))
    }
}

impl fmt::Display for AxisDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Split(axis) => write!(f, "S({axis})"),
            Self::Broadcast => f.write_str("B"),
            Self::PartialSum => f.write_str("P"),
        }
    }
}

/// Returns the axis of a split distribution.
///
/// # Panics
/// Panics if `distribution` is not a [`AxisDistribution::Split`]. Callers are expected to have
/// matched the pattern already.
pub fn axis_of_split(distribution: AxisDistribution) -> usize {
    match distribution {
        AxisDistribution::Split(axis) => axis,
        other => panic!("Expected a split distribution, got {other}"),
    }
}

/// An N-dimensional distribution: one [`AxisDistribution`] per parallelism dimension of the
/// placement hierarchy.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LayoutRecord")]
pub struct Layout {
    distributions: Vec<AxisDistribution>,
}

#[derive(Deserialize)]
struct LayoutRecord {
    distributions: Vec<AxisDistribution>,
}

impl TryFrom<LayoutRecord> for Layout {
    type Error = CheckError;

    fn try_from(record: LayoutRecord) -> Result<Self, Self::Error> {
        Self::try_new(record.distributions)
    }
}

impl Layout {
    /// Creates a layout from its per-dimension distributions.
    ///
    /// # Panics
    /// Panics if `distributions` is empty.
    pub fn new<D: Into<Vec<AxisDistribution>>>(distributions: D) -> Self {
        match Self::try_new(distributions) {
            Ok(layout) => layout,
            Err(err) => panic!("{err}"),
        }
    }

    /// Creates a layout from its per-dimension distributions, failing if there is none.
    pub fn try_new<D: Into<Vec<AxisDistribution>>>(distributions: D) -> Result<Self, CheckError> {
        let distributions = distributions.into();
        if distributions.is_empty() {
            return Err(CheckError::EmptyLayout);
        }
        Ok(Self { distributions })
    }

    /// One-dimensional layout split along `axis`.
    pub fn split(axis: usize) -> Self {
        Self::new([AxisDistribution::Split(axis)])
    }

    /// One-dimensional broadcast layout.
    pub fn broadcast() -> Self {
        Self::new([AxisDistribution::Broadcast])
    }

    /// One-dimensional partial-sum layout.
    pub fn partial_sum() -> Self {
        Self::new([AxisDistribution::PartialSum])
    }

    /// Number of parallelism dimensions.
    pub fn len(&self) -> usize {
        self.distributions.len()
    }

    /// Always false, layouts have at least one entry.
    pub fn is_empty(&self) -> bool {
        self.distributions.is_empty()
    }

    /// The distribution of parallelism dimension `dim`.
    pub fn get(&self, dim: usize) -> Option<AxisDistribution> {
        self.distributions.get(dim).copied()
    }

    /// The distribution of the first parallelism dimension.
    pub fn first(&self) -> AxisDistribution {
        self.distributions[0]
    }

    /// Iterates over the per-dimension distributions.
    pub fn iter(&self) -> Copied<slice::Iter<'_, AxisDistribution>> {
        self.distributions.iter().copied()
    }

    /// The largest split axis referenced by this layout, if any.
    pub fn max_split_axis(&self) -> Option<usize> {
        self.iter().filter_map(|d| d.split_axis()).max()
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, distribution) in self.distributions.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{distribution}")?;
        }
        f.write_str(")")
    }
}

/// True iff every entry of `layout` equals `kind`.
///
/// With `kind = Split(k)` this detects "fully split on axis k"; any other split axis fails.
pub fn is_uniform(layout: &Layout, kind: AxisDistribution) -> bool {
    layout.iter().all(|d| d == kind)
}

/// True iff every entry of `layout` is a broadcast.
pub fn is_all_broadcast(layout: &Layout) -> bool {
    is_uniform(layout, AxisDistribution::Broadcast)
}

/// True iff every entry of `layout` is a partial sum.
pub fn is_all_partial_sum(layout: &Layout) -> bool {
    is_uniform(layout, AxisDistribution::PartialSum)
}

/// Checks that every split axis of `layout` addresses a dimension of a rank-`rank` tensor.
pub fn validate_split_axes(layout: &Layout, rank: usize) -> Result<(), CheckError> {
    match layout.max_split_axis() {
        Some(axis) if axis >= rank => Err(CheckError::SplitAxisOutOfRange { axis, rank }),
        _ => Ok(()),
    }
}

/// Partitions `len` elements into `parts` contiguous ranges whose sizes differ by at most one.
///
/// The first `len % parts` ranges receive the extra element.
///
/// # Panics
/// Panics if `parts` is zero.
pub fn balanced_split(len: usize, parts: usize) -> Vec<Range<usize>> {
    assert!(parts > 0, "Cannot split into zero parts");
    let base = len / parts;
    let remainder = len % parts;
    let mut start = 0;

    (0..parts)
        .map(|i| {
            let size = base + usize::from(i < remainder);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}
