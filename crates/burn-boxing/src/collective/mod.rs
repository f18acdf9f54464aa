//! Transitions performed by a single hardware collective over a shared placement.
//!
//! | Rule | Source | Destination | Primitive |
//! |---|---|---|---|
//! | `nccl-p-to-b` | `P` | `B` | all-reduce (sum) |
//! | `nccl-p-to-s` | `P` | `S(k)` | reduce-scatter (sum) |
//! | `nccl-s-to-b` | `S(k)` | `B` | all-gather |
//! | `nccl-s-to-s` | `S(i)` | `S(j)`, `i != j` | all-to-all |
//!
//! All rules require one parallelism dimension, equal placements and devices with collective
//! support. Every precondition is checked before the primitive is issued.

mod host;

pub use host::*;

use strum::Display;

use crate::layout::{Layout, PlacedLayout, axis_of_split, is_all_broadcast, is_all_partial_sum};
use crate::{BoxingContext, CheckError, DistributedTensor, Result, RuleRegistry};

/// Reduction applied by all-reduce and reduce-scatter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReduceOp {
    /// Elementwise sum.
    Sum,
    /// Elementwise maximum.
    Max,
}

/// Issues collective primitives over the device group of a tensor's placement.
///
/// Each call returns a new tensor on the same placement. Calls on the same tensor must not
/// overlap; calls on disjoint tensors may run concurrently.
pub trait CollectiveIssuer: Send + Sync {
    /// Reduces every device's buffer and leaves the result on every device (`B`).
    fn all_reduce(&self, tensor: &DistributedTensor, op: ReduceOp) -> Result<DistributedTensor>;

    /// Reduces every device's buffer and partitions the result along `axis` (`S(axis)`).
    fn reduce_scatter(
        &self,
        tensor: &DistributedTensor,
        op: ReduceOp,
        axis: usize,
    ) -> Result<DistributedTensor>;

    /// Concatenates split shards and replicates the result (`B`).
    fn all_gather(&self, tensor: &DistributedTensor) -> Result<DistributedTensor>;

    /// Exchanges data so the split moves to the axis of `layout`.
    fn all_to_all(&self, tensor: &DistributedTensor, layout: &Layout) -> Result<DistributedTensor>;
}

pub(crate) fn register_rules(registry: &mut RuleRegistry) {
    registry
        .register("nccl-p-to-b", check_p_to_b, p_to_b)
        .register("nccl-p-to-s", check_p_to_s, p_to_s)
        .register("nccl-s-to-b", check_s_to_b, s_to_b)
        .register("nccl-s-to-s", check_s_to_s, s_to_s);
}

type Check = core::result::Result<(), CheckError>;

pub(crate) fn check_single_axis(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    for layout in [src.layout(), dst.layout()] {
        if layout.len() != 1 {
            return Err(CheckError::RankMismatch {
                expected: 1,
                actual: layout.len(),
            });
        }
    }
    Ok(())
}

fn check_collective_placement(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    if src.placement() != dst.placement() {
        return Err(CheckError::PlacementMismatch {
            src: src.placement().clone(),
            dst: dst.placement().clone(),
        });
    }
    if !src.placement().supports_collectives() {
        return Err(CheckError::NoCollectiveSupport {
            kind: src.placement().kind(),
        });
    }
    Ok(())
}

pub(crate) fn require_src(ok: bool, expected: &'static str, src: &PlacedLayout) -> Check {
    match ok {
        true => Ok(()),
        false => Err(CheckError::SourcePattern {
            expected,
            layout: src.layout().clone(),
        }),
    }
}

pub(crate) fn require_dst(ok: bool, expected: &'static str, dst: &PlacedLayout) -> Check {
    match ok {
        true => Ok(()),
        false => Err(CheckError::DestinationPattern {
            expected,
            layout: dst.layout().clone(),
        }),
    }
}

/// Both sides split, along different axes.
pub(crate) fn check_split_axes_differ(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    require_src(src.layout().first().is_split(), "split", src)?;
    require_dst(dst.layout().first().is_split(), "split", dst)?;

    let axis = axis_of_split(src.layout().first());
    if axis == axis_of_split(dst.layout().first()) {
        return Err(CheckError::SameSplitAxis { axis });
    }
    Ok(())
}

fn check_p_to_b(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    check_single_axis(src, dst)?;
    require_src(is_all_partial_sum(src.layout()), "partial-sum", src)?;
    require_dst(is_all_broadcast(dst.layout()), "broadcast", dst)?;
    check_collective_placement(src, dst)
}

fn check_p_to_s(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    check_single_axis(src, dst)?;
    require_src(is_all_partial_sum(src.layout()), "partial-sum", src)?;
    require_dst(dst.layout().first().is_split(), "split", dst)?;
    check_collective_placement(src, dst)
}

fn check_s_to_b(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    check_single_axis(src, dst)?;
    require_src(src.layout().first().is_split(), "split", src)?;
    require_dst(is_all_broadcast(dst.layout()), "broadcast", dst)?;
    check_collective_placement(src, dst)
}

fn check_s_to_s(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    check_single_axis(src, dst)?;
    check_split_axes_differ(src, dst)?;
    check_collective_placement(src, dst)
}

fn p_to_b(
    ctx: &BoxingContext,
    tensor: &DistributedTensor,
    src: &PlacedLayout,
    _dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    tensor.ensure_eager_as(src)?;
    ctx.collectives().all_reduce(tensor, ReduceOp::Sum)
}

fn p_to_s(
    ctx: &BoxingContext,
    tensor: &DistributedTensor,
    src: &PlacedLayout,
    dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    tensor.ensure_eager_as(src)?;
    let axis = axis_of_split(dst.layout().first());
    ctx.collectives().reduce_scatter(tensor, ReduceOp::Sum, axis)
}

fn s_to_b(
    ctx: &BoxingContext,
    tensor: &DistributedTensor,
    src: &PlacedLayout,
    _dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    tensor.ensure_eager_as(src)?;
    ctx.collectives().all_gather(tensor)
}

fn s_to_s(
    ctx: &BoxingContext,
    tensor: &DistributedTensor,
    src: &PlacedLayout,
    dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    tensor.ensure_eager_as(src)?;
    ctx.collectives().all_to_all(tensor, dst.layout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{AxisDistribution, DeviceId, DeviceKind, Placement, PlacementBuilder};
    use rstest::rstest;

    fn on(placement: &Placement, layout: Layout) -> PlacedLayout {
        PlacedLayout::new(placement.clone(), layout).unwrap()
    }

    #[rstest]
    #[case(Layout::partial_sum(), Layout::broadcast(), check_p_to_b)]
    #[case(Layout::partial_sum(), Layout::split(1), check_p_to_s)]
    #[case(Layout::split(1), Layout::broadcast(), check_s_to_b)]
    #[case(Layout::split(0), Layout::split(1), check_s_to_s)]
    fn test_accepts_same_accelerator_placement(
        #[case] src: Layout,
        #[case] dst: Layout,
        #[case] check: fn(&PlacedLayout, &PlacedLayout) -> Check,
    ) {
        let placement = Placement::accelerators(0, 0..4);

        assert_eq!(check(&on(&placement, src), &on(&placement, dst)), Ok(()));
    }

    #[rstest]
    #[case(Layout::partial_sum(), Layout::broadcast(), check_p_to_b)]
    #[case(Layout::split(0), Layout::split(1), check_s_to_s)]
    fn test_rejects_host_devices(
        #[case] src: Layout,
        #[case] dst: Layout,
        #[case] check: fn(&PlacedLayout, &PlacedLayout) -> Check,
    ) {
        let placement = Placement::hosts(0, 0..4);

        assert_eq!(
            check(&on(&placement, src), &on(&placement, dst)),
            Err(CheckError::NoCollectiveSupport { kind: DeviceKind::Host })
        );
    }

    #[test]
    fn test_rejects_different_placements() {
        let src = on(&Placement::accelerators(0, 0..4), Layout::partial_sum());
        let dst = on(&Placement::accelerators(0, 4..8), Layout::broadcast());

        assert!(matches!(check_p_to_b(&src, &dst), Err(CheckError::PlacementMismatch { .. })));
    }

    #[test]
    fn test_rejects_same_split_axis() {
        let placement = Placement::accelerators(0, 0..4);

        assert_eq!(
            check_s_to_s(&on(&placement, Layout::split(0)), &on(&placement, Layout::split(0))),
            Err(CheckError::SameSplitAxis { axis: 0 })
        );
    }

    #[test]
    fn test_rejects_multi_dimensional_layouts() {
        let devices = (0..4).map(|i| DeviceId::new(0, i)).collect();
        let placement = PlacementBuilder::new(DeviceKind::Accelerator, devices)
            .with_hierarchy([2, 2])
            .build()
            .unwrap();
        let partial = Layout::new([AxisDistribution::PartialSum; 2]);
        let broadcast = Layout::new([AxisDistribution::Broadcast; 2]);

        assert_eq!(
            check_p_to_b(&on(&placement, partial), &on(&placement, broadcast)),
            Err(CheckError::RankMismatch { expected: 1, actual: 2 })
        );
    }

    #[test]
    fn test_rejects_wrong_patterns() {
        let placement = Placement::accelerators(0, 0..2);

        assert!(matches!(
            check_p_to_b(
                &on(&placement, Layout::broadcast()),
                &on(&placement, Layout::broadcast())
            ),
            Err(CheckError::SourcePattern { .. })
        ));
        assert!(matches!(
            check_s_to_b(&on(&placement, Layout::split(0)), &on(&placement, Layout::partial_sum())),
            Err(CheckError::DestinationPattern { .. })
        ));
    }
}
