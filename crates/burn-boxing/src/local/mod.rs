//! Transitions performed by one eager boxing operator.
//!
//! These rules handle single-axis layouts whose placements differ in device count or topology,
//! or whose devices have no collective support. Each builds an operator descriptor keyed by the
//! parameters that determine its behavior, reuses it through the [`DescriptorCache`], and hands
//! it to the [`OpDispatcher`].

mod cache;
mod dispatch;
mod op;

pub use cache::*;
pub use dispatch::*;
pub use op::*;

use crate::collective::{check_single_axis, check_split_axes_differ, require_dst, require_src};
use crate::layout::{PlacedLayout, is_all_broadcast, is_all_partial_sum};
use crate::{BoxingContext, BoxingError, CheckError, DistributedTensor, Result, RuleRegistry};

pub(crate) fn register_rules(registry: &mut RuleRegistry) {
    registry
        .register("eager-p-to-b", check_p_to_b, p_to_b)
        .register("eager-p-to-s", check_p_to_s, p_to_s)
        .register("eager-s-to-b", check_s_to_b, s_to_b)
        .register("eager-b-to-s", check_b_to_s, b_to_s)
        .register("eager-naive-s-to-s", check_naive_s_to_s, naive_s_to_s);
}

type Check = core::result::Result<(), CheckError>;

fn check_device_kinds(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    let (src_kind, dst_kind) = (src.placement().kind(), dst.placement().kind());
    if src_kind != dst_kind {
        return Err(CheckError::DeviceKindMismatch {
            src: src_kind,
            dst: dst_kind,
        });
    }
    Ok(())
}

fn check_p_to_b(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    check_single_axis(src, dst)?;
    require_src(is_all_partial_sum(src.layout()), "partial-sum", src)?;
    require_dst(is_all_broadcast(dst.layout()), "broadcast", dst)?;
    check_device_kinds(src, dst)
}

fn check_p_to_s(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    check_single_axis(src, dst)?;
    require_src(is_all_partial_sum(src.layout()), "partial-sum", src)?;
    require_dst(dst.layout().first().is_split(), "split", dst)?;
    check_device_kinds(src, dst)
}

fn check_s_to_b(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    check_single_axis(src, dst)?;
    require_src(src.layout().first().is_split(), "split", src)?;
    require_dst(is_all_broadcast(dst.layout()), "broadcast", dst)?;
    check_device_kinds(src, dst)
}

fn check_b_to_s(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    check_single_axis(src, dst)?;
    require_src(is_all_broadcast(src.layout()), "broadcast", src)?;
    require_dst(dst.layout().first().is_split(), "split", dst)?;
    check_device_kinds(src, dst)
}

fn check_naive_s_to_s(src: &PlacedLayout, dst: &PlacedLayout) -> Check {
    check_single_axis(src, dst)?;
    check_split_axes_differ(src, dst)?;
    check_device_kinds(src, dst)
}

fn describe(key: &DescriptorKey) -> OpDescriptor {
    let mut builder = OpBuilder::new(key.op_type, unique_name(key.op_type))
        .input("in")
        .output("out");
    if let Some(axis) = key.in_split_axis {
        builder = builder.attr("in_split_axis", axis);
    }
    if let Some(axis) = key.out_split_axis {
        builder = builder.attr("out_split_axis", axis);
    }

    builder
        .attr("in_placement", key.in_placement.clone())
        .attr("out_placement", key.out_placement.clone())
        .attr("shape", key.shape.clone())
        .build()
}

fn run(
    op_type: &'static str,
    ctx: &BoxingContext,
    tensor: &DistributedTensor,
    src: &PlacedLayout,
    dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    tensor.ensure_eager_as(src)?;

    let key = DescriptorKey {
        op_type,
        in_placement: src.placement().clone(),
        out_placement: dst.placement().clone(),
        in_split_axis: src.layout().first().split_axis(),
        out_split_axis: dst.layout().first().split_axis(),
        shape: tensor.shape().to_vec(),
    };
    let op = ctx.descriptors().get_or_build(key, describe);

    let mut outputs = ctx.ops().dispatch(&op, &[tensor])?;
    match (outputs.pop(), outputs.is_empty()) {
        (Some(output), true) => Ok(output),
        _ => Err(BoxingError::OpDispatch {
            op: op.name().into(),
            reason: "expected exactly one output".into(),
        }),
    }
}

fn p_to_b(
    ctx: &BoxingContext,
    t: &DistributedTensor,
    src: &PlacedLayout,
    dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    run("eager_p_to_b", ctx, t, src, dst)
}

fn p_to_s(
    ctx: &BoxingContext,
    t: &DistributedTensor,
    src: &PlacedLayout,
    dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    run("eager_p_to_s", ctx, t, src, dst)
}

fn s_to_b(
    ctx: &BoxingContext,
    t: &DistributedTensor,
    src: &PlacedLayout,
    dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    run("eager_s_to_b", ctx, t, src, dst)
}

fn b_to_s(
    ctx: &BoxingContext,
    t: &DistributedTensor,
    src: &PlacedLayout,
    dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    run("eager_b_to_s", ctx, t, src, dst)
}

fn naive_s_to_s(
    ctx: &BoxingContext,
    t: &DistributedTensor,
    src: &PlacedLayout,
    dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    run("eager_naive_s_to_s", ctx, t, src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{DeviceKind, Layout, Placement};
    use crate::{ExecutionContext, LogicalBlobId};
    use ndarray::{ArrayD, IxDyn};

    fn arange(shape: &[usize]) -> ArrayD<f32> {
        let len = shape.iter().product::<usize>();
        ArrayD::from_shape_vec(IxDyn(shape), (0..len).map(|v| v as f32).collect()).unwrap()
    }

    fn on(placement: Placement, layout: Layout) -> PlacedLayout {
        PlacedLayout::new(placement, layout).unwrap()
    }

    fn eager(value: ArrayD<f32>, placed: &PlacedLayout) -> DistributedTensor {
        DistributedTensor::from_logical(LogicalBlobId::new("op", "out"), value, placed.clone())
            .unwrap()
    }

    #[test]
    fn test_checkers_accept_differing_placements() {
        let four = Placement::accelerators(0, 0..4);
        let two = Placement::accelerators(1, 0..2);

        let split = on(four.clone(), Layout::split(0));
        let broadcast = on(four.clone(), Layout::broadcast());
        let partial = on(four, Layout::partial_sum());

        assert_eq!(check_s_to_b(&split, &on(two.clone(), Layout::broadcast())), Ok(()));
        assert_eq!(check_b_to_s(&broadcast, &on(two.clone(), Layout::split(1))), Ok(()));
        assert_eq!(check_p_to_s(&partial, &on(two.clone(), Layout::split(0))), Ok(()));
        assert_eq!(check_naive_s_to_s(&split, &on(two, Layout::split(1))), Ok(()));
    }

    #[test]
    fn test_naive_s_to_s_rejects_same_axis() {
        let src = on(Placement::accelerators(0, 0..4), Layout::split(0));
        let dst = on(Placement::accelerators(0, 0..6), Layout::split(0));

        assert_eq!(check_naive_s_to_s(&src, &dst), Err(CheckError::SameSplitAxis { axis: 0 }));
    }

    #[test]
    fn test_device_kinds_must_match() {
        let src = on(Placement::hosts(0, 0..2), Layout::partial_sum());
        let dst = on(Placement::accelerators(0, 0..2), Layout::broadcast());

        assert_eq!(
            check_p_to_b(&src, &dst),
            Err(CheckError::DeviceKindMismatch {
                src: DeviceKind::Host,
                dst: DeviceKind::Accelerator
            })
        );
    }

    #[test]
    fn test_s_to_b_moves_to_fewer_devices() {
        let ctx = BoxingContext::host(ExecutionContext::single_process());
        let src = on(Placement::accelerators(0, 0..4), Layout::split(0));
        let dst = on(Placement::accelerators(0, 4..6), Layout::broadcast());
        let tensor = eager(arange(&[6, 2]), &src);

        let output = s_to_b(&ctx, &tensor, &src, &dst).unwrap();

        assert_eq!(output.placed_layout(), &dst);
        assert_eq!(output.shards().unwrap()[1], arange(&[6, 2]));
    }

    #[test]
    fn test_descriptors_are_reused_across_calls() {
        let ctx = BoxingContext::host(ExecutionContext::single_process());
        let src = on(Placement::hosts(0, 0..2), Layout::partial_sum());
        let dst = on(Placement::hosts(0, 0..3), Layout::split(1));

        let first = eager(arange(&[2, 3]), &src);
        let second = eager(arange(&[2, 3]) * 2.0, &src);
        let other_shape = eager(arange(&[2, 6]), &src);

        p_to_s(&ctx, &first, &src, &dst).unwrap();
        p_to_s(&ctx, &second, &src, &dst).unwrap();
        assert_eq!(ctx.descriptors().builds(), 1);

        let output = p_to_s(&ctx, &other_shape, &src, &dst).unwrap();
        assert_eq!(ctx.descriptors().builds(), 2);
        assert_eq!(output.to_logical().unwrap(), arange(&[2, 6]));
    }

    #[test]
    fn test_descriptors_differ_per_axis_and_placement() {
        let ctx = BoxingContext::host(ExecutionContext::single_process());
        let src = on(Placement::hosts(0, 0..2), Layout::split(0));
        let tensor = eager(arange(&[4, 4]), &src);
        let split_one = on(Placement::hosts(0, 0..3), Layout::split(1));
        let broadcast = on(Placement::hosts(0, 0..3), Layout::broadcast());
        let remote = on(Placement::hosts(1, 0..3), Layout::broadcast());

        naive_s_to_s(&ctx, &tensor, &src, &split_one).unwrap();
        s_to_b(&ctx, &tensor, &src, &broadcast).unwrap();
        s_to_b(&ctx, &tensor, &src, &remote).unwrap();
        s_to_b(&ctx, &tensor, &src, &broadcast).unwrap();

        let columns = on(Placement::hosts(0, 0..2), Layout::split(1));
        let moved = eager(arange(&[4, 4]), &columns);
        s_to_b(&ctx, &moved, &columns, &broadcast).unwrap();

        assert_eq!(ctx.descriptors().builds(), 4);
        assert_eq!(ctx.descriptors().len(), 4);
    }

    #[test]
    fn test_descriptor_attributes() {
        let key = DescriptorKey {
            op_type: "eager_naive_s_to_s",
            in_placement: Placement::hosts(0, 0..2),
            out_placement: Placement::hosts(0, 0..3),
            in_split_axis: Some(0),
            out_split_axis: Some(1),
            shape: vec![4, 4],
        };

        let op = describe(&key);

        assert_eq!(op.op_type(), "eager_naive_s_to_s");
        assert!(op.name().starts_with("eager_naive_s_to_s_"));
        assert_eq!(op.attr_axis("in_split_axis").unwrap(), 0);
        assert_eq!(op.attr_axis("out_split_axis").unwrap(), 1);
        assert_eq!(op.attr_placement("out_placement").unwrap().parallel_num(), 3);
    }

    #[test]
    fn test_lazy_tensors_are_rejected() {
        let ctx = BoxingContext::host(ExecutionContext::single_process());
        let src = on(Placement::hosts(0, 0..2), Layout::broadcast());
        let dst = on(Placement::hosts(0, 0..2), Layout::split(0));
        let blob = LogicalBlobId::new("op", "out");
        let tensor = DistributedTensor::lazy(blob, vec![4], src.clone()).unwrap();

        assert!(matches!(
            b_to_s(&ctx, &tensor, &src, &dst),
            Err(BoxingError::NotEager { .. })
        ));
        assert!(ctx.descriptors().is_empty());
    }
}
