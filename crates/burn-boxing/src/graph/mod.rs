//! Transitions wired into the distributed task graph instead of run as one instruction.
//!
//! The `b-to-1` rule collapses a broadcast (or single device) tensor onto one destination
//! device. Lazy tensors only get their graph wiring; eager tensors also get their value moved.

mod b21;
mod task;

pub use b21::*;
pub use task::*;

use crate::collective::{check_single_axis, require_src};
use crate::layout::{PlacedLayout, is_all_broadcast};
use crate::{BoxingContext, BoxingError, CheckError, DistributedTensor, Result, RuleRegistry};

pub(crate) fn register_rules(registry: &mut RuleRegistry) {
    registry.register("b-to-1", check_b_to_1, b_to_1);
}

fn check_b_to_1(src: &PlacedLayout, dst: &PlacedLayout) -> core::result::Result<(), CheckError> {
    check_single_axis(src, dst)?;
    let out_devices = dst.placement().parallel_num();
    if out_devices != 1 {
        return Err(CheckError::PlacementShape {
            reason: alloc::format!("destination spans {out_devices} devices, expected 1"),
        });
    }
    let degenerate = src.placement().parallel_num() == 1;
    require_src(degenerate || is_all_broadcast(src.layout()), "broadcast or single device", src)
}

fn b_to_1(
    ctx: &BoxingContext,
    tensor: &DistributedTensor,
    src: &PlacedLayout,
    dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    if tensor.placed_layout() != src {
        return Err(BoxingError::PlacementMismatch {
            expected: src.clone(),
            actual: tensor.placed_layout().clone(),
        });
    }

    let graph = ctx.task_graph();
    let in_tasks = graph.producer_tasks(tensor.blob(), src.placement());
    let output = B21SubTaskGraphBuilder.build(
        graph,
        &in_tasks,
        src.placement(),
        dst.placement(),
        tensor.blob(),
        src.layout().first(),
    )?;
    log::debug!("{}: {}", output.status.builder, output.status.comment);

    if !tensor.is_eager() {
        return DistributedTensor::lazy(tensor.blob().clone(), tensor.shape().to_vec(), dst.clone());
    }
    let value = tensor.shards()?[output.data_sources[0]].clone();
    DistributedTensor::from_logical(tensor.blob().clone(), value, dst.clone())
}
