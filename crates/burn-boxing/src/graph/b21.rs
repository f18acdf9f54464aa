use alloc::string::String;
use alloc::vec::Vec;

use crate::graph::{ControlGroup, TaskGraphBuilder, TaskId};
use crate::layout::{AxisDistribution, Placement};
use crate::{BoxingError, CheckError, LogicalBlobId, Result};

/// Diagnostic record of the builder that wired a sub task graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubTaskGraphStatus {
    /// Name of the builder.
    pub builder: &'static str,
    /// Human readable description of the wiring.
    pub comment: String,
}

/// Tasks produced by a sub task graph builder.
#[derive(Clone, Debug)]
pub struct SubTaskGraphOutput {
    /// One task per destination device, in parallel-id order.
    pub out_tasks: Vec<TaskId>,
    /// Per destination device, the source tasks linked by control edges only.
    pub ctrl_tasks: Vec<Vec<TaskId>>,
    /// Parallel id of the source task providing the data of each destination device.
    pub data_sources: Vec<usize>,
    /// Diagnostics.
    pub status: SubTaskGraphStatus,
}

/// Collapses a broadcast (or single device) source onto a single destination device.
///
/// The nearest source feeds the destination through a proxy node. Every other source joins
/// control group `0` of that proxy so the destination waits for all of them.
#[derive(Clone, Copy, Debug, Default)]
pub struct B21SubTaskGraphBuilder;

impl B21SubTaskGraphBuilder {
    /// Name reported in [`SubTaskGraphStatus`] and in [`BoxingError::BoxingNotSupported`].
    pub const NAME: &'static str = "B21SubTaskGraphBuilder";

    /// Wires `in_tasks` (one per device of `in_placement`) to `out_placement`.
    pub fn build(
        &self,
        graph: &dyn TaskGraphBuilder,
        in_tasks: &[TaskId],
        in_placement: &Placement,
        out_placement: &Placement,
        blob: &LogicalBlobId,
        in_distribution: AxisDistribution,
    ) -> Result<SubTaskGraphOutput> {
        let collapsible =
            in_placement.parallel_num() == 1 || in_distribution == AxisDistribution::Broadcast;
        if !collapsible || out_placement.parallel_num() != 1 {
            return Err(BoxingError::BoxingNotSupported { builder: Self::NAME });
        }
        if in_tasks.len() != in_placement.parallel_num() {
            return Err(CheckError::PlacementShape {
                reason: format!(
                    "{} source tasks for {} source devices",
                    in_tasks.len(),
                    in_placement.parallel_num()
                ),
            }
            .into());
        }

        let nearest = find_nearest_src_parallel_id(in_placement, out_placement, 0);
        let proxy = graph.add_proxy_node(in_tasks[nearest], blob, out_placement, 0);
        let group = ControlGroup { task: proxy, index: 0 };

        let ctrl: Vec<TaskId> = in_tasks
            .iter()
            .enumerate()
            .filter(|(parallel_id, _)| *parallel_id != nearest)
            .map(|(_, task)| *task)
            .collect();
        for task in ctrl.iter() {
            graph.add_control_edge(*task, group);
        }

        Ok(SubTaskGraphOutput {
            out_tasks: vec![proxy],
            status: SubTaskGraphStatus {
                builder: Self::NAME,
                comment: format!("data from source {nearest}, {} control edges", ctrl.len()),
            },
            ctrl_tasks: vec![ctrl],
            data_sources: vec![nearest],
        })
    }
}

/// Parallel id of the source device closest to device `out_parallel_id` of `out_placement`.
///
/// The same device wins, then the first device on the same machine, then parallel id `0`.
pub fn find_nearest_src_parallel_id(
    in_placement: &Placement,
    out_placement: &Placement,
    out_parallel_id: usize,
) -> usize {
    let Some(target) = out_placement.device(out_parallel_id) else {
        return 0;
    };
    let devices = in_placement.devices();

    devices
        .iter()
        .position(|device| *device == target)
        .or_else(|| devices.iter().position(|device| device.machine == target.machine))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskGraph;
    use crate::layout::{DeviceId, DeviceKind, PlacementBuilder};

    fn blob() -> LogicalBlobId {
        LogicalBlobId::new("matmul", "out")
    }

    #[test]
    fn test_single_source_single_destination() {
        let graph = TaskGraph::default();
        let src = Placement::accelerators(0, [0]);
        let dst = Placement::accelerators(0, [1]);
        let tasks = graph.producer_tasks(&blob(), &src);

        let output = B21SubTaskGraphBuilder
            .build(&graph, &tasks, &src, &dst, &blob(), AxisDistribution::Broadcast)
            .unwrap();

        assert_eq!(output.out_tasks.len(), 1);
        assert_eq!(output.ctrl_tasks, vec![Vec::<TaskId>::new()]);
        assert_eq!(graph.data_edges(), vec![(tasks[0], output.out_tasks[0])]);
        assert!(graph.control_edges().is_empty());
        assert_eq!(output.status.builder, "B21SubTaskGraphBuilder");
    }

    #[test]
    fn test_broadcast_collapses_with_control_edges() {
        let graph = TaskGraph::default();
        let src = Placement::accelerators(0, 0..4);
        let dst = Placement::hosts(1, [0]);
        let tasks = graph.producer_tasks(&blob(), &src);

        let output = B21SubTaskGraphBuilder
            .build(&graph, &tasks, &src, &dst, &blob(), AxisDistribution::Broadcast)
            .unwrap();
        let proxy = output.out_tasks[0];
        let group = ControlGroup { task: proxy, index: 0 };

        assert_eq!(output.data_sources, vec![0]);
        assert_eq!(graph.data_edges(), vec![(tasks[0], proxy)]);
        assert_eq!(
            graph.control_edges(),
            vec![(tasks[1], group), (tasks[2], group), (tasks[3], group)]
        );
    }

    #[test]
    fn test_rejects_split_source() {
        let graph = TaskGraph::default();
        let src = Placement::accelerators(0, 0..2);
        let dst = Placement::accelerators(0, [0]);
        let tasks = graph.producer_tasks(&blob(), &src);

        let split = AxisDistribution::Split(0);

        let result = B21SubTaskGraphBuilder.build(&graph, &tasks, &src, &dst, &blob(), split);

        assert!(matches!(
            result,
            Err(BoxingError::BoxingNotSupported {
                builder: "B21SubTaskGraphBuilder"
            })
        ));
        assert!(graph.data_edges().is_empty());
    }

    #[test]
    fn test_nearest_source_follows_topology() {
        let src = Placement::accelerators(0, 0..4);

        assert_eq!(find_nearest_src_parallel_id(&src, &Placement::accelerators(0, [2]), 0), 2);
        assert_eq!(find_nearest_src_parallel_id(&src, &Placement::accelerators(1, [2]), 0), 0);
        assert_eq!(find_nearest_src_parallel_id(&src, &Placement::accelerators(0, [7]), 0), 0);

        let remote = Placement::accelerators(1, 0..2);
        let devices = vec![DeviceId::new(0, 0), DeviceId::new(1, 3)];
        let mixed = PlacementBuilder::new(DeviceKind::Accelerator, devices)
            .build()
            .unwrap();
        assert_eq!(find_nearest_src_parallel_id(&mixed, &remote, 0), 1);
    }
}
