use alloc::vec::Vec;
use core::fmt;

use hashbrown::{HashMap, HashSet};
use spin::Mutex;

use crate::LogicalBlobId;
use crate::layout::{DeviceId, Placement};

/// Handle of a node in the distributed task graph.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// A group of control-only dependencies gating `task`.
///
/// `task` does not start until every member of the group has reached a safe point.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ControlGroup {
    /// The gated task.
    pub task: TaskId,
    /// Index of the group among the task's control groups.
    pub index: usize,
}

/// Inserts nodes and edges into the distributed task graph.
pub trait TaskGraphBuilder: Send + Sync {
    /// Tasks producing `blob` on each device of `placement`, in parallel-id order.
    fn producer_tasks(&self, blob: &LogicalBlobId, placement: &Placement) -> Vec<TaskId>;

    /// Returns a task holding `blob` from `src` on device `dst_index` of `dst`, connected to
    /// `src` by a data edge.
    fn add_proxy_node(
        &self,
        src: TaskId,
        blob: &LogicalBlobId,
        dst: &Placement,
        dst_index: usize,
    ) -> TaskId;

    /// Adds a control-only edge from `from` into `to`.
    fn add_control_edge(&self, from: TaskId, to: ControlGroup);
}

/// A node of the in-memory [`TaskGraph`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskNode {
    /// Produces a blob on a device.
    Producer {
        /// Produced blob.
        blob: LogicalBlobId,
        /// Device running the task.
        device: DeviceId,
    },
    /// Holds a copy of a blob produced elsewhere.
    Proxy {
        /// Copied blob.
        blob: LogicalBlobId,
        /// Task the data comes from.
        src: TaskId,
        /// Device holding the copy.
        device: DeviceId,
    },
}

#[derive(Default)]
struct TaskGraphState {
    nodes: Vec<TaskNode>,
    producers: HashMap<(LogicalBlobId, DeviceId), TaskId>,
    proxies: HashMap<(TaskId, DeviceId), TaskId>,
    data_edges: Vec<(TaskId, TaskId)>,
    control_edges: Vec<(TaskId, ControlGroup)>,
    control_set: HashSet<(TaskId, ControlGroup)>,
}

impl TaskGraphState {
    fn push(&mut self, node: TaskNode) -> TaskId {
        self.nodes.push(node);
        TaskId(self.nodes.len() - 1)
    }
}

/// Task graph kept in memory, one producer task per blob and device.
///
/// Proxies are shared: asking twice for the same source task on the same device returns the
/// same node. Control edges are kept once.
#[derive(Default)]
pub struct TaskGraph {
    state: Mutex<TaskGraphState>,
}

impl TaskGraph {
    /// Node with the given id.
    pub fn node(&self, id: TaskId) -> Option<TaskNode> {
        self.state.lock().nodes.get(id.0).cloned()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Whether the graph has no node.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Data edges, in insertion order.
    pub fn data_edges(&self) -> Vec<(TaskId, TaskId)> {
        self.state.lock().data_edges.clone()
    }

    /// Control-only edges, in insertion order.
    pub fn control_edges(&self) -> Vec<(TaskId, ControlGroup)> {
        self.state.lock().control_edges.clone()
    }
}

impl TaskGraphBuilder for TaskGraph {
    fn producer_tasks(&self, blob: &LogicalBlobId, placement: &Placement) -> Vec<TaskId> {
        let mut state = self.state.lock();

        placement
            .devices()
            .iter()
            .map(|device| {
                let key = (blob.clone(), *device);
                if let Some(id) = state.producers.get(&key) {
                    return *id;
                }
                let id = state.push(TaskNode::Producer {
                    blob: blob.clone(),
                    device: *device,
                });
                state.producers.insert(key, id);
                id
            })
            .collect()
    }

    fn add_proxy_node(
        &self,
        src: TaskId,
        blob: &LogicalBlobId,
        dst: &Placement,
        dst_index: usize,
    ) -> TaskId {
        let device = dst.devices()[dst_index];
        let mut state = self.state.lock();

        if let Some(id) = state.proxies.get(&(src, device)) {
            return *id;
        }
        let id = state.push(TaskNode::Proxy {
            blob: blob.clone(),
            src,
            device,
        });
        state.proxies.insert((src, device), id);
        state.data_edges.push((src, id));
        id
    }

    fn add_control_edge(&self, from: TaskId, to: ControlGroup) {
        let mut state = self.state.lock();
        if state.control_set.insert((from, to)) {
            state.control_edges.push((from, to));
        }
    }
}
