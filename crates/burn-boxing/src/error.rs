use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use thiserror::Error;

use crate::LogicalBlobId;
use crate::layout::{DeviceKind, Layout, PlacedLayout, Placement};

/// Result type alias using [`BoxingError`].
pub type Result<T> = core::result::Result<T, BoxingError>;

/// Reason a transition checker rejected a pair of placed layouts.
///
/// Checker results are memoized, so this type is cheap to clone and compare.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CheckError {
    /// The layout has an unexpected number of parallelism dimensions.
    #[error("expected {expected} parallelism dimension(s), got {actual}")]
    RankMismatch {
        /// Number of dimensions the rule handles.
        expected: usize,
        /// Number of dimensions of the layout.
        actual: usize,
    },

    /// The source layout does not have the pattern the rule consumes.
    #[error("source layout {layout} is not {expected}")]
    SourcePattern {
        /// Pattern the rule consumes.
        expected: &'static str,
        /// Offending layout.
        layout: Layout,
    },

    /// The destination layout does not have the pattern the rule produces.
    #[error("destination layout {layout} is not {expected}")]
    DestinationPattern {
        /// Pattern the rule produces.
        expected: &'static str,
        /// Offending layout.
        layout: Layout,
    },

    /// Source and destination split along the same axis.
    #[error("source and destination both split axis {axis}")]
    SameSplitAxis {
        /// The shared split axis.
        axis: usize,
    },

    /// The rule needs equal placements.
    #[error("placements differ: {src} vs {dst}")]
    PlacementMismatch {
        /// Source placement.
        src: Placement,
        /// Destination placement.
        dst: Placement,
    },

    /// The devices cannot run hardware collectives.
    #[error("{kind} devices do not support collective communication")]
    NoCollectiveSupport {
        /// Kind of the placement's devices.
        kind: DeviceKind,
    },

    /// The rule needs both placements to share a device kind.
    #[error("device kinds differ: {src} vs {dst}")]
    DeviceKindMismatch {
        /// Source device kind.
        src: DeviceKind,
        /// Destination device kind.
        dst: DeviceKind,
    },

    /// The rule does not handle this combination of device counts.
    #[error("unhandled placement shape: {reason}")]
    PlacementShape {
        /// What is not handled.
        reason: String,
    },

    /// The identity rule only accepts equal placed layouts.
    #[error("placed layouts are not identical")]
    NotIdentity,

    /// A split axis exceeds the tensor rank.
    #[error("split axis {axis} is out of range for a tensor of rank {rank}")]
    SplitAxisOutOfRange {
        /// Requested split axis.
        axis: usize,
        /// Rank of the logical tensor.
        rank: usize,
    },

    /// The layout has no parallelism dimension.
    #[error("a layout needs at least one parallelism dimension")]
    EmptyLayout,

    /// The layout does not have one entry per hierarchy dimension.
    #[error("layout has {layout} dimension(s) but the placement hierarchy has {hierarchy}")]
    HierarchyMismatch {
        /// Number of layout entries.
        layout: usize,
        /// Number of hierarchy dimensions.
        hierarchy: usize,
    },

    /// The rule is disabled by configuration.
    #[error("disabled by configuration")]
    Disabled,
}

/// Errors produced while redistributing a tensor.
#[derive(Error, Debug)]
pub enum BoxingError {
    /// A layout pair is malformed or unsupported by the rule handling it.
    #[error("layout validation failed: {0}")]
    LayoutValidation(#[from] CheckError),

    /// The tensor's live placed layout differs from the one declared by the request.
    #[error("tensor is placed as {actual} but the request declares {expected}")]
    PlacementMismatch {
        /// Declared placed layout.
        expected: PlacedLayout,
        /// Live placed layout of the tensor.
        actual: PlacedLayout,
    },

    /// No registered rule accepted the transition.
    #[error("no applicable boxing rule from {src} to {dst}")]
    UnsupportedTransition {
        /// Source placed layout.
        src: PlacedLayout,
        /// Destination placed layout.
        dst: PlacedLayout,
        /// Every rule's reason for rejecting the pair, in registration order.
        rejections: Vec<(String, CheckError)>,
    },

    /// The collective backend failed.
    #[error("collective execution failed: {0}")]
    CollectiveExecution(#[source] Box<dyn core::error::Error + Send + Sync>),

    /// The tensor has no materialized local shards.
    #[error("tensor `{blob}` is not materialized")]
    NotEager {
        /// Logical blob of the tensor.
        blob: LogicalBlobId,
    },

    /// A sub-task-graph builder does not handle the requested shape.
    #[error("boxing not supported by {builder}")]
    BoxingNotSupported {
        /// Name of the builder.
        builder: &'static str,
    },

    /// An operator could not be dispatched.
    #[error("dispatch of `{op}` failed: {reason}")]
    OpDispatch {
        /// Operator instance name.
        op: String,
        /// What went wrong.
        reason: String,
    },

    /// Local shards are inconsistent with the declared layout.
    #[error("invalid tensor: {0}")]
    InvalidTensor(String),

    /// Shards could not be combined.
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// The selected rule failed.
    #[error("boxing rule `{rule}` failed")]
    RuleFailed {
        /// Name of the rule.
        rule: String,
        /// Underlying failure.
        #[source]
        source: Box<BoxingError>,
    },

    /// The configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// The configuration could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BoxingError {
    /// Strips [`BoxingError::RuleFailed`] wrappers.
    pub fn root_cause(&self) -> &BoxingError {
        match self {
            Self::RuleFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
