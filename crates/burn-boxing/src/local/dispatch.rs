use alloc::vec::Vec;

use super::OpDescriptor;
use crate::layout::{AxisDistribution, Layout, PlacedLayout};
use crate::{DistributedTensor, Result};

/// Runs operator instances on tensors.
pub trait OpDispatcher: Send + Sync {
    /// Executes `op` on `inputs` and returns its outputs in declaration order.
    fn dispatch(
        &self,
        op: &OpDescriptor,
        inputs: &[&DistributedTensor],
    ) -> Result<Vec<DistributedTensor>>;
}

/// Dispatcher for the eager boxing operators over host memory.
///
/// Each operator gathers the logical value from the input placement and slices it for the
/// output placement, which is the data movement the device kernels perform point to point.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostOpDispatcher;

impl HostOpDispatcher {
    fn distributions(op: &OpDescriptor) -> Result<(AxisDistribution, AxisDistribution)> {
        let split = |name: &str| op.attr_axis(name).map(AxisDistribution::Split);

        Ok(match op.op_type() {
            "eager_s_to_b" => (split("in_split_axis")?, AxisDistribution::Broadcast),
            "eager_p_to_b" => (AxisDistribution::PartialSum, AxisDistribution::Broadcast),
            "eager_naive_s_to_s" => (split("in_split_axis")?, split("out_split_axis")?),
            "eager_b_to_s" => (AxisDistribution::Broadcast, split("out_split_axis")?),
            "eager_p_to_s" => (AxisDistribution::PartialSum, split("out_split_axis")?),
            other => return Err(op.error(format!("unknown operator type `{other}`"))),
        })
    }
}

impl OpDispatcher for HostOpDispatcher {
    fn dispatch(
        &self,
        op: &OpDescriptor,
        inputs: &[&DistributedTensor],
    ) -> Result<Vec<DistributedTensor>> {
        let [input] = inputs else {
            return Err(op.error(format!("expected one input, got {}", inputs.len())));
        };
        let (in_distribution, out_distribution) = Self::distributions(op)?;
        let in_placement = op.attr_placement("in_placement")?;
        let out_placement = op.attr_placement("out_placement")?;

        if input.placement() != in_placement {
            return Err(op.error(format!(
                "input is placed on {}, operator reads from {in_placement}",
                input.placement()
            )));
        }
        if input.shape() != op.attr_shape("shape")? {
            return Err(op.error(format!("unexpected input shape {:?}", input.shape())));
        }
        if input.layout() != &Layout::new([in_distribution]) {
            return Err(op.error(format!(
                "input layout {} is not ({in_distribution})",
                input.layout()
            )));
        }

        let value = input.to_logical()?;
        let placed = PlacedLayout::new(out_placement.clone(), Layout::new([out_distribution]))?;
        let output = DistributedTensor::from_logical(input.blob().clone(), value, placed)?;

        Ok(vec![output])
    }
}
