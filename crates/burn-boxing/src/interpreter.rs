use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::collective::{CollectiveIssuer, HostCollectives};
use crate::graph::{TaskGraph, TaskGraphBuilder};
use crate::layout::{PlacedLayout, validate_split_axes};
use crate::local::{DescriptorCache, HostOpDispatcher, OpDispatcher};
use crate::{BoxingConfig, BoxingError, DistributedTensor, ExecutionContext, Result, RuleRegistry};

/// Everything a rule executor may touch: the collaborators that move data and the shared
/// descriptor cache.
pub struct BoxingContext {
    exec: ExecutionContext,
    collectives: Arc<dyn CollectiveIssuer>,
    ops: Arc<dyn OpDispatcher>,
    task_graph: Arc<dyn TaskGraphBuilder>,
    descriptors: DescriptorCache,
}

impl BoxingContext {
    /// Creates a context over the given collaborators.
    pub fn new(
        exec: ExecutionContext,
        collectives: Arc<dyn CollectiveIssuer>,
        ops: Arc<dyn OpDispatcher>,
        task_graph: Arc<dyn TaskGraphBuilder>,
    ) -> Self {
        Self {
            exec,
            collectives,
            ops,
            task_graph,
            descriptors: DescriptorCache::default(),
        }
    }

    /// Context backed by the in-memory collaborators.
    pub fn host(exec: ExecutionContext) -> Self {
        Self::new(
            exec,
            Arc::new(HostCollectives::default()),
            Arc::new(HostOpDispatcher),
            Arc::new(TaskGraph::default()),
        )
    }

    /// Process identity.
    pub fn exec(&self) -> &ExecutionContext {
        &self.exec
    }

    /// Collective backend.
    pub fn collectives(&self) -> &dyn CollectiveIssuer {
        self.collectives.as_ref()
    }

    /// Operator dispatcher.
    pub fn ops(&self) -> &dyn OpDispatcher {
        self.ops.as_ref()
    }

    /// Task graph receiving sub-task-graph nodes.
    pub fn task_graph(&self) -> &dyn TaskGraphBuilder {
        self.task_graph.as_ref()
    }

    /// Cache of operator descriptors built by the local rules.
    pub fn descriptors(&self) -> &DescriptorCache {
        &self.descriptors
    }
}

/// Redistributes tensors between placed layouts.
///
/// The interpreter tries the registered rules in order and runs the first one that accepts the
/// transition. It never moves data itself.
pub struct BoxingInterpreter {
    config: BoxingConfig,
    registry: RuleRegistry,
    context: BoxingContext,
}

impl BoxingInterpreter {
    /// Interpreter over the default rules.
    pub fn new(config: BoxingConfig, context: BoxingContext) -> Self {
        Self::with_registry(config, context, RuleRegistry::with_default_rules())
    }

    /// Interpreter over a custom registry.
    pub fn with_registry(
        config: BoxingConfig,
        context: BoxingContext,
        registry: RuleRegistry,
    ) -> Self {
        Self {
            config,
            registry,
            context,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &BoxingConfig {
        &self.config
    }

    /// The rule registry.
    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// The execution context handed to rules.
    pub fn context(&self) -> &BoxingContext {
        &self.context
    }

    /// Name of the rule that would handle `src -> dst`.
    pub fn select_rule(&self, src: &PlacedLayout, dst: &PlacedLayout) -> Result<&str> {
        self.registry
            .select(src, dst, &self.config)
            .map(|rule| rule.name())
            .map_err(|rejections| BoxingError::UnsupportedTransition {
                src: src.clone(),
                dst: dst.clone(),
                rejections,
            })
    }

    /// Returns a tensor holding the same logical value as `tensor`, distributed as `dst`.
    ///
    /// `tensor` must currently be distributed as `src`.
    pub fn redistribute(
        &self,
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
        if self.config.validate_split_axes {
            validate_split_axes(src.layout(), tensor.shape().len())?;
            validate_split_axes(dst.layout(), tensor.shape().len())?;
        }

        let rule = match self.registry.select(src, dst, &self.config) {
            Ok(rule) => rule,
            Err(rejections) => {
                log::warn!("No boxing rule from {src} to {dst}");
                return Err(BoxingError::UnsupportedTransition {
                    src: src.clone(),
                    dst: dst.clone(),
                    rejections,
                });
            }
        };

        log::debug!(
            "Boxing `{}` from {src} to {dst} with `{}` on rank {}",
            tensor.blob(),
            rule.name(),
            self.context.exec().rank()
        );

        let output = rule
            .execute(&self.context, tensor, src, dst)
            .map_err(|err| rule_failed(rule.name(), err))?;

        if output.placed_layout() != dst {
            return Err(rule_failed(
                rule.name(),
                BoxingError::PlacementMismatch {
                    expected: dst.clone(),
                    actual: output.placed_layout().clone(),
                },
            ));
        }

        Ok(output)
    }
}

fn rule_failed(rule: &str, source: BoxingError) -> BoxingError {
    BoxingError::RuleFailed {
        rule: rule.into(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Layout, Placement};
    use crate::{CheckError, IDENTITY, LogicalBlobId};
    use ndarray::{ArrayD, IxDyn};

    fn interpreter() -> BoxingInterpreter {
        BoxingInterpreter::new(
            BoxingConfig::default(),
            BoxingContext::host(ExecutionContext::single_process()),
        )
    }

    fn placed(placement: Placement, layout: Layout) -> PlacedLayout {
        PlacedLayout::new(placement, layout).unwrap()
    }

    fn blob() -> LogicalBlobId {
        LogicalBlobId::new("embed", "out")
    }

    #[test]
    fn test_select_rule_by_priority() {
        let interpreter = interpreter();
        let accelerators = Placement::accelerators(0, 0..2);
        let hosts = Placement::hosts(0, 0..2);

        let rule = |src: &PlacedLayout, dst: &PlacedLayout| {
            interpreter.select_rule(src, dst).unwrap().to_string()
        };

        assert_eq!(
            rule(
                &placed(accelerators.clone(), Layout::partial_sum()),
                &placed(accelerators.clone(), Layout::broadcast())
            ),
            "nccl-p-to-b"
        );
        assert_eq!(
            rule(
                &placed(hosts.clone(), Layout::partial_sum()),
                &placed(hosts.clone(), Layout::broadcast())
            ),
            "eager-p-to-b"
        );
        assert_eq!(
            rule(&placed(hosts.clone(), Layout::split(0)), &placed(hosts, Layout::split(0))),
            IDENTITY
        );
    }

    #[test]
    fn test_lazy_tensor_is_rejected_by_eager_rules() {
        let interpreter = interpreter();
        let devices = Placement::hosts(0, 0..2);
        let src = placed(devices.clone(), Layout::split(0));
        let dst = placed(devices, Layout::broadcast());
        let tensor = DistributedTensor::lazy(blob(), vec![4, 2], src.clone()).unwrap();

        let err = interpreter.redistribute(&tensor, &src, &dst).unwrap_err();

        assert!(matches!(err.root_cause(), BoxingError::NotEager { .. }));
    }

    #[test]
    fn test_lazy_tensor_collapses_through_task_graph() {
        let interpreter = interpreter();
        let src = placed(Placement::accelerators(0, 0..2), Layout::broadcast());
        let dst = placed(Placement::hosts(0, [0]), Layout::broadcast());
        let tensor = DistributedTensor::lazy(blob(), vec![4, 2], src.clone()).unwrap();

        let output = interpreter.redistribute(&tensor, &src, &dst).unwrap();

        assert!(!output.is_eager());
        assert_eq!(output.placed_layout(), &dst);
    }

    #[test]
    fn test_split_axes_are_validated_against_rank() {
        let interpreter = interpreter();
        let devices = Placement::accelerators(0, 0..2);
        let src = placed(devices.clone(), Layout::split(1));
        let wide = placed(devices, Layout::split(3));
        let value = ArrayD::from_elem(IxDyn(&[4, 2]), 1.0);
        let tensor = DistributedTensor::from_logical(blob(), value, src.clone()).unwrap();

        assert!(matches!(
            interpreter.redistribute(&tensor, &src, &wide),
            Err(BoxingError::LayoutValidation(CheckError::SplitAxisOutOfRange { axis: 3, rank: 2 }))
        ));
    }
}
