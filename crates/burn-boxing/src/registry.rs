use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use dashmap::DashMap;

use crate::layout::PlacedLayout;
use crate::{
    BoxingConfig, BoxingContext, CheckError, DistributedTensor, Result, collective, graph, local,
};

/// Decides whether a rule handles a transition. Must be pure: the same pair always yields the
/// same decision.
pub type Checker = fn(&PlacedLayout, &PlacedLayout) -> core::result::Result<(), CheckError>;

/// Performs a transition accepted by the matching [`Checker`].
pub type Executor = fn(
    &BoxingContext,
    &DistributedTensor,
    &PlacedLayout,
    &PlacedLayout,
) -> Result<DistributedTensor>;

/// Name of the rule that returns the input tensor when source and destination are equal.
pub const IDENTITY: &str = "identity";

/// A named pair of checker and executor.
#[derive(Clone)]
pub struct TransitionRule {
    name: String,
    checker: Checker,
    executor: Executor,
}

impl TransitionRule {
    /// Name used in diagnostics and configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the checker without memoization.
    pub fn check(
        &self,
        src: &PlacedLayout,
        dst: &PlacedLayout,
    ) -> core::result::Result<(), CheckError> {
        (self.checker)(src, dst)
    }

    /// Runs the executor.
    pub fn execute(
        &self,
        ctx: &BoxingContext,
        tensor: &DistributedTensor,
        src: &PlacedLayout,
        dst: &PlacedLayout,
    ) -> Result<DistributedTensor> {
        (self.executor)(ctx, tensor, src, dst)
    }
}

impl fmt::Debug for TransitionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionRule").field("name", &self.name).finish()
    }
}

type MemoKey = (usize, PlacedLayout, PlacedLayout);

/// Ordered set of transition rules. The first rule whose checker accepts a pair handles it.
///
/// Rules are registered once, before the registry is shared, and never change afterwards.
/// Checker decisions are memoized per rule and pair for the lifetime of the registry.
#[derive(Default)]
pub struct RuleRegistry {
    rules: Vec<TransitionRule>,
    memo: DashMap<MemoKey, core::result::Result<(), CheckError>>,
}

impl RuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in rules, cheapest first:
    ///
    /// 1. `identity`
    /// 2. the collective rules (`nccl-*`)
    /// 3. the local operator rules (`eager-*`)
    /// 4. the sub-task-graph rule (`b-to-1`)
    pub fn with_default_rules() -> Self {
        let mut registry = Self::new();
        registry.register(IDENTITY, check_identity, execute_identity);
        collective::register_rules(&mut registry);
        local::register_rules(&mut registry);
        graph::register_rules(&mut registry);
        registry
    }

    /// Appends a rule.
    ///
    /// # Panics
    /// Panics if a rule with the same name is already registered.
    pub fn register<S: Into<String>>(
        &mut self,
        name: S,
        checker: Checker,
        executor: Executor,
    ) -> &mut Self {
        let name = name.into();
        assert!(
            self.rules.iter().all(|rule| rule.name != name),
            "Boxing rule `{name}` registered twice"
        );
        self.rules.push(TransitionRule {
            name,
            checker,
            executor,
        });
        self
    }

    /// Registered rules, in priority order.
    pub fn rules(&self) -> &[TransitionRule] {
        &self.rules
    }

    /// Number of memoized decisions.
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }

    fn check(
        &self,
        index: usize,
        src: &PlacedLayout,
        dst: &PlacedLayout,
        memoize: bool,
    ) -> core::result::Result<(), CheckError> {
        let rule = &self.rules[index];
        if !memoize {
            return rule.check(src, dst);
        }

        let key = (index, src.clone(), dst.clone());
        if let Some(decision) = self.memo.get(&key) {
            return decision.clone();
        }
        let decision = rule.check(src, dst);
        self.memo.entry(key).or_insert(decision).clone()
    }

    /// Selects the first enabled rule that accepts `src -> dst`.
    ///
    /// On failure, returns every rule's reason for rejecting the pair.
    pub fn select(
        &self,
        src: &PlacedLayout,
        dst: &PlacedLayout,
        config: &BoxingConfig,
    ) -> core::result::Result<&TransitionRule, Vec<(String, CheckError)>> {
        let mut rejections = Vec::new();

        for (index, rule) in self.rules.iter().enumerate() {
            if rule.name != IDENTITY && config.is_disabled(&rule.name) {
                rejections.push((rule.name.clone(), CheckError::Disabled));
                continue;
            }
            match self.check(index, src, dst, config.memoize_checks) {
                Ok(()) => return Ok(rule),
                Err(reason) => {
                    log::trace!("Boxing rule `{}` rejected {src} -> {dst}: {reason}", rule.name);
                    rejections.push((rule.name.clone(), reason));
                }
            }
        }

        Err(rejections)
    }
}

fn check_identity(src: &PlacedLayout, dst: &PlacedLayout) -> core::result::Result<(), CheckError> {
    if src == dst {
        Ok(())
    } else {
        Err(CheckError::NotIdentity)
    }
}

fn execute_identity(
    _ctx: &BoxingContext,
    tensor: &DistributedTensor,
    _src: &PlacedLayout,
    _dst: &PlacedLayout,
) -> Result<DistributedTensor> {
    Ok(tensor.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Layout, Placement};

    fn placed(n: usize, layout: Layout) -> PlacedLayout {
        PlacedLayout::new(Placement::accelerators(0, 0..n), layout).unwrap()
    }

    fn names(registry: &RuleRegistry) -> Vec<&str> {
        registry.rules().iter().map(|rule| rule.name()).collect()
    }

    #[test]
    fn test_default_registration_order() {
        let registry = RuleRegistry::with_default_rules();

        assert_eq!(
            names(&registry),
            vec![
                "identity",
                "nccl-p-to-b",
                "nccl-p-to-s",
                "nccl-s-to-b",
                "nccl-s-to-s",
                "eager-p-to-b",
                "eager-p-to-s",
                "eager-s-to-b",
                "eager-b-to-s",
                "eager-naive-s-to-s",
                "b-to-1",
            ]
        );
    }

    #[test]
    #[should_panic = "Boxing rule `identity` registered twice"]
    fn test_rule_names_should_be_unique() {
        let mut registry = RuleRegistry::with_default_rules();
        registry.register(IDENTITY, check_identity, execute_identity);
    }

    #[test]
    fn test_first_accepting_rule_wins() {
        let mut registry = RuleRegistry::new();
        registry
            .register("first", |_, _| Ok(()), execute_identity)
            .register("second", |_, _| Ok(()), execute_identity);

        let src = placed(2, Layout::partial_sum());
        let dst = placed(2, Layout::broadcast());

        let rule = registry
            .select(&src, &dst, &BoxingConfig::default())
            .unwrap();
        assert_eq!(rule.name(), "first");
    }

    #[test]
    fn test_memoized_decisions_match_direct_checks() {
        let registry = RuleRegistry::with_default_rules();
        let config = BoxingConfig::default();
        let src = placed(4, Layout::split(0));
        let dst = placed(4, Layout::split(1));

        let first = registry.select(&src, &dst, &config).unwrap().name().to_string();
        let memoized = registry.memoized();
        let second = registry.select(&src, &dst, &config).unwrap().name().to_string();

        assert_eq!(first, "nccl-s-to-s");
        assert_eq!(first, second);
        assert_eq!(registry.memoized(), memoized);

        let unmemoized = BoxingConfig {
            memoize_checks: false,
            ..BoxingConfig::default()
        };
        assert_eq!(registry.select(&src, &dst, &unmemoized).unwrap().name(), first);
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let registry = RuleRegistry::with_default_rules();
        let config = BoxingConfig::default().with_disabled_rule("nccl-p-to-b");

        let rule = registry
            .select(&placed(4, Layout::partial_sum()), &placed(4, Layout::broadcast()), &config)
            .unwrap();
        assert_eq!(rule.name(), "eager-p-to-b");
    }

    #[test]
    fn test_identity_cannot_be_disabled() {
        let registry = RuleRegistry::with_default_rules();
        let config = BoxingConfig::default().with_disabled_rule(IDENTITY);
        let layout = placed(4, Layout::split(0));

        assert_eq!(registry.select(&layout, &layout, &config).unwrap().name(), IDENTITY);
    }

    #[test]
    fn test_rejections_are_reported_in_order() {
        let registry = RuleRegistry::with_default_rules();
        let src = PlacedLayout::new(Placement::accelerators(0, 0..4), Layout::split(0)).unwrap();
        let dst = PlacedLayout::new(Placement::accelerators(0, 0..6), Layout::split(0)).unwrap();

        let rejections = registry.select(&src, &dst, &BoxingConfig::default()).unwrap_err();
        assert_eq!(rejections.len(), registry.rules().len());
        assert_eq!(rejections[0], (IDENTITY.to_string(), CheckError::NotIdentity));
        assert_eq!(
            rejections[4],
            ("nccl-s-to-s".to_string(), CheckError::SameSplitAxis { axis: 0 })
        );
        assert_eq!(rejections[9].1, CheckError::SameSplitAxis { axis: 0 });
        assert!(matches!(rejections[10].1, CheckError::PlacementShape { .. }));
    }
}
