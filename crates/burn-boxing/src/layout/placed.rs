use alloc::sync::Arc;
use core::fmt;
use std::sync::LazyLock;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{Layout, Placement};
use crate::CheckError;

/// A [`Layout`] bound to the [`Placement`] it distributes over. Boxing transitions go from one
/// placed layout to another.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PlacedLayoutRecord")]
pub struct PlacedLayout {
    placement: Placement,
    layout: Layout,
}

#[derive(Deserialize)]
struct PlacedLayoutRecord {
    placement: Placement,
    layout: Layout,
}

impl TryFrom<PlacedLayoutRecord> for PlacedLayout {
    type Error = CheckError;

    fn try_from(record: PlacedLayoutRecord) -> Result<Self, Self::Error> {
        Self::new(record.placement, record.layout)
    }
}

static SYMBOLS: LazyLock<DashMap<PlacedLayout, Arc<PlacedLayout>>> = LazyLock::new(DashMap::new);

impl PlacedLayout {
    /// Binds `layout` to `placement`.
    ///
    /// The layout must have one entry per dimension of the placement hierarchy.
    pub fn new(placement: Placement, layout: Layout) -> Result<Self, CheckError> {
        if placement.hierarchy().len() != layout.len() {
            return Err(CheckError::HierarchyMismatch {
                layout: layout.len(),
                hierarchy: placement.hierarchy().len(),
            });
        }

        Ok(Self { placement, layout })
    }

    /// The placement.
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// The layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Number of parallelism dimensions of the layout.
    pub fn ndim(&self) -> usize {
        self.layout.len()
    }

    /// Returns the process-wide shared instance structurally equal to `self`.
    pub fn intern(self) -> Arc<PlacedLayout> {
        SYMBOLS
            .entry(self.clone())
            .or_insert_with(|| Arc::new(self))
            .value()
            .clone()
    }
}

impl fmt::Display for PlacedLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.placement, self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{AxisDistribution, DeviceId, DeviceKind, PlacementBuilder};

    #[test]
    fn test_interned_symbols_are_shared() {
        let placement = Placement::accelerators(0, 0..2);
        let a = PlacedLayout::new(placement.clone(), Layout::split(0))
            .unwrap()
            .intern();
        let b = PlacedLayout::new(placement.clone(), Layout::split(0))
            .unwrap()
            .intern();
        let c = PlacedLayout::new(placement, Layout::broadcast())
            .unwrap()
            .intern();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_layout_should_match_hierarchy() {
        let devices = (0..4).map(|i| DeviceId::new(0, i)).collect();
        let placement = PlacementBuilder::new(DeviceKind::Accelerator, devices)
            .with_hierarchy([2, 2])
            .build()
            .unwrap();

        let err = PlacedLayout::new(placement.clone(), Layout::broadcast()).unwrap_err();
        assert_eq!(
            err,
            CheckError::HierarchyMismatch {
                layout: 1,
                hierarchy: 2
            }
        );
        assert!(
            PlacedLayout::new(
                placement,
                Layout::new([AxisDistribution::Split(0), AxisDistribution::Broadcast])
            )
            .is_ok()
        );
    }

    #[test]
    fn test_deserialization_checks_hierarchy() {
        let json = serde_json::json!({
            "placement": Placement::hosts(0, 0..2),
            "layout": { "distributions": ["Broadcast", "Broadcast"] },
        });

        let err = serde_json::from_value::<PlacedLayout>(json).unwrap_err();
        assert!(err.to_string().contains("placement hierarchy has 1"), "{err}");

        let valid = PlacedLayout::new(Placement::hosts(0, 0..2), Layout::split(0)).unwrap();
        let json = serde_json::to_string(&valid).unwrap();
        assert_eq!(serde_json::from_str::<PlacedLayout>(&json).unwrap(), valid);
    }

    #[test]
    fn test_display() {
        let placed = PlacedLayout::new(Placement::hosts(1, [0, 1]), Layout::partial_sum()).unwrap();
        assert_eq!(placed.to_string(), "host:{1:0, 1:1} (P)");
    }
}
