use core::fmt;

use derive_new::new;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::StreamKind;

/// The kind of device a placement spans.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    /// Host memory, driven by the CPU.
    Host,
    /// An accelerator with its own streams and collective backend.
    Accelerator,
}

/// Identifies a physical device: the machine (process rank) it belongs to and its index on
/// that machine.
#[derive(new, Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    /// Machine the device belongs to.
    pub machine: usize,
    /// Index of the device on its machine.
    pub local_index: usize,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine, self.local_index)
    }
}

/// An ordered, deduplicated set of devices of a single [`DeviceKind`], arranged in a logical
/// hierarchy.
///
/// The hierarchy has one dimension per parallelism dimension of the layouts placed on it, and
/// devices are laid out in row-major order over it. A flat placement of `n` devices has the
/// hierarchy `[n]`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PlacementRecord")]
pub struct Placement {
    kind: DeviceKind,
    devices: Vec<DeviceId>,
    hierarchy: Vec<usize>,
}

#[derive(Deserialize)]
struct PlacementRecord {
    kind: DeviceKind,
    devices: Vec<DeviceId>,
    hierarchy: Vec<usize>,
}

impl TryFrom<PlacementRecord> for Placement {
    type Error = PlacementError;

    fn try_from(record: PlacementRecord) -> Result<Self, Self::Error> {
        PlacementBuilder::new(record.kind, record.devices)
            .with_hierarchy(record.hierarchy)
            .build()
    }
}

impl Placement {
    /// Flat accelerator placement over `machine`'s devices `local_indices`.
    ///
    /// # Panics
    /// Panics if the placement is empty or lists a device twice.
    pub fn accelerators<I: IntoIterator<Item = usize>>(machine: usize, local_indices: I) -> Self {
        Self::flat(DeviceKind::Accelerator, machine, local_indices)
    }

    /// Flat host placement over `machine`'s devices `local_indices`.
    ///
    /// # Panics
    /// Panics if the placement is empty or lists a device twice.
    pub fn hosts<I: IntoIterator<Item = usize>>(machine: usize, local_indices: I) -> Self {
        Self::flat(DeviceKind::Host, machine, local_indices)
    }

    fn flat<I: IntoIterator<Item = usize>>(
        kind: DeviceKind,
        machine: usize,
        local_indices: I,
    ) -> Self {
        let devices = local_indices
            .into_iter()
            .map(|local_index| DeviceId::new(machine, local_index))
            .collect();

        match PlacementBuilder::new(kind, devices).build() {
            Ok(placement) => placement,
            Err(err) => panic!("{err:?}"),
        }
    }

    /// Kind of every device of the placement.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Devices in parallel-id order.
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// Shape of the logical device hierarchy.
    pub fn hierarchy(&self) -> &[usize] {
        &self.hierarchy
    }

    /// Number of devices.
    pub fn parallel_num(&self) -> usize {
        self.devices.len()
    }

    /// Device with the given parallel id.
    pub fn device(&self, parallel_id: usize) -> Option<DeviceId> {
        self.devices.get(parallel_id).copied()
    }

    /// Parallel id of `device`, if it belongs to the placement.
    pub fn parallel_id_of(&self, device: DeviceId) -> Option<usize> {
        self.devices.iter().position(|d| *d == device)
    }

    /// Stream every device of the placement executes on.
    pub fn streams(&self) -> impl Iterator<Item = StreamKind> + '_ {
        self.devices
            .iter()
            .map(|device| StreamKind::for_device(self.kind, *device))
    }

    /// Whether every device can take part in a hardware collective.
    pub fn supports_collectives(&self) -> bool {
        self.streams().all(|stream| stream.supports_collectives())
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{{", self.kind)?;
        for (i, device) in self.devices.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{device}")?;
        }
        f.write_str("}")?;
        if self.hierarchy.len() > 1 {
            write!(f, "@{:?}", self.hierarchy)?;
        }
        Ok(())
    }
}

/// Represents errors that can occur when constructing a [`Placement`].
#[derive(Error, Debug)]
pub enum PlacementError {
    /// The placement lists no devices.
    #[error("a placement needs at least one device")]
    Empty,
    /// A device appears more than once.
    #[error("{0}")]
    DuplicateDevice(String),
    /// The hierarchy is invalid for the device list.
    #[error("{0}")]
    InvalidHierarchy(String),
}

/// A builder for constructing a [`Placement`].
///
/// Without an explicit hierarchy, the placement is flat.
#[derive(Clone, Debug)]
pub struct PlacementBuilder {
    kind: DeviceKind,
    devices: Vec<DeviceId>,
    hierarchy: Option<Vec<usize>>,
}

impl PlacementBuilder {
    /// Creates a new [`PlacementBuilder`] with the given device kind and devices.
    ///
    /// # Arguments
    /// * `kind` - The kind shared by every device.
    /// * `devices` - The devices, in parallel-id order.
    pub fn new(kind: DeviceKind, devices: Vec<DeviceId>) -> Self {
        Self {
            kind,
            devices,
            hierarchy: None,
        }
    }

    /// Arranges the devices in a logical hierarchy.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use burn_boxing::layout::{DeviceId, DeviceKind, PlacementBuilder};
    /// let devices = (0..4).map(|i| DeviceId::new(0, i)).collect();
    /// let placement = PlacementBuilder::new(DeviceKind::Accelerator, devices)
    ///     .with_hierarchy([2, 2])
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(placement.hierarchy(), &[2, 2]);
    /// ```
    pub fn with_hierarchy<S: Into<Vec<usize>>>(mut self, hierarchy: S) -> Self {
        self.hierarchy = Some(hierarchy.into());
        self
    }

    /// Builds a [`Placement`] from the current configuration.
    ///
    /// # Returns
    /// A `Placement` if the configuration is valid, or a `PlacementError` if invalid.
    pub fn build(self) -> Result<Placement, PlacementError> {
        if self.devices.is_empty() {
            return Err(PlacementError::Empty);
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(*device) {
                return Err(PlacementError::DuplicateDevice(format!(
                    "Device {device} listed more than once"
                )));
            }
        }

        let hierarchy = self.hierarchy.unwrap_or_else(|| vec![self.devices.len()]);
        if hierarchy.is_empty() || hierarchy.contains(&0) {
            return Err(PlacementError::InvalidHierarchy(format!(
                "Hierarchy {hierarchy:?} must be non-empty with positive dimensions"
            )));
        }

        let expected_devices = hierarchy.iter().product::<usize>();
        if self.devices.len() != expected_devices {
            return Err(PlacementError::InvalidHierarchy(format!(
                "Device count ({}) doesn't match hierarchy {:?}",
                self.devices.len(),
                hierarchy,
            )));
        }

        Ok(Placement {
            kind: self.kind,
            devices: self.devices,
            hierarchy,
        })
    }
}
