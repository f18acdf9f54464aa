use derive_new::new;

use crate::layout::{DeviceId, DeviceKind};

/// Identity of the current process among the processes driving a placement.
///
/// Passed explicitly to everything that needs to know which devices are addressable from here.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    rank: usize,
    process_count: usize,
}

impl ExecutionContext {
    /// Context of a job that runs in a single process.
    pub fn single_process() -> Self {
        Self::new(0, 1)
    }

    /// Rank of the current process.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of processes.
    pub fn process_count(&self) -> usize {
        self.process_count
    }

    /// Whether `device` is driven by the current process.
    ///
    /// Machines map to processes; a single-process job drives every device.
    pub fn is_local(&self, device: DeviceId) -> bool {
        self.process_count == 1 || device.machine == self.rank
    }

    /// Runs `callback` only on process `rank`.
    pub fn on_rank<R, F: FnOnce() -> R>(&self, rank: usize, callback: F) -> Option<R> {
        match self.rank == rank {
            true => Some(callback()),
            false => None,
        }
    }
}

/// The stream a device executes work on.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum StreamKind {
    /// Host thread.
    Host,
    /// Accelerator stream bound to a device.
    Accelerator {
        /// Index of the device on its machine.
        device_index: usize,
    },
}

impl StreamKind {
    /// Stream used by `device` of the given kind.
    pub fn for_device(kind: DeviceKind, device: DeviceId) -> Self {
        match kind {
            DeviceKind::Host => Self::Host,
            DeviceKind::Accelerator => Self::Accelerator {
                device_index: device.local_index,
            },
        }
    }

    /// Whether the stream can take part in hardware collectives.
    pub fn supports_collectives(&self) -> bool {
        match self {
            Self::Host => false,
            Self::Accelerator { .. } => true,
        }
    }
}
