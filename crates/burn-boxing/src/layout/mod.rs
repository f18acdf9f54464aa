//! Value types describing how a tensor is distributed over devices.

mod placed;
mod placement;
mod sbp;

pub use placed::*;
pub use placement::*;
pub use sbp::*;
