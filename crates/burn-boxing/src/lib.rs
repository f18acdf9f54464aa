#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn boxing: redistribution of tensors between distributed layouts.
//!
//! A [`DistributedTensor`] is described by a [`PlacedLayout`](layout::PlacedLayout): a set of
//! devices and, per parallelism dimension, whether the tensor is split, broadcast or held as
//! partial sums. The [`BoxingInterpreter`] moves a tensor from one placed layout to another by
//! picking the first rule of its [`RuleRegistry`] that accepts the pair.

extern crate alloc;

mod config;
mod error;
mod interpreter;
mod registry;
mod runtime;
mod tensor;

pub mod collective;
pub mod graph;
pub mod layout;
pub mod local;

pub use config::*;
pub use error::*;
pub use interpreter::*;
pub use registry::*;
pub use runtime::*;
pub use tensor::*;
