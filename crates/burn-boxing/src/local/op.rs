use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::layout::Placement;
use crate::{BoxingError, Result};

/// Typed operator attribute.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum AttrValue {
    /// Integer attribute, e.g. a split axis.
    Int(i64),
    /// Shape attribute.
    Shape(Vec<usize>),
    /// Placement attribute.
    Placement(Placement),
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for AttrValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<Vec<usize>> for AttrValue {
    fn from(value: Vec<usize>) -> Self {
        Self::Shape(value)
    }
}

impl From<Placement> for AttrValue {
    fn from(value: Placement) -> Self {
        Self::Placement(value)
    }
}

/// A fully described operator instance, ready to be dispatched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpDescriptor {
    op_type: String,
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    attrs: BTreeMap<String, AttrValue>,
}

impl OpDescriptor {
    /// Operator type, e.g. `eager_s_to_b`.
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Process-unique instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input argument names.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Output argument names.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Attribute by name.
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Integer attribute converted to an axis.
    pub fn attr_axis(&self, name: &str) -> Result<usize> {
        match self.attr(name) {
            Some(AttrValue::Int(value)) => usize::try_from(*value)
                .map_err(|_| self.error(format!("attribute `{name}` is negative: {value}"))),
            other => Err(self.error(format!("expected integer attribute `{name}`, got {other:?}"))),
        }
    }

    /// Shape attribute.
    pub fn attr_shape(&self, name: &str) -> Result<&[usize]> {
        match self.attr(name) {
            Some(AttrValue::Shape(shape)) => Ok(shape),
            other => Err(self.error(format!("expected shape attribute `{name}`, got {other:?}"))),
        }
    }

    /// Placement attribute.
    pub fn attr_placement(&self, name: &str) -> Result<&Placement> {
        match self.attr(name) {
            Some(AttrValue::Placement(placement)) => Ok(placement),
            other => Err(self.error(format!(
                "expected placement attribute `{name}`, got {other:?}"
            ))),
        }
    }

    pub(crate) fn error(&self, reason: String) -> BoxingError {
        BoxingError::OpDispatch {
            op: self.name.clone(),
            reason,
        }
    }
}

static INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// Returns `prefix` suffixed with a process-wide counter.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}_{}", INSTANCES.fetch_add(1, Ordering::Relaxed))
}

/// Builds an [`OpDescriptor`].
///
/// # Example
///
/// ```rust
/// # use burn_boxing::local::OpBuilder;
/// let op = OpBuilder::new("eager_b_to_s", "eager_b_to_s_0")
///     .input("in")
///     .output("out")
///     .attr("out_split_axis", 1usize)
///     .build();
/// assert_eq!(op.attr_axis("out_split_axis").unwrap(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct OpBuilder {
    descriptor: OpDescriptor,
}

impl OpBuilder {
    /// Starts describing an operator of type `op_type` named `name`.
    pub fn new<T: Into<String>, N: Into<String>>(op_type: T, name: N) -> Self {
        Self {
            descriptor: OpDescriptor {
                op_type: op_type.into(),
                name: name.into(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                attrs: BTreeMap::new(),
            },
        }
    }

    /// Adds an input argument.
    pub fn input<S: Into<String>>(mut self, name: S) -> Self {
        self.descriptor.inputs.push(name.into());
        self
    }

    /// Adds an output argument.
    pub fn output<S: Into<String>>(mut self, name: S) -> Self {
        self.descriptor.outputs.push(name.into());
        self
    }

    /// Sets an attribute.
    pub fn attr<S: Into<String>, V: Into<AttrValue>>(mut self, name: S, value: V) -> Self {
        self.descriptor.attrs.insert(name.into(), value.into());
        self
    }

    /// Finishes the descriptor.
    pub fn build(self) -> OpDescriptor {
        self.descriptor
    }
}
