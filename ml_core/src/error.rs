use std::{
    error::Error,
    fmt::{self, Display},
};

use ndarray::ShapeError;

/// The result type used in the entire ml core crate.
pub type Result<T> = std::result::Result<T, MlErr>;

/// Errors produced while building, binding or evaluating the model's tensors.
#[derive(Debug)]
pub enum MlErr {
    /// An input is invalid for semantic or domain reasons.
    InvalidInput(&'static str),

    /// A tensor didn't have the shape it was expected to have.
    ShapeMismatch {
        what: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    /// A batch can't be split into equally sized shards.
    UnevenSplit { batch: usize, parts: usize },

    /// A declaring scope tried to create a variable that already exists.
    DuplicateVariable { name: String },

    /// A reusing scope tried to bind a variable that was never declared.
    UnknownVariable { name: String },

    /// A random initializer was built with invalid arguments.
    Rand(String),

    /// An ndarray reshape failed.
    Layout(ShapeError),
}

impl MlErr {
    /// Builds a `ShapeMismatch` error.
    ///
    /// # Arguments
    /// * `what` - The name of the mismatching tensor.
    /// * `got` - The observed shape.
    /// * `expected` - The required shape.
    pub fn shape_mismatch(what: impl Into<String>, got: &[usize], expected: &[usize]) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            got: got.to_vec(),
            expected: expected.to_vec(),
        }
    }
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            MlErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {what}: got {got:?}, expected {expected:?}"
            ),
            MlErr::UnevenSplit { batch, parts } => write!(
                f,
                "a batch of {batch} examples can't be split evenly into {parts} shards"
            ),
            MlErr::DuplicateVariable { name } => {
                write!(f, "variable {name} is already declared, enable reuse to bind it")
            }
            MlErr::UnknownVariable { name } => {
                write!(f, "variable {name} doesn't exist, it must be declared before reuse")
            }
            MlErr::Rand(msg) => write!(f, "invalid initializer: {msg}"),
            MlErr::Layout(e) => write!(f, "layout error: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Layout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Layout(value)
    }
}
