use std::{
    error::Error,
    fmt::{self, Display},
};

use ml_core::MlErr;

/// The result type used in the entire coordinator crate.
pub type Result<T> = std::result::Result<T, CoordinatorErr>;

/// Errors produced while reducing gradients or committing an update.
#[derive(Debug)]
pub enum CoordinatorErr {
    /// There were no tower gradients to reduce.
    NoTowers,

    /// A tower didn't produce a gradient for a trainable variable.
    MissingGradient { name: String, tower: usize },

    /// A buffer didn't have the length it was expected to have.
    SizeMismatch {
        what: String,
        got: usize,
        expected: usize,
    },

    /// A tensor isn't laid out contiguously in memory.
    NonContiguous { name: String },

    /// An optimizer was asked for a slot it doesn't have.
    UnknownSlot { slot: String },

    /// The total loss of the step wasn't finite, nothing was committed.
    Diverged { step: u64, loss: f32 },

    Ml(MlErr),
}

impl Display for CoordinatorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorErr::NoTowers => f.write_str("no tower gradients to reduce"),
            CoordinatorErr::MissingGradient { name, tower } => {
                write!(f, "tower {tower} produced no gradient for {name}")
            }
            CoordinatorErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch for {what}: got {got}, expected {expected}"),
            CoordinatorErr::NonContiguous { name } => {
                write!(f, "tensor {name} isn't contiguous in memory")
            }
            CoordinatorErr::UnknownSlot { slot } => write!(f, "unknown optimizer slot {slot}"),
            CoordinatorErr::Diverged { step, loss } => {
                write!(f, "training diverged at step {step} with loss {loss}")
            }
            CoordinatorErr::Ml(e) => write!(f, "ml error: {e}"),
        }
    }
}

impl Error for CoordinatorErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CoordinatorErr::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for CoordinatorErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}
