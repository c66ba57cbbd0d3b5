use std::{error::Error, fmt};

use ml_core::{Device, MlErr};
use tokio::task::JoinError;

/// The tower module's result type.
pub type Result<T> = std::result::Result<T, TowerErr>;

/// Tower construction and execution failures.
#[derive(Debug)]
pub enum TowerErr {
    Ml(MlErr),
    Join(JoinError),
    /// The device list is empty, malformed or names a device twice.
    InvalidDevices(String),
    /// The global batch can't be shared evenly among the devices.
    BatchNotDivisible {
        batch: usize,
        devices: usize,
    },
    /// A reusing tower didn't bind exactly the variables the declaring tower created.
    ReuseViolation {
        device: Device,
        bound: usize,
        declared: usize,
    },
}

impl fmt::Display for TowerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TowerErr::Ml(e) => write!(f, "model error: {e}"),
            TowerErr::Join(e) => write!(f, "tower join error: {e}"),
            TowerErr::InvalidDevices(detail) => write!(f, "invalid device list: {detail}"),
            TowerErr::BatchNotDivisible { batch, devices } => write!(
                f,
                "a global batch of {batch} examples can't be split evenly among {devices} devices"
            ),
            TowerErr::ReuseViolation {
                device,
                bound,
                declared,
            } => write!(
                f,
                "tower on {device} bound {bound} distinct variables, {declared} were declared"
            ),
        }
    }
}

impl Error for TowerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TowerErr::Ml(e) => Some(e),
            TowerErr::Join(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for TowerErr {
    fn from(value: MlErr) -> Self {
        match value {
            MlErr::UnevenSplit { batch, parts } => Self::BatchNotDivisible {
                batch,
                devices: parts,
            },
            other => Self::Ml(other),
        }
    }
}

impl From<JoinError> for TowerErr {
    fn from(value: JoinError) -> Self {
        Self::Join(value)
    }
}
