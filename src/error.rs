use std::{error::Error, fmt, io};

use coordinator::CoordinatorErr;
use ml_core::MlErr;
use tower::TowerErr;

use crate::{checkpoint::CheckpointErr, data::BatchSourceErr};

/// The training module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Fatal training failures. Every one of them halts the run.
#[derive(Debug)]
pub enum TrainErr {
    /// Invalid configuration, caught before any device work.
    Config(String),
    Ml(MlErr),
    Tower(TowerErr),
    Coordinator(CoordinatorErr),
    Checkpoint(CheckpointErr),
    BatchSource(BatchSourceErr),
    /// The summary sink couldn't be written.
    Summary(io::Error),
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid config: {msg}"),
            Self::Ml(e) => write!(f, "{e}"),
            Self::Tower(e) => write!(f, "tower failure: {e}"),
            Self::Coordinator(e) => write!(f, "update failure: {e}"),
            Self::Checkpoint(e) => write!(f, "checkpoint failure: {e}"),
            Self::BatchSource(e) => write!(f, "batch source failure: {e}"),
            Self::Summary(e) => write!(f, "summary sink failure: {e}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(_) => None,
            Self::Ml(e) => Some(e),
            Self::Tower(e) => Some(e),
            Self::Coordinator(e) => Some(e),
            Self::Checkpoint(e) => Some(e),
            Self::BatchSource(e) => Some(e),
            Self::Summary(e) => Some(e),
        }
    }
}

impl From<MlErr> for TrainErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<TowerErr> for TrainErr {
    fn from(value: TowerErr) -> Self {
        Self::Tower(value)
    }
}

impl From<CoordinatorErr> for TrainErr {
    fn from(value: CoordinatorErr) -> Self {
        Self::Coordinator(value)
    }
}

impl From<CheckpointErr> for TrainErr {
    fn from(value: CheckpointErr) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<BatchSourceErr> for TrainErr {
    fn from(value: BatchSourceErr) -> Self {
        Self::BatchSource(value)
    }
}
