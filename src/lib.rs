pub mod checkpoint;
mod config;
pub mod data;
mod error;
pub mod metrics;
pub mod summary;
mod trainer;

pub use checkpoint::{CheckpointManager, CheckpointPointer, SeedReport};
pub use config::TrainConfig;
pub use error::{Result, TrainErr};
pub use trainer::{RunSummary, StopReason, Trainer};
