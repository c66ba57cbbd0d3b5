mod coordinator;
mod error;
mod moving_average;
pub mod optimization;
mod reduction;
mod schedule;

pub use coordinator::{StateMut, StepReport, UpdateCoordinator};
pub use error::{CoordinatorErr, Result};
pub use moving_average::MovingAverage;
pub use reduction::GradientReducer;
pub use schedule::LearningRateSchedule;
