mod devices;
mod error;
mod runner;

pub use devices::DeviceSet;
pub use error::{Result, TowerErr};
pub use runner::{Diagnostics, StepTowers, TowerOutput, TowerRunner};
