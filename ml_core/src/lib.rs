mod batch;
mod device;
mod error;
mod grads;
pub mod initialization;
mod model;
mod params;
pub mod reference;
mod regularization;
mod scope;

pub use batch::Batch;
pub use device::Device;
pub use error::{MlErr, Result};
pub use grads::GradientSet;
pub use initialization::Initializer;
pub use model::{Loss, LossValue, Model, Predictions};
pub use params::{ParamId, ParameterSet, StatId, Statistic, Variable};
pub use regularization::Regularizer;
pub use scope::{Bound, StatUpdate, VariableScope};
