mod adam;
mod gradient_descent;
mod gradient_descent_with_momentum;
mod optimizer;

pub use adam::Adam;
pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use optimizer::Optimizer;

use serde::{Deserialize, Serialize};

/// Which optimizer updates the variables, and its hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerSpec {
    Adam {
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    GradientDescent,
    GradientDescentWithMomentum {
        #[serde(default = "default_momentum")]
        momentum: f32,
    },
}

fn default_beta1() -> f32 {
    Adam::BETA1
}

fn default_beta2() -> f32 {
    Adam::BETA2
}

fn default_epsilon() -> f32 {
    Adam::EPSILON
}

fn default_momentum() -> f32 {
    GradientDescentWithMomentum::MOMENTUM
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        Self::Adam {
            beta1: Adam::BETA1,
            beta2: Adam::BETA2,
            epsilon: Adam::EPSILON,
        }
    }
}
