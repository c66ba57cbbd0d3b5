use ml_core::{MlErr, ParamId, ParameterSet};
use ndarray::ArrayD;
use rayon::prelude::*;

use crate::Result;

/// An exponentially decayed running copy of every trainable variable.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    decay: f32,
    shadow: Vec<ArrayD<f32>>,
}

impl MovingAverage {
    /// Creates a new `MovingAverage` whose shadow starts equal to the variables.
    ///
    /// # Arguments
    /// * `decay` - The upper bound of the decay coefficient.
    /// * `params` - The variables to shadow.
    pub fn new(decay: f32, params: &ParameterSet) -> Self {
        let shadow = params.variables().iter().map(|v| v.value().clone()).collect();
        Self { decay, shadow }
    }

    /// The decay used at `step`, ramped up during the first steps.
    pub fn decay_at(&self, step: u64) -> f32 {
        let step = step as f32;
        self.decay.min((1. + step) / (10. + step))
    }

    /// Moves every shadow towards the current value of its variable.
    pub fn apply(&mut self, params: &ParameterSet, step: u64) -> f32 {
        let decay = self.decay_at(step);

        self.shadow
            .par_iter_mut()
            .zip(params.variables().par_iter())
            .for_each(|(shadow, var)| {
                shadow.zip_mut_with(var.value(), |s, &v| *s -= (1. - decay) * (*s - v));
            });

        decay
    }

    /// The shadow values in declaration order.
    pub fn shadow(&self) -> &[ArrayD<f32>] {
        &self.shadow
    }

    pub fn get(&self, id: ParamId) -> &ArrayD<f32> {
        &self.shadow[id.index()]
    }

    /// Overwrites the shadow of one variable.
    ///
    /// # Returns
    /// A `ShapeMismatch` error if `value` doesn't have the variable's shape.
    pub fn assign(&mut self, id: ParamId, value: ArrayD<f32>) -> Result<()> {
        let shadow = &mut self.shadow[id.index()];
        if shadow.shape() != value.shape() {
            return Err(MlErr::shape_mismatch(
                format!("shadow #{}", id.index()),
                value.shape(),
                shadow.shape(),
            )
            .into());
        }

        *shadow = value;
        Ok(())
    }
}
