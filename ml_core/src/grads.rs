use std::collections::{HashMap, hash_map::Entry};

use ndarray::ArrayD;

use crate::{MlErr, ParamId, Result};

/// Gradients of a tower's scalar loss, keyed by the identity of the variable they belong to.
#[derive(Debug, Clone, Default)]
pub struct GradientSet {
    grads: HashMap<ParamId, ArrayD<f32>>,
}

impl GradientSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a gradient contribution for a variable, summing it with any previous one.
    ///
    /// # Returns
    /// A `ShapeMismatch` error if a previous contribution has a different shape.
    pub fn accumulate(&mut self, id: ParamId, grad: ArrayD<f32>) -> Result<()> {
        match self.grads.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(grad);
            }
            Entry::Occupied(mut entry) => {
                let acc = entry.get_mut();
                if acc.shape() != grad.shape() {
                    return Err(MlErr::shape_mismatch(
                        format!("gradient #{}", id.index()),
                        grad.shape(),
                        acc.shape(),
                    ));
                }

                *acc += &grad;
            }
        }

        Ok(())
    }

    pub fn get(&self, id: ParamId) -> Option<&ArrayD<f32>> {
        self.grads.get(&id)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}
