use super::{Optimizer, optimizer::check_len};
use crate::{CoordinatorErr, Result};

#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    pub const MOMENTUM: f32 = 0.9;

    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` instance.
    pub fn new(len: usize, momentum: f32) -> Self {
        Self {
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, learning_rate: f32, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len("gradient", grad.len(), params.len())?;
        check_len("velocity", self.velocity.len(), params.len())?;

        let mu = self.momentum;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + g;
                *p -= learning_rate * *v;
            });

        Ok(())
    }

    fn slots(&self) -> Vec<(&'static str, &[f32])> {
        vec![("velocity", &self.velocity[..])]
    }

    fn load_slot(&mut self, slot: &str, values: &[f32]) -> Result<()> {
        if slot != "velocity" {
            return Err(CoordinatorErr::UnknownSlot {
                slot: slot.to_string(),
            });
        }

        check_len(slot, values.len(), self.velocity.len())?;
        self.velocity.copy_from_slice(values);
        Ok(())
    }
}
