use super::{Optimizer, optimizer::check_len};
use crate::{CoordinatorErr, Result};

#[derive(Debug, Default)]
pub struct GradientDescent;

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    pub fn new() -> Self {
        Self
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, learning_rate: f32, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len("gradient", grad.len(), params.len())?;

        for (p, g) in params.iter_mut().zip(grad) {
            *p -= learning_rate * g;
        }

        Ok(())
    }

    fn slots(&self) -> Vec<(&'static str, &[f32])> {
        Vec::new()
    }

    fn load_slot(&mut self, slot: &str, _: &[f32]) -> Result<()> {
        Err(CoordinatorErr::UnknownSlot {
            slot: slot.to_string(),
        })
    }
}
