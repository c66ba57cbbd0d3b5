use std::slice;

use super::{Optimizer, optimizer::check_len};
use crate::{CoordinatorErr, Result};

#[derive(Debug)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    v: Box<[f32]>,
    s: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    pub const BETA1: f32 = 0.9;
    pub const BETA2: f32 = 0.999;
    pub const EPSILON: f32 = 1e-8;

    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(len: usize, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, learning_rate: f32, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len("gradient", grad.len(), params.len())?;
        check_len("adam moments", self.v.len(), params.len())?;

        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = learning_rate * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });

        Ok(())
    }

    fn slots(&self) -> Vec<(&'static str, &[f32])> {
        vec![
            ("m", &self.v[..]),
            ("v", &self.s[..]),
            ("beta1_power", slice::from_ref(&self.beta1_t)),
            ("beta2_power", slice::from_ref(&self.beta2_t)),
        ]
    }

    fn load_slot(&mut self, slot: &str, values: &[f32]) -> Result<()> {
        let buf = match slot {
            "m" => &mut self.v[..],
            "v" => &mut self.s[..],
            "beta1_power" => slice::from_mut(&mut self.beta1_t),
            "beta2_power" => slice::from_mut(&mut self.beta2_t),
            _ => {
                return Err(CoordinatorErr::UnknownSlot {
                    slot: slot.to_string(),
                });
            }
        };

        check_len(slot, values.len(), buf.len())?;
        buf.copy_from_slice(values);
        Ok(())
    }
}
