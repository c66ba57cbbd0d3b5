use std::num::NonZeroU64;

/// An exponentially decaying learning rate, recomputed from the step counter on every step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    base: f32,
    decay_rate: f32,
    decay_steps: NonZeroU64,
    staircase: bool,
}

impl LearningRateSchedule {
    /// Creates a new `LearningRateSchedule`.
    ///
    /// # Arguments
    /// * `base` - The learning rate at step zero.
    /// * `decay_rate` - The factor applied every `decay_steps` steps.
    /// * `decay_steps` - The length of a decay period.
    /// * `staircase` - Whether the exponent is floored, decaying in discrete plateaus.
    pub fn new(base: f32, decay_rate: f32, decay_steps: NonZeroU64, staircase: bool) -> Self {
        Self {
            base,
            decay_rate,
            decay_steps,
            staircase,
        }
    }

    /// The learning rate at `step`, `base * decay_rate ^ (step / decay_steps)`.
    pub fn rate(&self, step: u64) -> f32 {
        let periods = self.decay_steps.get();
        let exponent = if self.staircase {
            (step / periods) as f64
        } else {
            step as f64 / periods as f64
        };

        (self.base as f64 * (self.decay_rate as f64).powf(exponent)) as f32
    }
}
