use crate::Result;

/// Defines the strategy for updating model parameters based on calculated gradients.
///
/// One instance owns the state of exactly one trainable variable.
pub trait Optimizer: Send {
    /// Updates the provided slice of parameters using the averaged gradient.
    ///
    /// # Arguments
    /// * `learning_rate` - The learning rate of the current step.
    /// * `grad` - The averaged gradient corresponding to the `params` slice.
    /// * `params` - The current values of the variable.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad`, `params` and the inner state.
    fn update_params(&mut self, learning_rate: f32, grad: &[f32], params: &mut [f32]) -> Result<()>;

    /// Returns the named state buffers of the optimizer, used to persist it.
    fn slots(&self) -> Vec<(&'static str, &[f32])>;

    /// Overwrites a state buffer previously returned by `slots`.
    ///
    /// # Returns
    /// An error if the slot doesn't exist or `values` has the wrong length.
    fn load_slot(&mut self, slot: &str, values: &[f32]) -> Result<()>;
}

pub(super) fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(crate::CoordinatorErr::SizeMismatch {
            what: what.to_string(),
            got,
            expected,
        });
    }

    Ok(())
}
