use ndarray::ArrayD;

/// A penalty registered alongside a variable and added to every tower's loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Regularizer {
    /// `scale * sum(w^2) / 2`.
    L2 { scale: f32 },
}

impl Regularizer {
    /// Computes the penalty term for the given value of the variable.
    pub fn penalty(&self, value: &ArrayD<f32>) -> f32 {
        match *self {
            Regularizer::L2 { scale } => scale * value.iter().map(|w| w * w).sum::<f32>() / 2.,
        }
    }

    /// Computes the gradient of the penalty term with respect to the variable.
    pub fn gradient(&self, value: &ArrayD<f32>) -> ArrayD<f32> {
        match *self {
            Regularizer::L2 { scale } => value.mapv(|w| scale * w),
        }
    }
}
