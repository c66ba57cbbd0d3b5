use rand::Rng;
use rand_distr::{Distribution, Uniform, uniform::Error as UniformError};

use crate::{MlErr, Result};

impl From<UniformError> for MlErr {
    fn from(value: UniformError) -> Self {
        Self::Rand(value.to_string())
    }
}

/// Xavier (Glorot) uniform initialization, `len` values over `[-r, r)` with
/// `r = sqrt(6 / (fan_in + fan_out))`.
///
/// Every variable of a model borrows the same generator, so a declaration pass consumes one seeded
/// stream in declaration order.
///
/// # Returns
/// An error if both fans are zero.
pub(super) fn xavier_uniform<R: Rng>(
    rng: &mut R,
    len: usize,
    fan_in: usize,
    fan_out: usize,
) -> Result<Vec<f32>> {
    let range = (6. / (fan_in + fan_out) as f32).sqrt();
    let distribution = Uniform::new(-range, range)?;

    Ok(distribution.sample_iter(rng).take(len).collect())
}
