mod random;

use ndarray::{ArrayD, IxDyn};
use rand::Rng;

use crate::Result;

/// How a variable is filled when it's first declared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Const(f32),
    XavierUniform { fan_in: usize, fan_out: usize },
}

impl Initializer {
    pub const ZEROS: Self = Self::Const(0.);
    pub const ONES: Self = Self::Const(1.);

    /// Generates a freshly initialized tensor.
    ///
    /// # Arguments
    /// * `shape` - The shape of the tensor.
    /// * `rng` - The random number generator shared by the whole declaration pass.
    ///
    /// # Returns
    /// The tensor or an `MlErr::Rand` if the initializer's arguments are invalid.
    pub fn generate<R: Rng>(&self, shape: &[usize], rng: &mut R) -> Result<ArrayD<f32>> {
        let limit = shape.iter().product();

        let values = match *self {
            Initializer::Const(value) => vec![value; limit],
            Initializer::XavierUniform { fan_in, fan_out } => {
                random::xavier_uniform(rng, limit, fan_in, fan_out)?
            }
        };

        Ok(ArrayD::from_shape_vec(IxDyn(shape), values)?)
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn generates_the_requested_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let tensor = Initializer::XavierUniform { fan_in: 3, fan_out: 5 }
            .generate(&[3, 5], &mut rng)
            .unwrap();

        assert_eq!(tensor.shape(), [3, 5]);
    }

    #[test]
    fn same_seed_same_values() {
        let init = Initializer::XavierUniform {
            fan_in: 4,
            fan_out: 4,
        };

        let a = init.generate(&[4, 4], &mut StdRng::seed_from_u64(1)).unwrap();
        let b = init.generate(&[4, 4], &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn scalars_and_empty_tensors() {
        let mut rng = StdRng::seed_from_u64(0);
        let scalar = Initializer::ONES.generate(&[], &mut rng).unwrap();
        assert_eq!(scalar.len(), 1);

        let empty = Initializer::ZEROS.generate(&[0, 3], &mut rng).unwrap();
        assert!(empty.is_empty());
    }
}
