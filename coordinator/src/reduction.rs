use ml_core::{GradientSet, ParameterSet};
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;

use crate::{CoordinatorErr, Result};

/// Averages the gradients every tower computed for the same step.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientReducer;

impl GradientReducer {
    /// Computes the elementwise mean of the towers' gradients for every trainable variable.
    ///
    /// Gradients are matched by variable identity, the position of a gradient inside a tower's
    /// set is irrelevant.
    ///
    /// # Arguments
    /// * `params` - The parameter set the gradients were computed against.
    /// * `towers` - One gradient set per tower, in device order.
    ///
    /// # Returns
    /// One averaged gradient per trainable variable in declaration order, or an error if any
    /// tower is missing a gradient or has an unexpected one.
    pub fn average(params: &ParameterSet, towers: &[GradientSet]) -> Result<Vec<ArrayD<f32>>> {
        if towers.is_empty() {
            return Err(CoordinatorErr::NoTowers);
        }

        for (i, grads) in towers.iter().enumerate() {
            if grads.len() > params.len() {
                return Err(CoordinatorErr::SizeMismatch {
                    what: format!("gradients of tower {i}"),
                    got: grads.len(),
                    expected: params.len(),
                });
            }
        }

        let count = towers.len() as f32;
        let ids: Vec<_> = params.variable_ids().collect();

        ids.into_par_iter()
            .map(|id| {
                let var = params.variable(id);
                let mut sum = ArrayD::<f32>::zeros(IxDyn(var.shape()));

                for (tower, grads) in towers.iter().enumerate() {
                    let grad = grads.get(id).ok_or_else(|| CoordinatorErr::MissingGradient {
                        name: var.name().to_string(),
                        tower,
                    })?;

                    if grad.shape() != var.shape() {
                        return Err(ml_core::MlErr::shape_mismatch(
                            format!("gradient of {} from tower {tower}", var.name()),
                            grad.shape(),
                            var.shape(),
                        )
                        .into());
                    }

                    sum += grad;
                }

                sum /= count;
                Ok(sum)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ml_core::{Device, Initializer, VariableScope};
    use ndarray::{ArrayD, IxDyn, arr1};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn params() -> (ParameterSet, Vec<ml_core::ParamId>) {
        let mut params = ParameterSet::new();
        let mut rng = StdRng::seed_from_u64(0);
        let mut scope = VariableScope::declaring(&mut params, &mut rng, Device::new(0));
        let a = scope.get_variable("a", &[2], Initializer::ZEROS, None).unwrap().id;
        let b = scope.get_variable("b", &[1], Initializer::ZEROS, None).unwrap().id;
        drop(scope);
        (params, vec![a, b])
    }

    #[test]
    fn single_tower_is_identity() {
        let (params, ids) = params();
        let mut grads = GradientSet::new();
        grads.accumulate(ids[1], arr1(&[3.]).into_dyn()).unwrap();
        grads.accumulate(ids[0], arr1(&[1., -2.]).into_dyn()).unwrap();

        let averaged = GradientReducer::average(&params, &[grads]).unwrap();

        assert_eq!(averaged, vec![arr1(&[1., -2.]).into_dyn(), arr1(&[3.]).into_dyn()]);
    }

    #[test]
    fn four_towers_average_elementwise() {
        let (params, ids) = params();
        let towers: Vec<_> = (0..4)
            .map(|t| {
                let mut grads = GradientSet::new();
                let t = t as f32;
                grads.accumulate(ids[0], arr1(&[t, 10. * t]).into_dyn()).unwrap();
                grads.accumulate(ids[1], ArrayD::from_elem(IxDyn(&[1]), 1.)).unwrap();
                grads
            })
            .collect();

        let averaged = GradientReducer::average(&params, &towers).unwrap();

        assert_eq!(averaged[0], arr1(&[1.5, 15.]).into_dyn());
        assert_eq!(averaged[1], arr1(&[1.]).into_dyn());
    }

    #[test]
    fn missing_gradients_are_reported() {
        let (params, ids) = params();
        let mut grads = GradientSet::new();
        grads.accumulate(ids[0], arr1(&[1., 1.]).into_dyn()).unwrap();

        let err = GradientReducer::average(&params, &[grads]).unwrap_err();
        assert!(matches!(err, CoordinatorErr::MissingGradient { tower: 0, .. }));
        assert!(matches!(
            GradientReducer::average(&params, &[]),
            Err(CoordinatorErr::NoTowers)
        ));
    }
}
