use std::sync::Arc;

use log::debug;
use ml_core::{MlErr, ParameterSet, StatUpdate};
use ndarray::ArrayD;
use rayon::prelude::*;

use crate::{CoordinatorErr, LearningRateSchedule, MovingAverage, Result, optimization::Optimizer};

/// What a committed step did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// The value of the step counter after the commit.
    pub step: u64,
    pub learning_rate: f32,
    pub shadow_decay: f32,
}

/// The only owner of the mutable training state.
///
/// Towers read immutable snapshots of the parameter set, every mutation happens inside `apply`
/// after the step's gradients were reduced.
#[derive(Debug)]
pub struct UpdateCoordinator<O: Optimizer> {
    params: ParameterSet,
    shadow: MovingAverage,
    optimizers: Vec<O>,
    schedule: LearningRateSchedule,
    step: u64,
}

impl<O: Optimizer> UpdateCoordinator<O> {
    /// Creates a new `UpdateCoordinator` at step zero.
    ///
    /// # Arguments
    /// * `params` - The freshly initialized parameter set.
    /// * `schedule` - The learning rate schedule.
    /// * `moving_average_decay` - The decay of the moving average shadow.
    /// * `optimizer_factory` - Creates the optimizer state of a variable given its length.
    pub fn new<F>(
        params: ParameterSet,
        schedule: LearningRateSchedule,
        moving_average_decay: f32,
        mut optimizer_factory: F,
    ) -> Self
    where
        F: FnMut(usize) -> O,
    {
        let optimizers = params
            .variables()
            .iter()
            .map(|var| optimizer_factory(var.value().len()))
            .collect();

        Self {
            shadow: MovingAverage::new(moving_average_decay, &params),
            params,
            optimizers,
            schedule,
            step: 0,
        }
    }

    /// The amount of completed updates.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// The learning rate the next update will use.
    pub fn learning_rate(&self) -> f32 {
        self.schedule.rate(self.step)
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    /// A shared read only view of the current parameters for the towers of the next step.
    pub fn snapshot(&self) -> Arc<ParameterSet> {
        Arc::new(self.params.clone())
    }

    pub fn shadow(&self) -> &MovingAverage {
        &self.shadow
    }

    /// The optimizer state of every variable, in declaration order.
    pub fn optimizers(&self) -> &[O] {
        &self.optimizers
    }

    /// Mutable access to the whole state, used to restore or seed it between steps.
    pub fn state_mut(&mut self) -> StateMut<'_, O> {
        StateMut {
            params: &mut self.params,
            shadow: &mut self.shadow,
            optimizers: &mut self.optimizers,
            step: &mut self.step,
        }
    }

    /// Commits one training step.
    ///
    /// The optimizer step, the moving average update and the batch normalization updates are
    /// applied in that order and only then the step counter advances. Nothing is mutated if the
    /// step is rejected.
    ///
    /// # Arguments
    /// * `averaged` - The averaged gradient of every variable, in declaration order.
    /// * `updates` - The batch normalization updates of every tower, in device order.
    /// * `total_loss` - The total loss of the step.
    ///
    /// # Returns
    /// A report of the commit, `Diverged` if `total_loss` isn't finite or a size error if the
    /// inputs don't match the parameter set.
    pub fn apply(
        &mut self,
        averaged: Vec<ArrayD<f32>>,
        updates: &[StatUpdate],
        total_loss: f32,
    ) -> Result<StepReport> {
        if !total_loss.is_finite() {
            return Err(CoordinatorErr::Diverged {
                step: self.step,
                loss: total_loss,
            });
        }

        self.validate(&averaged, updates)?;

        let learning_rate = self.schedule.rate(self.step);
        let mut values: Vec<_> = self.params.variables_mut().collect();

        values
            .par_iter_mut()
            .zip(self.optimizers.par_iter_mut())
            .zip(averaged.par_iter())
            .try_for_each(|((value, optimizer), grad)| {
                let grad = grad.as_standard_layout();
                let (Some(grad), Some(params)) = (grad.as_slice(), value.as_slice_mut()) else {
                    return Err(CoordinatorErr::NonContiguous {
                        name: "variable".to_string(),
                    });
                };

                optimizer.update_params(learning_rate, grad, params)
            })?;

        let shadow_decay = self.shadow.apply(&self.params, self.step);

        for update in updates {
            let decay = update.decay;
            self.params
                .statistic_mut(update.stat)
                .zip_mut_with(&update.value, |m, &b| *m = *m * decay + b * (1. - decay));
        }

        self.step += 1;

        debug!(
            step = self.step,
            learning_rate = learning_rate,
            shadow_decay = shadow_decay;
            "committed update"
        );

        Ok(StepReport {
            step: self.step,
            learning_rate,
            shadow_decay,
        })
    }

    fn validate(&self, averaged: &[ArrayD<f32>], updates: &[StatUpdate]) -> Result<()> {
        if averaged.len() != self.params.len() {
            return Err(CoordinatorErr::SizeMismatch {
                what: "averaged gradients".to_string(),
                got: averaged.len(),
                expected: self.params.len(),
            });
        }

        for (grad, var) in averaged.iter().zip(self.params.variables()) {
            if grad.shape() != var.shape() {
                return Err(MlErr::shape_mismatch(var.name(), grad.shape(), var.shape()).into());
            }
        }

        for update in updates {
            let stat = self
                .params
                .statistics()
                .get(update.stat.index())
                .ok_or(CoordinatorErr::SizeMismatch {
                    what: "statistics".to_string(),
                    got: update.stat.index() + 1,
                    expected: self.params.statistics().len(),
                })?;

            if stat.value().shape() != update.value.shape() {
                return Err(
                    MlErr::shape_mismatch(stat.name(), update.value.shape(), stat.value().shape())
                        .into(),
                );
            }
        }

        Ok(())
    }
}

/// Borrowed mutable state of an `UpdateCoordinator`.
pub struct StateMut<'a, O> {
    pub params: &'a mut ParameterSet,
    pub shadow: &'a mut MovingAverage,
    pub optimizers: &'a mut [O],
    pub step: &'a mut u64,
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;

    use ml_core::{Device, Initializer, StatId, VariableScope};
    use ndarray::{IxDyn, arr1};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::optimization::GradientDescent;

    fn coordinator() -> (UpdateCoordinator<GradientDescent>, StatId) {
        let mut params = ParameterSet::new();
        let mut rng = StdRng::seed_from_u64(0);
        let mut scope = VariableScope::declaring(&mut params, &mut rng, Device::new(0));
        scope.get_variable("w", &[2], Initializer::ONES, None).unwrap();
        let stat = scope.get_statistic("mean", &[1], Initializer::ZEROS).unwrap().id;
        drop(scope);

        let schedule = LearningRateSchedule::new(0.5, 0.1, NonZeroU64::new(2).unwrap(), true);
        let coordinator = UpdateCoordinator::new(params, schedule, 0.997, |_| GradientDescent);
        (coordinator, stat)
    }

    fn update(stat: StatId, device: usize, value: f32) -> StatUpdate {
        StatUpdate {
            stat,
            device: Device::new(device),
            value: ArrayD::from_elem(IxDyn(&[1]), value),
            decay: 0.5,
        }
    }

    #[test]
    fn commit_applies_every_effect_once() {
        let (mut coordinator, stat) = coordinator();
        let updates = [update(stat, 0, 4.), update(stat, 1, 8.)];

        let report = coordinator
            .apply(vec![arr1(&[1., -1.]).into_dyn()], &updates, 1.)
            .unwrap();

        assert_eq!(report.step, 1);
        assert_eq!(report.learning_rate, 0.5);
        assert_eq!(coordinator.step(), 1);
        assert_eq!(coordinator.params().variables()[0].value(), &arr1(&[0.5, 1.5]).into_dyn());
        // ((0 * .5 + 4 * .5) * .5 + 8 * .5)
        assert_eq!(coordinator.params().statistic(stat).value()[[0]], 5.);

        let shadow = coordinator.shadow().shadow()[0].clone();
        assert!((shadow - arr1(&[0.55, 1.45]).into_dyn()).iter().all(|d| d.abs() < 1e-6));
    }

    #[test]
    fn learning_rate_follows_the_step_counter() {
        let (mut coordinator, _) = coordinator();
        let zero = || vec![arr1(&[0., 0.]).into_dyn()];

        coordinator.apply(zero(), &[], 1.).unwrap();
        assert_eq!(coordinator.learning_rate(), 0.5);
        coordinator.apply(zero(), &[], 1.).unwrap();
        assert!((coordinator.learning_rate() - 0.05).abs() < 1e-7);
    }

    #[test]
    fn divergence_commits_nothing() {
        let (mut coordinator, stat) = coordinator();
        let before = coordinator.params().clone();

        let err = coordinator
            .apply(vec![arr1(&[1., 1.]).into_dyn()], &[update(stat, 0, 1.)], f32::NAN)
            .unwrap_err();

        assert!(matches!(err, CoordinatorErr::Diverged { step: 0, .. }));
        assert_eq!(coordinator.step(), 0);
        assert!(coordinator.params().values_eq(&before));
    }

    #[test]
    fn mismatched_inputs_commit_nothing() {
        let (mut coordinator, stat) = coordinator();
        let before = coordinator.params().clone();
        let mut bad = update(stat, 0, 1.);
        bad.value = ArrayD::zeros(IxDyn(&[3]));

        assert!(coordinator.apply(vec![arr1(&[1., 1.]).into_dyn()], &[bad], 1.).is_err());
        assert!(coordinator.apply(vec![], &[], 1.).is_err());
        assert_eq!(coordinator.step(), 0);
        assert!(coordinator.params().values_eq(&before));
    }

    #[test]
    fn snapshots_are_not_affected_by_later_updates() {
        let (mut coordinator, _) = coordinator();
        let snapshot = coordinator.snapshot();

        coordinator.apply(vec![arr1(&[1., 1.]).into_dyn()], &[], 1.).unwrap();

        assert_eq!(snapshot.variables()[0].value(), &arr1(&[1., 1.]).into_dyn());
    }
}
