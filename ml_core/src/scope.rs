use std::sync::Arc;

use ndarray::ArrayD;
use rand::rngs::StdRng;

use crate::{
    Device, Initializer, MlErr, ParamId, ParameterSet, Regularizer, Result, StatId,
};

/// A tensor bound through a scope: its identity plus a shared handle to its current value.
#[derive(Debug, Clone)]
pub struct Bound<Id> {
    pub id: Id,
    pub value: Arc<ArrayD<f32>>,
}

/// A batch normalization statistic update produced by one tower and applied by the coordinator.
#[derive(Debug, Clone)]
pub struct StatUpdate {
    pub stat: StatId,
    pub device: Device,
    pub value: ArrayD<f32>,
    pub decay: f32,
}

enum Mode<'a> {
    Declare {
        params: &'a mut ParameterSet,
        rng: &'a mut StdRng,
    },
    Reuse {
        params: &'a ParameterSet,
    },
}

/// The handle a model evaluation reads its tensors through.
///
/// A declaring scope creates every tensor it's asked for, a reusing scope binds to tensors that
/// were previously declared and never creates new ones. Neither of them mutates a value that
/// already exists, batch normalization updates are only recorded.
pub struct VariableScope<'a> {
    mode: Mode<'a>,
    device: Device,
    bound: Vec<ParamId>,
    updates: Vec<StatUpdate>,
}

impl<'a> VariableScope<'a> {
    /// Creates a scope that declares and initializes tensors into `params`.
    pub fn declaring(params: &'a mut ParameterSet, rng: &'a mut StdRng, device: Device) -> Self {
        Self {
            mode: Mode::Declare { params, rng },
            device,
            bound: Vec::new(),
            updates: Vec::new(),
        }
    }

    /// Creates a scope that binds to the tensors already declared in `params`.
    pub fn reusing(params: &'a ParameterSet, device: Device) -> Self {
        Self {
            mode: Mode::Reuse { params },
            device,
            bound: Vec::new(),
            updates: Vec::new(),
        }
    }

    pub fn reuse(&self) -> bool {
        matches!(self.mode, Mode::Reuse { .. })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Gets a trainable variable, declaring it if the scope isn't reusing.
    ///
    /// # Arguments
    /// * `name` - The unique name of the variable.
    /// * `shape` - The shape of the variable.
    /// * `init` - How to fill the variable when it's declared.
    /// * `regularizer` - The penalty to register for the variable when it's declared.
    ///
    /// # Returns
    /// The bound variable, or an error if a declaring scope finds the name taken or a reusing
    /// scope finds it missing or with a different shape.
    pub fn get_variable(
        &mut self,
        name: &str,
        shape: &[usize],
        init: Initializer,
        regularizer: Option<Regularizer>,
    ) -> Result<Bound<ParamId>> {
        let (id, value) = match &mut self.mode {
            Mode::Declare { params, rng } => {
                let value = init.generate(shape, &mut **rng)?;
                let id = params.declare_variable(name, value, regularizer)?;
                (id, params.shared_variable(id))
            }
            Mode::Reuse { params } => {
                let id = params.variable_id(name).ok_or_else(|| MlErr::UnknownVariable {
                    name: name.to_string(),
                })?;

                let value = params.shared_variable(id);
                if value.shape() != shape {
                    return Err(MlErr::shape_mismatch(name, shape, value.shape()));
                }

                (id, value)
            }
        };

        self.bound.push(id);
        Ok(Bound { id, value })
    }

    /// Gets a non trainable statistic, declaring it if the scope isn't reusing.
    ///
    /// # Returns
    /// The bound statistic or the same errors as `get_variable`.
    pub fn get_statistic(
        &mut self,
        name: &str,
        shape: &[usize],
        init: Initializer,
    ) -> Result<Bound<StatId>> {
        let (id, value) = match &mut self.mode {
            Mode::Declare { params, rng } => {
                let value = init.generate(shape, &mut **rng)?;
                let id = params.declare_statistic(name, value)?;
                (id, params.shared_statistic(id))
            }
            Mode::Reuse { params } => {
                let id = params.statistic_id(name).ok_or_else(|| MlErr::UnknownVariable {
                    name: name.to_string(),
                })?;

                let value = params.shared_statistic(id);
                if value.shape() != shape {
                    return Err(MlErr::shape_mismatch(name, shape, value.shape()));
                }

                (id, value)
            }
        };

        Ok(Bound { id, value })
    }

    /// Records the batch value of a statistic so it's folded into its moving value once the
    /// step commits, as `moving * decay + value * (1 - decay)`.
    pub fn record_update(&mut self, stat: &Bound<StatId>, value: ArrayD<f32>, decay: f32) -> Result<()> {
        if value.shape() != stat.value.shape() {
            return Err(MlErr::shape_mismatch(
                format!("update of statistic #{}", stat.id.index()),
                value.shape(),
                stat.value.shape(),
            ));
        }

        self.updates.push(StatUpdate {
            stat: stat.id,
            device: self.device,
            value,
            decay,
        });

        Ok(())
    }

    /// The variables bound so far, in binding order.
    pub fn bound(&self) -> &[ParamId] {
        &self.bound
    }

    /// Consumes the scope returning the statistic updates it recorded.
    pub fn into_updates(self) -> Vec<StatUpdate> {
        self.updates
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn reusing_scope_binds_the_declared_value() {
        let mut params = ParameterSet::new();
        let mut rng = StdRng::seed_from_u64(7);

        let declared = {
            let mut scope = VariableScope::declaring(&mut params, &mut rng, Device::new(0));
            assert!(!scope.reuse());
            scope
                .get_variable("w", &[2, 3], Initializer::ONES, None)
                .unwrap()
        };

        let mut scope = VariableScope::reusing(&params, Device::new(1));
        let reused = scope
            .get_variable("w", &[2, 3], Initializer::ZEROS, None)
            .unwrap();

        assert_eq!(declared.id, reused.id);
        assert!(Arc::ptr_eq(&reused.value, &params.shared_variable(reused.id)));
        assert_eq!(scope.bound(), &[reused.id]);
    }

    #[test]
    fn declaring_twice_is_rejected() {
        let mut params = ParameterSet::new();
        let mut rng = StdRng::seed_from_u64(7);
        let mut scope = VariableScope::declaring(&mut params, &mut rng, Device::new(0));

        scope.get_variable("w", &[1], Initializer::ZEROS, None).unwrap();
        let err = scope.get_variable("w", &[1], Initializer::ZEROS, None);

        assert!(matches!(err, Err(MlErr::DuplicateVariable { .. })));
    }

    #[test]
    fn reuse_rejects_unknown_names_and_shapes() {
        let mut params = ParameterSet::new();
        let mut rng = StdRng::seed_from_u64(7);
        VariableScope::declaring(&mut params, &mut rng, Device::new(0))
            .get_variable("w", &[1], Initializer::ZEROS, None)
            .unwrap();

        let mut scope = VariableScope::reusing(&params, Device::new(1));
        assert!(matches!(
            scope.get_variable("v", &[1], Initializer::ZEROS, None),
            Err(MlErr::UnknownVariable { .. })
        ));
        assert!(matches!(
            scope.get_variable("w", &[2], Initializer::ZEROS, None),
            Err(MlErr::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn updates_are_recorded_not_applied() {
        let mut params = ParameterSet::new();
        let mut rng = StdRng::seed_from_u64(7);
        VariableScope::declaring(&mut params, &mut rng, Device::new(0))
            .get_statistic("mean", &[2], Initializer::ZEROS)
            .unwrap();

        let mut scope = VariableScope::reusing(&params, Device::new(1));
        let stat = scope.get_statistic("mean", &[2], Initializer::ZEROS).unwrap();
        scope
            .record_update(&stat, ArrayD::ones(ndarray::IxDyn(&[2])), 0.9)
            .unwrap();

        let updates = scope.into_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].device, Device::new(1));
        assert!(params.statistic(stat.id).value().iter().all(|&v| v == 0.));
    }
}
