use std::{collections::HashMap, sync::Arc};

use ndarray::ArrayD;

use crate::{MlErr, Regularizer, Result};

/// The identity of a trainable variable, its position in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub(crate) usize);

impl ParamId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The identity of a non trainable statistic, its position in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatId(pub(crate) usize);

impl StatId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Variable(ParamId),
    Statistic(StatId),
}

/// A trainable tensor.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    value: Arc<ArrayD<f32>>,
    regularizer: Option<Regularizer>,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn regularizer(&self) -> Option<Regularizer> {
        self.regularizer
    }
}

/// A non trainable tensor, such as the running statistics of a batch normalization layer.
#[derive(Debug, Clone)]
pub struct Statistic {
    name: String,
    value: Arc<ArrayD<f32>>,
}

impl Statistic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }
}

/// The complete collection of the model's tensors.
///
/// Values are reference counted, cloning a `ParameterSet` is cheap and every clone observes
/// the same tensors until one of them is mutated, which copies the mutated tensor only if it's
/// still shared.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    variables: Vec<Variable>,
    statistics: Vec<Statistic>,
    index: HashMap<String, Slot>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the amount of trainable variables.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.statistics.is_empty()
    }

    /// Returns the total amount of trainable scalars.
    pub fn num_elements(&self) -> usize {
        self.variables.iter().map(|v| v.value.len()).sum()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Declares a new trainable variable.
    ///
    /// # Arguments
    /// * `name` - The unique name of the variable.
    /// * `value` - The initial value.
    /// * `regularizer` - An optional penalty added to the training loss.
    ///
    /// # Returns
    /// The identity of the variable or `DuplicateVariable` if the name is taken.
    pub fn declare_variable(
        &mut self,
        name: &str,
        value: ArrayD<f32>,
        regularizer: Option<Regularizer>,
    ) -> Result<ParamId> {
        self.reserve(name)?;

        let id = ParamId(self.variables.len());
        self.index.insert(name.to_string(), Slot::Variable(id));
        self.variables.push(Variable {
            name: name.to_string(),
            value: Arc::new(value.as_standard_layout().into_owned()),
            regularizer,
        });

        Ok(id)
    }

    /// Declares a new non trainable statistic.
    ///
    /// # Returns
    /// The identity of the statistic or `DuplicateVariable` if the name is taken.
    pub fn declare_statistic(&mut self, name: &str, value: ArrayD<f32>) -> Result<StatId> {
        self.reserve(name)?;

        let id = StatId(self.statistics.len());
        self.index.insert(name.to_string(), Slot::Statistic(id));
        self.statistics.push(Statistic {
            name: name.to_string(),
            value: Arc::new(value.as_standard_layout().into_owned()),
        });

        Ok(id)
    }

    fn reserve(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            return Err(MlErr::DuplicateVariable {
                name: name.to_string(),
            });
        }

        Ok(())
    }

    pub fn variable_id(&self, name: &str) -> Option<ParamId> {
        match self.index.get(name)? {
            Slot::Variable(id) => Some(*id),
            Slot::Statistic(_) => None,
        }
    }

    pub fn statistic_id(&self, name: &str) -> Option<StatId> {
        match self.index.get(name)? {
            Slot::Statistic(id) => Some(*id),
            Slot::Variable(_) => None,
        }
    }

    /// The identities of the trainable variables in declaration order.
    pub fn variable_ids(&self) -> impl Iterator<Item = ParamId> + use<> {
        (0..self.variables.len()).map(ParamId)
    }

    /// The trainable variables in declaration order.
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// The statistics in declaration order.
    pub fn statistics(&self) -> &[Statistic] {
        &self.statistics
    }

    pub fn variable(&self, id: ParamId) -> &Variable {
        &self.variables[id.0]
    }

    pub fn statistic(&self, id: StatId) -> &Statistic {
        &self.statistics[id.0]
    }

    pub(crate) fn shared_variable(&self, id: ParamId) -> Arc<ArrayD<f32>> {
        Arc::clone(&self.variables[id.0].value)
    }

    pub(crate) fn shared_statistic(&self, id: StatId) -> Arc<ArrayD<f32>> {
        Arc::clone(&self.statistics[id.0].value)
    }

    /// Mutable access to a variable's tensor, copying it first if someone else still reads it.
    pub fn variable_mut(&mut self, id: ParamId) -> &mut ArrayD<f32> {
        Arc::make_mut(&mut self.variables[id.0].value)
    }

    /// Mutable access to every variable's tensor, in declaration order.
    pub fn variables_mut(&mut self) -> impl Iterator<Item = &mut ArrayD<f32>> {
        self.variables.iter_mut().map(|v| Arc::make_mut(&mut v.value))
    }

    /// Mutable access to a statistic's tensor, copying it first if someone else still reads it.
    pub fn statistic_mut(&mut self, id: StatId) -> &mut ArrayD<f32> {
        Arc::make_mut(&mut self.statistics[id.0].value)
    }

    /// Overwrites a variable's value.
    ///
    /// # Returns
    /// A `ShapeMismatch` error if `value` doesn't have the variable's shape.
    pub fn assign_variable(&mut self, id: ParamId, value: ArrayD<f32>) -> Result<()> {
        let var = &mut self.variables[id.0];
        if var.value.shape() != value.shape() {
            return Err(MlErr::shape_mismatch(&var.name, value.shape(), var.value.shape()));
        }

        var.value = Arc::new(value.as_standard_layout().into_owned());
        Ok(())
    }

    /// Overwrites a statistic's value.
    ///
    /// # Returns
    /// A `ShapeMismatch` error if `value` doesn't have the statistic's shape.
    pub fn assign_statistic(&mut self, id: StatId, value: ArrayD<f32>) -> Result<()> {
        let stat = &mut self.statistics[id.0];
        if stat.value.shape() != value.shape() {
            return Err(MlErr::shape_mismatch(&stat.name, value.shape(), stat.value.shape()));
        }

        stat.value = Arc::new(value.as_standard_layout().into_owned());
        Ok(())
    }

    /// Whether both sets declare the same names and shapes and hold the same values.
    pub fn values_eq(&self, other: &ParameterSet) -> bool {
        let vars = self.variables.len() == other.variables.len()
            && self
                .variables
                .iter()
                .zip(&other.variables)
                .all(|(a, b)| a.name == b.name && a.value == b.value);

        let stats = self.statistics.len() == other.statistics.len()
            && self
                .statistics
                .iter()
                .zip(&other.statistics)
                .all(|(a, b)| a.name == b.name && a.value == b.value);

        vars && stats
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn zeros(shape: &[usize]) -> ArrayD<f32> {
        ArrayD::zeros(IxDyn(shape))
    }

    #[test]
    fn declaration_order_is_identity() {
        let mut params = ParameterSet::new();
        let a = params.declare_variable("a", zeros(&[2]), None).unwrap();
        let s = params.declare_statistic("s", zeros(&[1])).unwrap();
        let b = params.declare_variable("b", zeros(&[3, 3]), None).unwrap();

        assert_eq!((a.index(), b.index(), s.index()), (0, 1, 0));
        assert_eq!(params.variable_id("b"), Some(b));
        assert_eq!(params.variable_id("s"), None);
        assert_eq!(params.statistic_id("s"), Some(s));
        assert_eq!(params.num_elements(), 11);
    }

    #[test]
    fn names_are_unique_across_kinds() {
        let mut params = ParameterSet::new();
        params.declare_variable("w", zeros(&[1]), None).unwrap();

        assert!(matches!(
            params.declare_statistic("w", zeros(&[1])),
            Err(MlErr::DuplicateVariable { .. })
        ));
    }

    #[test]
    fn clones_are_isolated_from_mutation() {
        let mut params = ParameterSet::new();
        let id = params.declare_variable("w", zeros(&[2]), None).unwrap();
        let snapshot = params.clone();

        params.variable_mut(id).fill(1.);

        assert_eq!(snapshot.variable(id).value(), &zeros(&[2]));
        assert!(!snapshot.values_eq(&params));
    }

    #[test]
    fn assign_checks_shape() {
        let mut params = ParameterSet::new();
        let id = params.declare_variable("w", zeros(&[2]), None).unwrap();
        assert!(params.assign_variable(id, zeros(&[3])).is_err());
        assert!(params.assign_variable(id, zeros(&[2])).is_ok());
    }
}
