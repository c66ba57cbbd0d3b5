use std::sync::Arc;

use log::debug;
use ml_core::{
    Batch, Device, GradientSet, Loss, Model, ParamId, ParameterSet, Predictions, StatUpdate,
    VariableScope,
};
use rand::rngs::StdRng;
use tokio::task::JoinSet;

use crate::{DeviceSet, Result, TowerErr};

/// What one tower produced for a step.
#[derive(Debug)]
pub struct TowerOutput {
    pub device: Device,
    /// Gradients of `total_loss` with respect to every trainable variable.
    pub grads: GradientSet,
    /// The loss of the shard as computed by the loss evaluator.
    pub model_loss: f32,
    /// `model_loss` plus every registered regularization term.
    pub total_loss: f32,
    /// Batch normalization updates recorded by the tower, not yet applied.
    pub updates: Vec<StatUpdate>,
}

/// The outputs of every tower of one step, in device order.
#[derive(Debug)]
pub struct StepTowers {
    outputs: Vec<TowerOutput>,
    lead_shard: Batch,
}

impl StepTowers {
    pub fn outputs(&self) -> &[TowerOutput] {
        &self.outputs
    }

    /// The output of the first device, the one designated for metrics.
    pub fn lead(&self) -> &TowerOutput {
        &self.outputs[0]
    }

    /// The shard of the batch the first device computed on.
    pub fn lead_shard(&self) -> &Batch {
        &self.lead_shard
    }

    /// The mean total loss over every tower, not finite if any tower's isn't.
    pub fn mean_total_loss(&self) -> f32 {
        let sum: f32 = self.outputs.iter().map(|o| o.total_loss).sum();
        sum / self.outputs.len() as f32
    }

    /// Splits the outputs into the per tower gradients and every batch normalization update.
    pub fn into_parts(self) -> (Vec<GradientSet>, Vec<StatUpdate>, Batch) {
        let mut grads = Vec::with_capacity(self.outputs.len());
        let mut updates = Vec::new();

        for output in self.outputs {
            grads.push(output.grads);
            updates.extend(output.updates);
        }

        (grads, updates, self.lead_shard)
    }
}

/// The result of a side effect free forward pass, used for summaries.
#[derive(Debug)]
pub struct Diagnostics {
    pub model_loss: f32,
    pub total_loss: f32,
    pub predictions: Predictions,
}

/// Runs one tower per device over equal shards of a global batch.
///
/// Every tower reads the same shared parameter set and nothing else, the model and the loss are
/// shared through reference counting and evaluated on the blocking pool.
pub struct TowerRunner<M, L> {
    model: Arc<M>,
    loss: Arc<L>,
    devices: DeviceSet,
}

impl<M, L> TowerRunner<M, L>
where
    M: Model + 'static,
    L: Loss + 'static,
{
    /// Creates a new `TowerRunner`.
    ///
    /// # Arguments
    /// * `model` - The model every tower evaluates.
    /// * `loss` - The training objective.
    /// * `devices` - The devices to spread each step over.
    pub fn new(model: M, loss: L, devices: DeviceSet) -> Self {
        Self {
            model: Arc::new(model),
            loss: Arc::new(loss),
            devices,
        }
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Declares and initializes the parameter set.
    ///
    /// The first device evaluates its shard of `probe` with a declaring scope, every other
    /// device evaluates its shard with a reusing scope and must bind exactly the declared
    /// variables.
    ///
    /// # Arguments
    /// * `probe` - A batch with the shapes of the training batches.
    /// * `rng` - The random number generator for the initializers.
    ///
    /// # Returns
    /// The freshly initialized parameter set, or an error if any tower breaks the reuse rules.
    pub fn build(&self, probe: &Batch, rng: &mut StdRng) -> Result<ParameterSet> {
        self.devices.check_divisible(probe.len())?;
        let shards = probe.split(self.devices.len())?;

        let mut params = ParameterSet::new();
        let mut devices = self.devices.iter().zip(&shards);

        if let Some((device, shard)) = devices.next() {
            let mut scope = VariableScope::declaring(&mut params, rng, device);
            self.model.evaluate(&mut scope, shard.images())?;
        }

        for (device, shard) in devices {
            let mut scope = VariableScope::reusing(&params, device);
            self.model.evaluate(&mut scope, shard.images())?;
            check_reuse(&params, device, scope.bound())?;
        }

        debug!(
            devices = self.devices.len(),
            variables = params.len(),
            scalars = params.num_elements();
            "built towers"
        );

        Ok(params)
    }

    /// Runs every tower of one training step concurrently and waits for all of them.
    ///
    /// # Arguments
    /// * `params` - The snapshot of the parameters for this step.
    /// * `batch` - The global batch, split into one contiguous shard per device.
    ///
    /// # Returns
    /// Every tower's output in device order, or the first error any tower produced.
    pub async fn run_step(&self, params: Arc<ParameterSet>, batch: Batch) -> Result<StepTowers> {
        self.devices.check_divisible(batch.len())?;
        let mut shards = batch.split(self.devices.len())?;
        let lead_shard = shards[0].clone();

        let mut tasks = JoinSet::new();
        for (i, (device, shard)) in self.devices.iter().zip(shards.drain(..)).enumerate() {
            let model = Arc::clone(&self.model);
            let loss = Arc::clone(&self.loss);
            let params = Arc::clone(&params);

            tasks.spawn_blocking(move || {
                run_tower(&*model, &*loss, &params, device, shard).map(|output| (i, output))
            });
        }

        let mut slots: Vec<Option<TowerOutput>> = (0..self.devices.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (i, output) = joined??;
            debug!(
                device = output.device.ordinal(),
                model_loss = output.model_loss,
                total_loss = output.total_loss;
                "tower finished"
            );
            slots[i] = Some(output);
        }

        let outputs = slots.into_iter().flatten().collect();
        Ok(StepTowers {
            outputs,
            lead_shard,
        })
    }

    /// Evaluates the model and the loss on a shard without computing gradients or keeping any
    /// batch normalization update.
    ///
    /// # Arguments
    /// * `params` - The parameters to evaluate with.
    /// * `shard` - The examples to evaluate.
    pub async fn diagnose(&self, params: Arc<ParameterSet>, shard: Batch) -> Result<Diagnostics> {
        let model = Arc::clone(&self.model);
        let loss = Arc::clone(&self.loss);
        let device = self.devices.lead();

        tokio::task::spawn_blocking(move || -> Result<Diagnostics> {
            let mut scope = VariableScope::reusing(&params, device);
            let (predictions, _) = model.evaluate(&mut scope, shard.images())?;
            let value = loss.compute(
                shard.score_maps(),
                predictions.score_map.view(),
                shard.geometry_maps(),
                predictions.geometry_map.view(),
                shard.training_masks(),
            )?;

            let penalty = regularization(&params, scope.bound(), None)?;
            Ok(Diagnostics {
                model_loss: value.loss,
                total_loss: value.loss + penalty,
                predictions,
            })
        })
        .await?
    }
}

fn run_tower<M: Model, L: Loss>(
    model: &M,
    loss: &L,
    params: &ParameterSet,
    device: Device,
    shard: Batch,
) -> Result<TowerOutput> {
    let mut scope = VariableScope::reusing(params, device);
    let (predictions, cache) = model.evaluate(&mut scope, shard.images())?;
    let value = loss.compute(
        shard.score_maps(),
        predictions.score_map.view(),
        shard.geometry_maps(),
        predictions.geometry_map.view(),
        shard.training_masks(),
    )?;

    let mut grads = model.backward(cache, value.d_score.view(), value.d_geometry.view())?;
    let penalty = regularization(params, scope.bound(), Some(&mut grads))?;

    Ok(TowerOutput {
        device,
        grads,
        model_loss: value.loss,
        total_loss: value.loss + penalty,
        updates: scope.into_updates(),
    })
}

/// Sums the penalty of every regularized variable a tower bound, adding each penalty's gradient
/// to `grads` when given.
fn regularization(
    params: &ParameterSet,
    bound: &[ParamId],
    mut grads: Option<&mut GradientSet>,
) -> Result<f32> {
    let mut ids = bound.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let mut penalty = 0.;
    for id in ids {
        let var = params.variable(id);
        let Some(regularizer) = var.regularizer() else {
            continue;
        };

        penalty += regularizer.penalty(var.value());
        if let Some(grads) = grads.as_deref_mut() {
            grads.accumulate(id, regularizer.gradient(var.value()))?;
        }
    }

    Ok(penalty)
}

fn check_reuse(params: &ParameterSet, device: Device, bound: &[ParamId]) -> Result<()> {
    let mut ids = bound.to_vec();
    ids.sort_unstable();
    ids.dedup();

    if ids.len() != params.len() {
        return Err(TowerErr::ReuseViolation {
            device,
            bound: ids.len(),
            declared: params.len(),
        });
    }

    Ok(())
}
