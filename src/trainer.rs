use std::time::Instant;

use coordinator::{CoordinatorErr, GradientReducer, UpdateCoordinator, optimization::Optimizer};
use log::{debug, error, info};
use ml_core::{Batch, Loss, Model};
use rand::{SeedableRng, rngs::StdRng};
use tower::TowerRunner;

use crate::{
    CheckpointManager, Result, TrainConfig, TrainErr,
    data::BatchSource,
    metrics::{StepSample, StepWindow},
    summary::{JsonlSummaryWriter, write_step_summaries},
};

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    /// The step counter reached `max_steps`.
    Completed,
    /// The total loss of the step at `step` wasn't finite, nothing of that step was committed.
    Diverged { step: u64, loss: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub stop: StopReason,
    /// The step counter when the run ended.
    pub final_step: u64,
}

/// Drives the towers, the reduction, the update and the checkpoints of a training run.
pub struct Trainer<M, L, O: Optimizer> {
    runner: TowerRunner<M, L>,
    coordinator: UpdateCoordinator<O>,
    checkpoints: CheckpointManager,
    sink: JsonlSummaryWriter,
    config: TrainConfig,
}

impl<M, L, O> Trainer<M, L, O>
where
    M: Model + 'static,
    L: Loss + 'static,
    O: Optimizer,
{
    /// Validates the configuration and readies the training state.
    ///
    /// When `config.restore` is set the latest checkpoint is the only source of the state.
    /// Otherwise the checkpoint directory is cleared, the parameters are freshly initialized and
    /// then seeded from the pretrained model if one is configured.
    ///
    /// # Arguments
    /// * `config` - The run configuration.
    /// * `model` - The model evaluator.
    /// * `loss` - The loss evaluator.
    /// * `probe` - A global batch with the shapes of the training batches, used to declare the
    ///   parameters.
    /// * `optimizer_factory` - Creates the optimizer state of a variable given its length.
    pub fn new<F>(
        config: TrainConfig,
        model: M,
        loss: L,
        probe: &Batch,
        optimizer_factory: F,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> O,
    {
        config.validate()?;

        let devices = config.devices()?;
        let global_batch = config.global_batch_size()?;
        if probe.len() != global_batch {
            return Err(TrainErr::Config(format!(
                "probe batch has {} examples, expected {global_batch}",
                probe.len()
            )));
        }

        let runner = TowerRunner::new(model, loss, devices);
        let checkpoints = CheckpointManager::new(&config.checkpoint_path, config.keep_checkpoints);
        checkpoints.prepare(config.restore)?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = runner.build(probe, &mut rng)?;
        let mut coordinator = UpdateCoordinator::new(
            params,
            config.schedule()?,
            config.moving_average_decay,
            optimizer_factory,
        );

        if config.restore {
            let step = checkpoints.restore_latest(&mut coordinator)?;
            info!(step = step; "resuming training");
        } else if let Some(path) = &config.pretrained_model_path {
            let report = CheckpointManager::seed_from_pretrained(path, &mut coordinator)?;
            debug!(skipped = report.skipped.len(); "unmatched pretrained tensors skipped");
        } else {
            info!("training from scratch");
        }

        let sink = JsonlSummaryWriter::open(checkpoints.dir()).map_err(TrainErr::Summary)?;

        Ok(Self {
            runner,
            coordinator,
            checkpoints,
            sink,
            config,
        })
    }

    pub fn coordinator(&self) -> &UpdateCoordinator<O> {
        &self.coordinator
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Trains until the step counter reaches `max_steps` or the loss diverges.
    ///
    /// # Arguments
    /// * `source` - Where the global batches come from.
    ///
    /// # Returns
    /// How the run ended, or the fatal error that halted it.
    pub async fn run<B: BatchSource>(&mut self, source: &mut B) -> Result<RunSummary> {
        let max_steps = self.config.max_steps;
        let mut window = StepWindow::new(self.config.log_every as usize);

        info!(
            step = self.coordinator.step(),
            max_steps = max_steps,
            devices = self.runner.devices().len();
            "starting training"
        );

        while self.coordinator.step() < max_steps {
            let batch = source.next_batch().await?;
            let started = Instant::now();
            let examples = batch.len();

            let towers = self.runner.run_step(self.coordinator.snapshot(), batch).await?;
            let (model_loss, lead_loss) = (towers.lead().model_loss, towers.lead().total_loss);
            let total_loss = towers.mean_total_loss();
            let (grads, updates, shard) = towers.into_parts();

            let averaged = GradientReducer::average(self.coordinator.params(), &grads)?;
            let report = match self.coordinator.apply(averaged, &updates, total_loss) {
                Ok(report) => report,
                Err(CoordinatorErr::Diverged { step, loss }) => {
                    error!(
                        step = step,
                        model_loss = model_loss,
                        total_loss = lead_loss;
                        "loss diverged, stopping without saving"
                    );

                    return Ok(RunSummary {
                        stop: StopReason::Diverged { step, loss },
                        final_step: self.coordinator.step(),
                    });
                }
                Err(e) => return Err(e.into()),
            };

            let step = report.step;
            window.push(StepSample {
                duration: started.elapsed(),
                model_loss,
                total_loss: lead_loss,
                examples,
            });

            if step % self.config.log_every == 0 {
                if let Some(summary) = window.summary() {
                    info!("{}", summary.line(step));
                }
            }

            if step % self.config.save_summary_steps == 0 {
                let diagnostics = self
                    .runner
                    .diagnose(self.coordinator.snapshot(), shard.clone())
                    .await?;

                write_step_summaries(
                    &mut self.sink,
                    step,
                    report.learning_rate,
                    &shard,
                    &diagnostics,
                    self.config.max_image_summaries,
                )
                .map_err(TrainErr::Summary)?;
            }

            if step % self.config.save_checkpoint_steps == 0 {
                self.checkpoints.save(&self.coordinator)?;
            }
        }

        let final_step = self.coordinator.step();
        if self.checkpoints.latest()?.map(|pointer| pointer.step) != Some(final_step) {
            self.checkpoints.save(&self.coordinator)?;
        }

        info!(step = final_step; "training finished");
        Ok(RunSummary {
            stop: StopReason::Completed,
            final_step,
        })
    }
}
