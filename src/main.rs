use std::{path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::Parser;
use coordinator::optimization::{
    Adam, GradientDescent, GradientDescentWithMomentum, Optimizer, OptimizerSpec,
};
use log::{error, info};
use ml_core::reference::{MaskedSquaredError, PixelHead};
use tower_orchestra::{
    RunSummary, StopReason, TrainConfig, Trainer,
    data::{BatchProducer, BatchQueue, SyntheticBatches},
};

/// Trains the reference detector head on synthetic batches across several devices.
#[derive(Parser, Debug, Clone)]
#[command(name = "tower-orchestra", version, about)]
struct Args {
    /// JSON training configuration, every missing field takes its default.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Resume from the latest checkpoint in the checkpoint directory.
    #[arg(long, default_value_t = false)]
    restore: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default(),
    };
    config.restore |= args.restore;
    config.validate()?;

    let summary = match config.optimizer {
        OptimizerSpec::Adam {
            beta1,
            beta2,
            epsilon,
        } => train(config, |len| Adam::new(len, beta1, beta2, epsilon)).await,
        OptimizerSpec::GradientDescent => train(config, |_| GradientDescent::new()).await,
        OptimizerSpec::GradientDescentWithMomentum { momentum } => {
            train(config, |len| GradientDescentWithMomentum::new(len, momentum)).await
        }
    };

    let summary = summary.inspect_err(|e| error!("training failed: {e:#}"))?;
    match summary.stop {
        StopReason::Completed => {
            info!(step = summary.final_step; "done");
            Ok(())
        }
        StopReason::Diverged { step, loss } => {
            bail!("loss diverged to {loss} at step {step}, the last saved checkpoint was kept")
        }
    }
}

async fn train<O, F>(config: TrainConfig, optimizer_factory: F) -> anyhow::Result<RunSummary>
where
    O: Optimizer,
    F: FnMut(usize) -> O,
{
    let model = PixelHead::default();
    let stride = model.stride();
    let batch_size = config.global_batch_size()?;
    let (seed, input_size) = (config.seed, config.input_size);

    let probe = SyntheticBatches::new(seed, batch_size, input_size, stride, None)
        .produce()?
        .context("the synthetic producer yielded no probe batch")?;

    let mut source = BatchQueue::spawn(
        config.num_readers,
        config.queue_capacity,
        config.batch_timeout_secs.map(Duration::from_secs),
        |reader| {
            let seed = seed.wrapping_add(1 + reader as u64);
            SyntheticBatches::new(seed, batch_size, input_size, stride, None)
        },
    )?;

    let mut trainer = Trainer::new(
        config,
        model,
        MaskedSquaredError::default(),
        &probe,
        optimizer_factory,
    )?;

    Ok(trainer.run(&mut source).await?)
}
