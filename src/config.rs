use std::{
    fs,
    num::NonZeroU64,
    path::{Path, PathBuf},
};

use coordinator::{LearningRateSchedule, optimization::OptimizerSpec};
use serde::{Deserialize, Serialize};
use tower::DeviceSet;

use crate::{Result, TrainErr};

/// Every knob of a training run.
///
/// Missing fields take their default value when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Comma separated device ordinals, the first one leads.
    pub gpu_list: String,
    pub batch_size_per_gpu: usize,
    pub learning_rate: f32,
    pub decay_steps: u64,
    pub decay_rate: f32,
    pub staircase: bool,
    pub optimizer: OptimizerSpec,
    pub max_steps: u64,
    pub moving_average_decay: f32,
    pub checkpoint_path: PathBuf,
    /// Resume from the latest checkpoint instead of starting over.
    pub restore: bool,
    pub save_checkpoint_steps: u64,
    pub save_summary_steps: u64,
    pub log_every: u64,
    /// How many snapshots are kept in the checkpoint directory.
    pub keep_checkpoints: usize,
    /// A safetensors file with a subset of the parameters to start from.
    pub pretrained_model_path: Option<PathBuf>,
    pub num_readers: usize,
    pub queue_capacity: usize,
    /// Fail if no batch arrives within this many seconds, wait forever if unset.
    pub batch_timeout_secs: Option<u64>,
    pub input_size: usize,
    pub max_image_summaries: usize,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            gpu_list: "0,1".to_string(),
            batch_size_per_gpu: 14,
            learning_rate: 1e-4,
            decay_steps: 10_000,
            decay_rate: 0.94,
            staircase: true,
            optimizer: OptimizerSpec::default(),
            max_steps: 100_000,
            moving_average_decay: 0.997,
            checkpoint_path: PathBuf::from("./ckpts/"),
            restore: false,
            save_checkpoint_steps: 1000,
            save_summary_steps: 100,
            log_every: 10,
            keep_checkpoints: 5,
            pretrained_model_path: None,
            num_readers: 16,
            queue_capacity: 24,
            batch_timeout_secs: None,
            input_size: 512,
            max_image_summaries: 3,
            seed: 42,
        }
    }
}

impl TrainConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    /// A `TrainErr::Config` if the file can't be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| TrainErr::Config(format!("cannot read '{}': {e}", path.display())))?;

        serde_json::from_str(&content).map_err(|e| TrainErr::Config(format!("invalid JSON: {e}")))
    }

    /// The parsed device list.
    pub fn devices(&self) -> Result<DeviceSet> {
        self.gpu_list
            .parse::<DeviceSet>()
            .map_err(|e| TrainErr::Config(format!("gpu_list: {e}")))
    }

    /// The size of the global batch, shared evenly among the devices.
    pub fn global_batch_size(&self) -> Result<usize> {
        Ok(self.batch_size_per_gpu * self.devices()?.len())
    }

    /// The learning rate schedule.
    pub fn schedule(&self) -> Result<LearningRateSchedule> {
        let decay_steps = NonZeroU64::new(self.decay_steps)
            .ok_or_else(|| TrainErr::Config("decay_steps must be positive".to_string()))?;

        Ok(LearningRateSchedule::new(
            self.learning_rate,
            self.decay_rate,
            decay_steps,
            self.staircase,
        ))
    }

    /// Checks the configuration before any device work begins.
    ///
    /// # Errors
    /// A `TrainErr::Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TrainErr::Config(msg.to_string()));

        let devices = self.devices()?;
        if self.batch_size_per_gpu == 0 {
            return invalid("batch_size_per_gpu must be positive");
        }
        devices
            .check_divisible(self.batch_size_per_gpu * devices.len())
            .map_err(|e| TrainErr::Config(e.to_string()))?;

        if !(self.learning_rate > 0.) || !self.learning_rate.is_finite() {
            return invalid("learning_rate must be a positive number");
        }
        if !(self.decay_rate > 0.) || !self.decay_rate.is_finite() {
            return invalid("decay_rate must be a positive number");
        }
        self.schedule()?;

        if !(0. ..1.).contains(&self.moving_average_decay) {
            return invalid("moving_average_decay must be in [0, 1)");
        }
        if self.save_checkpoint_steps == 0 || self.save_summary_steps == 0 || self.log_every == 0 {
            return invalid("checkpoint, summary and log cadences must be positive");
        }
        if self.keep_checkpoints == 0 {
            return invalid("keep_checkpoints must be positive");
        }
        if self.num_readers == 0 || self.queue_capacity == 0 {
            return invalid("num_readers and queue_capacity must be positive");
        }
        if self.batch_timeout_secs == Some(0) {
            return invalid("batch_timeout_secs must be positive when set");
        }
        if self.input_size == 0 {
            return invalid("input_size must be positive");
        }

        if let Some(path) = &self.pretrained_model_path {
            if !self.restore && !path.is_file() {
                return Err(TrainErr::Config(format!(
                    "pretrained model '{}' doesn't exist",
                    path.display()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: TrainConfig =
            serde_json::from_str(r#"{ "gpu_list": "0", "max_steps": 10 }"#).unwrap();

        assert_eq!(config.gpu_list, "0");
        assert_eq!(config.max_steps, 10);
        assert_eq!(config.batch_size_per_gpu, 14);
        assert_eq!(config.save_checkpoint_steps, 1000);
        assert_eq!(config.optimizer, OptimizerSpec::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn optimizer_is_tagged() {
        let config: TrainConfig = serde_json::from_str(
            r#"{ "optimizer": { "kind": "gradient_descent_with_momentum" } }"#,
        )
        .unwrap();

        assert_eq!(
            config.optimizer,
            OptimizerSpec::GradientDescentWithMomentum { momentum: 0.9 }
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<TrainConfig>(r#"{ "gpus": "0" }"#).is_err());
    }

    #[test]
    fn invalid_settings_are_reported() {
        let bad = [
            TrainConfig {
                gpu_list: "".to_string(),
                ..Default::default()
            },
            TrainConfig {
                batch_size_per_gpu: 0,
                ..Default::default()
            },
            TrainConfig {
                save_summary_steps: 0,
                ..Default::default()
            },
            TrainConfig {
                learning_rate: f32::NAN,
                ..Default::default()
            },
            TrainConfig {
                pretrained_model_path: Some(PathBuf::from("/definitely/not/here.safetensors")),
                ..Default::default()
            },
        ];

        for config in bad {
            assert!(matches!(config.validate(), Err(TrainErr::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn global_batch_spans_every_device() {
        let config = TrainConfig::default();
        assert_eq!(config.global_batch_size().unwrap(), 28);
    }
}
