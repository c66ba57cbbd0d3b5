use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use coordinator::optimization::Adam;
use ml_core::{
    Batch, Loss, LossValue, ParameterSet, Result as MlResult,
    reference::{MaskedSquaredError, PixelHead},
};
use ndarray::{ArrayD, ArrayView4, IxDyn};
use safetensors::{Dtype, tensor::TensorView};
use tower_orchestra::{
    StopReason, TrainConfig, TrainErr, Trainer,
    checkpoint::{CheckpointErr, POINTER_FILE},
    data::{BatchProducer, BatchSource, BatchSourceErr, SyntheticBatches},
    summary::EVENTS_FILE,
};

const STRIDE: usize = 4;
const INPUT: usize = 8;

/// Replays a fixed list of batches, then reports exhaustion.
struct Replay(VecDeque<Batch>);

impl BatchSource for Replay {
    async fn next_batch(&mut self) -> Result<Batch, BatchSourceErr> {
        self.0.pop_front().ok_or(BatchSourceErr::Exhausted)
    }
}

/// Delegates to the masked squared error until `after` calls, then reports a NaN loss.
struct NanAfter {
    inner: MaskedSquaredError,
    calls: AtomicUsize,
    after: usize,
}

impl Loss for NanAfter {
    fn compute(
        &self,
        score_true: ArrayView4<'_, f32>,
        score_pred: ArrayView4<'_, f32>,
        geometry_true: ArrayView4<'_, f32>,
        geometry_pred: ArrayView4<'_, f32>,
        mask: ArrayView4<'_, f32>,
    ) -> MlResult<LossValue> {
        let mut value =
            self.inner
                .compute(score_true, score_pred, geometry_true, geometry_pred, mask)?;

        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.after {
            value.loss = f32::NAN;
        }

        Ok(value)
    }
}

fn config(dir: &Path, max_steps: u64) -> TrainConfig {
    TrainConfig {
        gpu_list: "0,1".to_string(),
        batch_size_per_gpu: 2,
        max_steps,
        checkpoint_path: dir.to_path_buf(),
        save_checkpoint_steps: 2,
        save_summary_steps: 1000,
        log_every: 1,
        keep_checkpoints: 10,
        num_readers: 1,
        queue_capacity: 2,
        input_size: INPUT,
        seed: 7,
        ..TrainConfig::default()
    }
}

fn batches(count: usize) -> Vec<Batch> {
    let mut producer = SyntheticBatches::new(11, 4, INPUT, STRIDE, None);
    (0..count)
        .map(|_| producer.produce().unwrap().unwrap())
        .collect()
}

fn replay(batches: &[Batch]) -> Replay {
    Replay(batches.iter().cloned().collect())
}

fn adam(len: usize) -> Adam {
    Adam::new(len, Adam::BETA1, Adam::BETA2, Adam::EPSILON)
}

fn trainer<L: Loss + 'static>(config: TrainConfig, loss: L) -> Trainer<PixelHead, L, Adam> {
    let probe = batches(1).remove(0);
    Trainer::new(config, PixelHead::default(), loss, &probe, adam).unwrap()
}

fn checkpoint_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("model.ckpt-"))
        .collect();
    names.sort();
    names
}

fn assert_close(a: &ParameterSet, b: &ParameterSet) {
    for (x, y) in a.variables().iter().zip(b.variables()) {
        assert_eq!(x.name(), y.name());
        for (p, q) in x.value().iter().zip(y.value()) {
            assert!((p - q).abs() <= 1e-6, "{}: {p} != {q}", x.name());
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_continues_from_the_saved_step() {
    let data = batches(6);

    let resumed_dir = tempfile::tempdir().unwrap();
    let mut first = trainer(config(resumed_dir.path(), 4), MaskedSquaredError::default());
    let summary = first.run(&mut replay(&data[..4])).await.unwrap();
    assert_eq!(summary.final_step, 4);
    let saved = first.coordinator().params().clone();
    let saved_shadow = first.coordinator().shadow().shadow().to_vec();
    drop(first);

    let mut resume_config = config(resumed_dir.path(), 6);
    resume_config.restore = true;
    let mut resumed = trainer(resume_config, MaskedSquaredError::default());
    assert_eq!(resumed.coordinator().step(), 4);
    assert!(resumed.coordinator().params().values_eq(&saved));
    assert_eq!(resumed.coordinator().shadow().shadow(), &saved_shadow[..]);

    let summary = resumed.run(&mut replay(&data[4..])).await.unwrap();
    assert_eq!(summary.stop, StopReason::Completed);
    assert_eq!(summary.final_step, 6);

    let straight_dir = tempfile::tempdir().unwrap();
    let mut straight = trainer(config(straight_dir.path(), 6), MaskedSquaredError::default());
    straight.run(&mut replay(&data)).await.unwrap();

    assert_close(resumed.coordinator().params(), straight.coordinator().params());
}

#[tokio::test(flavor = "multi_thread")]
async fn divergence_stops_without_saving_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 10);
    config.save_checkpoint_steps = 1;

    // Two towers per step, the fourth step is the first with a NaN loss.
    let loss = NanAfter {
        inner: MaskedSquaredError::default(),
        calls: AtomicUsize::new(0),
        after: 6,
    };
    let mut trainer = trainer(config, loss);
    let before = trainer.coordinator().params().clone();

    let summary = trainer.run(&mut replay(&batches(10))).await.unwrap();

    let StopReason::Diverged { step, loss } = summary.stop else {
        panic!("expected divergence, got {:?}", summary.stop);
    };
    assert_eq!(step, 3);
    assert!(loss.is_nan());
    assert_eq!(summary.final_step, 3);
    assert!(!trainer.coordinator().params().values_eq(&before));

    let pointer = trainer.checkpoints().latest().unwrap().unwrap();
    assert_eq!(pointer.step, 3);
    assert!(!checkpoint_files(dir.path()).contains(&"model.ckpt-4.safetensors".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoints_and_summaries_follow_their_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 5);
    config.save_summary_steps = 2;

    let mut trainer = trainer(config, MaskedSquaredError::default());
    trainer.run(&mut replay(&batches(5))).await.unwrap();

    assert_eq!(
        checkpoint_files(dir.path()),
        [
            "model.ckpt-2.safetensors",
            "model.ckpt-4.safetensors",
            "model.ckpt-5.safetensors"
        ]
    );

    let pointer = trainer.checkpoints().latest().unwrap().unwrap();
    assert_eq!(pointer.latest, "model.ckpt-5.safetensors");
    assert_eq!(pointer.step, 5);

    let events = fs::read_to_string(dir.path().join(EVENTS_FILE)).unwrap();
    let steps: Vec<u64> = events
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .filter(|event| event["tag"] == "total_loss")
        .map(|event| event["step"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, [2, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn retention_keeps_the_newest_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 4);
    config.save_checkpoint_steps = 1;
    config.keep_checkpoints = 2;

    let mut trainer = trainer(config, MaskedSquaredError::default());
    trainer.run(&mut replay(&batches(4))).await.unwrap();

    assert_eq!(
        checkpoint_files(dir.path()),
        ["model.ckpt-3.safetensors", "model.ckpt-4.safetensors"]
    );
    let leftovers = fs::read_dir(dir.path())
        .unwrap()
        .filter(|entry| {
            let name = entry.as_ref().unwrap().file_name();
            name.to_string_lossy().ends_with(".tmp")
        })
        .count();
    assert_eq!(leftovers, 0);

    let pointer: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join(POINTER_FILE)).unwrap())
            .unwrap();
    assert_eq!(
        pointer["history"],
        serde_json::json!(["model.ckpt-3.safetensors", "model.ckpt-4.safetensors"])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_source_halts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = trainer(config(dir.path(), 5), MaskedSquaredError::default());

    let result = trainer.run(&mut replay(&batches(2))).await;

    assert!(matches!(
        result,
        Err(TrainErr::BatchSource(BatchSourceErr::Exhausted))
    ));
    assert_eq!(trainer.coordinator().step(), 2);
    assert_eq!(checkpoint_files(dir.path()), ["model.ckpt-2.safetensors"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn unwritable_checkpoint_directory_halts_the_run() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("ckpt");
    let mut config = config(&dir, 3);
    config.save_checkpoint_steps = 1;

    let mut trainer = trainer(config, MaskedSquaredError::default());
    fs::remove_dir_all(&dir).unwrap();
    fs::write(&dir, b"not a directory").unwrap();

    let result = trainer.run(&mut replay(&batches(3))).await;

    assert!(matches!(
        result,
        Err(TrainErr::Checkpoint(CheckpointErr::Io { .. }))
    ));
    assert_eq!(trainer.coordinator().step(), 1);
}

#[test]
fn restoring_an_empty_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 4);
    config.restore = true;

    let probe = batches(1).remove(0);
    let result = Trainer::new(config, PixelHead::default(), MaskedSquaredError::default(), &probe, adam);

    assert!(matches!(
        result,
        Err(TrainErr::Checkpoint(CheckpointErr::NoCheckpoint { .. }))
    ));
}

#[test]
fn fresh_start_clears_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("model.ckpt-99.safetensors");
    fs::write(&stale, b"stale").unwrap();

    let _trainer = trainer(config(dir.path(), 4), MaskedSquaredError::default());

    assert!(!stale.exists());
    assert!(dir.path().is_dir());
}

fn write_pretrained(path: &Path, tensors: &[(&str, Vec<usize>, Vec<f32>)]) {
    let bytes: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, shape, values)| {
            let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.to_string(), shape.clone(), bytes)
        })
        .collect();

    let views: Vec<_> = bytes
        .iter()
        .map(|(name, shape, data)| {
            (
                name.as_str(),
                TensorView::new(Dtype::F32, shape.clone(), data).unwrap(),
            )
        })
        .collect();

    let serialized = safetensors::tensor::serialize(views, &None::<HashMap<String, String>>).unwrap();
    fs::write(path, serialized).unwrap();
}

#[test]
fn seeding_touches_only_matching_variables() {
    let source = tempfile::tempdir().unwrap();
    let pretrained = source.path().join("backbone.safetensors");
    let weights = vec![0.25, -0.5, 0.75];
    write_pretrained(
        &pretrained,
        &[
            ("params/score/weights", vec![3, 1], weights.clone()),
            ("geometry/bias", vec![4], vec![9.0; 4]),
            ("head/unknown", vec![2], vec![1.0, 2.0]),
        ],
    );

    let baseline_dir = tempfile::tempdir().unwrap();
    let baseline = trainer(config(baseline_dir.path(), 1), MaskedSquaredError::default());

    let seeded_dir = tempfile::tempdir().unwrap();
    let mut seeded_config = config(seeded_dir.path(), 1);
    seeded_config.pretrained_model_path = Some(pretrained);
    let seeded = trainer(seeded_config, MaskedSquaredError::default());

    let params = seeded.coordinator().params();
    let base = baseline.coordinator().params();
    for (var, base_var) in params.variables().iter().zip(base.variables()) {
        if var.name() == "score/weights" {
            let expected = ArrayD::from_shape_vec(IxDyn(&[3, 1]), weights.clone()).unwrap();
            assert_eq!(var.value(), &expected);
        } else {
            assert_eq!(var.value(), base_var.value(), "{} changed", var.name());
        }
    }

    let id = params.variable_id("score/weights").unwrap();
    assert_eq!(seeded.coordinator().shadow().get(id), params.variable(id).value());
}

#[test]
fn learning_rate_decays_in_stairs() {
    let config = TrainConfig::default();
    let schedule = config.schedule().unwrap();

    assert_eq!(schedule.rate(0), 1e-4);
    assert_eq!(schedule.rate(9_999), 1e-4);
    assert!((schedule.rate(10_000) - 1e-4 * 0.94).abs() < 1e-10);
}
