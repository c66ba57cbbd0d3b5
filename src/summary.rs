use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
};

use ml_core::Batch;
use ndarray::{Array4, ArrayView4, s};
use serde::Serialize;
use tower::Diagnostics;

/// The file summaries are appended to, inside the checkpoint directory.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Where summary scalars and images go.
pub trait SummarySink: Send {
    fn scalar(&mut self, tag: &str, step: u64, value: f32) -> io::Result<()>;

    fn image(&mut self, tag: &str, step: u64, images: ArrayView4<'_, f32>) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Event<'a> {
    Scalar {
        tag: &'a str,
        step: u64,
        value: f32,
    },
    Image {
        tag: &'a str,
        step: u64,
        shape: &'a [usize],
        data: Vec<f32>,
    },
}

/// Appends one JSON object per summary to a file.
pub struct JsonlSummaryWriter {
    out: BufWriter<File>,
}

impl JsonlSummaryWriter {
    /// Opens the events file of `dir` for appending, creating it if needed.
    pub fn open(dir: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;

        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    fn write(&mut self, event: &Event<'_>) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, event)?;
        self.out.write_all(b"\n")
    }
}

impl SummarySink for JsonlSummaryWriter {
    fn scalar(&mut self, tag: &str, step: u64, value: f32) -> io::Result<()> {
        self.write(&Event::Scalar { tag, step, value })
    }

    fn image(&mut self, tag: &str, step: u64, images: ArrayView4<'_, f32>) -> io::Result<()> {
        self.write(&Event::Image {
            tag,
            step,
            shape: images.shape(),
            data: images.iter().copied().collect(),
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Writes the summaries of one step.
///
/// # Arguments
/// * `sink` - Where to write.
/// * `step` - The step the summaries belong to.
/// * `learning_rate` - The rate the step was taken with.
/// * `shard` - The lead device's shard of the step's batch.
/// * `diagnostics` - The losses and predictions of a diagnostic pass over `shard`.
/// * `max_images` - How many examples of each image summary to keep.
pub fn write_step_summaries<S: SummarySink + ?Sized>(
    sink: &mut S,
    step: u64,
    learning_rate: f32,
    shard: &Batch,
    diagnostics: &Diagnostics,
    max_images: usize,
) -> io::Result<()> {
    sink.scalar("model_loss", step, diagnostics.model_loss)?;
    sink.scalar("total_loss", step, diagnostics.total_loss)?;
    sink.scalar("learning_rate", step, learning_rate)?;

    let n = max_images.min(shard.len());
    let score_maps = shard.score_maps();
    let predictions = &diagnostics.predictions;

    let geo_map = masked_geometry(shard.geometry_maps(), score_maps);
    let geo_map_pred = masked_geometry(predictions.geometry_map.view(), score_maps);

    let images = [
        ("input", shard.images()),
        ("score_map", score_maps),
        ("score_map_pred", predictions.score_map.view()),
        ("geo_map_0", geo_map.view()),
        ("geo_map_0_pred", geo_map_pred.view()),
        ("training_masks", shard.training_masks()),
    ];

    for (tag, image) in images {
        sink.image(tag, step, image.slice(s![..n, .., .., ..]))?;
    }

    sink.flush()
}

/// The first four geometry channels where the ground truth score is set.
fn masked_geometry(geometry: ArrayView4<'_, f32>, score: ArrayView4<'_, f32>) -> Array4<f32> {
    &geometry.slice(s![.., .., .., 0..4]) * &score
}
