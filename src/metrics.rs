use std::{collections::VecDeque, time::Duration};

/// One completed training step as seen by the console log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSample {
    pub duration: Duration,
    pub model_loss: f32,
    pub total_loss: f32,
    pub examples: usize,
}

/// A rolling window over the last few steps, so the console shows averages instead of per-step noise.
#[derive(Debug, Clone)]
pub struct StepWindow {
    samples: VecDeque<StepSample>,
    capacity: usize,
}

impl StepWindow {
    /// Creates a new `StepWindow`.
    ///
    /// # Arguments
    /// * `capacity` - How many of the most recent steps to average over.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn push(&mut self, sample: StepSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }

        self.samples.push_back(sample);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The averages over the window, `None` while it is empty.
    pub fn summary(&self) -> Option<WindowSummary> {
        if self.samples.is_empty() {
            return None;
        }

        let n = self.samples.len() as f64;
        let mut seconds = 0.0;
        let mut model_loss = 0.0;
        let mut total_loss = 0.0;
        let mut examples = 0.0;

        for sample in &self.samples {
            seconds += sample.duration.as_secs_f64();
            model_loss += sample.model_loss as f64;
            total_loss += sample.total_loss as f64;
            examples += sample.examples as f64;
        }

        let seconds_per_step = seconds / n;
        let examples_per_second = if seconds > 0.0 { examples / seconds } else { 0.0 };

        Some(WindowSummary {
            model_loss: model_loss / n,
            total_loss: total_loss / n,
            seconds_per_step,
            examples_per_second,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSummary {
    pub model_loss: f64,
    pub total_loss: f64,
    pub seconds_per_step: f64,
    pub examples_per_second: f64,
}

impl WindowSummary {
    /// Formats the console line for `step`.
    pub fn line(&self, step: u64) -> String {
        format!(
            "Step {step:06}, model loss {:.4}, total loss {:.4}, {:.2} seconds/step, {:.2} examples/second",
            self.model_loss, self.total_loss, self.seconds_per_step, self.examples_per_second
        )
    }
}
