use std::{error::Error, fmt, io, thread, time::Duration};

use log::{debug, warn};
use ml_core::{Batch, MlErr};
use ndarray::{Array4, Axis, s};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::Normal;
use tokio::sync::mpsc;

/// Failures of the batch source. All of them are fatal to training.
#[derive(Debug)]
pub enum BatchSourceErr {
    /// Every producer finished, no batch will ever arrive.
    Exhausted,
    /// No batch arrived within the configured timeout.
    Stalled { waited: Duration },
    /// A producer failed to build a batch.
    Producer { reader: usize, detail: String },
    /// A reader thread couldn't be started.
    Spawn(io::Error),
}

impl fmt::Display for BatchSourceErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => f.write_str("every batch producer finished"),
            Self::Stalled { waited } => {
                write!(f, "producer stalled: no batch within {}s", waited.as_secs_f32())
            }
            Self::Producer { reader, detail } => write!(f, "reader {reader} failed: {detail}"),
            Self::Spawn(e) => write!(f, "couldn't start reader thread: {e}"),
        }
    }
}

impl Error for BatchSourceErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Where the training loop pulls its batches from.
#[trait_variant::make(BatchSource: Send)]
pub trait BatchSourceTemplate {
    /// Waits for the next global batch.
    ///
    /// # Errors
    /// Any `BatchSourceErr`, after which no more batches will be produced.
    async fn next_batch(&mut self) -> Result<Batch, BatchSourceErr>;
}

/// Builds batches on a reader thread.
pub trait BatchProducer: Send + 'static {
    /// Builds the next batch.
    ///
    /// # Returns
    /// The batch, `None` once the producer has nothing left, or an error.
    fn produce(&mut self) -> Result<Option<Batch>, MlErr>;
}

/// A bounded queue of ready batches filled by a pool of reader threads.
pub struct BatchQueue {
    rx: mpsc::Receiver<Result<Batch, BatchSourceErr>>,
    timeout: Option<Duration>,
}

impl BatchQueue {
    /// Starts the reader pool.
    ///
    /// # Arguments
    /// * `readers` - The amount of reader threads.
    /// * `capacity` - The maximum amount of ready batches waiting in the queue.
    /// * `timeout` - How long `next_batch` waits before reporting a stalled producer.
    /// * `producer_factory` - Creates the producer of each reader given its index.
    pub fn spawn<P, F>(
        readers: usize,
        capacity: usize,
        timeout: Option<Duration>,
        mut producer_factory: F,
    ) -> Result<Self, BatchSourceErr>
    where
        P: BatchProducer,
        F: FnMut(usize) -> P,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        for reader in 0..readers {
            let mut producer = producer_factory(reader);
            let tx = tx.clone();

            thread::Builder::new()
                .name(format!("batch-reader-{reader}"))
                .spawn(move || {
                    loop {
                        let next = match producer.produce() {
                            Ok(Some(batch)) => Ok(batch),
                            Ok(None) => break,
                            Err(e) => Err(BatchSourceErr::Producer {
                                reader,
                                detail: e.to_string(),
                            }),
                        };

                        let failed = next.is_err();
                        if tx.blocking_send(next).is_err() || failed {
                            break;
                        }
                    }

                    debug!(reader = reader; "batch reader finished");
                })
                .map_err(BatchSourceErr::Spawn)?;
        }

        Ok(Self { rx, timeout })
    }
}

impl BatchSource for BatchQueue {
    async fn next_batch(&mut self) -> Result<Batch, BatchSourceErr> {
        let next = match self.timeout {
            Some(waited) => tokio::time::timeout(waited, self.rx.recv())
                .await
                .map_err(|_| {
                    warn!(waited_secs = waited.as_secs(); "no batch arrived in time");
                    BatchSourceErr::Stalled { waited }
                })?,
            None => self.rx.recv().await,
        };

        next.unwrap_or(Err(BatchSourceErr::Exhausted))
    }
}

/// Seeded random batches whose score maps follow the brightness of the images.
#[derive(Debug)]
pub struct SyntheticBatches {
    rng: StdRng,
    batch_size: usize,
    input_size: usize,
    stride: usize,
    remaining: Option<u64>,
}

impl SyntheticBatches {
    /// Creates a new `SyntheticBatches` producer.
    ///
    /// # Arguments
    /// * `seed` - The seed of the producer's random number generator.
    /// * `batch_size` - The amount of examples per batch.
    /// * `input_size` - The side of the square images.
    /// * `stride` - The ratio between the image side and the label map side.
    /// * `limit` - The amount of batches to produce, unbounded if `None`.
    pub fn new(
        seed: u64,
        batch_size: usize,
        input_size: usize,
        stride: usize,
        limit: Option<u64>,
    ) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            batch_size,
            input_size,
            stride,
            remaining: limit,
        }
    }
}

impl BatchProducer for SyntheticBatches {
    fn produce(&mut self) -> Result<Option<Batch>, MlErr> {
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }

        if self.stride == 0 || self.input_size % self.stride != 0 {
            return Err(MlErr::InvalidInput(
                "input size must be a multiple of the label stride",
            ));
        }

        let (b, side, stride) = (self.batch_size, self.input_size, self.stride);
        let out = side / stride;
        let rng = &mut self.rng;

        let images = Array4::from_shape_simple_fn((b, side, side, 3), || rng.random::<f32>());
        let noise = Normal::<f32>::new(0., 0.1).map_err(|e| MlErr::Rand(e.to_string()))?;

        let mut labels = Array4::zeros((b, out, out, 6));
        for ((n, i, j, c), label) in labels.indexed_iter_mut() {
            let window = images.slice(s![
                n,
                i * stride..(i + 1) * stride,
                j * stride..(j + 1) * stride,
                0
            ]);
            let brightness = window.mean().unwrap_or(0.);
            *label = match c {
                0 => (brightness > 0.5) as u8 as f32,
                _ => brightness * c as f32 + rng.sample::<f32, _>(noise),
            };
        }

        let masks = Array4::ones((b, out, out, 1));
        debug!(examples = labels.len_of(Axis(0)); "produced synthetic batch");

        Batch::new(images, labels, masks).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use ml_core::{Batch, MlErr};

    use super::{BatchProducer, BatchQueue, BatchSource, BatchSourceErr, SyntheticBatches};

    #[tokio::test(flavor = "multi_thread")]
    async fn readers_fill_the_queue_until_exhausted() {
        let mut queue = BatchQueue::spawn(2, 4, None, |reader| {
            SyntheticBatches::new(reader as u64, 2, 8, 4, Some(3))
        })
        .unwrap();

        for _ in 0..6 {
            let batch = queue.next_batch().await.unwrap();
            assert_eq!(batch.len(), 2);
            assert_eq!(batch.label_maps().shape(), [2, 2, 2, 6]);
        }

        assert!(matches!(
            queue.next_batch().await,
            Err(BatchSourceErr::Exhausted)
        ));
    }

    struct Failing;

    impl BatchProducer for Failing {
        fn produce(&mut self) -> Result<Option<Batch>, MlErr> {
            Err(MlErr::InvalidInput("corrupt sample"))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn producer_errors_are_propagated() {
        let mut queue = BatchQueue::spawn(1, 1, None, |_| Failing).unwrap();

        assert!(matches!(
            queue.next_batch().await,
            Err(BatchSourceErr::Producer { reader: 0, .. })
        ));
    }

    struct Sleepy;

    impl BatchProducer for Sleepy {
        fn produce(&mut self) -> Result<Option<Batch>, MlErr> {
            thread::sleep(Duration::from_millis(500));
            Ok(None)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_producers_are_reported_as_stalled() {
        let timeout = Some(Duration::from_millis(20));
        let mut queue = BatchQueue::spawn(1, 1, timeout, |_| Sleepy).unwrap();

        assert!(matches!(
            queue.next_batch().await,
            Err(BatchSourceErr::Stalled { .. })
        ));
    }

    #[test]
    fn synthetic_batches_are_seeded() {
        let a = SyntheticBatches::new(7, 1, 8, 4, None).produce().unwrap().unwrap();
        let b = SyntheticBatches::new(7, 1, 8, 4, None).produce().unwrap().unwrap();

        assert_eq!(a, b);
        assert!(a.score_maps().iter().all(|&s| s == 0. || s == 1.));
    }
}
