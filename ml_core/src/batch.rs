use ndarray::{Array4, ArrayView4, Axis, Slice, s};

use crate::{MlErr, Result};

/// Channels of a label map: one score channel followed by five geometry channels.
const LABEL_CHANNELS: usize = 6;
const SCORE_CHANNELS: usize = 1;

/// A batch of labeled training examples, the batch dimension is always the first axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    images: Array4<f32>,
    label_maps: Array4<f32>,
    training_masks: Array4<f32>,
}

impl Batch {
    /// Creates a new `Batch`.
    ///
    /// # Arguments
    /// * `images` - Input images, `[batch, height, width, 3]`.
    /// * `label_maps` - Ground truth maps, `[batch, h, w, 6]`, score then geometry channels.
    /// * `training_masks` - Per pixel training weights, `[batch, h, w, 1]`.
    ///
    /// # Returns
    /// A new `Batch` or a `ShapeMismatch` error if the three tensors disagree.
    pub fn new(
        images: Array4<f32>,
        label_maps: Array4<f32>,
        training_masks: Array4<f32>,
    ) -> Result<Self> {
        let (b, h, w, c) = label_maps.dim();

        if c != LABEL_CHANNELS {
            return Err(MlErr::shape_mismatch(
                "label_maps",
                label_maps.shape(),
                &[b, h, w, LABEL_CHANNELS],
            ));
        }

        if training_masks.shape() != [b, h, w, 1] {
            return Err(MlErr::shape_mismatch(
                "training_masks",
                training_masks.shape(),
                &[b, h, w, 1],
            ));
        }

        if images.len_of(Axis(0)) != b {
            let (_, ih, iw, ic) = images.dim();
            return Err(MlErr::shape_mismatch(
                "images",
                images.shape(),
                &[b, ih, iw, ic],
            ));
        }

        Ok(Self {
            images,
            label_maps,
            training_masks,
        })
    }

    /// Returns the amount of examples in the batch.
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn images(&self) -> ArrayView4<'_, f32> {
        self.images.view()
    }

    pub fn label_maps(&self) -> ArrayView4<'_, f32> {
        self.label_maps.view()
    }

    pub fn training_masks(&self) -> ArrayView4<'_, f32> {
        self.training_masks.view()
    }

    /// The score channel of the label maps.
    pub fn score_maps(&self) -> ArrayView4<'_, f32> {
        self.label_maps.slice(s![.., .., .., ..SCORE_CHANNELS])
    }

    /// The geometry channels of the label maps.
    pub fn geometry_maps(&self) -> ArrayView4<'_, f32> {
        self.label_maps.slice(s![.., .., .., SCORE_CHANNELS..])
    }

    /// Partitions the batch into `parts` contiguous shards of equal size along the batch axis.
    ///
    /// # Arguments
    /// * `parts` - The amount of shards to produce.
    ///
    /// # Returns
    /// The shards in order, or an `UnevenSplit` error if the batch isn't divisible by `parts`.
    pub fn split(&self, parts: usize) -> Result<Vec<Batch>> {
        if parts == 0 {
            return Err(MlErr::InvalidInput("can't split a batch into zero shards"));
        }

        let len = self.len();
        if len % parts != 0 {
            return Err(MlErr::UnevenSplit { batch: len, parts });
        }

        let shard = len / parts;
        let shards = (0..parts)
            .map(|i| {
                let range = Slice::from(i * shard..(i + 1) * shard);
                Self {
                    images: self.images.slice_axis(Axis(0), range).to_owned(),
                    label_maps: self.label_maps.slice_axis(Axis(0), range).to_owned(),
                    training_masks: self.training_masks.slice_axis(Axis(0), range).to_owned(),
                }
            })
            .collect();

        Ok(shards)
    }
}
