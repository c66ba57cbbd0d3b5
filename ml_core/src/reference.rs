//! Small collaborators implementing the `Model` and `Loss` contracts.
//!
//! They are enough to drive the training machinery end to end, not to detect text.

use ndarray::{Array2, Array4, ArrayView4, Axis, Ix1, Ix2, s};

use crate::{
    GradientSet, Initializer, Loss, LossValue, MlErr, Model, ParamId, Predictions, Regularizer,
    Result, VariableScope,
};

const IMAGE_CHANNELS: usize = 3;
const GEOMETRY_CHANNELS: usize = 5;

/// A per pixel linear detector head over average pooled, batch centered image features.
///
/// Centering uses the batch mean of the shard and records it as a batch normalization update
/// of the `feature/moving_mean` statistic.
#[derive(Debug, Clone, Copy)]
pub struct PixelHead {
    stride: usize,
    bn_decay: f32,
    weight_decay: f32,
}

impl PixelHead {
    /// Creates a new `PixelHead`.
    ///
    /// # Arguments
    /// * `stride` - The downsampling factor between the images and the output maps.
    /// * `bn_decay` - The decay of the moving feature mean.
    /// * `weight_decay` - The scale of the L2 penalty on the weights.
    pub fn new(stride: usize, bn_decay: f32, weight_decay: f32) -> Self {
        Self {
            stride,
            bn_decay,
            weight_decay,
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    fn pool(&self, images: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (b, hh, ww, c) = images.dim();
        let stride = self.stride;

        if c != IMAGE_CHANNELS {
            return Err(MlErr::shape_mismatch("images", images.shape(), &[b, hh, ww, 3]));
        }

        if stride == 0 || hh % stride != 0 || ww % stride != 0 {
            return Err(MlErr::InvalidInput(
                "image size must be a multiple of the head's stride",
            ));
        }

        let area = (stride * stride) as f32;
        let pooled = Array4::from_shape_fn((b, hh / stride, ww / stride, c), |(n, i, j, ch)| {
            let window = images.slice(s![
                n,
                i * stride..(i + 1) * stride,
                j * stride..(j + 1) * stride,
                ch
            ]);
            window.sum() / area
        });

        Ok(pooled)
    }
}

impl Default for PixelHead {
    fn default() -> Self {
        Self::new(4, 0.997, 1e-5)
    }
}

/// What `PixelHead::backward` needs from the forward pass.
pub struct PixelHeadCache {
    features: Array2<f32>,
    score: Array2<f32>,
    score_weights: ParamId,
    score_bias: ParamId,
    geometry_weights: ParamId,
    geometry_bias: ParamId,
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

impl Model for PixelHead {
    type Cache = PixelHeadCache;

    fn evaluate(
        &self,
        scope: &mut VariableScope<'_>,
        images: ArrayView4<'_, f32>,
    ) -> Result<(Predictions, Self::Cache)> {
        let pooled = self.pool(images)?;
        let (b, h, w, c) = pooled.dim();
        let x = pooled.into_shape_with_order((b * h * w, c))?;

        let batch_mean = x
            .mean_axis(Axis(0))
            .ok_or(MlErr::InvalidInput("can't evaluate an empty shard"))?;

        let moving_mean = scope.get_statistic("feature/moving_mean", &[c], Initializer::ZEROS)?;
        scope.record_update(&moving_mean, batch_mean.clone().into_dyn(), self.bn_decay)?;

        let features = &x - &batch_mean;
        let l2 = Some(Regularizer::L2 {
            scale: self.weight_decay,
        });

        let sw = scope.get_variable(
            "score/weights",
            &[c, 1],
            Initializer::XavierUniform {
                fan_in: c,
                fan_out: 1,
            },
            l2,
        )?;
        let sb = scope.get_variable("score/bias", &[1], Initializer::ZEROS, None)?;
        let gw = scope.get_variable(
            "geometry/weights",
            &[c, GEOMETRY_CHANNELS],
            Initializer::XavierUniform {
                fan_in: c,
                fan_out: GEOMETRY_CHANNELS,
            },
            l2,
        )?;
        let gb = scope.get_variable("geometry/bias", &[GEOMETRY_CHANNELS], Initializer::ZEROS, None)?;

        let logits = features.dot(&sw.value.view().into_dimensionality::<Ix2>()?)
            + &sb.value.view().into_dimensionality::<Ix1>()?;
        let score = logits.mapv(sigmoid);
        let geometry = features.dot(&gw.value.view().into_dimensionality::<Ix2>()?)
            + &gb.value.view().into_dimensionality::<Ix1>()?;

        let predictions = Predictions {
            score_map: score.clone().into_shape_with_order((b, h, w, 1))?,
            geometry_map: geometry.into_shape_with_order((b, h, w, GEOMETRY_CHANNELS))?,
        };

        let cache = PixelHeadCache {
            features,
            score,
            score_weights: sw.id,
            score_bias: sb.id,
            geometry_weights: gw.id,
            geometry_bias: gb.id,
        };

        Ok((predictions, cache))
    }

    fn backward(
        &self,
        cache: Self::Cache,
        d_score: ArrayView4<'_, f32>,
        d_geometry: ArrayView4<'_, f32>,
    ) -> Result<GradientSet> {
        let n = cache.features.nrows();
        let d_score = d_score.to_shape((n, 1))?;
        let d_geometry = d_geometry.to_shape((n, GEOMETRY_CHANNELS))?;

        let d_logits = &d_score * &cache.score.mapv(|s| s * (1. - s));
        let x_t = cache.features.t();

        let mut grads = GradientSet::new();
        grads.accumulate(cache.score_weights, x_t.dot(&d_logits).into_dyn())?;
        grads.accumulate(cache.score_bias, d_logits.sum_axis(Axis(0)).into_dyn())?;
        grads.accumulate(cache.geometry_weights, x_t.dot(&d_geometry).into_dyn())?;
        grads.accumulate(cache.geometry_bias, d_geometry.sum_axis(Axis(0)).into_dyn())?;

        Ok(grads)
    }
}

/// A masked squared error over the score map plus a score weighted squared error over the
/// geometry map.
#[derive(Debug, Clone, Copy)]
pub struct MaskedSquaredError {
    geometry_weight: f32,
}

impl MaskedSquaredError {
    /// Creates a new `MaskedSquaredError` loss.
    ///
    /// # Arguments
    /// * `geometry_weight` - The factor of the geometry term.
    pub fn new(geometry_weight: f32) -> Self {
        Self { geometry_weight }
    }
}

impl Default for MaskedSquaredError {
    fn default() -> Self {
        Self::new(1.)
    }
}

impl Loss for MaskedSquaredError {
    fn compute(
        &self,
        score_true: ArrayView4<'_, f32>,
        score_pred: ArrayView4<'_, f32>,
        geometry_true: ArrayView4<'_, f32>,
        geometry_pred: ArrayView4<'_, f32>,
        mask: ArrayView4<'_, f32>,
    ) -> Result<LossValue> {
        let (b, h, w, _) = score_true.dim();
        let score_shape = [b, h, w, 1];
        let geometry_shape = [b, h, w, GEOMETRY_CHANNELS];

        for (what, got, expected) in [
            ("score_true", score_true.shape(), &score_shape[..]),
            ("score_pred", score_pred.shape(), &score_shape[..]),
            ("training_mask", mask.shape(), &score_shape[..]),
            ("geometry_true", geometry_true.shape(), &geometry_shape[..]),
            ("geometry_pred", geometry_pred.shape(), &geometry_shape[..]),
        ] {
            if got != expected {
                return Err(MlErr::shape_mismatch(what, got, expected));
            }
        }

        let pixels = (b * h * w) as f32;
        if pixels == 0. {
            return Err(MlErr::InvalidInput("can't compute the loss of an empty shard"));
        }

        let score_diff = &score_pred - &score_true;
        let masked_score = &score_diff * &mask;
        let score_loss = (&masked_score * &score_diff).sum() / pixels;
        let d_score = masked_score.mapv(|v| 2. * v / pixels);

        let weights = &mask * &score_true;
        let geometry_diff = &geometry_pred - &geometry_true;
        let weighted = &geometry_diff * &weights;
        let geometry_pixels = pixels * GEOMETRY_CHANNELS as f32;
        let geometry_loss = (&weighted * &geometry_diff).sum() / geometry_pixels;
        let lambda = self.geometry_weight;
        let d_geometry = weighted.mapv(|v| lambda * 2. * v / geometry_pixels);

        Ok(LossValue {
            loss: score_loss + lambda * geometry_loss,
            d_score,
            d_geometry,
        })
    }
}
