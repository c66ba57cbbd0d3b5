use ndarray::{Array4, ArrayView4};

use crate::{GradientSet, Result, VariableScope};

/// The two dense maps a detector predicts for every output pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    /// Text confidence, `[batch, h, w, 1]`.
    pub score_map: Array4<f32>,
    /// Box geometry, `[batch, h, w, 5]`.
    pub geometry_map: Array4<f32>,
}

/// The network evaluated by every tower.
///
/// Implementations must read every tensor through the given scope. Evaluating with a declaring
/// scope creates the parameter set, evaluating with a reusing scope must bind exactly the same
/// tensors in the same order.
pub trait Model: Send + Sync {
    /// Whatever the forward pass needs to keep around to compute the backward pass.
    type Cache: Send;

    /// Runs the forward pass.
    ///
    /// # Arguments
    /// * `scope` - The scope to read the model's tensors through.
    /// * `images` - The shard of images, `[batch, height, width, 3]`.
    ///
    /// # Returns
    /// The predictions and the cache for `backward`.
    fn evaluate(
        &self,
        scope: &mut VariableScope<'_>,
        images: ArrayView4<'_, f32>,
    ) -> Result<(Predictions, Self::Cache)>;

    /// Runs the backward pass.
    ///
    /// # Arguments
    /// * `cache` - The cache returned by the matching `evaluate` call.
    /// * `d_score` - The gradient of the loss with respect to the score map.
    /// * `d_geometry` - The gradient of the loss with respect to the geometry map.
    ///
    /// # Returns
    /// The gradient of the loss with respect to every variable the evaluation bound.
    fn backward(
        &self,
        cache: Self::Cache,
        d_score: ArrayView4<'_, f32>,
        d_geometry: ArrayView4<'_, f32>,
    ) -> Result<GradientSet>;
}

/// A scalar loss and its gradient with respect to both prediction maps.
#[derive(Debug, Clone)]
pub struct LossValue {
    pub loss: f32,
    pub d_score: Array4<f32>,
    pub d_geometry: Array4<f32>,
}

/// The training objective.
pub trait Loss: Send + Sync {
    fn compute(
        &self,
        score_true: ArrayView4<'_, f32>,
        score_pred: ArrayView4<'_, f32>,
        geometry_true: ArrayView4<'_, f32>,
        geometry_pred: ArrayView4<'_, f32>,
        mask: ArrayView4<'_, f32>,
    ) -> Result<LossValue>;
}
