use ndarray::{Array2, ArrayView4};

use crate::error::{Error, Result};
use crate::pipeline::backbone::Backbone;
use crate::pipeline::config::SodNetConfig;
use crate::pipeline::layers::{relu, seeded_rng, sigmoid, BatchNorm, Linear};

/// Single object detection: one box and one class distribution per image.
pub struct SodNet<B: Backbone> {
    backbone: B,
    interim: Linear,
    batch_norm: BatchNorm,
    bbox: Linear,
    label: Linear,
    image_dim: f32,
}

impl<B: Backbone> SodNet<B> {
    pub fn new(backbone: B, config: &SodNetConfig) -> Result<Self> {
        let features = backbone.output_shape();
        if features.is_empty() || config.hidden_features == 0 || config.num_classes == 0 {
            return Err(Error::Configuration(format!(
                "sod net needs non-empty features ({features:?}), hidden layer and classes"
            )));
        }

        let mut rng = seeded_rng(config.seed);
        let interim = Linear::new(features.len(), config.hidden_features, &mut rng);
        let bbox = Linear::new(config.hidden_features, 4, &mut rng);
        let label = Linear::new(config.hidden_features, config.num_classes, &mut rng);

        Ok(SodNet {
            backbone,
            interim,
            batch_norm: BatchNorm::new(config.hidden_features),
            bbox,
            label,
            image_dim: config.image_dim,
        })
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    /// Returns `batch x 4` boxes in pixels and `batch x num_classes` logits.
    ///
    /// Boxes go through a sigmoid scaled by the image size, so they always lie inside the image.
    pub fn forward(&self, images: ArrayView4<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        let batch_size = images.dim().0;
        let features = self.backbone.features(images)?;
        self.backbone.output_shape().check(batch_size, &features)?;

        let flat = features
            .into_shape((batch_size, self.interim.in_features()))
            .map_err(|_| Error::shape("sod features", "contiguous", "strided"))?;

        let hidden = relu(self.interim.forward(relu(flat).view())?);
        let hidden = self.batch_norm.forward(hidden)?;

        let boxes = sigmoid(self.bbox.forward(hidden.view())?) * self.image_dim;
        let labels = self.label.forward(hidden.view())?;

        Ok((boxes, labels))
    }
}
