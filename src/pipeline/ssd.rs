use ndarray::{concatenate, Array2, Array4, ArrayView2, ArrayView4, Axis};

use crate::error::{Error, Result};
use crate::pipeline::backbone::Backbone;
use crate::pipeline::config::SsdNetConfig;
use crate::pipeline::layers::{seeded_rng, BatchNorm, Conv2d, Rng};
use crate::rcnn::anchors::AnchorSet;

/// One resolution of the detector: a stride 2 reduction followed by the two prediction heads.
struct Stage {
    conv: Conv2d,
    batch_norm: BatchNorm,
    box_head: Conv2d,
    class_head: Conv2d,
    grid_size: usize,
}

impl Stage {
    fn new(
        in_channels: usize,
        config: &SsdNetConfig,
        input_size: usize,
        rng: &mut Rng,
    ) -> Result<Self> {
        let conv = Conv2d::new(in_channels, config.head_channels, 3, 2, 1, rng);
        let grid_size = conv.output_size(input_size).ok_or_else(|| {
            Error::Configuration(format!("feature map of size {input_size} is too small"))
        })?;
        let permutations = config.num_permutations;

        Ok(Stage {
            conv,
            batch_norm: BatchNorm::new(config.head_channels),
            box_head: Conv2d::new(config.head_channels, permutations * 4, 3, 1, 1, rng),
            class_head: Conv2d::new(
                config.head_channels,
                permutations * (config.num_classes + 1),
                3,
                1,
                1,
                rng,
            ),
            grid_size,
        })
    }
}

/// Lays a `batch x channels x h x w` head output out as `batch x (h * w * channels)`, so that the
/// prediction for cell `(y, x)` and permutation `p` lands at `(y * w + x) * P + p`.
fn flatten(head: Array4<f32>) -> Result<Array2<f32>> {
    let (batch, channels, height, width) = head.dim();
    let permuted = head.permuted_axes([0, 2, 3, 1]);
    Array2::from_shape_vec(
        (batch, height * width * channels),
        permuted.iter().copied().collect(),
    )
    .map_err(|_| Error::shape("ssd head", (batch, channels, height, width), "flattened"))
}

/// Single shot multi object detector over grids of decreasing resolution.
pub struct SsdNet<B: Backbone> {
    backbone: B,
    stages: Vec<Stage>,
    num_classes: usize,
    num_permutations: usize,
}

impl<B: Backbone> SsdNet<B> {
    /// Builds three stages on top of `backbone`. With the ResNet-34 trunk the 7 x 7 feature map
    /// becomes grids of 4, 2 and 1 cells.
    pub fn new(backbone: B, config: &SsdNetConfig) -> Result<Self> {
        let features = backbone.output_shape();
        if features.is_empty() || features.height != features.width {
            return Err(Error::Configuration(format!(
                "ssd net needs square, non-empty backbone features, got {features:?}"
            )));
        }
        if config.num_permutations == 0 || config.head_channels == 0 || config.num_classes == 0 {
            return Err(Error::Configuration(format!(
                "ssd net needs permutations, head channels and classes: {config:?}"
            )));
        }

        let mut rng = seeded_rng(config.seed);
        let mut stages = Vec::with_capacity(3);
        let mut in_channels = features.channels;
        let mut size = features.height;
        for _ in 0..3 {
            let stage = Stage::new(in_channels, config, size, &mut rng)?;
            in_channels = config.head_channels;
            size = stage.grid_size;
            stages.push(stage);
        }

        let net = SsdNet {
            backbone,
            stages,
            num_classes: config.num_classes,
            num_permutations: config.num_permutations,
        };
        tracing::info!(
            "ssd net with grids {:?}, {} predictions per image",
            net.grid_sizes(),
            net.num_predictions()
        );
        Ok(net)
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn grid_sizes(&self) -> Vec<usize> {
        self.stages.iter().map(|stage| stage.grid_size).collect()
    }

    /// Number of anchors the outputs refer to.
    pub fn num_predictions(&self) -> usize {
        self.stages
            .iter()
            .map(|stage| stage.grid_size * stage.grid_size)
            .sum::<usize>()
            * self.num_permutations
    }

    /// Checks that `anchors` has one box per prediction.
    pub fn check_anchors(&self, anchors: &AnchorSet) -> Result<()> {
        if anchors.len() != self.num_predictions() {
            return Err(Error::shape(
                "ssd anchors",
                self.num_predictions(),
                anchors.len(),
            ));
        }
        Ok(())
    }

    /// Returns box activations (`batch x N*4`) and class logits (`batch x N*(num_classes+1)`).
    pub fn forward(&self, images: ArrayView4<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        let batch_size = images.dim().0;
        let mut x = self.backbone.features(images)?;
        self.backbone.output_shape().check(batch_size, &x)?;

        let mut boxes = Vec::with_capacity(self.stages.len());
        let mut labels = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            x = stage.batch_norm.forward(stage.conv.forward(x.view())?)?;
            boxes.push(flatten(stage.box_head.forward(x.view())?)?);
            labels.push(flatten(stage.class_head.forward(x.view())?)?);
        }

        Ok((concat(&boxes)?, concat(&labels)?))
    }
}

fn concat(parts: &[Array2<f32>]) -> Result<Array2<f32>> {
    let views: Vec<ArrayView2<f32>> = parts.iter().map(|part| part.view()).collect();
    concatenate(Axis(1), &views).map_err(|_| Error::shape("ssd outputs", "equal batch", "ragged"))
}
