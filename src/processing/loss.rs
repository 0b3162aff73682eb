use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::Arc;

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

use crate::error::{Error, Result};
use crate::pipeline::config::SsdLossConfig;
use crate::pipeline::layers::logistic;
use crate::processing::box_coder::activations_to_ratios;
use crate::processing::matching::{assign, classify};
use crate::rcnn::anchors::AnchorSet;
use crate::rcnn::bbox::{box_areas, check_boxes, jaccard};

/// Box regression and classification losses, kept apart so the caller can weigh them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SsdLossOutput {
    pub box_loss: f32,
    pub class_loss: f32,
}

impl SsdLossOutput {
    /// `box_weight * box_loss + class_loss`, see
    /// [`loss_balance_factor`](crate::processing::metrics::loss_balance_factor).
    pub fn combined(&self, box_weight: f32) -> f32 {
        box_weight * self.box_loss + self.class_loss
    }
}

impl Add for SsdLossOutput {
    type Output = SsdLossOutput;

    fn add(self, rhs: Self) -> Self::Output {
        SsdLossOutput {
            box_loss: self.box_loss + rhs.box_loss,
            class_loss: self.class_loss + rhs.class_loss,
        }
    }
}

impl AddAssign for SsdLossOutput {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for SsdLossOutput {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(SsdLossOutput::default(), Add::add)
    }
}

/// One-hot targets over `num_classes + 1` categories with the background column dropped.
///
/// Anchors labelled `num_classes` (background) get an all-zero row.
pub fn one_hot_targets(classes: ArrayView1<usize>, num_classes: usize) -> Array2<f32> {
    let mut targets = Array2::<f32>::zeros((classes.len(), num_classes));
    for (mut row, &class) in targets.outer_iter_mut().zip(classes.iter()) {
        if class < num_classes {
            row[class] = 1.0;
        }
    }
    targets
}

/// `max(x, 0) - x * t + ln(1 + exp(-|x|))`, stable for large logits.
fn bce_with_logits(logit: f32, target: f32) -> f32 {
    logit.max(0.0) - logit * target + (-logit.abs()).exp().ln_1p()
}

/// Focal binary cross entropy, averaged over every element.
///
/// Each element is weighted by `alpha_t * (1 - p_t)^gamma` where `p` is the sigmoid of the logit,
/// `p_t = p * t + (1 - p) * (1 - t)` and `alpha_t = alpha * t + (1 - alpha) * (1 - t)`.
pub fn focal_loss(
    logits: ArrayView2<f32>,
    targets: ArrayView2<f32>,
    alpha: f32,
    gamma: f32,
) -> Result<f32> {
    if logits.dim() != targets.dim() {
        return Err(Error::shape("focal_loss", targets.dim(), logits.dim()));
    }
    if logits.is_empty() {
        return Ok(0.0);
    }

    let total = Zip::from(&logits)
        .and(&targets)
        .fold(0.0_f32, |acc, &logit, &target| {
            let p = logistic(logit);
            let p_t = p * target + (1.0 - p) * (1.0 - target);
            let alpha_t = alpha * target + (1.0 - alpha) * (1.0 - target);
            let weight = alpha_t * (1.0 - p_t).powf(gamma);
            acc + weight * bce_with_logits(logit, target)
        });

    Ok(total / logits.len() as f32)
}

/// Smooth L1 (Huber with `beta = 1`), averaged over every element.
pub fn smooth_l1_loss(predicted: ArrayView2<f32>, target: ArrayView2<f32>) -> Result<f32> {
    if predicted.dim() != target.dim() {
        return Err(Error::shape("smooth_l1_loss", target.dim(), predicted.dim()));
    }
    if predicted.is_empty() {
        return Ok(0.0);
    }

    let total = Zip::from(&predicted)
        .and(&target)
        .fold(0.0_f32, |acc, &p, &t| {
            let diff = (p - t).abs();
            acc + if diff < 1.0 { 0.5 * diff * diff } else { diff - 0.5 }
        });

    Ok(total / predicted.len() as f32)
}

/// Single shot detector loss over a fixed [`AnchorSet`].
///
/// Predictions are expected in anchor order: prediction `i` of an image belongs to anchor `i`.
#[derive(Debug, Clone)]
pub struct SsdLoss {
    anchors: Arc<AnchorSet>,
    normalized_anchors: Array2<f32>,
    config: SsdLossConfig,
}

impl SsdLoss {
    pub fn new(anchors: Arc<AnchorSet>, config: SsdLossConfig) -> Result<Self> {
        config.validate()?;
        if anchors.is_empty() {
            return Err(Error::Configuration("anchor set is empty".to_string()));
        }

        let normalized_anchors = anchors.normalized(config.image_dim);
        tracing::info!(
            "ssd loss over {} anchors, {} classes, threshold {}",
            anchors.len(),
            config.num_classes,
            config.threshold
        );

        Ok(SsdLoss {
            anchors,
            normalized_anchors,
            config,
        })
    }

    pub fn anchors(&self) -> &AnchorSet {
        &self.anchors
    }

    pub fn config(&self) -> &SsdLossConfig {
        &self.config
    }

    fn check_targets(
        &self,
        target_boxes: &ArrayView2<f32>,
        target_labels: &ArrayView1<usize>,
    ) -> Result<()> {
        check_boxes("target boxes", target_boxes)?;
        if target_boxes.nrows() == 0 {
            return Err(Error::EmptyImage);
        }
        if target_labels.len() != target_boxes.nrows() {
            return Err(Error::shape(
                "target labels",
                target_boxes.nrows(),
                target_labels.len(),
            ));
        }
        if let Some(&label) = target_labels
            .iter()
            .find(|&&label| label >= self.config.num_classes)
        {
            return Err(Error::LabelOutOfRange {
                label,
                num_classes: self.config.num_classes,
            });
        }
        if let Some(index) = box_areas(target_boxes.view())
            .iter()
            .position(|&area| !(area > 0.0))
        {
            return Err(Error::DegenerateBox { index });
        }
        Ok(())
    }

    /// Loss of a single image.
    ///
    /// * `target_boxes` - `m x 4` ground truth boxes in pixels, `m >= 1`.
    /// * `target_labels` - `m` class labels in `0..num_classes`.
    /// * `predicted_boxes` - `n * 4` raw box activations, four per anchor.
    /// * `predicted_labels` - `n * (num_classes + 1)` class logits, background last.
    pub fn image_loss(
        &self,
        target_boxes: ArrayView2<f32>,
        target_labels: ArrayView1<usize>,
        predicted_boxes: ArrayView1<f32>,
        predicted_labels: ArrayView1<f32>,
    ) -> Result<SsdLossOutput> {
        self.check_targets(&target_boxes, &target_labels)?;

        let num_anchors = self.anchors.len();
        let num_classes = self.config.num_classes;
        if predicted_boxes.len() != num_anchors * 4 {
            return Err(Error::shape(
                "predicted boxes",
                num_anchors * 4,
                predicted_boxes.len(),
            ));
        }
        if predicted_labels.len() != num_anchors * (num_classes + 1) {
            return Err(Error::shape(
                "predicted labels",
                num_anchors * (num_classes + 1),
                predicted_labels.len(),
            ));
        }

        let overlaps = jaccard(self.anchors.boxes(), target_boxes)?;
        let assignment = assign(overlaps.view())?;
        let anchor_classes = classify(
            &assignment,
            target_labels,
            self.config.threshold,
            self.config.background_index,
        )?;

        // classification, background anchors are trained towards zero on every real class
        let targets = one_hot_targets(anchor_classes.classes.view(), num_classes);
        let logits = predicted_labels
            .as_standard_layout()
            .into_shape((num_anchors, num_classes + 1))
            .map_err(|_| Error::shape("predicted labels", "contiguous", "strided"))?;
        let class_loss = focal_loss(
            logits.slice(s![.., ..num_classes]),
            targets.view(),
            self.config.alpha,
            self.config.gamma,
        )?;

        // regression, only anchors matched to an object contribute
        let activations = predicted_boxes
            .as_standard_layout()
            .into_shape((num_anchors, 4))
            .map_err(|_| Error::shape("predicted boxes", "contiguous", "strided"))?;
        let positive_activations = activations.select(Axis(0), &anchor_classes.positive_anchors);
        let positive_anchors = self
            .normalized_anchors
            .select(Axis(0), &anchor_classes.positive_anchors);
        let predicted = activations_to_ratios(positive_activations.view(), positive_anchors.view())?;

        let matched_targets = (&target_boxes / self.config.image_dim)
            .select(Axis(0), &anchor_classes.matched_objects);
        let box_loss = smooth_l1_loss(predicted.view(), matched_targets.view())?;

        tracing::debug!(
            "image loss: {} objects, {} positive anchors, box {box_loss:.5}, class {class_loss:.5}",
            target_boxes.nrows(),
            anchor_classes.positive_anchors.len()
        );

        Ok(SsdLossOutput {
            box_loss,
            class_loss,
        })
    }

    /// Summed loss over a batch; the first failing image aborts the whole batch.
    ///
    /// * `target_boxes` / `target_labels` - one entry per image.
    /// * `predicted_boxes` - `batch x (n * 4)`.
    /// * `predicted_labels` - `batch x (n * (num_classes + 1))`.
    pub fn forward(
        &self,
        target_boxes: &[Array2<f32>],
        target_labels: &[Array1<usize>],
        predicted_boxes: ArrayView2<f32>,
        predicted_labels: ArrayView2<f32>,
    ) -> Result<SsdLossOutput> {
        let batch_size = target_boxes.len();
        if target_labels.len() != batch_size {
            return Err(Error::shape("target labels batch", batch_size, target_labels.len()));
        }
        if predicted_boxes.nrows() != batch_size {
            return Err(Error::shape(
                "predicted boxes batch",
                batch_size,
                predicted_boxes.nrows(),
            ));
        }
        if predicted_labels.nrows() != batch_size {
            return Err(Error::shape(
                "predicted labels batch",
                batch_size,
                predicted_labels.nrows(),
            ));
        }

        target_boxes
            .iter()
            .zip(target_labels)
            .zip(predicted_boxes.outer_iter().zip(predicted_labels.outer_iter()))
            .enumerate()
            .map(|(image, ((boxes, labels), (pred_boxes, pred_labels)))| {
                self.image_loss(boxes.view(), labels.view(), pred_boxes, pred_labels)
                    .inspect_err(|e| tracing::warn!("loss failed on image {image}: {e}"))
            })
            .sum()
    }
}
