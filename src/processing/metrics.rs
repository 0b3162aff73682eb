use ndarray::{ArrayView1, ArrayView2, Zip};

use crate::error::{Error, Result};
use crate::processing::loss::SsdLossOutput;

fn check_labels(
    context: &'static str,
    logits: &ArrayView2<f32>,
    labels: &ArrayView1<usize>,
) -> Result<()> {
    if logits.nrows() == 0 {
        return Err(Error::shape(context, "at least one sample", logits.dim()));
    }
    if labels.len() != logits.nrows() {
        return Err(Error::shape(context, logits.nrows(), labels.len()));
    }
    if let Some(&label) = labels.iter().find(|&&label| label >= logits.ncols()) {
        return Err(Error::LabelOutOfRange {
            label,
            num_classes: logits.ncols(),
        });
    }
    Ok(())
}

/// Fraction of samples whose highest logit is their label.
pub fn accuracy(logits: ArrayView2<f32>, labels: ArrayView1<usize>) -> Result<f32> {
    check_labels("accuracy", &logits, &labels)?;

    let correct = logits
        .outer_iter()
        .zip(labels.iter())
        .filter(|(row, &label)| {
            // softmax keeps the order of the logits, the first maximum wins
            let best = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                });
            best.0 == label
        })
        .count();

    Ok(correct as f32 / labels.len() as f32)
}

/// Mean softmax cross entropy of `logits` (`batch x classes`) against `labels`.
pub fn cross_entropy(logits: ArrayView2<f32>, labels: ArrayView1<usize>) -> Result<f32> {
    check_labels("cross_entropy", &logits, &labels)?;

    let total: f32 = logits
        .outer_iter()
        .zip(labels.iter())
        .map(|(row, &label)| {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let log_sum_exp = row.fold(0.0, |acc, &v| acc + (v - max).exp()).ln() + max;
            log_sum_exp - row[label]
        })
        .sum();

    Ok(total / labels.len() as f32)
}

/// Mean absolute error between two equally shaped arrays.
pub fn l1_loss(predicted: ArrayView2<f32>, target: ArrayView2<f32>) -> Result<f32> {
    if predicted.dim() != target.dim() {
        return Err(Error::shape("l1_loss", target.dim(), predicted.dim()));
    }
    if predicted.is_empty() {
        return Ok(0.0);
    }

    let total = Zip::from(&predicted)
        .and(&target)
        .fold(0.0_f32, |acc, &p, &t| acc + (p - t).abs());
    Ok(total / predicted.len() as f32)
}

/// Losses of the single object network: L1 on pixel boxes and cross entropy on the labels.
///
/// * `predicted_boxes` / `target_boxes` - `batch x 4` boxes in pixels.
/// * `predicted_logits` - `batch x num_classes`.
pub fn sod_losses(
    predicted_boxes: ArrayView2<f32>,
    predicted_logits: ArrayView2<f32>,
    target_boxes: ArrayView2<f32>,
    target_labels: ArrayView1<usize>,
) -> Result<SsdLossOutput> {
    Ok(SsdLossOutput {
        box_loss: l1_loss(predicted_boxes, target_boxes)?,
        class_loss: cross_entropy(predicted_logits, target_labels)?,
    })
}

/// Scalar that makes the box loss comparable to the class loss: `|class_loss / box_loss|`.
///
/// Computed once, from the losses of a single batch, and then used as the box weight in
/// [`SsdLossOutput::combined`].
pub fn loss_balance_factor(losses: &SsdLossOutput) -> Result<f32> {
    if losses.box_loss == 0.0 {
        return Err(Error::ZeroLoss);
    }
    let factor = (losses.class_loss / losses.box_loss).abs();
    tracing::info!("loss balance factor {factor}");
    Ok(factor)
}
