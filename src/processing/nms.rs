use std::collections::BTreeMap;

use ndarray::{ArrayView1, ArrayView2, Axis};

use crate::error::{Error, Result};
use crate::pipeline::config::DetectionConfig;
use crate::pipeline::layers::logistic;
use crate::processing::box_coder::activations_to_ratios;
use crate::rcnn::anchors::AnchorSet;
use crate::rcnn::bbox::{check_boxes, iou, BBox};

/// A decoded prediction in pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub score: f32,
    pub class: usize,
}

/// Greedily keeps the highest scoring boxes, dropping any box that overlaps a kept one
/// by more than `iou_threshold`.
///
/// * `boxes` - `k x 4` corner boxes.
/// * `scores` - `k` confidences.
/// * `return` - indexes into `boxes` to keep, by descending score.
pub fn nms(boxes: ArrayView2<f32>, scores: ArrayView1<f32>, iou_threshold: f32) -> Result<Vec<usize>> {
    check_boxes("nms", &boxes)?;
    if scores.len() != boxes.nrows() {
        return Err(Error::shape("nms scores", boxes.nrows(), scores.len()));
    }

    let boxes: Vec<BBox> = boxes
        .outer_iter()
        .map(|b| [b[0], b[1], b[2], b[3]])
        .collect();

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep = Vec::new();
    while let Some((&i, rest)) = order.split_first() {
        keep.push(i);
        order = rest
            .iter()
            .copied()
            .filter(|&j| iou(&boxes[i], &boxes[j]) <= iou_threshold)
            .collect();
    }

    Ok(keep)
}

/// Turns raw network outputs for one image into scored, non-overlapping detections.
///
/// Class scores are the sigmoid of the logits, the background logit is ignored. Each anchor
/// proposes its best class; proposals under `confidence_threshold` are dropped and the rest
/// go through [`nms`] per class.
pub fn decode_detections(
    predicted_boxes: ArrayView1<f32>,
    predicted_labels: ArrayView1<f32>,
    anchors: &AnchorSet,
    num_classes: usize,
    image_dim: f32,
    config: &DetectionConfig,
) -> Result<Vec<Detection>> {
    let num_anchors = anchors.len();
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

    let activations = predicted_boxes
        .as_standard_layout()
        .into_shape((num_anchors, 4))
        .map_err(|_| Error::shape("predicted boxes", "contiguous", "strided"))?;
    let logits = predicted_labels
        .as_standard_layout()
        .into_shape((num_anchors, num_classes + 1))
        .map_err(|_| Error::shape("predicted labels", "contiguous", "strided"))?;

    let boxes = activations_to_ratios(activations.view(), anchors.normalized(image_dim).view())?
        * image_dim;

    // candidates grouped per class, in anchor order
    let mut candidates: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut scores = vec![0.0; num_anchors];
    let mut classes = vec![0; num_anchors];
    for (anchor, row) in logits.axis_iter(Axis(0)).enumerate() {
        let (class, logit) = row
            .iter()
            .take(num_classes)
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (c, l)| if l > best.1 { (c, l) } else { best });
        let score = logistic(logit);

        if score >= config.confidence_threshold {
            scores[anchor] = score;
            classes[anchor] = class;
            candidates.entry(class).or_default().push(anchor);
        }
    }

    let mut detections = Vec::new();
    for (class, members) in candidates {
        let class_boxes = boxes.select(Axis(0), &members);
        let class_scores = ndarray::Array1::from_iter(members.iter().map(|&a| scores[a]));

        for keep in nms(class_boxes.view(), class_scores.view(), config.iou_threshold)? {
            let anchor = members[keep];
            let b = boxes.row(anchor);
            detections.push(Detection {
                bbox: [b[0], b[1], b[2], b[3]],
                score: scores[anchor],
                class: classes[anchor],
            });
        }

        tracing::debug!("class {class}: {} candidates", members.len());
    }

    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1};

    use super::{decode_detections, nms};
    use crate::pipeline::config::DetectionConfig;
    use crate::rcnn::anchors::AnchorSet;

    #[test]
    fn test_nms() {
        let boxes = array![
            [100.0, 100.0, 210.0, 210.0],
            [250.0, 250.0, 420.0, 420.0],
            [220.0, 220.0, 320.0, 330.0],
            [100.0, 100.0, 210.0, 210.0],
        ];
        let scores = array![0.72, 0.8, 0.92, 0.6];

        let keep = nms(boxes.view(), scores.view(), 0.4).unwrap();
        assert_eq!(keep, vec![2, 1, 0]);

        let keep = nms(boxes.view(), scores.view(), 0.1).unwrap();
        assert_eq!(keep, vec![2, 0]);
    }

    #[test]
    fn test_nms_shape_mismatch() {
        let boxes = array![[0.0, 0.0, 1.0, 1.0]];
        assert!(nms(boxes.view(), array![0.1, 0.2].view(), 0.5).is_err());
    }

    #[test]
    fn test_decode_detections() {
        let anchors = AnchorSet::grid(224.0, &[2], &[1.0], &[(1.0, 1.0)]).unwrap();
        let num_classes = 2;
        let predicted_boxes = Array1::<f32>::zeros(4 * 4);

        // anchor 0 is confident about class 1, anchor 3 about class 0, the others are background
        let mut predicted_labels = Array1::<f32>::from_elem(4 * 3, -10.0);
        predicted_labels[1] = 4.0;
        predicted_labels[3 * 3] = 2.0;
        predicted_labels[3 * 3 + 2] = 10.0;

        let detections = decode_detections(
            predicted_boxes.view(),
            predicted_labels.view(),
            &anchors,
            num_classes,
            224.0,
            &DetectionConfig::new(),
        )
        .unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class, 1);
        assert_eq!(detections[0].bbox, [0.0, 0.0, 112.0, 112.0]);
        assert_eq!(detections[1].class, 0);
        assert_eq!(detections[1].bbox, [112.0, 112.0, 224.0, 224.0]);
        assert!(detections[0].score > detections[1].score);
    }
}
