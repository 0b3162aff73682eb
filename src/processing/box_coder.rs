use ndarray::{stack, Array1, Array2, ArrayView2, Axis};

use crate::error::{Error, Result};
use crate::rcnn::bbox::check_boxes;

/// Keeps `atanh` finite when encoding boxes that reach the edge of the decodable range.
const TANH_CLIP: f32 = 1.0 - 1e-6;

struct AnchorGeometry {
    ctr_x: Array1<f32>,
    ctr_y: Array1<f32>,
    widths: Array1<f32>,
    heights: Array1<f32>,
}

fn anchor_geometry(anchors: &ArrayView2<f32>) -> AnchorGeometry {
    let widths = &anchors.column(2) - &anchors.column(0);
    let heights = &anchors.column(3) - &anchors.column(1);

    AnchorGeometry {
        ctr_x: &widths / 2.0 + &anchors.column(0),
        ctr_y: &heights / 2.0 + &anchors.column(1),
        widths,
        heights,
    }
}

fn check_pairs(
    context: &'static str,
    boxes: &ArrayView2<f32>,
    anchors: &ArrayView2<f32>,
) -> Result<()> {
    check_boxes(context, boxes)?;
    check_boxes(context, anchors)?;
    if boxes.nrows() != anchors.nrows() {
        return Err(Error::shape(context, anchors.dim(), boxes.dim()));
    }
    Ok(())
}

/// Decodes raw head activations into corner boxes, relative to their anchors.
///
/// The activations go through `tanh`, so the predicted center can move at most half an anchor
/// away from the anchor center and each side can scale between `0.5x` and `1.5x`.
///
/// * `activations` - `k x 4` raw outputs `(dx, dy, dw, dh)`.
/// * `anchors` - `k x 4` matched anchors as `[0, 1]` ratios.
/// * `return` - `k x 4` boxes as `[0, 1]` ratios in `(xmin, ymin, xmax, ymax)` form.
pub fn activations_to_ratios(
    activations: ArrayView2<f32>,
    anchors: ArrayView2<f32>,
) -> Result<Array2<f32>> {
    check_pairs("activations_to_ratios", &activations, &anchors)?;

    let activations = activations.mapv(f32::tanh);
    let anchors = anchor_geometry(&anchors);

    let pred_ctr_x = &activations.column(0) / 2.0 * &anchors.widths + &anchors.ctr_x;
    let pred_ctr_y = &activations.column(1) / 2.0 * &anchors.heights + &anchors.ctr_y;
    let pred_w = (&activations.column(2) / 2.0 + 1.0) * &anchors.widths;
    let pred_h = (&activations.column(3) / 2.0 + 1.0) * &anchors.heights;

    let half_w = pred_w / 2.0;
    let half_h = pred_h / 2.0;

    let x1 = &pred_ctr_x - &half_w;
    let y1 = &pred_ctr_y - &half_h;
    let x2 = &pred_ctr_x + &half_w;
    let y2 = &pred_ctr_y + &half_h;

    Ok(stack![Axis(1), x1, y1, x2, y2])
}

/// Inverse of [`activations_to_ratios`]: the activations that decode to `boxes`.
///
/// Boxes outside the decodable range of their anchor are clipped to its edge.
/// Anchors without width or height cannot encode anything and are rejected.
pub fn ratios_to_activations(
    boxes: ArrayView2<f32>,
    anchors: ArrayView2<f32>,
) -> Result<Array2<f32>> {
    check_pairs("ratios_to_activations", &boxes, &anchors)?;

    let anchors = anchor_geometry(&anchors);
    if let Some(index) = anchors
        .widths
        .iter()
        .zip(anchors.heights.iter())
        .position(|(&w, &h)| !(w > 0.0 && h > 0.0))
    {
        return Err(Error::DegenerateBox { index });
    }

    let boxes = anchor_geometry(&boxes);

    let dx = (&boxes.ctr_x - &anchors.ctr_x) / &anchors.widths * 2.0;
    let dy = (&boxes.ctr_y - &anchors.ctr_y) / &anchors.heights * 2.0;
    let dw = (&boxes.widths / &anchors.widths - 1.0) * 2.0;
    let dh = (&boxes.heights / &anchors.heights - 1.0) * 2.0;

    let activations = stack![Axis(1), dx, dy, dw, dh];
    Ok(activations.mapv(|a| a.clamp(-TANH_CLIP, TANH_CLIP).atanh()))
}
