use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

use crate::error::{Error, Result};

/// A single box in `(xmin, ymin, xmax, ymax)` form.
pub type BBox = [f32; 4];

/// Checks that `boxes` is an `n x 4` array of corner coordinates.
pub(crate) fn check_boxes(context: &'static str, boxes: &ArrayView2<f32>) -> Result<()> {
    if boxes.ncols() != 4 {
        return Err(Error::shape(context, "(n, 4)", boxes.dim()));
    }
    Ok(())
}

/// Clamps a negative extent to zero, keeping NaN.
fn non_negative(extent: f32) -> f32 {
    if extent.is_nan() {
        extent
    } else {
        extent.max(0.0)
    }
}

/// `max(0, min(amax, bmax) - max(amin, bmin))`, NaN when any coordinate is NaN.
fn overlap(amin: f32, amax: f32, bmin: f32, bmax: f32) -> f32 {
    if amin.is_nan() || amax.is_nan() || bmin.is_nan() || bmax.is_nan() {
        return f32::NAN;
    }
    non_negative(amax.min(bmax) - amin.max(bmin))
}

/// Area of every box in `boxes`. Negative extents count as zero, NaN coordinates give NaN.
pub fn box_areas(boxes: ArrayView2<f32>) -> Array1<f32> {
    Zip::from(boxes.column(0))
        .and(boxes.column(1))
        .and(boxes.column(2))
        .and(boxes.column(3))
        .map_collect(|&xmin, &ymin, &xmax, &ymax| {
            non_negative(xmax - xmin) * non_negative(ymax - ymin)
        })
}

/// Pairwise [`overlap`] along one axis.
fn overlap_extent(
    a_min: ArrayView1<f32>,
    a_max: ArrayView1<f32>,
    b_min: ArrayView1<f32>,
    b_max: ArrayView1<f32>,
) -> Array2<f32> {
    let mut extent = Array2::<f32>::zeros((a_min.len(), b_min.len()));

    // anchors vary along the rows, objects along the columns
    Zip::from(&mut extent)
        .and_broadcast(a_min.insert_axis(Axis(1)))
        .and_broadcast(a_max.insert_axis(Axis(1)))
        .and_broadcast(b_min.insert_axis(Axis(0)))
        .and_broadcast(b_max.insert_axis(Axis(0)))
        .for_each(|e, &amin, &amax, &bmin, &bmax| {
            *e = overlap(amin, amax, bmin, bmax);
        });

    extent
}

/// Jaccard index (intersection over union) between every anchor and every object.
///
/// * `anchors` - `n x 4` boxes.
/// * `objects` - `m x 4` boxes, in the same coordinate frame.
/// * `return` - `n x m` matrix, entry `(i, j)` is the overlap of anchor `i` with object `j`.
///
/// Pairs whose union is empty get an overlap of `0.0`. A NaN coordinate makes every overlap
/// of its box NaN.
pub fn jaccard(anchors: ArrayView2<f32>, objects: ArrayView2<f32>) -> Result<Array2<f32>> {
    check_boxes("jaccard anchors", &anchors)?;
    check_boxes("jaccard objects", &objects)?;

    let overlap_width = overlap_extent(
        anchors.column(0),
        anchors.column(2),
        objects.column(0),
        objects.column(2),
    );
    let overlap_height = overlap_extent(
        anchors.column(1),
        anchors.column(3),
        objects.column(1),
        objects.column(3),
    );
    let overlaps = overlap_width * overlap_height;

    let anchor_areas = box_areas(anchors);
    let object_areas = box_areas(objects);
    let union = &anchor_areas.view().insert_axis(Axis(1))
        + &object_areas.view().insert_axis(Axis(0))
        - &overlaps;

    Ok(Zip::from(&overlaps)
        .and(&union)
        .map_collect(|&overlap, &union| {
            if union == 0.0 {
                0.0
            } else {
                overlap / union
            }
        }))
}

/// Jaccard index of two single boxes, with the same conventions as [`jaccard`].
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let width = overlap(a[0], a[2], b[0], b[2]);
    let height = overlap(a[1], a[3], b[1], b[3]);
    let intersection = width * height;

    let area_a = non_negative(a[2] - a[0]) * non_negative(a[3] - a[1]);
    let area_b = non_negative(b[2] - b[0]) * non_negative(b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}
