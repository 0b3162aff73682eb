use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

use crate::error::{Error, Result};

/// Score given to the best anchor of every object, above any natural overlap.
pub const FORCED_MATCH_SCORE: f32 = 1.99;

/// Index and value of the first maximum in `values`.
///
/// Ties resolve to the earliest index, and NaN never wins over a number.
fn argmax(values: ArrayView1<f32>) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, value)| match best {
            Some((_, best_value))
                if value > best_value || (best_value.is_nan() && !value.is_nan()) =>
            {
                Some((i, value))
            }
            Some(_) => best,
            None => Some((i, value)),
        })
}

/// Best object for every anchor, after forcing each object onto its best anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorAssignment {
    /// Overlap of every anchor with its object, [`FORCED_MATCH_SCORE`] for forced anchors.
    pub scores: Array1<f32>,
    /// Object index assigned to every anchor.
    pub objects: Array1<usize>,
    /// Best anchor of every object.
    pub best_anchors: Array1<usize>,
}

/// Matches anchors and objects from their `n x m` overlap matrix.
///
/// Every anchor takes the object it overlaps most. Then every object claims the anchor it
/// overlaps most: that anchor's score is raised to [`FORCED_MATCH_SCORE`] and it points back
/// to the object, so no object is left without an anchor. Objects are applied in index order,
/// so when two objects share a best anchor the later one keeps it.
pub fn assign(overlaps: ArrayView2<f32>) -> Result<AnchorAssignment> {
    let (num_anchors, num_objects) = overlaps.dim();
    if num_anchors == 0 {
        return Err(Error::shape("assign", "at least one anchor", overlaps.dim()));
    }
    if num_objects == 0 {
        return Err(Error::EmptyImage);
    }

    // a NaN column has no maximum, fall back to the first anchor
    let best_anchors: Array1<usize> = overlaps
        .axis_iter(Axis(1))
        .map(|column| argmax(column).map_or(0, |(i, _)| i))
        .collect();

    let (mut objects, mut scores): (Vec<usize>, Vec<f32>) = overlaps
        .axis_iter(Axis(0))
        .map(|row| argmax(row).unwrap_or((0, f32::NAN)))
        .unzip();

    for (object, &anchor) in best_anchors.iter().enumerate() {
        scores[anchor] = FORCED_MATCH_SCORE;
        objects[anchor] = object;
    }

    Ok(AnchorAssignment {
        scores: Array1::from(scores),
        objects: Array1::from(objects),
        best_anchors,
    })
}

/// Per-anchor class targets derived from an [`AnchorAssignment`].
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorClasses {
    /// Class of every anchor, `background_index` for anchors without an object.
    pub classes: Array1<usize>,
    /// Anchors whose score is above the threshold, ascending.
    pub positive_anchors: Vec<usize>,
    /// Object matched to each of `positive_anchors`, in the same order.
    pub matched_objects: Vec<usize>,
}

/// Labels every anchor with the class of its object, or as background.
///
/// An anchor is positive when its score is strictly above `threshold`.
pub fn classify(
    assignment: &AnchorAssignment,
    object_labels: ArrayView1<usize>,
    threshold: f32,
    background_index: usize,
) -> Result<AnchorClasses> {
    let num_objects = object_labels.len();
    if num_objects != assignment.best_anchors.len() {
        return Err(Error::shape(
            "classify labels",
            assignment.best_anchors.len(),
            num_objects,
        ));
    }
    if let Some(&object) = assignment.objects.iter().find(|&&o| o >= num_objects) {
        return Err(Error::shape(
            "classify labels",
            format!("at least {} labels", object + 1),
            num_objects,
        ));
    }
    if assignment.scores.len() != assignment.objects.len() {
        return Err(Error::shape(
            "classify assignment",
            assignment.objects.len(),
            assignment.scores.len(),
        ));
    }

    let mut classes = Array1::from_elem(assignment.scores.len(), background_index);
    let mut positive_anchors = Vec::new();
    let mut matched_objects = Vec::new();

    for (anchor, (&score, &object)) in assignment
        .scores
        .iter()
        .zip(assignment.objects.iter())
        .enumerate()
    {
        if score > threshold {
            classes[anchor] = object_labels[object];
            positive_anchors.push(anchor);
            matched_objects.push(object);
        }
    }

    Ok(AnchorClasses {
        classes,
        positive_anchors,
        matched_objects,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2};

    use super::{argmax, assign, classify, FORCED_MATCH_SCORE};
    use crate::error::Error;
    use crate::rcnn::bbox::jaccard;

    #[test]
    fn test_argmax_first_wins() {
        let values = array![0.2, 0.7, 0.7, 0.1];
        assert_eq!(argmax(values.view()), Some((1, 0.7)));

        let values = array![f32::NAN, 0.3, f32::NAN, 0.3];
        assert_eq!(argmax(values.view()).map(|(i, _)| i), Some(1));

        let values = ndarray::Array1::<f32>::zeros(0);
        assert_eq!(argmax(values.view()), None);
    }

    #[test]
    fn test_exact_match() {
        let anchors = array![[0.0, 0.0, 10.0, 10.0]];
        let objects = array![[0.0, 0.0, 10.0, 10.0]];
        let labels = array![7_usize];

        let overlaps = jaccard(anchors.view(), objects.view()).unwrap();
        assert_eq!(overlaps[[0, 0]], 1.0);

        let assignment = assign(overlaps.view()).unwrap();
        let classes = classify(&assignment, labels.view(), 0.5, 20).unwrap();

        assert_eq!(classes.classes, array![7]);
        assert_eq!(classes.positive_anchors, vec![0]);
        assert_eq!(classes.matched_objects, vec![0]);
    }

    #[test]
    fn test_disjoint_object_is_forced() {
        let anchors = array![[0.0, 0.0, 10.0, 10.0], [0.0, 0.0, 10.0, 10.0]];
        let objects = array![[50.0, 50.0, 60.0, 60.0]];
        let labels = array![3_usize];

        let overlaps = jaccard(anchors.view(), objects.view()).unwrap();
        let assignment = assign(overlaps.view()).unwrap();

        // all overlaps are zero, the first anchor wins the tie
        assert_eq!(assignment.best_anchors, array![0]);
        assert_eq!(assignment.scores, array![FORCED_MATCH_SCORE, 0.0]);

        let classes = classify(&assignment, labels.view(), 0.5, 20).unwrap();
        assert_eq!(classes.positive_anchors, vec![0]);
        assert_eq!(classes.matched_objects, vec![0]);
        assert_eq!(classes.classes, array![3, 20]);
    }

    #[test]
    fn test_forced_anchor_points_back() {
        // anchor 1 prefers object 1 naturally, but it is the best anchor of object 0
        let overlaps = array![
            [0.1, 0.0],
            [0.3, 0.6],
            [0.0, 0.9],
        ];
        let assignment = assign(overlaps.view()).unwrap();

        assert_eq!(assignment.best_anchors, array![1, 2]);
        assert_eq!(assignment.objects, array![0, 0, 1]);
        assert_eq!(
            assignment.scores,
            array![0.1, FORCED_MATCH_SCORE, FORCED_MATCH_SCORE]
        );
    }

    #[test]
    fn test_every_object_matched_below_threshold() {
        let anchors = array![
            [0.0, 0.0, 100.0, 100.0],
            [100.0, 0.0, 200.0, 100.0],
            [0.0, 100.0, 100.0, 200.0],
        ];
        let objects = array![
            [0.0, 0.0, 20.0, 20.0],
            [150.0, 10.0, 170.0, 30.0],
            [10.0, 180.0, 30.0, 200.0],
        ];
        let labels = array![0_usize, 1, 2];

        let overlaps = jaccard(anchors.view(), objects.view()).unwrap();
        assert!(overlaps.iter().all(|&o| o < 0.5));

        let assignment = assign(overlaps.view()).unwrap();
        let classes = classify(&assignment, labels.view(), 0.5, 3).unwrap();

        for object in 0..3 {
            let matched = classes
                .positive_anchors
                .iter()
                .zip(&classes.matched_objects)
                .any(|(&anchor, &o)| o == object && classes.classes[anchor] == labels[object]);
            assert!(matched, "object {object} has no positive anchor");
        }
    }

    #[test]
    fn test_shared_best_anchor_later_object_wins() {
        let overlaps = array![[0.8, 0.9], [0.1, 0.2]];
        let assignment = assign(overlaps.view()).unwrap();

        assert_eq!(assignment.best_anchors, array![0, 0]);
        assert_eq!(assignment.objects, array![1, 1]);
    }

    #[test]
    fn test_strict_threshold() {
        let overlaps = array![[0.5, 0.0], [0.2, 0.0], [0.0, 0.9]];
        let assignment = assign(overlaps.view()).unwrap();
        let labels = array![4_usize, 5];

        // anchor 0 is forced for object 0 anyway; drop the force to test the boundary
        let mut natural = assignment.clone();
        natural.scores[0] = 0.5;

        let classes = classify(&natural, labels.view(), 0.5, 6).unwrap();
        assert_eq!(classes.classes, array![6, 6, 5]);
        assert_eq!(classes.positive_anchors, vec![2]);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            assign(Array2::<f32>::zeros((3, 0)).view()),
            Err(Error::EmptyImage)
        ));
        assert!(matches!(
            assign(Array2::<f32>::zeros((0, 2)).view()),
            Err(Error::ShapeMismatch { .. })
        ));

        let assignment = assign(array![[0.4, 0.6]].view()).unwrap();
        assert!(matches!(
            classify(&assignment, array![1_usize].view(), 0.5, 2),
            Err(Error::ShapeMismatch { .. })
        ));

        // one object, three labels
        let assignment = assign(array![[0.9], [0.1]].view()).unwrap();
        assert!(matches!(
            classify(&assignment, array![0_usize, 1, 2].view(), 0.5, 3),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_nan_overlaps() {
        let overlaps = array![[f32::NAN, 0.2], [0.7, f32::NAN], [0.1, 0.3]];
        let assignment = assign(overlaps.view()).unwrap();

        assert_eq!(assignment.best_anchors, array![1, 2]);
        assert_eq!(assignment.objects, array![1, 0, 1]);
        assert_eq!(
            assignment.scores,
            array![0.2, FORCED_MATCH_SCORE, FORCED_MATCH_SCORE]
        );

        let classes = classify(&assignment, array![4_usize, 5].view(), 0.5, 6).unwrap();
        assert_eq!(classes.classes, array![6, 4, 5]);
        assert_eq!(classes.positive_anchors, vec![1, 2]);
    }

    #[test]
    fn test_nan_anchor_stays_background() {
        let anchors = array![[f32::NAN, 0.0, 10.0, 10.0], [0.0, 0.0, 10.0, 10.0]];
        let objects = array![[0.0, 0.0, 10.0, 10.0]];

        let overlaps = jaccard(anchors.view(), objects.view()).unwrap();
        assert!(overlaps[[0, 0]].is_nan());

        let assignment = assign(overlaps.view()).unwrap();
        assert_eq!(assignment.best_anchors, array![1]);
        assert!(assignment.scores[0].is_nan());

        let classes = classify(&assignment, array![2_usize].view(), 0.5, 3).unwrap();
        assert_eq!(classes.classes, array![3, 2]);
        assert_eq!(classes.positive_anchors, vec![1]);
    }
}
