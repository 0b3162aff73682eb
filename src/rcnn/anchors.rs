use std::path::Path;

use anyhow::Context;
use ndarray::{Array2, ArrayView1, ArrayView2};
use ndarray_npy::{read_npy, write_npy};

use crate::error::{Error, Result};
use crate::pipeline::config::AnchorConfig;
use crate::rcnn::bbox::check_boxes;

/// Fixed, ordered reference boxes in pixel coordinates.
///
/// The order of the rows is the order in which detection heads emit their predictions,
/// so an anchor set is built once and shared read-only between every image of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
    boxes: Array2<f32>,
}

impl AnchorSet {
    /// Wraps an `n x 4` array of `(xmin, ymin, xmax, ymax)` boxes.
    pub fn from_boxes(boxes: Array2<f32>) -> Result<Self> {
        check_boxes("anchor set", &boxes.view())?;
        if boxes.nrows() == 0 {
            return Err(Error::Configuration("anchor set is empty".to_string()));
        }
        Ok(AnchorSet { boxes })
    }

    /// Tiles anchors over square grids covering an image of side `image_dim`.
    ///
    /// For every grid size `g`, cells are visited row by row (y, then x) and each cell gets one
    /// anchor per `(zoom, ratio)` permutation, zoom-major. The anchor is centered on the cell and
    /// has size `(zoom * ratio.0 / g, zoom * ratio.1 / g)` relative to the image.
    pub fn grid(
        image_dim: f32,
        grid_sizes: &[usize],
        zooms: &[f32],
        ratios: &[(f32, f32)],
    ) -> Result<Self> {
        if grid_sizes.contains(&0) {
            return Err(Error::Configuration("grid sizes must be positive".to_string()));
        }
        if zooms.is_empty() || ratios.is_empty() {
            return Err(Error::Configuration(
                "anchors need at least one zoom and one ratio".to_string(),
            ));
        }

        let num_permutations = zooms.len() * ratios.len();
        let num_anchors: usize = grid_sizes.iter().map(|g| g * g * num_permutations).sum();
        let mut boxes = Vec::with_capacity(num_anchors * 4);

        for &g in grid_sizes {
            let cell = 1.0 / g as f32;
            for y in 0..g {
                let cy = (y as f32 + 0.5) * cell;
                for x in 0..g {
                    let cx = (x as f32 + 0.5) * cell;
                    for &zoom in zooms {
                        for &(rw, rh) in ratios {
                            let half_w = zoom * rw * cell / 2.0;
                            let half_h = zoom * rh * cell / 2.0;
                            boxes.extend_from_slice(&[
                                (cx - half_w) * image_dim,
                                (cy - half_h) * image_dim,
                                (cx + half_w) * image_dim,
                                (cy + half_h) * image_dim,
                            ]);
                        }
                    }
                }
            }
        }

        let boxes = Array2::from_shape_vec((num_anchors, 4), boxes)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Self::from_boxes(boxes)
    }

    /// Builds the anchor grid described by `config` for images of side `image_dim`.
    pub fn from_config(config: &AnchorConfig, image_dim: f32) -> Result<Self> {
        let anchors = Self::grid(image_dim, &config.grid_sizes, &config.zooms, &config.ratios)?;
        tracing::info!(
            "generated {} anchors over grids {:?}",
            anchors.len(),
            config.grid_sizes
        );
        Ok(anchors)
    }

    /// Loads an `n x 4` anchor array stored with numpy's `.npy` format.
    pub fn read_npy(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let boxes: Array2<f32> = read_npy(path)
            .with_context(|| format!("failed to read anchors from `{}`", path.display()))?;
        Ok(Self::from_boxes(boxes)?)
    }

    /// Stores the anchors with numpy's `.npy` format.
    pub fn write_npy(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        write_npy(path, &self.boxes)
            .with_context(|| format!("failed to write anchors to `{}`", path.display()))
    }

    pub fn boxes(&self) -> ArrayView2<'_, f32> {
        self.boxes.view()
    }

    pub fn get(&self, index: usize) -> Option<ArrayView1<'_, f32>> {
        (index < self.len()).then(|| self.boxes.row(index))
    }

    pub fn len(&self) -> usize {
        self.boxes.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.nrows() == 0
    }

    /// Anchors scaled into `[0, 1]` ratios of an image of side `image_dim`.
    pub fn normalized(&self, image_dim: f32) -> Array2<f32> {
        &self.boxes / image_dim
    }
}
