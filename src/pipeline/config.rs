use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Anchor grid layout, see [`AnchorSet::grid`](crate::rcnn::anchors::AnchorSet::grid).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    pub grid_sizes: Vec<usize>,
    pub zooms: Vec<f32>,
    pub ratios: Vec<(f32, f32)>,
}

impl AnchorConfig {
    pub fn new() -> Self {
        AnchorConfig {
            grid_sizes: vec![4, 2, 1],
            zooms: vec![0.7, 1.0, 1.3],
            ratios: vec![(1.0, 1.0), (1.0, 0.5), (0.5, 1.0)],
        }
    }

    /// Number of anchors per grid cell.
    pub fn num_permutations(&self) -> usize {
        self.zooms.len() * self.ratios.len()
    }
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsdLossConfig {
    /// Anchors whose overlap is strictly above this are assigned to their object.
    pub threshold: f32,
    pub num_classes: usize,
    /// Label used for anchors without an object. Must equal `num_classes`.
    pub background_index: usize,
    /// Side of the (square) input image in pixels.
    pub image_dim: f32,
    pub alpha: f32,
    pub gamma: f32,
}

impl SsdLossConfig {
    pub fn new() -> Self {
        SsdLossConfig {
            threshold: 0.5,
            num_classes: 20,
            background_index: 20,
            image_dim: 224.0,
            alpha: 0.25,
            gamma: 1.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Configuration(
                "num_classes must be positive".to_string(),
            ));
        }
        if self.background_index != self.num_classes {
            return Err(Error::Configuration(format!(
                "background_index ({}) must equal num_classes ({})",
                self.background_index, self.num_classes
            )));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::Configuration(format!(
                "threshold {} is outside [0, 1]",
                self.threshold
            )));
        }
        if !(self.image_dim.is_finite() && self.image_dim > 0.0) {
            return Err(Error::Configuration(format!(
                "image_dim {} must be positive",
                self.image_dim
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha) || !(self.gamma >= 0.0) {
            return Err(Error::Configuration(format!(
                "focal parameters alpha={} gamma={} are invalid",
                self.alpha, self.gamma
            )));
        }
        Ok(())
    }
}

impl Default for SsdLossConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl DetectionConfig {
    pub fn new() -> Self {
        DetectionConfig {
            confidence_threshold: 0.7,
            iou_threshold: 0.45,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SodNetConfig {
    pub num_classes: usize,
    pub hidden_features: usize,
    pub image_dim: f32,
    pub seed: u64,
}

impl SodNetConfig {
    pub fn new() -> Self {
        SodNetConfig {
            num_classes: 20,
            hidden_features: 256,
            image_dim: 224.0,
            seed: 0,
        }
    }
}

impl Default for SodNetConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsdNetConfig {
    /// Real classes, the heads emit one extra background logit.
    pub num_classes: usize,
    pub num_permutations: usize,
    pub head_channels: usize,
    pub seed: u64,
}

impl SsdNetConfig {
    pub fn new() -> Self {
        SsdNetConfig {
            num_classes: 20,
            num_permutations: 9,
            head_channels: 256,
            seed: 0,
        }
    }
}

impl Default for SsdNetConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub input_size: usize,
    pub target_size: usize,
    pub input_channels: usize,
    pub additional_blocks: usize,
}

impl GeneratorConfig {
    pub fn new() -> Self {
        GeneratorConfig {
            input_size: 7,
            target_size: 28,
            input_channels: 40,
            additional_blocks: 5,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Every tunable of the crate, as read from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub anchors: AnchorConfig,
    pub loss: SsdLossConfig,
    pub detection: DetectionConfig,
    pub sod: SodNetConfig,
    pub ssd: SsdNetConfig,
    pub generator: GeneratorConfig,
}

impl DetectorConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: DetectorConfig = toml::from_str(contents)?;
        config.loss.validate()?;

        if config.loss.num_classes != config.ssd.num_classes {
            return Err(Error::Configuration(format!(
                "loss expects {} classes but the ssd heads predict {}",
                config.loss.num_classes, config.ssd.num_classes
            )));
        }
        if config.ssd.num_permutations != config.anchors.num_permutations() {
            tracing::warn!(
                "ssd heads emit {} permutations per cell but anchors use {}",
                config.ssd.num_permutations,
                config.anchors.num_permutations()
            );
        }

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;

        tracing::info!("loading detector config from `{}`", path.display());
        Self::from_toml_str(&contents)
    }
}
