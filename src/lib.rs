pub mod error;
pub mod rcnn;
pub mod processing;
pub mod pipeline;
pub mod utils;

pub use error::{Error, Result};
pub use pipeline::backbone::{Backbone, FeatureShape, TappedBackbone};
pub use pipeline::config::{
    AnchorConfig, DetectionConfig, DetectorConfig, GeneratorConfig, SodNetConfig, SsdLossConfig,
    SsdNetConfig,
};
pub use pipeline::generator::{generator_layers, Activation, TransposedConvSpec};
pub use pipeline::sod::SodNet;
pub use pipeline::ssd::SsdNet;
pub use processing::box_coder::{activations_to_ratios, ratios_to_activations};
pub use processing::loss::{SsdLoss, SsdLossOutput};
pub use processing::matching::{assign, classify, AnchorAssignment, AnchorClasses};
pub use processing::metrics::{accuracy, loss_balance_factor, sod_losses};
pub use processing::nms::{decode_detections, nms, Detection};
pub use rcnn::anchors::AnchorSet;
pub use rcnn::bbox::jaccard;
pub use utils::utils::{byte_data_to_image, images_to_tensor};
