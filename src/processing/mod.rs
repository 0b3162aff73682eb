pub mod box_coder;
pub mod loss;
pub mod matching;
pub mod metrics;
pub mod nms;
