pub mod backbone;
pub mod config;
pub mod generator;
pub mod layers;
pub mod sod;
pub mod ssd;
