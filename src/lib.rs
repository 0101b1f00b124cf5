//! Image-classification training harness on top of Burn.
//!
//! Trains a ResNet or a vision transformer on CIFAR-100 (or any
//! image-folder dataset) with SGD and a multi-step learning-rate schedule,
//! reporting top-1/top-5 accuracy every epoch.

pub mod augment;
pub mod checkpoint;
pub mod data;
pub mod dataset;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod stats;
pub mod summary;
pub mod training;

pub use error::{Error, Result};
