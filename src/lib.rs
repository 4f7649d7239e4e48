//! Image classification training driver: an image-folder dataset split
//! into train/validation subsets, a residual network trained with tch,
//! and a saved model carrying `Epoch`, `Accuracy` and `Loss` properties.

pub mod configs;
pub mod error;
pub mod evaluator;
pub mod image_folder;
pub mod listener;
pub mod model;
pub mod resnet;
pub mod runner;
pub mod trainer;
pub mod transform;

pub use configs::Config;
pub use error::{ Error, Result };
pub use runner::{ run, RunReport };
