use std::path::PathBuf;

use crate::error::{ Error, Result };
use crate::resnet::{ ResNetConfig, SUPPORTED_DEPTHS };


pub const MODEL_NAME: &str = "shoeclassifier";
pub const DATASET_ROOT: &str = "data/ut-zap50k-images-square";
pub const OUTPUT_DIR: &str = "models";

pub const IMAGE_WIDTH: u32 = 224;
pub const IMAGE_HEIGHT: u32 = 224;
pub const EPOCHS: usize = 2;
pub const BATCH_SIZE: usize = 20;
pub const NUM_OF_OUTPUTS: i64 = 40;       // Must equal the number of label directories
pub const NUM_LAYERS: usize = 50;
pub const MAX_DEPTH: usize = 10;
pub const SPLIT_WEIGHTS: [f64; 2] = [8.0, 2.0];   // train, validate
pub const LEARNING_RATE: f64 = 1e-3;



#[derive(Debug, Clone)]
pub struct Config {
    pub model_name: String,
    pub dataset_root: PathBuf,
    pub output_dir: PathBuf,
    pub image_width: u32,
    pub image_height: u32,
    pub epochs: usize,
    pub batch_size: usize,
    pub num_outputs: i64,
    pub num_layers: usize,
    pub max_depth: usize,
    pub split_weights: Vec<f64>,
    pub learning_rate: f64,
    pub seed: Option<u64>,      // None draws the split from OS entropy
}


impl Default for Config {
    fn default() -> Self {
        Config {
            model_name: MODEL_NAME.to_string(),
            dataset_root: PathBuf::from(DATASET_ROOT),
            output_dir: PathBuf::from(OUTPUT_DIR),
            image_width: IMAGE_WIDTH,
            image_height: IMAGE_HEIGHT,
            epochs: EPOCHS,
            batch_size: BATCH_SIZE,
            num_outputs: NUM_OF_OUTPUTS,
            num_layers: NUM_LAYERS,
            max_depth: MAX_DEPTH,
            split_weights: SPLIT_WEIGHTS.to_vec(),
            learning_rate: LEARNING_RATE,
            seed: None,
        }
    }
}


impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.model_name.is_empty() {
            return Err(Error::Config("model name must not be empty".to_string()));
        }
        if self.image_width == 0 || self.image_height == 0 {
            return Err(Error::Config(format!(
                "image size must be positive, got {}x{}", self.image_width, self.image_height
            )));
        }
        if self.epochs == 0 {
            return Err(Error::Config("epoch count must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }
        if self.num_outputs <= 0 {
            return Err(Error::Config(format!("output count must be positive, got {}", self.num_outputs)));
        }
        if !SUPPORTED_DEPTHS.contains(&self.num_layers) {
            return Err(Error::Config(format!(
                "{} layers not supported, expected one of {:?}", self.num_layers, SUPPORTED_DEPTHS
            )));
        }
        ResNetConfig::new(
            [3, self.image_height as i64, self.image_width as i64],
            self.num_layers,
            self.num_outputs,
        ).validate()?;
        if self.split_weights.len() < 2 {
            return Err(Error::Config("split needs at least two weights".to_string()));
        }
        if self.split_weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(Error::Config(format!("split weights must be positive, got {:?}", self.split_weights)));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::Config(format!("learning rate must be positive, got {}", self.learning_rate)));
        }
        Ok(())
    }
}
