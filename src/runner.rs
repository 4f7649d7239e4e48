use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use log::info;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::configs::Config;
use crate::error::{ Error, Result };
use crate::evaluator::{ Accuracy, SoftmaxCrossEntropyLoss };
use crate::image_folder::ImageFolder;
use crate::listener;
use crate::model::{ Model, ModelManifest };
use crate::resnet::ResNetConfig;
use crate::trainer::{ fit, Metrics, TrainingConfig, TrainingResult };
use crate::transform::{ Resize, ToTensor };


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Uninitialized,
    DatasetPrepared,
    ModelConstructed,
    TrainerInitialized,
    TrainingComplete,
    Saved,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Uninitialized => "uninitialized",
            Stage::DatasetPrepared => "dataset prepared",
            Stage::ModelConstructed => "model constructed",
            Stage::TrainerInitialized => "trainer initialized",
            Stage::TrainingComplete => "training complete",
            Stage::Saved => "saved",
        };
        f.write_str(name)
    }
}


#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: TrainingResult,
    pub properties: BTreeMap<String, String>,
    pub manifest: PathBuf,
    pub parameters: PathBuf,
    pub train_size: usize,
    pub validate_size: usize,
    pub synsets: Vec<String>,
}


fn enter(stage: &mut Stage, next: Stage) {
    info!("[{}] -> [{}]", stage, next);
    *stage = next;
}


pub fn init_dataset(cfg: &Config) -> Result<ImageFolder> {
    let mut dataset = ImageFolder::builder()
        .set_repository_path(&cfg.dataset_root)
        .opt_max_depth(cfg.max_depth)
        .add_transform(Resize::new(cfg.image_width, cfg.image_height))
        .add_transform(ToTensor)
        .set_sampling(cfg.batch_size, true)
        .build()?;
    dataset.prepare()?;
    Ok(dataset)
}


pub fn get_model(cfg: &Config) -> Result<Model> {
    let mut model = Model::new_instance(&cfg.model_name);
    let resnet = ResNetConfig::new(
        [3, cfg.image_height as i64, cfg.image_width as i64],
        cfg.num_layers,
        cfg.num_outputs,
    );
    model.set_block(resnet)?;
    Ok(model)
}


pub fn setup_training_config(cfg: &Config) -> TrainingConfig {
    TrainingConfig::new(SoftmaxCrossEntropyLoss)
        .add_evaluator(Accuracy)
        .add_training_listeners(listener::defaults_logging())
        .opt_learning_rate(cfg.learning_rate)
        .opt_seed(cfg.seed)
}


/// The label directories found on disk must match the network's output count.
pub fn check_class_count(dataset: &ImageFolder, num_outputs: i64) -> Result<()> {
    let found = dataset.synsets().len();
    if found as i64 != num_outputs {
        return Err(Error::Config(format!(
            "dataset {:?} has {} label directories but the network is configured for {} outputs",
            dataset.root(), found, num_outputs
        )));
    }
    Ok(())
}


pub fn run(cfg: &Config) -> Result<RunReport> {
    cfg.validate()?;
    let mut stage = Stage::Uninitialized;

    let dataset = init_dataset(cfg)?;
    check_class_count(&dataset, cfg.num_outputs)?;
    let mut rng = match cfg.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };
    let datasets = dataset.random_split(&cfg.split_weights, &mut rng)?;
    let (train, validate) = (&datasets[0], &datasets[1]);
    info!("Split {} images into {} train / {} validate", dataset.len(), train.len(), validate.len());
    enter(&mut stage, Stage::DatasetPrepared);

    let training_config = setup_training_config(cfg);

    let mut model = get_model(cfg)?;
    enter(&mut stage, Stage::ModelConstructed);

    let result = {
        let mut trainer = model.new_trainer(training_config)?;
        trainer.set_metrics(Metrics::new());
        // (batch, channels, height, width)
        let input_shape = [1, 3, cfg.image_height as i64, cfg.image_width as i64];
        trainer.initialize(&input_shape)?;
        enter(&mut stage, Stage::TrainerInitialized);

        fit(&mut trainer, cfg.epochs, train, Some(validate))?;
        trainer.training_result().clone()
    };
    enter(&mut stage, Stage::TrainingComplete);

    let accuracy = result.validate_evaluation("Accuracy")
        .ok_or_else(|| Error::Training("no validation accuracy recorded".to_string()))?;
    let loss = result.validate_loss()
        .ok_or_else(|| Error::Training("no validation loss recorded".to_string()))?;

    model.set_property("Epoch", cfg.epochs.to_string());
    model.set_property("Accuracy", format!("{:.5}", accuracy));
    model.set_property("Loss", format!("{:.5}", loss));
    let manifest = model.save(&cfg.output_dir, &cfg.model_name)?;
    enter(&mut stage, Stage::Saved);

    Ok(RunReport {
        manifest: ModelManifest::path(&cfg.output_dir, &cfg.model_name),
        parameters: cfg.output_dir.join(&manifest.parameters),
        properties: manifest.properties,
        result,
        train_size: train.len(),
        validate_size: validate.len(),
        synsets: dataset.synsets().to_vec(),
    })
}



#[cfg(test)]
mod tests {
    use super::*;
    use image::{ Rgb, RgbImage };
    use std::path::Path;
    use tempfile::TempDir;

    fn write_classes(root: &Path, classes: &[&str], per_class: usize) {
        for (c, name) in classes.iter().enumerate() {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let shade = (40 * c + 7 * i) as u8;
                RgbImage::from_pixel(10, 10, Rgb([shade, 128, 255 - shade]))
                    .save(dir.join(format!("{:02}.png", i)))
                    .unwrap();
            }
        }
    }

    #[test]
    fn class_count_mismatch_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        write_classes(dir.path(), &["boots", "sandals", "slippers"], 1);
        let cfg = Config { dataset_root: dir.path().to_path_buf(), image_width: 8, image_height: 8, ..Config::default() };
        let dataset = init_dataset(&cfg).unwrap();
        assert!(matches!(check_class_count(&dataset, 40), Err(Error::Config(_))));
        assert!(check_class_count(&dataset, 3).is_ok());
    }

    #[test]
    fn model_matches_configured_shape() {
        let cfg = Config { image_width: 16, image_height: 16, num_layers: 18, num_outputs: 4, ..Config::default() };
        let model = get_model(&cfg).unwrap();
        let block = model.block_config().unwrap();
        assert_eq!(block.image_shape, [3, 16, 16]);
        assert_eq!(block.out_size, 4);
    }

    #[test]
    fn training_config_carries_accuracy() {
        let tc = setup_training_config(&Config::default());
        assert_eq!(tc.evaluator_names(), vec!["Accuracy"]);
    }

    #[test]
    fn stages_display_in_order() {
        let mut stage = Stage::Uninitialized;
        enter(&mut stage, Stage::DatasetPrepared);
        assert_eq!(stage, Stage::DatasetPrepared);
        assert_eq!(Stage::TrainingComplete.to_string(), "training complete");
    }
}
