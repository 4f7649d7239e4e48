use std::collections::BTreeMap;
use std::path::{ Path, PathBuf };

use log::{ debug, info };
use serde::{ Deserialize, Serialize };
use tch::nn::{ self, ModuleT };
use tch::{ Device, Tensor };

use crate::error::{ Error, Result };
use crate::resnet::ResNetConfig;
use crate::trainer::{ Trainer, TrainingConfig };


/// A named network plus its parameters and a string property bag.
pub struct Model {
    name: String,
    vs: nn::VarStore,
    block: Option<(ResNetConfig, nn::FuncT<'static>)>,
    properties: BTreeMap<String, String>,
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub name: String,
    pub block: ResNetConfig,
    pub parameters: String,     // file name relative to the manifest
    pub properties: BTreeMap<String, String>,
}

impl ModelManifest {
    pub fn path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.json", name))
    }

    pub fn read<P: AsRef<Path>>(dir: P, name: &str) -> Result<Self> {
        let path = Self::path(dir.as_ref(), name);
        let raw = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }
}


impl Model {
    pub fn new_instance(name: &str) -> Self {
        Model::on_device(name, Device::cuda_if_available())
    }

    pub fn on_device(name: &str, device: Device) -> Self {
        debug!("Creating model '{}' on {:?}", name, device);
        Model {
            name: name.to_string(),
            vs: nn::VarStore::new(device),
            block: None,
            properties: BTreeMap::new(),
        }
    }

    /// Builds the network into this model's parameter store.
    pub fn set_block(&mut self, cfg: ResNetConfig) -> Result<()> {
        if self.block.is_some() {
            return Err(Error::Model(format!("model '{}' already has a block", self.name)));
        }
        let net = cfg.build(&self.vs.root())?;
        self.block = Some((cfg, net));
        info!(
            "Model '{}': ResNet-{} for {:?} -> {} classes, {} parameters",
            self.name, cfg.num_layers, cfg.image_shape, cfg.out_size, self.parameter_count()
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn block_config(&self) -> Option<ResNetConfig> {
        self.block.as_ref().map(|(cfg, _)| *cfg)
    }

    pub fn parameter_count(&self) -> i64 {
        self.vs.trainable_variables()
            .iter()
            .map(|t| t.size().iter().product::<i64>())
            .sum()
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match &self.block {
            Some((_, net)) => Ok(net.forward_t(xs, train)),
            None => Err(Error::Model(format!("model '{}' has no block", self.name))),
        }
    }

    pub fn set_property(&mut self, key: &str, value: impl Into<String>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn new_trainer(&self, config: TrainingConfig) -> Result<Trainer<'_>> {
        Trainer::new(self, config)
    }

    /// Writes `<name>-<epoch:04>.ot` and `<name>.json` into `dir`, replacing
    /// earlier files. The epoch comes from the `Epoch` property (0 if unset).
    pub fn save<P: AsRef<Path>>(&self, dir: P, name: &str) -> Result<ModelManifest> {
        let dir = dir.as_ref();
        let cfg = self.block_config()
            .ok_or_else(|| Error::Model(format!("model '{}' has no block to save", self.name)))?;

        let epoch = match self.property("Epoch") {
            Some(v) => v.parse::<u32>()
                .map_err(|_| Error::Model(format!("Epoch property is not an integer: {:?}", v)))?,
            None => 0,
        };

        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

        let parameters = format!("{}-{:04}.ot", name, epoch);
        self.vs.save(dir.join(&parameters))?;

        let manifest = ModelManifest {
            name: name.to_string(),
            block: cfg,
            parameters,
            properties: self.properties.clone(),
        };
        let manifest_path = ModelManifest::path(dir, name);
        let json = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(&manifest_path, json).map_err(|e| Error::io(&manifest_path, e))?;

        info!("Saved model '{}' to {:?}", name, dir);
        Ok(manifest)
    }

    pub fn load<P: AsRef<Path>>(dir: P, name: &str, device: Device) -> Result<Self> {
        let dir = dir.as_ref();
        let manifest = ModelManifest::read(dir, name)?;
        let mut model = Model::on_device(&manifest.name, device);
        model.set_block(manifest.block)?;
        model.vs.load(dir.join(&manifest.parameters))?;
        model.properties = manifest.properties;
        Ok(model)
    }
}


impl Drop for Model {
    fn drop(&mut self) {
        debug!("Releasing model '{}'", self.name);
    }
}



#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;
    use tempfile::TempDir;

    fn small_model() -> Model {
        let mut model = Model::on_device("tiny", Device::Cpu);
        model.set_block(ResNetConfig::new([3, 16, 16], 18, 3)).unwrap();
        model
    }

    #[test]
    fn forward_without_block_fails() {
        let model = Model::on_device("empty", Device::Cpu);
        let xs = Tensor::zeros(&[1, 3, 16, 16], (Kind::Float, Device::Cpu));
        assert!(matches!(model.forward(&xs, false), Err(Error::Model(_))));
    }

    #[test]
    fn second_block_is_rejected() {
        let mut model = small_model();
        assert!(model.set_block(ResNetConfig::new([3, 16, 16], 18, 3)).is_err());
    }

    #[test]
    fn save_names_parameters_after_epoch_and_load_restores_them() {
        let dir = TempDir::new().unwrap();
        let mut model = small_model();
        model.set_property("Epoch", "3");
        model.set_property("Accuracy", "0.50000");

        let manifest = model.save(dir.path(), "tiny").unwrap();
        assert_eq!(manifest.parameters, "tiny-0003.ot");
        assert!(dir.path().join("tiny-0003.ot").exists());
        assert_eq!(ModelManifest::read(dir.path(), "tiny").unwrap(), manifest);

        let loaded = Model::load(dir.path(), "tiny", Device::Cpu).unwrap();
        assert_eq!(loaded.properties(), model.properties());
        assert_eq!(loaded.block_config(), model.block_config());

        let xs = Tensor::rand(&[2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let a = model.forward(&xs, false).unwrap();
        let b = loaded.forward(&xs, false).unwrap();
        assert!(a.allclose(&b, 1e-5, 1e-6, false));
    }

    #[test]
    fn non_numeric_epoch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut model = small_model();
        model.set_property("Epoch", "two");
        assert!(matches!(model.save(dir.path(), "tiny"), Err(Error::Model(_))));
    }

    #[test]
    fn unwritable_output_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let model = small_model();
        assert!(model.save(blocker.join("out"), "tiny").unwrap_err().is_io());
    }
}
