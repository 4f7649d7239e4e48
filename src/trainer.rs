use std::collections::{ BTreeMap, HashMap };
use std::time::{ Duration, Instant };

use log::{ debug, info };
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{ Deserialize, Serialize };
use tch::nn::{ self, OptimizerConfig };
use tch::{ Kind, Tensor };

use crate::configs::LEARNING_RATE;
use crate::error::{ Error, Result };
use crate::evaluator::{ Evaluator, EvaluatorAccumulator };
use crate::image_folder::{ Batch, Subset };
use crate::listener::{ BatchData, EpochData, TrainingListener };
use crate::model::Model;


pub struct TrainingConfig {
    loss: Box<dyn Evaluator>,
    evaluators: Vec<Box<dyn Evaluator>>,
    listeners: Vec<Box<dyn TrainingListener>>,
    learning_rate: f64,
    seed: Option<u64>,
}

impl TrainingConfig {
    pub fn new<L: Evaluator + 'static>(loss: L) -> Self {
        TrainingConfig {
            loss: Box::new(loss),
            evaluators: Vec::new(),
            listeners: Vec::new(),
            learning_rate: LEARNING_RATE,
            seed: None,
        }
    }

    pub fn add_evaluator<E: Evaluator + 'static>(mut self, evaluator: E) -> Self {
        self.evaluators.push(Box::new(evaluator));
        self
    }

    pub fn add_training_listeners(mut self, listeners: Vec<Box<dyn TrainingListener>>) -> Self {
        self.listeners.extend(listeners);
        self
    }

    pub fn opt_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Seeds the per-epoch batch shuffling.
    pub fn opt_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn evaluator_names(&self) -> Vec<&str> {
        self.evaluators.iter().map(|e| e.name()).collect()
    }
}


#[derive(Debug, Clone, Default)]
pub struct Metrics {
    series: HashMap<String, Vec<f64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics { series: HashMap::new() }
    }

    pub fn add_metric(&mut self, name: &str, value: f64) {
        self.series.entry(name.to_string()).or_default().push(value);
    }

    pub fn latest(&self, name: &str) -> Option<f64> {
        self.series.get(name).and_then(|s| s.last().copied())
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        self.series.get(name)
            .filter(|s| !s.is_empty())
            .map(|s| s.iter().sum::<f64>() / s.len() as f64)
    }

    pub fn count(&self, name: &str) -> usize {
        self.series.get(name).map_or(0, Vec::len)
    }
}


#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    pub epoch: usize,
    pub evaluations: BTreeMap<String, f64>,     // train_<name> / validate_<name>
}

impl TrainingResult {
    pub fn train_evaluation(&self, name: &str) -> Option<f64> {
        self.evaluations.get(&format!("train_{}", name)).copied()
    }

    pub fn validate_evaluation(&self, name: &str) -> Option<f64> {
        self.evaluations.get(&format!("validate_{}", name)).copied()
    }

    pub fn train_loss(&self) -> Option<f64> {
        self.train_evaluation("loss")
    }

    pub fn validate_loss(&self) -> Option<f64> {
        self.validate_evaluation("loss")
    }
}


pub struct Trainer<'a> {
    model: &'a Model,
    optimizer: nn::Optimizer,
    loss: Box<dyn Evaluator>,
    evaluators: Vec<Box<dyn Evaluator>>,
    listeners: Vec<Box<dyn TrainingListener>>,
    metrics: Metrics,
    train_acc: EvaluatorAccumulator,
    validate_acc: EvaluatorAccumulator,
    result: TrainingResult,
    rng: ChaCha8Rng,
    initialized: bool,
}


impl<'a> Trainer<'a> {
    pub fn new(model: &'a Model, config: TrainingConfig) -> Result<Self> {
        if model.block_config().is_none() {
            return Err(Error::Model(format!("model '{}' has no block to train", model.name())));
        }
        let optimizer = nn::Adam::default().build(model.var_store(), config.learning_rate)?;
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        debug!("Opening trainer for '{}' (lr {})", model.name(), config.learning_rate);
        Ok(Trainer {
            model,
            optimizer,
            loss: config.loss,
            evaluators: config.evaluators,
            listeners: config.listeners,
            metrics: Metrics::new(),
            train_acc: EvaluatorAccumulator::new(),
            validate_acc: EvaluatorAccumulator::new(),
            result: TrainingResult::default(),
            rng,
            initialized: false,
        })
    }

    pub fn set_metrics(&mut self, metrics: Metrics) {
        self.metrics = metrics;
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn model(&self) -> &Model {
        self.model
    }

    pub fn training_result(&self) -> &TrainingResult {
        &self.result
    }

    /// Checks `[N, C, H, W]` against the network and runs one dry forward pass.
    pub fn initialize(&mut self, shape: &[i64]) -> Result<()> {
        let cfg = self.model.block_config()
            .ok_or_else(|| Error::Model(format!("model '{}' has no block", self.model.name())))?;
        if shape.len() != 4 || shape[0] < 1 || shape[1..] != cfg.image_shape[..] {
            return Err(Error::Config(format!(
                "input shape {:?} does not match network image shape {:?}", shape, cfg.image_shape
            )));
        }

        let xs = Tensor::zeros(shape, (Kind::Float, self.model.device()));
        let ys = tch::no_grad(|| self.model.forward(&xs, false))?;
        if ys.size() != [shape[0], cfg.out_size] {
            return Err(Error::Model(format!(
                "network produced {:?} for input {:?}, expected [{}, {}]", ys.size(), shape, shape[0], cfg.out_size
            )));
        }

        self.initialized = true;
        info!("Initialized trainer for input {:?}, {} trainable parameters", shape, self.model.parameter_count());
        Ok(())
    }

    fn notify<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut dyn TrainingListener) -> Result<()>,
    {
        for listener in self.listeners.iter_mut() {
            f(listener.as_mut())?;
        }
        Ok(())
    }

    fn train_batch(&mut self, epoch: usize, batch_idx: usize, num_batches: usize, batch: Batch) -> Result<()> {
        let device = self.model.device();
        let images = batch.images.to_device(device);
        let labels = batch.labels.to_device(device);
        let size = batch.size();

        let logits = self.model.forward(&images, true)?;
        let loss = self.loss.evaluate(&logits, &labels);
        self.optimizer.backward_step(&loss);

        let loss_value = loss.double_value(&[]);
        self.train_acc.add(self.loss.name(), loss_value, size);
        for ev in self.evaluators.iter() {
            let value = tch::no_grad(|| ev.evaluate(&logits, &labels)).double_value(&[]);
            self.train_acc.add(ev.name(), value, size);
        }

        let data = BatchData { epoch, batch_idx, num_batches, batch_size: size, loss: loss_value };
        self.notify(|l| l.on_training_batch(&data))
    }

    fn validate_batch(&mut self, epoch: usize, batch_idx: usize, num_batches: usize, batch: Batch) -> Result<()> {
        let device = self.model.device();
        let images = batch.images.to_device(device);
        let labels = batch.labels.to_device(device);
        let size = batch.size();

        let (loss_value, values) = tch::no_grad(|| -> Result<(f64, Vec<f64>)> {
            let logits = self.model.forward(&images, false)?;
            let loss = self.loss.evaluate(&logits, &labels).double_value(&[]);
            let values = self.evaluators.iter()
                .map(|ev| ev.evaluate(&logits, &labels).double_value(&[]))
                .collect();
            Ok((loss, values))
        })?;

        self.validate_acc.add(self.loss.name(), loss_value, size);
        for (ev, value) in self.evaluators.iter().zip(values) {
            self.validate_acc.add(ev.name(), value, size);
        }

        let data = BatchData { epoch, batch_idx, num_batches, batch_size: size, loss: loss_value };
        self.notify(|l| l.on_validation_batch(&data))
    }

    fn end_epoch(&mut self, epoch: usize, epochs: usize, duration: Duration) -> Result<()> {
        let mut evaluations = BTreeMap::new();
        for (name, value) in self.train_acc.means() {
            evaluations.insert(format!("train_{}", name), value);
        }
        for (name, value) in self.validate_acc.means() {
            evaluations.insert(format!("validate_{}", name), value);
        }
        self.train_acc.reset();
        self.validate_acc.reset();

        self.metrics.add_metric("epoch_seconds", duration.as_secs_f64());
        let data = EpochData { epoch, epochs, evaluations: &evaluations, duration };
        self.notify(|l| l.on_epoch(&data))?;

        self.result = TrainingResult { epoch: epoch + 1, evaluations };
        Ok(())
    }
}


impl Drop for Trainer<'_> {
    fn drop(&mut self) {
        debug!("Closing trainer for '{}'", self.model.name());
    }
}


/// Runs `epochs` passes over `train`, evaluating on `validate` after each one.
pub fn fit(
    trainer: &mut Trainer<'_>,
    epochs: usize,
    train: &Subset<'_>,
    validate: Option<&Subset<'_>>,
    ) -> Result<()> {
    if !trainer.initialized {
        return Err(Error::Training("trainer must be initialized before fit".to_string()));
    }
    if train.is_empty() {
        return Err(Error::Training("training subset is empty".to_string()));
    }

    let validate_size = validate.map_or(0, |v| v.len());
    trainer.notify(|l| l.on_training_begin(epochs, train.len(), validate_size))?;

    let start = Instant::now();
    for epoch in 0..epochs {
        let epoch_start = Instant::now();

        let num_batches = train.num_batches();
        for (batch_idx, batch) in train.batches(&mut trainer.rng).enumerate() {
            trainer.train_batch(epoch, batch_idx, num_batches, batch?)?;
        }
        trainer.metrics.add_metric("train_batches", num_batches as f64);

        if let Some(validate) = validate {
            let num_batches = validate.num_batches();
            for (batch_idx, batch) in validate.batches(&mut trainer.rng).enumerate() {
                trainer.validate_batch(epoch, batch_idx, num_batches, batch?)?;
            }
        }

        trainer.end_epoch(epoch, epochs, epoch_start.elapsed())?;
    }

    let total = start.elapsed();
    trainer.metrics.add_metric("training_seconds", total.as_secs_f64());
    trainer.notify(|l| l.on_training_end(total))
}
