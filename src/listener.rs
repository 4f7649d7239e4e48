use std::collections::BTreeMap;
use std::time::Duration;

use log::{ debug, info };

use crate::error::{ Error, Result };


#[derive(Debug, Clone, Copy)]
pub struct BatchData {
    pub epoch: usize,
    pub batch_idx: usize,
    pub num_batches: usize,
    pub batch_size: usize,
    pub loss: f64,
}


#[derive(Debug, Clone)]
pub struct EpochData<'a> {
    pub epoch: usize,
    pub epochs: usize,
    pub evaluations: &'a BTreeMap<String, f64>,     // train_<name> / validate_<name>
    pub duration: Duration,
}


/// Hooks into the training loop. Every hook defaults to a no-op; an error
/// aborts the run.
pub trait TrainingListener: Send {
    fn on_training_begin(&mut self, _epochs: usize, _train_size: usize, _validate_size: usize) -> Result<()> {
        Ok(())
    }

    fn on_training_batch(&mut self, _batch: &BatchData) -> Result<()> {
        Ok(())
    }

    fn on_validation_batch(&mut self, _batch: &BatchData) -> Result<()> {
        Ok(())
    }

    fn on_epoch(&mut self, _epoch: &EpochData<'_>) -> Result<()> {
        Ok(())
    }

    fn on_training_end(&mut self, _total: Duration) -> Result<()> {
        Ok(())
    }
}


/// Logging plus a divergence guard.
pub fn defaults_logging() -> Vec<Box<dyn TrainingListener>> {
    vec![
        Box::new(DivergenceCheckTrainingListener),
        Box::new(LoggingTrainingListener::default()),
    ]
}


#[derive(Debug, Default)]
pub struct LoggingTrainingListener {
    running_loss: f64,
    seen: usize,
}

impl TrainingListener for LoggingTrainingListener {
    fn on_training_begin(&mut self, epochs: usize, train_size: usize, validate_size: usize) -> Result<()> {
        info!("Training for {} epochs on {} images, validating on {}", epochs, train_size, validate_size);
        Ok(())
    }

    fn on_training_batch(&mut self, batch: &BatchData) -> Result<()> {
        if batch.batch_idx == 0 {
            self.running_loss = 0.0;
            self.seen = 0;
        }
        self.running_loss += batch.loss * batch.batch_size as f64;
        self.seen += batch.batch_size;
        debug!(
            "Epoch {} batch {}/{}: loss {:.5} (running {:.5})",
            batch.epoch + 1,
            batch.batch_idx + 1,
            batch.num_batches,
            batch.loss,
            self.running_loss / self.seen.max(1) as f64
        );
        Ok(())
    }

    fn on_validation_batch(&mut self, batch: &BatchData) -> Result<()> {
        debug!("Epoch {} validating {}/{}", batch.epoch + 1, batch.batch_idx + 1, batch.num_batches);
        Ok(())
    }

    fn on_epoch(&mut self, epoch: &EpochData<'_>) -> Result<()> {
        let summary = epoch.evaluations.iter()
            .map(|(k, v)| format!("{}: {:.5}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        info!("Epoch {}/{} finished in {:.1}s: {}", epoch.epoch + 1, epoch.epochs, epoch.duration.as_secs_f64(), summary);
        Ok(())
    }

    fn on_training_end(&mut self, total: Duration) -> Result<()> {
        info!("Training finished in {:.1}s", total.as_secs_f64());
        Ok(())
    }
}


#[derive(Debug, Default, Clone, Copy)]
pub struct DivergenceCheckTrainingListener;

impl TrainingListener for DivergenceCheckTrainingListener {
    fn on_training_batch(&mut self, batch: &BatchData) -> Result<()> {
        if !batch.loss.is_finite() {
            return Err(Error::Training(format!(
                "loss diverged to {} at epoch {} batch {}", batch.loss, batch.epoch + 1, batch.batch_idx + 1
            )));
        }
        Ok(())
    }
}
