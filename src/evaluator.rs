use std::collections::BTreeMap;

use tch::{ Tensor, Kind };


pub trait Evaluator: Send {
    fn name(&self) -> &str;

    /// Scalar value for one batch.
    fn evaluate(&self, logits: &Tensor, labels: &Tensor) -> Tensor;
}


#[derive(Debug, Clone, Copy, Default)]
pub struct SoftmaxCrossEntropyLoss;

impl Evaluator for SoftmaxCrossEntropyLoss {
    fn name(&self) -> &str {
        "loss"
    }

    fn evaluate(&self, logits: &Tensor, labels: &Tensor) -> Tensor {
        logits.cross_entropy_for_logits(labels)
    }
}


#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy;

impl Evaluator for Accuracy {
    fn name(&self) -> &str {
        "Accuracy"
    }

    fn evaluate(&self, logits: &Tensor, labels: &Tensor) -> Tensor {
        logits.accuracy_for_logits(labels).to_kind(Kind::Float)
    }
}


/// Batch-size weighted running means, one per evaluator name.
#[derive(Debug, Clone, Default)]
pub struct EvaluatorAccumulator {
    sums: BTreeMap<String, (f64, usize)>,
}

impl EvaluatorAccumulator {
    pub fn new() -> Self {
        EvaluatorAccumulator { sums: BTreeMap::new() }
    }

    pub fn add(&mut self, name: &str, value: f64, count: usize) {
        let entry = self.sums.entry(name.to_string()).or_insert((0.0, 0));
        entry.0 += value * count as f64;
        entry.1 += count;
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        self.sums.get(name)
            .filter(|(_, n)| *n > 0)
            .map(|(sum, n)| sum / *n as f64)
    }

    pub fn means(&self) -> BTreeMap<String, f64> {
        self.sums.keys()
            .filter_map(|k| self.mean(k).map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn reset(&mut self) {
        self.sums.clear();
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_counts_argmax_hits() {
        let logits = Tensor::of_slice(&[2.0f32, 0.0, 0.0, 3.0, 5.0, 1.0]).view([3, 2]);
        let labels = Tensor::of_slice(&[0i64, 1, 1]);
        let acc = Accuracy.evaluate(&logits, &labels).double_value(&[]);
        assert!((acc - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn loss_is_lower_for_confident_correct_logits() {
        let labels = Tensor::of_slice(&[0i64, 1]);
        let good = Tensor::of_slice(&[9.0f32, 0.0, 0.0, 9.0]).view([2, 2]);
        let bad = Tensor::of_slice(&[0.0f32, 9.0, 9.0, 0.0]).view([2, 2]);
        let loss = SoftmaxCrossEntropyLoss;
        assert!(loss.evaluate(&good, &labels).double_value(&[]) < loss.evaluate(&bad, &labels).double_value(&[]));
    }

    #[test]
    fn accumulator_weights_by_batch_size() {
        let mut acc = EvaluatorAccumulator::new();
        acc.add("Accuracy", 1.0, 3);
        acc.add("Accuracy", 0.0, 1);
        assert_eq!(acc.mean("Accuracy"), Some(0.75));
        assert_eq!(acc.mean("loss"), None);
        acc.reset();
        assert!(acc.means().is_empty());
    }
}
