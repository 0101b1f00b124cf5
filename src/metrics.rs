use burn::prelude::*;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};

/// Samples in a batch whose target is among the `k` highest logits, for
/// `k = 1` and `k = 5`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopKCounts {
    pub top1: usize,
    pub top5: usize,
}

impl TopKCounts {
    /// The rank of a target is the number of classes scoring strictly higher
    /// than it, so ties resolve in the target's favour.
    pub fn from_logits<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Self {
        let [batch_size, _num_classes] = logits.dims();
        if batch_size == 0 {
            return Self::default();
        }

        let target_logits = logits
            .clone()
            .gather(1, targets.reshape([batch_size, 1]));
        let ranks = logits
            .sub(target_logits)
            .greater_elem(0.0)
            .int()
            .sum_dim(1);

        let within = |k: i64| -> usize {
            ranks
                .clone()
                .lower_elem(k)
                .int()
                .sum()
                .into_scalar()
                .elem::<i64>() as usize
        };

        Self {
            top1: within(1),
            top5: within(5),
        }
    }
}

/// Accuracy and loss over one pass of a data loader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub top1: f64,
    pub top5: f64,
    pub loss: f64,
}

#[derive(Clone, Debug, Default)]
pub struct StatsAccumulator {
    correct1: usize,
    correct5: usize,
    loss_sum: f64,
    samples: usize,
}

impl StatsAccumulator {
    /// Adds one batch; `mean_loss` is the batch-averaged loss.
    pub fn update(&mut self, counts: TopKCounts, mean_loss: f64, batch_size: usize) {
        self.correct1 += counts.top1;
        self.correct5 += counts.top5;
        self.loss_sum += mean_loss * batch_size as f64;
        self.samples += batch_size;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn finish(&self) -> EpochStats {
        if self.samples == 0 {
            return EpochStats {
                top1: 0.0,
                top5: 0.0,
                loss: f64::NAN,
            };
        }

        let n = self.samples as f64;
        EpochStats {
            top1: self.correct1 as f64 / n,
            top5: self.correct5 as f64 / n,
            loss: self.loss_sum / n,
        }
    }
}
