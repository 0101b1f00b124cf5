use burn::{config::Config, lr_scheduler::LrScheduler, tensor::backend::Backend, LearningRate};

/// Configuration of a [multi-step learning rate schedule](MultiStepLr).
///
/// The learning rate starts at `initial_lr` and is multiplied by `gamma`
/// each time the epoch counter reaches one of the `milestones`.
#[derive(Config, Debug)]
pub struct MultiStepLrConfig {
    pub initial_lr: LearningRate,
    #[config(default = "vec![20, 40]")]
    pub milestones: Vec<usize>,
    #[config(default = 0.2)]
    pub gamma: f64,
}

impl MultiStepLrConfig {
    pub fn init(&self) -> MultiStepLr {
        MultiStepLr {
            initial_lr: self.initial_lr,
            milestones: self.milestones.clone(),
            gamma: self.gamma,
            epoch: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MultiStepLr {
    initial_lr: LearningRate,
    milestones: Vec<usize>,
    gamma: f64,
    epoch: usize,
}

impl MultiStepLr {
    /// Learning rate for the current epoch.
    pub fn lr(&self) -> LearningRate {
        // a milestone listed twice decays twice
        let decays = self.milestones.iter().filter(|m| **m <= self.epoch).count();
        self.initial_lr * self.gamma.powi(decays as i32)
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl LrScheduler for MultiStepLr {
    type Record<B: Backend> = usize;

    /// Advances to the next epoch and returns its learning rate.
    fn step(&mut self) -> LearningRate {
        self.epoch += 1;
        self.lr()
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.epoch
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.epoch = record;
        self
    }
}
