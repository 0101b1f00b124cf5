use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use burn::{
    data::{dataloader::DataLoader, dataset::Dataset},
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    lr_scheduler::LrScheduler,
    optim::{momentum::MomentumConfig, decay::WeightDecayConfig, GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use serde::{Deserialize, Serialize};

use crate::{
    augment::{BatchMixer, TrainMode},
    checkpoint::{save_status, TrainingStatus},
    data::{batches_per_epoch, build_loader, ClassificationBatch, ClassificationBatcher},
    dataset::{DatasetSource, ImageDataset, Split},
    error::{Error, Result},
    metrics::{EpochStats, StatsAccumulator, TopKCounts},
    model::{Architecture, ImageClassifier, ResNetConfig, VitConfig},
    scheduler::{MultiStepLr, MultiStepLrConfig},
    summary::ScalarWriter,
};

pub const CONFIG_FILE: &str = "config.json";
pub const CLASSES_FILE: &str = "classes.json";

#[derive(Config)]
pub struct TrainingConfig {
    pub data: DatasetSource,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 60)]
    pub num_epochs: usize,
    /// `resnet`, anything else trains the transformer.
    #[config(default = "String::from(\"transformer\")")]
    pub model: String,
    #[config(default = 0.02)]
    pub learning_rate: f64,
    #[config(default = "vec![20, 40]")]
    pub milestones: Vec<usize>,
    #[config(default = 0.2)]
    pub gamma: f64,
    #[config(default = 0.9)]
    pub momentum: f64,
    #[config(default = 5e-4)]
    pub weight_decay: f64,
    /// `baseline`, `cutout`, `mixup` or `cutmix`.
    #[config(default = "String::from(\"baseline\")")]
    pub mode: String,
    #[config(default = 16)]
    pub cutout_size: usize,
    /// Random crop and horizontal flip on training images.
    #[config(default = true)]
    pub augment: bool,
    #[config(default = 32)]
    pub image_size: usize,
    #[config(default = "crate::data::CIFAR100_MEAN")]
    pub mean: [f32; 3],
    #[config(default = "crate::data::CIFAR100_STD")]
    pub std: [f32; 3],
    #[config(default = "ResNetConfig::new()")]
    pub resnet: ResNetConfig,
    #[config(default = "VitConfig::new()")]
    pub vit: VitConfig,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = "String::from(\"artifacts\")")]
    pub artifact_dir: String,
    /// Scalar log directory, defaults to the model name.
    pub log_dir: Option<String>,
}

impl TrainingConfig {
    pub fn architecture(&self) -> Architecture {
        Architecture::from_name(&self.model)
    }

    pub fn train_mode(&self) -> Result<TrainMode> {
        self.mode.parse()
    }

    pub fn optimizer(&self) -> SgdConfig {
        SgdConfig::new()
            .with_momentum(Some(MomentumConfig {
                momentum: self.momentum,
                dampening: 0.,
                nesterov: false,
            }))
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay.elem())))
    }

    pub fn scheduler(&self) -> MultiStepLr {
        MultiStepLrConfig::new(self.learning_rate)
            .with_milestones(self.milestones.clone())
            .with_gamma(self.gamma)
            .init()
    }

    pub fn resnet_config(&self, num_classes: usize) -> ResNetConfig {
        self.resnet.clone().with_num_classes(num_classes)
    }

    pub fn vit_config(&self, num_classes: usize) -> VitConfig {
        self.vit
            .clone()
            .with_image_size(self.image_size)
            .with_num_classes(num_classes)
    }

    pub fn checkpoint_base(&self) -> PathBuf {
        PathBuf::from(&self.artifact_dir).join(self.architecture().name())
    }

    pub fn log_path(&self) -> PathBuf {
        match &self.log_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(self.architecture().name()),
        }
    }
}

/// Results of one epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train: EpochStats,
    pub test: EpochStats,
}

/// Only `config.json`, `classes.json` and the `<model>*` checkpoint files
/// are overwritten; anything else in the directory is left alone.
fn create_artifact_dir(artifact_dir: &str) -> Result<()> {
    std::fs::create_dir_all(artifact_dir).map_err(Error::io(artifact_dir))
}

fn check_image_size(dataset: &ImageDataset, split: Split, expected: usize) -> Result<()> {
    if dataset.image_size() != expected {
        return Err(Error::ImageSizeMismatch {
            split: split.dir_name(),
            expected,
            actual: dataset.image_size(),
        });
    }
    Ok(())
}

/// Loads the configured dataset and trains the configured model on it.
pub fn train<B: AutodiffBackend>(config: TrainingConfig, device: B::Device) -> Result<Vec<EpochRecord>> {
    let train_set = config.data.load(Split::Train, config.image_size)?;
    let test_set = config.data.load(Split::Test, config.image_size)?;
    fit::<B>(config, train_set, test_set, device)
}

/// Trains on already loaded datasets.
pub fn fit<B: AutodiffBackend>(
    config: TrainingConfig,
    train_set: ImageDataset,
    test_set: ImageDataset,
    device: B::Device,
) -> Result<Vec<EpochRecord>> {
    if train_set.is_empty() {
        return Err(Error::EmptyDataset(PathBuf::from(Split::Train.dir_name())));
    }
    check_image_size(&train_set, Split::Train, config.image_size)?;
    check_image_size(&test_set, Split::Test, config.image_size)?;
    // Reject bad modes before any artifact is touched
    let mode = config.train_mode()?;

    create_artifact_dir(&config.artifact_dir)?;
    config
        .save(PathBuf::from(&config.artifact_dir).join(CONFIG_FILE))
        .map_err(Error::io(&config.artifact_dir))?;
    let classes_path = PathBuf::from(&config.artifact_dir).join(CLASSES_FILE);
    std::fs::write(&classes_path, serde_json::to_string_pretty(train_set.classes())?)
        .map_err(Error::io(&classes_path))?;

    B::seed(config.seed);

    let num_classes = train_set.classes().len();
    match config.architecture() {
        Architecture::ResNet => {
            let model = config.resnet_config(num_classes).init::<B>(&device);
            run::<B, _>(config, mode, model, train_set, test_set, device)
        }
        Architecture::Transformer => {
            let model = config.vit_config(num_classes).init::<B>(&device)?;
            run::<B, _>(config, mode, model, train_set, test_set, device)
        }
    }
}

fn run<B, M>(
    config: TrainingConfig,
    mode: TrainMode,
    mut model: M,
    train_set: ImageDataset,
    test_set: ImageDataset,
    device: B::Device,
) -> Result<Vec<EpochRecord>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
{
    let train_set = Arc::new(train_set);
    let test_set = Arc::new(test_set);

    // Dataloaders
    let batcher_train =
        ClassificationBatcher::<B>::new(config.image_size, config.mean, config.std, device.clone());
    let batcher_train = if config.augment {
        batcher_train.with_augmentation(config.seed)
    } else {
        batcher_train
    };
    let batcher_valid = ClassificationBatcher::<B::InnerBackend>::new(
        config.image_size,
        config.mean,
        config.std,
        device.clone(),
    );

    let dataloader_train = build_loader(
        batcher_train,
        train_set.clone(),
        config.batch_size,
        Some(config.seed),
        config.num_workers,
    );
    let dataloader_train_eval = build_loader(
        batcher_valid.clone(),
        train_set.clone(),
        config.batch_size,
        None,
        config.num_workers,
    );
    let dataloader_test = build_loader(
        batcher_valid,
        test_set,
        config.batch_size,
        None,
        config.num_workers,
    );

    let iterations = batches_per_epoch(train_set.len(), config.batch_size);
    println!("number of iterations: {}", config.num_epochs * iterations);
    println!("number of iterations per epoch: {}", iterations);
    println!();

    let mut optim = config.optimizer().init::<B, M>();
    let mut scheduler = config.scheduler();
    let mut mixer = BatchMixer::new(mode, config.cutout_size, config.seed);
    let mut writer = ScalarWriter::new(config.log_path())?;
    log::info!(
        "Training {} for {} epochs in {} mode, logging scalars to {}",
        config.architecture().name(),
        config.num_epochs,
        mixer.mode(),
        writer.path().display()
    );

    let mut history = Vec::with_capacity(config.num_epochs);
    let now = Instant::now();

    println!("Epoch\tTrain top1\tTrain top5\tTest top1\tTest top5\t");
    for epoch in 0..config.num_epochs {
        let learning_rate = scheduler.lr();
        let (trained, train_loss) =
            optimize(model, &mut optim, &*dataloader_train, &mut mixer, learning_rate);
        model = trained;
        scheduler.step();

        let model_valid = model.valid();
        let train = evaluate(&model_valid, &*dataloader_train_eval);
        let test = evaluate(&model_valid, &*dataloader_test);

        writer.add_scalars("top1", &[("train", train.top1), ("test", test.top1)], epoch)?;
        writer.add_scalars("top5", &[("train", train.top5), ("test", test.top5)], epoch)?;
        writer.add_scalars("loss", &[("train", train.loss), ("test", test.loss)], epoch)?;

        println!(
            "{:2}\t{:.5}\t\t{:.5}\t\t{:.5}\t\t{:.5}",
            epoch + 1,
            train.top1,
            train.top5,
            test.top1,
            test.top5
        );
        log::debug!("epoch {} lr={learning_rate} optimize loss={train_loss:.4}", epoch + 1);

        history.push(EpochRecord {
            epoch: epoch + 1,
            learning_rate,
            train_loss,
            train,
            test,
        });
    }

    let elapsed = now.elapsed().as_secs();
    log::info!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

    let status = TrainingStatus {
        model: config.architecture().name().to_string(),
        epoch: config.num_epochs,
        scheduler_epoch: scheduler.to_record::<B>(),
        learning_rate: scheduler.lr(),
    };
    save_status::<B, M, _>(&model, &optim, &status, &config.checkpoint_base())?;

    writer.flush()?;
    writer.close()?;

    Ok(history)
}

/// Runs one epoch of forward, backward and optimizer steps. Returns the
/// updated model and the mean training loss of the epoch.
pub fn optimize<B, M, O>(
    mut model: M,
    optim: &mut O,
    loader: &dyn DataLoader<ClassificationBatch<B>>,
    mixer: &mut BatchMixer,
    learning_rate: f64,
) -> (M, f64)
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
    O: Optimizer<M, B>,
{
    let mut loss_sum = 0.0;
    let mut batches = 0usize;

    for batch in loader.iter() {
        let batch = mixer.apply(batch);
        let logits = model.forward(batch.images.clone());
        let loss = batch.loss(logits);

        loss_sum += loss.clone().into_scalar().elem::<f64>();
        batches += 1;

        // Backward pass + SGD update
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optim.step(learning_rate, model, grads);
    }

    let mean_loss = if batches > 0 {
        loss_sum / batches as f64
    } else {
        f64::NAN
    };
    (model, mean_loss)
}

/// Top-1/top-5 accuracy and mean cross-entropy of `model` over `loader`.
pub fn evaluate<B, M>(model: &M, loader: &dyn DataLoader<ClassificationBatch<B>>) -> EpochStats
where
    B: Backend,
    M: ImageClassifier<B>,
{
    let mut stats = StatsAccumulator::default();

    for batch in loader.iter() {
        let batch_size = batch.targets.dims()[0];
        let logits = model.forward(batch.images);

        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem::<f64>();
        let counts = TopKCounts::from_logits(logits, batch.targets);

        stats.update(counts, loss, batch_size);
    }

    stats.finish()
}
