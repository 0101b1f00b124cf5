use std::path::PathBuf;

use anyhow::{anyhow, Context};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::prelude::*;
use clap::{command, value_parser, Arg, ArgAction, ArgMatches, Command};
use vision_trainer::dataset::DatasetSource;
use vision_trainer::inference::infer_from_file;
use vision_trainer::stats::NormalizationStats;
use vision_trainer::training::{train, EpochRecord, TrainingConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackendKind {
    Wgpu,
    NdArray,
}

impl BackendKind {
    fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        match matches.get_one::<String>("backend").map(String::as_str) {
            None | Some("wgpu") => Ok(BackendKind::Wgpu),
            Some("ndarray") | Some("cpu") => Ok(BackendKind::NdArray),
            Some(other) => Err(anyhow!("unknown backend `{other}` (expected wgpu or ndarray)")),
        }
    }
}

fn cli() -> Command {
    command!()
        .subcommand_required(true)
        .arg(
            Arg::new("backend")
                .long("backend")
                .global(true)
                .help("Compute backend: wgpu (default) or ndarray"),
        )
        .subcommand(
            Command::new("train")
                .about("Train a classifier and checkpoint it")
                .next_help_heading("HYPER-PARAMETERS")
                .args([
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Start from a saved config.json; flags below override it"),
                    Arg::new("batch_size")
                        .long("batch_size")
                        .value_parser(value_parser!(usize))
                        .help("Mini-batch size [default: 128]"),
                    Arg::new("num_epoch")
                        .long("num_epoch")
                        .value_parser(value_parser!(usize))
                        .help("Number of epochs [default: 60]"),
                    Arg::new("model")
                        .long("model")
                        .help("resnet, anything else selects the transformer [default: transformer]"),
                    Arg::new("lr")
                        .long("lr")
                        .value_parser(value_parser!(f64))
                        .help("Initial learning rate [default: 0.02]"),
                    Arg::new("milestones")
                        .long("milestones")
                        .value_parser(value_parser!(usize))
                        .value_delimiter(',')
                        .num_args(1..)
                        .help("Epochs at which the learning rate decays [default: 20,40]"),
                    Arg::new("gamma")
                        .long("gamma")
                        .value_parser(value_parser!(f64))
                        .help("Learning rate decay factor [default: 0.2]"),
                    Arg::new("momentum")
                        .long("momentum")
                        .value_parser(value_parser!(f64))
                        .help("SGD momentum [default: 0.9]"),
                    Arg::new("lambd")
                        .long("lambd")
                        .value_parser(value_parser!(f64))
                        .help("Weight decay [default: 5e-4]"),
                    Arg::new("mode")
                        .long("mode")
                        .help("baseline, cutout, mixup or cutmix [default: baseline]"),
                    Arg::new("no_augment")
                        .long("no_augment")
                        .action(ArgAction::SetTrue)
                        .help("Disable random crop and flip"),
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .help("Random seed [default: 42]"),
                    Arg::new("workers")
                        .long("workers")
                        .value_parser(value_parser!(usize))
                        .help("Data loader workers [default: 4]"),
                ])
                .next_help_heading("DATA AND OUTPUT")
                .args([
                    Arg::new("data")
                        .long("data")
                        .help("cifar100 (default) or folder"),
                    Arg::new("data_dir")
                        .long("data_dir")
                        .value_parser(value_parser!(PathBuf))
                        .help("Dataset root [default: data]"),
                    Arg::new("artifact_dir")
                        .long("artifact_dir")
                        .help("Where the config and checkpoint are written [default: artifacts]"),
                    Arg::new("log_dir")
                        .long("log_dir")
                        .help("Scalar log directory [default: the model name]"),
                    Arg::new("normalization")
                        .long("normalization")
                        .value_parser(value_parser!(PathBuf))
                        .help("Channel statistics written by dataset_stats [default: CIFAR-100 values]"),
                ]),
        )
        .subcommand(
            Command::new("predict")
                .about("Classify one image with a trained checkpoint")
                .args([
                    Arg::new("image")
                        .long("image")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                    Arg::new("artifact_dir")
                        .long("artifact_dir")
                        .value_parser(value_parser!(PathBuf))
                        .default_value("artifacts"),
                ]),
        )
}

/// Builds the dataset source from `--data` and `--data_dir`, falling back to
/// the kind and root of `loaded` for whichever flag is missing.
fn data_source(matches: &ArgMatches, loaded: Option<&DatasetSource>) -> anyhow::Result<DatasetSource> {
    let root = match (matches.get_one::<PathBuf>("data_dir"), loaded) {
        (Some(root), _) => root.clone(),
        (None, Some(DatasetSource::Cifar100 { root } | DatasetSource::ImageFolder { root })) => {
            root.clone()
        }
        (None, None) => PathBuf::from("data"),
    };
    match matches.get_one::<String>("data").map(String::as_str) {
        None => match loaded {
            Some(DatasetSource::ImageFolder { .. }) => Ok(DatasetSource::ImageFolder { root }),
            _ => Ok(DatasetSource::Cifar100 { root }),
        },
        Some("cifar100") => Ok(DatasetSource::Cifar100 { root }),
        Some("folder") => Ok(DatasetSource::ImageFolder { root }),
        Some(other) => Err(anyhow!("unknown dataset `{other}` (expected cifar100 or folder)")),
    }
}

fn training_config(matches: &ArgMatches) -> anyhow::Result<TrainingConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => TrainingConfig::load(path)
            .map_err(|err| anyhow!("failed to load {}: {err:?}", path.display()))?,
        None => TrainingConfig::new(data_source(matches, None)?),
    };

    if matches.contains_id("data") || matches.contains_id("data_dir") {
        config.data = data_source(matches, Some(&config.data))?;
    }
    if let Some(batch_size) = matches.get_one::<usize>("batch_size") {
        config.batch_size = *batch_size;
    }
    if let Some(num_epochs) = matches.get_one::<usize>("num_epoch") {
        config.num_epochs = *num_epochs;
    }
    if let Some(model) = matches.get_one::<String>("model") {
        config.model = model.clone();
    }
    if let Some(lr) = matches.get_one::<f64>("lr") {
        config.learning_rate = *lr;
    }
    if let Some(milestones) = matches.get_many::<usize>("milestones") {
        config.milestones = milestones.copied().collect();
    }
    if let Some(gamma) = matches.get_one::<f64>("gamma") {
        config.gamma = *gamma;
    }
    if let Some(momentum) = matches.get_one::<f64>("momentum") {
        config.momentum = *momentum;
    }
    if let Some(lambd) = matches.get_one::<f64>("lambd") {
        config.weight_decay = *lambd;
    }
    if let Some(mode) = matches.get_one::<String>("mode") {
        config.mode = mode.clone();
    }
    if matches.get_flag("no_augment") {
        config.augment = false;
    }
    if let Some(seed) = matches.get_one::<u64>("seed") {
        config.seed = *seed;
    }
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.num_workers = *workers;
    }
    if let Some(artifact_dir) = matches.get_one::<String>("artifact_dir") {
        config.artifact_dir = artifact_dir.clone();
    }
    if let Some(log_dir) = matches.get_one::<String>("log_dir") {
        config.log_dir = Some(log_dir.clone());
    }

    if let Some(path) = matches.get_one::<PathBuf>("normalization") {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let stats: NormalizationStats = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.mean = stats.mean;
        config.std = stats.std;
    }

    // fail on a bad mode before loading any data
    config.train_mode()?;
    Ok(config)
}

fn run_train(backend: BackendKind, config: TrainingConfig) -> anyhow::Result<Vec<EpochRecord>> {
    let history = match backend {
        BackendKind::Wgpu => train::<Autodiff<Wgpu>>(config, WgpuDevice::default()),
        BackendKind::NdArray => train::<Autodiff<NdArray>>(config, NdArrayDevice::default()),
    };
    history.context("training failed")
}

fn run_predict(backend: BackendKind, matches: &ArgMatches) -> anyhow::Result<()> {
    let image = matches
        .get_one::<PathBuf>("image")
        .context("--image is required")?;
    let artifact_dir = matches
        .get_one::<PathBuf>("artifact_dir")
        .context("--artifact_dir is required")?;

    let predictions = match backend {
        BackendKind::Wgpu => infer_from_file::<Wgpu>(artifact_dir, &WgpuDevice::default(), image),
        BackendKind::NdArray => {
            infer_from_file::<NdArray>(artifact_dir, &NdArrayDevice::default(), image)
        }
    }
    .with_context(|| format!("failed to classify {}", image.display()))?;

    for prediction in predictions {
        println!(
            "{:>3} {:<24} {:.5}",
            prediction.class_index, prediction.class_name, prediction.probability
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = cli().get_matches();
    let backend = BackendKind::from_matches(&matches)?;

    match matches.subcommand() {
        Some(("train", matches)) => {
            let config = training_config(matches)?;
            run_train(backend, config)?;
        }
        Some(("predict", matches)) => run_predict(backend, matches)?,
        _ => unreachable!("subcommand is required"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ArgMatches {
        let mut argv = vec!["vision-trainer", "train"];
        argv.extend_from_slice(args);
        let matches = cli().get_matches_from(argv);
        matches.subcommand_matches("train").unwrap().clone()
    }

    #[test]
    fn flags_override_defaults() {
        let config = training_config(&parse(&[
            "--model",
            "resnet",
            "--milestones",
            "10,30,50",
            "--lambd",
            "1e-4",
            "--data",
            "folder",
            "--data_dir",
            "/tmp/images",
        ]))
        .unwrap();

        assert_eq!(config.model, "resnet");
        assert_eq!(config.milestones, vec![10, 30, 50]);
        assert_eq!(config.weight_decay, 1e-4);
        assert_eq!(config.batch_size, 128);
        assert_eq!(
            config.data,
            DatasetSource::ImageFolder {
                root: PathBuf::from("/tmp/images")
            }
        );
    }

    #[test]
    fn data_dir_keeps_the_saved_dataset_kind() {
        let dir = tempfile::tempdir().unwrap();
        let saved = dir.path().join("config.json");
        TrainingConfig::new(DatasetSource::ImageFolder {
            root: PathBuf::from("/srv/old"),
        })
        .with_batch_size(32)
        .save(&saved)
        .unwrap();

        let config = training_config(&parse(&[
            "--config",
            saved.to_str().unwrap(),
            "--data_dir",
            "/srv/new",
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 32);
        assert_eq!(
            config.data,
            DatasetSource::ImageFolder {
                root: PathBuf::from("/srv/new")
            }
        );

        let config =
            training_config(&parse(&["--config", saved.to_str().unwrap(), "--data", "cifar100"]))
                .unwrap();
        assert_eq!(
            config.data,
            DatasetSource::Cifar100 {
                root: PathBuf::from("/srv/old")
            }
        );
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(training_config(&parse(&["--mode", "dropout"])).is_err());
    }

    #[test]
    fn backend_is_global() {
        let matches = cli().get_matches_from(["vision-trainer", "--backend", "ndarray", "train"]);
        assert_eq!(BackendKind::from_matches(&matches).unwrap(), BackendKind::NdArray);
    }

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }
}
