use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Training progress stored next to the model and optimizer records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatus {
    pub model: String,
    pub epoch: usize,
    /// Epoch counter of the learning rate scheduler.
    pub scheduler_epoch: usize,
    pub learning_rate: f64,
}

/// File names of one saved training state, all derived from `base`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusPaths {
    pub model: PathBuf,
    pub optimizer: PathBuf,
    pub status: PathBuf,
}

impl StatusPaths {
    /// The recorder appends its own extension to `model` and `optimizer`.
    pub fn new(base: &Path) -> Self {
        let name = base
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("model");
        Self {
            model: base.to_path_buf(),
            optimizer: base.with_file_name(format!("{name}-optim")),
            status: base.with_file_name(format!("{name}-status.json")),
        }
    }
}

/// Saves model weights, optimizer state and scheduler progress.
pub fn save_status<B, M, O>(
    model: &M,
    optim: &O,
    status: &TrainingStatus,
    base: &Path,
) -> Result<StatusPaths>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let paths = StatusPaths::new(base);
    if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(Error::io(parent))?;
    }

    let recorder = CompactRecorder::new();
    model.clone().save_file(paths.model.clone(), &recorder)?;
    Recorder::<B>::record(&recorder, optim.to_record(), paths.optimizer.clone())?;

    let json = serde_json::to_string_pretty(status)?;
    fs::write(&paths.status, json).map_err(Error::io(&paths.status))?;

    log::info!("Saved training state to {}", paths.model.display());
    Ok(paths)
}

pub fn load_status(base: &Path) -> Result<TrainingStatus> {
    let path = StatusPaths::new(base).status;
    let json = fs::read_to_string(&path).map_err(Error::io(&path))?;
    Ok(serde_json::from_str(&json)?)
}

/// Loads weights saved by [`save_status`] into a freshly initialized model.
pub fn load_model<B: Backend, M: Module<B>>(model: M, base: &Path, device: &B::Device) -> Result<M> {
    Ok(model.load_file(base.to_path_buf(), &CompactRecorder::new(), device)?)
}
