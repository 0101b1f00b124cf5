use std::path::Path;

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::{activation::softmax, Element, ElementConversion, TensorData},
};
use serde::Serialize;

use crate::{
    checkpoint::load_model,
    data::ClassificationBatcher,
    dataset::{load_image_chw, ImageItem},
    error::{Error, Result},
    model::{Architecture, ImageClassifier},
    training::{TrainingConfig, CLASSES_FILE, CONFIG_FILE},
};

const TOP_K: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    pub class_index: usize,
    pub class_name: String,
    pub probability: f64,
}

/// Classifies one image with the model saved in `artifact_dir`, returning
/// up to five classes by decreasing probability.
pub fn infer_from_file<B: Backend>(
    artifact_dir: &Path,
    device: &B::Device,
    image_path: &Path,
) -> Result<Vec<Prediction>> {
    let config_path = artifact_dir.join(CONFIG_FILE);
    let config = TrainingConfig::load(&config_path)
        .map_err(|err| Error::InvalidModel(format!("{}: {err:?}", config_path.display())))?;

    let classes_path = artifact_dir.join(CLASSES_FILE);
    let classes: Vec<String> = serde_json::from_str(
        &std::fs::read_to_string(&classes_path).map_err(Error::io(&classes_path))?,
    )?;

    let pixels = load_image_chw(image_path, config.image_size)?;
    let batcher = ClassificationBatcher::<B>::new(config.image_size, config.mean, config.std, device.clone());
    let batch = batcher.batch(vec![ImageItem { pixels, label: 0 }]);

    let base = config.checkpoint_base();
    let logits = match config.architecture() {
        Architecture::ResNet => {
            let model = config.resnet_config(classes.len()).init::<B>(device);
            load_model::<B, _>(model, &base, device)?.forward(batch.images)
        }
        Architecture::Transformer => {
            let model = config.vit_config(classes.len()).init::<B>(device)?;
            load_model::<B, _>(model, &base, device)?.forward(batch.images)
        }
    };
    log::info!("Model loaded from {}", base.display());

    top_predictions(logits, &classes, TOP_K)
}

/// Softmax over the first row of `logits`, best `k` classes first.
pub fn top_predictions<B: Backend>(
    logits: Tensor<B, 2>,
    classes: &[String],
    k: usize,
) -> Result<Vec<Prediction>> {
    let [_, num_classes] = logits.dims();
    let k = k.min(num_classes);
    if k == 0 {
        return Ok(Vec::new());
    }

    let probabilities = softmax(logits, 1);
    let (values, indices) = probabilities.topk_with_indices(k, 1);
    let values = data_to_vec::<f32>(values.to_data().convert::<f32>())?;
    let indices = data_to_vec::<i64>(indices.to_data().convert::<i64>())?;

    Ok(values
        .into_iter()
        .zip(indices)
        .map(|(probability, index)| {
            let class_index = index as usize;
            Prediction {
                class_index,
                class_name: classes
                    .get(class_index)
                    .cloned()
                    .unwrap_or_else(|| class_index.to_string()),
                probability: probability.elem::<f64>(),
            }
        })
        .collect())
}

fn data_to_vec<E: Element>(data: TensorData) -> Result<Vec<E>> {
    data.to_vec::<E>()
        .map_err(|err| Error::TensorData(format!("{err:?}")))
}
