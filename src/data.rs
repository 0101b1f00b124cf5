use std::sync::{Arc, Mutex};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    prelude::*,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::dataset::ImageItem;

// CIFAR-100 mean and std values
pub const CIFAR100_MEAN: [f32; 3] = [0.5071, 0.4865, 0.4409];
pub const CIFAR100_STD: [f32; 3] = [0.2673, 0.2564, 0.2762];

const CROP_PADDING: usize = 4;

/// Per-channel normalizer.
#[derive(Clone)]
pub struct Normalizer<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub std: Tensor<B, 4>,
}

impl<B: Backend> Normalizer<B> {
    pub fn new(mean: [f32; 3], std: [f32; 3], device: &Device<B>) -> Self {
        let mean = Tensor::<B, 1>::from_floats(mean, device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(std, device).reshape([1, 3, 1, 1]);
        Self { mean, std }
    }

    /// Normalizes images in the range [0, 1]:
    /// `input = (input - mean) / std`
    pub fn normalize(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        (input - self.mean.clone()) / self.std.clone()
    }
}

#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct ClassificationBatcher<B: Backend> {
    normalizer: Normalizer<B>,
    image_size: usize,
    augment: Option<Arc<Mutex<StdRng>>>,
    device: B::Device,
}

impl<B: Backend> ClassificationBatcher<B> {
    pub fn new(image_size: usize, mean: [f32; 3], std: [f32; 3], device: B::Device) -> Self {
        Self {
            normalizer: Normalizer::<B>::new(mean, std, &device),
            image_size,
            augment: None,
            device,
        }
    }

    /// Enables random crop and horizontal flip, seeded for reproducibility.
    pub fn with_augmentation(mut self, seed: u64) -> Self {
        self.augment = Some(Arc::new(Mutex::new(StdRng::seed_from_u64(seed))));
        self
    }
}

impl<B: Backend> Batcher<ImageItem, ClassificationBatch<B>> for ClassificationBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ClassificationBatch<B> {
        let size = self.image_size;
        let batch_size = items.len();

        let targets = items.iter().map(|item| item.label as i64).collect::<Vec<_>>();

        let mut pixels = Vec::with_capacity(batch_size * 3 * size * size);
        match &self.augment {
            Some(rng) => {
                let mut rng = rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                for item in &items {
                    let dy = rng.gen_range(0..=2 * CROP_PADDING);
                    let dx = rng.gen_range(0..=2 * CROP_PADDING);
                    let flip = rng.gen_bool(0.5);
                    let augmented = random_crop_flip(&item.pixels, size, CROP_PADDING, dy, dx, flip);
                    pixels.extend(augmented.into_iter().map(f32::from));
                }
            }
            None => {
                for item in &items {
                    pixels.extend(item.pixels.iter().copied().map(f32::from));
                }
            }
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, Shape::new([batch_size, 3, size, size]))
                .convert::<B::FloatElem>(),
            &self.device,
        ) / 255; // normalize between [0, 1]

        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets, Shape::new([batch_size])).convert::<B::IntElem>(),
            &self.device,
        );

        let images = self.normalizer.normalize(images);

        ClassificationBatch { images, targets }
    }
}

/// Crops a `size` x `size` window at offset (`dy`, `dx`) out of the image
/// zero-padded by `padding` on each side, optionally mirrored left-right.
/// Input and output are channel-major.
pub fn random_crop_flip(
    chw: &[u8],
    size: usize,
    padding: usize,
    dy: usize,
    dx: usize,
    flip: bool,
) -> Vec<u8> {
    let plane = size * size;
    let mut out = vec![0u8; chw.len()];

    for c in 0..3 {
        for y in 0..size {
            // row in the padded frame -> row in the source
            let sy = (y + dy).checked_sub(padding).filter(|sy| *sy < size);
            let Some(sy) = sy else { continue };
            for x in 0..size {
                let ox = if flip { size - 1 - x } else { x };
                let sx = (ox + dx).checked_sub(padding).filter(|sx| *sx < size);
                if let Some(sx) = sx {
                    out[c * plane + y * size + x] = chw[c * plane + sy * size + sx];
                }
            }
        }
    }
    out
}

/// Builds a data loader over `dataset`, shuffling with `shuffle` as seed.
pub fn build_loader<B, D>(
    batcher: ClassificationBatcher<B>,
    dataset: D,
    batch_size: usize,
    shuffle: Option<u64>,
    num_workers: usize,
) -> Arc<dyn DataLoader<ClassificationBatch<B>>>
where
    B: Backend,
    D: Dataset<ImageItem> + 'static,
{
    let builder = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .num_workers(num_workers);

    match shuffle {
        Some(seed) => builder.shuffle(seed).build(dataset),
        None => builder.build(dataset),
    }
}

/// Number of batches a loader yields for `len` items.
pub fn batches_per_epoch(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn ramp(size: usize) -> Vec<u8> {
        (0..3 * size * size).map(|i| i as u8).collect()
    }

    #[test]
    fn centered_crop_without_flip_is_identity() {
        let img = ramp(4);
        assert_eq!(random_crop_flip(&img, 4, 2, 2, 2, false), img);
    }

    #[test]
    fn flip_mirrors_each_row() {
        let img = ramp(2);
        let flipped = random_crop_flip(&img, 2, 0, 0, 0, true);
        assert_eq!(&flipped[..4], &[1, 0, 3, 2]);
    }

    #[test]
    fn shifted_crop_fills_padding_with_zeros() {
        let img = vec![9u8; 3 * 3 * 3];
        // top-left corner of the padded frame
        let out = random_crop_flip(&img, 3, 1, 0, 0, false);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 0);
        assert_eq!(out[3], 0);
        assert_eq!(out[4], 9);
        assert_eq!(out[8], 9);
    }

    #[test]
    fn batches_normalized_images_and_targets() {
        let device = Default::default();
        let batcher = ClassificationBatcher::<TestBackend>::new(2, [0.5; 3], [0.5; 3], device);
        let items = vec![
            ImageItem { pixels: vec![255; 12], label: 4 },
            ImageItem { pixels: vec![0; 12], label: 7 },
        ];

        let batch = batcher.batch(items);

        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        let values = batch.images.to_data().to_vec::<f32>().unwrap();
        assert!(values[..12].iter().all(|v| (v - 1.0).abs() < 1e-5));
        assert!(values[12..].iter().all(|v| (v + 1.0).abs() < 1e-5));
        let targets = batch.targets.to_data().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![4, 7]);
    }

    #[test]
    fn counts_partial_last_batch() {
        assert_eq!(batches_per_epoch(50_000, 128), 391);
        assert_eq!(batches_per_epoch(256, 128), 2);
        assert_eq!(batches_per_epoch(0, 128), 0);
    }
}
