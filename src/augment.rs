//! Batch-level regularization applied while optimizing.
//!
//! `Cutout` erases a square patch from each image. `Mixup` blends every
//! image with another one from the same batch and `CutMix` pastes a box
//! from it instead. Both train against the two labels in proportion to the
//! mix ratio.

use std::fmt;
use std::str::FromStr;

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::data::ClassificationBatch;
use crate::error::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrainMode {
    #[default]
    Baseline,
    Cutout,
    Mixup,
    CutMix,
}

impl FromStr for TrainMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "baseline" => Ok(TrainMode::Baseline),
            "cutout" => Ok(TrainMode::Cutout),
            "mixup" => Ok(TrainMode::Mixup),
            "cutmix" => Ok(TrainMode::CutMix),
            _ => Err(Error::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for TrainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainMode::Baseline => "baseline",
            TrainMode::Cutout => "cutout",
            TrainMode::Mixup => "mixup",
            TrainMode::CutMix => "cutmix",
        };
        f.write_str(name)
    }
}

/// A training batch whose loss mixes two target sets with weight `lam`.
#[derive(Clone, Debug)]
pub struct MixedBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets_a: Tensor<B, 1, Int>,
    pub targets_b: Tensor<B, 1, Int>,
    pub lam: f64,
}

impl<B: Backend> MixedBatch<B> {
    fn unmixed(batch: ClassificationBatch<B>) -> Self {
        Self {
            images: batch.images,
            targets_b: batch.targets.clone(),
            targets_a: batch.targets,
            lam: 1.0,
        }
    }

    /// `lam * CE(logits, a) + (1 - lam) * CE(logits, b)`.
    pub fn loss(&self, logits: Tensor<B, 2>) -> Tensor<B, 1> {
        let criterion = CrossEntropyLossConfig::new().init(&logits.device());
        let loss_a = criterion.forward(logits.clone(), self.targets_a.clone());
        if self.lam >= 1.0 {
            return loss_a;
        }

        let loss_b = criterion.forward(logits, self.targets_b.clone());
        loss_a.mul_scalar(self.lam) + loss_b.mul_scalar(1.0 - self.lam)
    }
}

pub struct BatchMixer {
    mode: TrainMode,
    cutout_size: usize,
    rng: StdRng,
}

impl BatchMixer {
    pub fn new(mode: TrainMode, cutout_size: usize, seed: u64) -> Self {
        Self {
            mode,
            cutout_size,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn mode(&self) -> TrainMode {
        self.mode
    }

    pub fn apply<B: Backend>(&mut self, batch: ClassificationBatch<B>) -> MixedBatch<B> {
        let [batch_size, _channels, height, width] = batch.images.dims();
        if batch_size == 0 {
            return MixedBatch::unmixed(batch);
        }
        let device = batch.images.device();

        match self.mode {
            TrainMode::Baseline => MixedBatch::unmixed(batch),
            TrainMode::Cutout => {
                let centers = (0..batch_size)
                    .map(|_| (self.rng.gen_range(0..height), self.rng.gen_range(0..width)))
                    .collect::<Vec<_>>();
                let mask = cutout_mask(height, width, self.cutout_size, &centers);
                let mask = mask_tensor::<B>(mask, [batch_size, 1, height, width], &device);

                MixedBatch::unmixed(ClassificationBatch {
                    images: batch.images * mask,
                    targets: batch.targets,
                })
            }
            TrainMode::Mixup => {
                let lam: f64 = self.rng.gen();
                let perm = self.permutation::<B>(batch_size, &device);
                let shuffled = batch.images.clone().select(0, perm.clone());

                MixedBatch {
                    images: batch.images.mul_scalar(lam) + shuffled.mul_scalar(1.0 - lam),
                    targets_b: batch.targets.clone().select(0, perm),
                    targets_a: batch.targets,
                    lam,
                }
            }
            TrainMode::CutMix => {
                let lam: f64 = self.rng.gen();
                let center = (self.rng.gen_range(0..height), self.rng.gen_range(0..width));
                let bounds = cutmix_box(height, width, lam, center);
                let area = (bounds.y2 - bounds.y1) * (bounds.x2 - bounds.x1);
                let lam = 1.0 - area as f64 / (height * width) as f64;

                let perm = self.permutation::<B>(batch_size, &device);
                let shuffled = batch.images.clone().select(0, perm.clone());
                let mask = mask_tensor::<B>(box_mask(height, width, bounds), [1, 1, height, width], &device);
                let keep = mask.clone().mul_scalar(-1.0).add_scalar(1.0);

                MixedBatch {
                    images: batch.images * keep + shuffled * mask,
                    targets_b: batch.targets.clone().select(0, perm),
                    targets_a: batch.targets,
                    lam,
                }
            }
        }
    }

    fn permutation<B: Backend>(&mut self, len: usize, device: &B::Device) -> Tensor<B, 1, Int> {
        let mut indices = (0..len as i64).collect::<Vec<_>>();
        indices.shuffle(&mut self.rng);
        Tensor::from_data(
            TensorData::new(indices, Shape::new([len])).convert::<B::IntElem>(),
            device,
        )
    }
}

/// Half-open pixel box `[y1, y2) x [x1, x2)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoxBounds {
    pub y1: usize,
    pub y2: usize,
    pub x1: usize,
    pub x2: usize,
}

/// Box covering a `1 - lam` share of the image around `center`, clipped to
/// the image borders.
pub fn cutmix_box(height: usize, width: usize, lam: f64, center: (usize, usize)) -> BoxBounds {
    let ratio = (1.0 - lam).max(0.0).sqrt();
    let cut_h = (height as f64 * ratio) as usize;
    let cut_w = (width as f64 * ratio) as usize;
    let (cy, cx) = center;

    BoxBounds {
        y1: cy.saturating_sub(cut_h / 2),
        y2: (cy + cut_h / 2).min(height),
        x1: cx.saturating_sub(cut_w / 2),
        x2: (cx + cut_w / 2).min(width),
    }
}

/// `1.0` inside the box, `0.0` elsewhere.
pub fn box_mask(height: usize, width: usize, bounds: BoxBounds) -> Vec<f32> {
    let mut mask = vec![0.0; height * width];
    for y in bounds.y1..bounds.y2 {
        for x in bounds.x1..bounds.x2 {
            mask[y * width + x] = 1.0;
        }
    }
    mask
}

/// One mask plane per center: `0.0` inside a `size` x `size` square around
/// the center (clipped at borders), `1.0` elsewhere.
pub fn cutout_mask(height: usize, width: usize, size: usize, centers: &[(usize, usize)]) -> Vec<f32> {
    let mut mask = Vec::with_capacity(centers.len() * height * width);
    for (cy, cx) in centers {
        let hole = BoxBounds {
            y1: cy.saturating_sub(size / 2),
            y2: (cy + size / 2).min(height),
            x1: cx.saturating_sub(size / 2),
            x2: (cx + size / 2).min(width),
        };
        mask.extend(box_mask(height, width, hole).into_iter().map(|v| 1.0 - v));
    }
    mask
}

fn mask_tensor<B: Backend>(mask: Vec<f32>, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(
        TensorData::new(mask, Shape::new(shape)).convert::<B::FloatElem>(),
        device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f32>;

    fn batch(values: [f32; 2], labels: [i64; 2]) -> ClassificationBatch<TestBackend> {
        let device = Default::default();
        let images = Tensor::cat(
            vec![
                Tensor::<TestBackend, 4>::ones([1, 3, 4, 4], &device).mul_scalar(values[0]),
                Tensor::<TestBackend, 4>::ones([1, 3, 4, 4], &device).mul_scalar(values[1]),
            ],
            0,
        );
        let targets = Tensor::<TestBackend, 1, Int>::from_ints(labels, &device);
        ClassificationBatch { images, targets }
    }

    #[test]
    fn parses_modes() {
        assert_eq!("baseline".parse::<TrainMode>().unwrap(), TrainMode::Baseline);
        assert_eq!("CutMix".parse::<TrainMode>().unwrap(), TrainMode::CutMix);
        assert_eq!(TrainMode::Mixup.to_string(), "mixup");
        assert!(matches!(
            "dropblock".parse::<TrainMode>(),
            Err(Error::UnknownMode(_))
        ));
    }

    #[test]
    fn cutout_clips_holes_at_the_border() {
        let mask = cutout_mask(4, 4, 2, &[(0, 0)]);
        let zeros = mask.iter().filter(|v| **v == 0.0).count();
        assert_eq!(zeros, 1);
        assert_eq!(mask[0], 0.0);

        let mask = cutout_mask(4, 4, 2, &[(2, 2)]);
        let holes = [5, 6, 9, 10];
        for (i, v) in mask.iter().enumerate() {
            assert_eq!(*v == 0.0, holes.contains(&i), "pixel {i}");
        }
    }

    #[test]
    fn cutmix_box_area_tracks_lambda() {
        let bounds = cutmix_box(32, 32, 0.75, (16, 16));
        assert_eq!(bounds, BoxBounds { y1: 8, y2: 24, x1: 8, x2: 24 });

        let clipped = cutmix_box(32, 32, 0.75, (0, 31));
        assert_eq!(clipped, BoxBounds { y1: 0, y2: 8, x1: 23, x2: 32 });

        assert_eq!(cutmix_box(32, 32, 1.0, (5, 5)), BoxBounds { y1: 5, y2: 5, x1: 5, x2: 5 });
    }

    #[test]
    fn baseline_keeps_batch_and_single_target() {
        let mut mixer = BatchMixer::new(TrainMode::Baseline, 16, 0);
        let mixed = mixer.apply(batch([1.0, 2.0], [3, 4]));

        assert_eq!(mixed.lam, 1.0);
        let images = mixed.images.to_data().to_vec::<f32>().unwrap();
        assert!(images[..48].iter().all(|v| *v == 1.0));
        assert!(images[48..].iter().all(|v| *v == 2.0));
    }

    #[test]
    fn mixup_blends_images_and_labels_consistently() {
        let mut mixer = BatchMixer::new(TrainMode::Mixup, 16, 7);
        let mixed = mixer.apply(batch([0.0, 1.0], [0, 1]));

        let lam = mixed.lam;
        assert!((0.0..=1.0).contains(&lam));

        let first = mixed.images.clone().slice([0..1]).mean().into_scalar().elem::<f64>();
        let partner = mixed.targets_b.clone().slice([0..1]).into_scalar().elem::<i64>();
        // image 0 is blank, so its mix equals (1 - lam) * partner value
        let expected = (1.0 - lam) * partner as f64;
        assert!((first - expected).abs() < 1e-5);
    }

    #[test]
    fn mixed_loss_interpolates_both_targets() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[2.0, 0.0], [0.0, 2.0]], &device);
        let a = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);
        let b = Tensor::<TestBackend, 1, Int>::from_ints([1, 0], &device);
        let images = Tensor::zeros([2, 3, 1, 1], &device);

        let loss_of = |lam: f64| {
            MixedBatch {
                images: images.clone(),
                targets_a: a.clone(),
                targets_b: b.clone(),
                lam,
            }
            .loss(logits.clone())
            .into_scalar()
            .elem::<f64>()
        };

        let (good, bad, half) = (loss_of(1.0), loss_of(0.0), loss_of(0.5));
        assert!(good < bad);
        assert!((half - (good + bad) / 2.0).abs() < 1e-5);
    }

    fn flat_batch(values: &[f32], size: usize) -> ClassificationBatch<TestBackend> {
        let device = Default::default();
        let images = values
            .iter()
            .map(|v| Tensor::<TestBackend, 4>::ones([1, 3, size, size], &device).mul_scalar(*v))
            .collect();
        let labels = (0..values.len() as i64).collect::<Vec<_>>();
        ClassificationBatch {
            images: Tensor::cat(images, 0),
            targets: Tensor::from_data(
                TensorData::new(labels, Shape::new([values.len()])).convert::<i64>(),
                &device,
            ),
        }
    }

    #[test]
    fn cutout_zeroes_the_same_hole_in_every_channel() {
        let (size, hole, seed) = (32, 16, 11);
        let mut mixer = BatchMixer::new(TrainMode::Cutout, hole, seed);
        let mixed = mixer.apply(flat_batch(&[1.0, 1.0, 1.0], size));
        assert_eq!(mixed.lam, 1.0);

        // the mixer draws one (row, column) center per image from its seeded rng
        let mut rng = StdRng::seed_from_u64(seed);
        let centers = (0..3)
            .map(|_| (rng.gen_range(0..size), rng.gen_range(0..size)))
            .collect::<Vec<_>>();
        let expected = cutout_mask(size, size, hole, &centers);

        let pixels = mixed.images.to_data().to_vec::<f32>().unwrap();
        let plane = size * size;
        for (i, (cy, cx)) in centers.iter().enumerate() {
            let mask = &expected[i * plane..(i + 1) * plane];
            let clipped = (cy + hole / 2).min(size) - cy.saturating_sub(hole / 2);
            let clipped = clipped * ((cx + hole / 2).min(size) - cx.saturating_sub(hole / 2));
            assert_eq!(mask.iter().filter(|v| **v == 0.0).count(), clipped);

            for c in 0..3 {
                let start = (i * 3 + c) * plane;
                assert_eq!(&pixels[start..start + plane], mask, "image {i} channel {c}");
            }
        }
    }

    #[test]
    fn cutmix_pastes_the_box_from_the_partner_image() {
        let size = 8;
        let plane = size * size;
        let values = [1.0, 2.0, 3.0, 4.0];
        let mut pasted_from_other = 0;

        for seed in 0..20 {
            let mut mixer = BatchMixer::new(TrainMode::CutMix, 16, seed);
            let mixed = mixer.apply(flat_batch(&values, size));
            let pixels = mixed.images.to_data().to_vec::<f32>().unwrap();
            let partners = mixed.targets_b.to_data().convert::<i64>().to_vec::<i64>().unwrap();
            let pasted = ((1.0 - mixed.lam) * plane as f64).round() as usize;

            for (i, partner) in partners.iter().enumerate() {
                let own = values[i];
                let other = values[*partner as usize];
                let image = &pixels[i * 3 * plane..(i + 1) * 3 * plane];
                assert!(image.iter().all(|v| *v == own || *v == other), "seed {seed}");

                if other != own {
                    assert_eq!(image.iter().filter(|v| **v == other).count(), 3 * pasted);
                    pasted_from_other += pasted;
                }
            }
        }
        assert!(pasted_from_other > 0);
    }

    #[test]
    fn cutmix_lambda_is_kept_area_share() {
        let mut mixer = BatchMixer::new(TrainMode::CutMix, 16, 3);
        let mixed = mixer.apply(batch([0.0, 0.0], [0, 1]));

        let cells = 16.0;
        let kept = mixed.lam * cells;
        assert!((kept - kept.round()).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&mixed.lam));
    }
}
