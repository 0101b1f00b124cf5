use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::list_images;
use crate::error::{Error, Result};

/// Per-channel mean and standard deviation of pixel values in [0, 1].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub images: usize,
}

#[derive(Clone, Copy, Default)]
struct ChannelSums {
    sum: [f64; 3],
    sum_sq: [f64; 3],
    pixels: u64,
}

impl ChannelSums {
    fn merge(mut self, other: Self) -> Self {
        for c in 0..3 {
            self.sum[c] += other.sum[c];
            self.sum_sq[c] += other.sum_sq[c];
        }
        self.pixels += other.pixels;
        self
    }
}

/// All images under `split_dir/<class>/`.
pub fn collect_split_images(split_dir: &Path) -> Result<Vec<PathBuf>> {
    if !split_dir.exists() {
        return Err(Error::MissingDataset(split_dir.to_path_buf()));
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(split_dir).map_err(Error::io(split_dir))? {
        let path = entry.map_err(Error::io(split_dir))?.path();
        if path.is_dir() {
            paths.extend(list_images(&path)?);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Computes channel statistics over `paths` at their native resolution,
/// decoding in parallel.
pub fn channel_stats(paths: &[PathBuf]) -> Result<NormalizationStats> {
    if paths.is_empty() {
        return Err(Error::EmptyDataset(PathBuf::new()));
    }

    let sums = paths
        .par_iter()
        .map(|path| {
            let img = image::open(path)
                .map_err(|source| Error::Image {
                    path: path.clone(),
                    source,
                })?
                .to_rgb8();

            let mut sums = ChannelSums::default();
            for pixel in img.pixels() {
                for c in 0..3 {
                    let v = pixel[c] as f64 / 255.0;
                    sums.sum[c] += v;
                    sums.sum_sq[c] += v * v;
                }
            }
            sums.pixels += u64::from(img.width()) * u64::from(img.height());
            Ok::<_, Error>(sums)
        })
        .try_reduce(ChannelSums::default, |a, b| Ok(a.merge(b)))?;

    let n = sums.pixels.max(1) as f64;
    let mut mean = [0f32; 3];
    let mut std = [0f32; 3];
    for c in 0..3 {
        let m = sums.sum[c] / n;
        mean[c] = m as f32;
        std[c] = (sums.sum_sq[c] / n - m * m).max(0.0).sqrt() as f32;
    }

    Ok(NormalizationStats {
        mean,
        std,
        images: paths.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn stats_over_two_flat_images() {
        let dir = tempfile::tempdir().unwrap();
        let class_dir = dir.path().join("train").join("any");
        std::fs::create_dir_all(&class_dir).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([0, 255, 51]))
            .save(class_dir.join("a.png"))
            .unwrap();
        RgbImage::from_pixel(2, 2, Rgb([255, 255, 51]))
            .save(class_dir.join("b.png"))
            .unwrap();

        let paths = collect_split_images(&dir.path().join("train")).unwrap();
        let stats = channel_stats(&paths).unwrap();

        assert_eq!(stats.images, 2);
        // 16 black and 4 white pixels in the red channel
        assert!((stats.mean[0] - 0.2).abs() < 1e-6);
        assert!((stats.std[0] - 0.4).abs() < 1e-6);
        assert!((stats.mean[1] - 1.0).abs() < 1e-6);
        assert!(stats.std[1].abs() < 1e-3);
        assert!((stats.mean[2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn empty_split_is_an_error() {
        assert!(matches!(channel_stats(&[]), Err(Error::EmptyDataset(_))));
    }
}
