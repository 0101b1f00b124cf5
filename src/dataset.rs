use burn::data::{dataset::Dataset, network::downloader};
use flate2::read::GzDecoder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;

use crate::error::{Error, Result};

const CIFAR100_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-100-binary.tar.gz";
const CIFAR100_DIR: &str = "cifar-100-binary";
const CIFAR100_CLASSES: usize = 100;
const CIFAR_SIZE: usize = 32;
// coarse label, fine label, then three 32x32 planes
const CIFAR_RECORD_LEN: usize = 2 + 3 * CIFAR_SIZE * CIFAR_SIZE;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// A single decoded image in channel-major (`[3, H, W]`) byte layout.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageItem {
    pub pixels: Vec<u8>,
    pub label: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// Where the labeled images come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSource {
    /// CIFAR-100 binary release, downloaded into `root` on first use.
    Cifar100 { root: PathBuf },
    /// `root/<split>/<class>/<image>` tree of arbitrary images.
    ImageFolder { root: PathBuf },
}

impl DatasetSource {
    pub fn load(&self, split: Split, image_size: usize) -> Result<ImageDataset> {
        match self {
            DatasetSource::Cifar100 { root } => {
                if image_size != CIFAR_SIZE {
                    return Err(Error::InvalidModel(format!(
                        "CIFAR-100 images are {CIFAR_SIZE}x{CIFAR_SIZE}, got image_size {image_size}"
                    )));
                }
                ImageDataset::cifar100(root, split)
            }
            DatasetSource::ImageFolder { root } => {
                ImageDataset::image_folder(root, split, image_size)
            }
        }
    }
}

/// In-memory labeled image dataset.
#[derive(Clone, Debug)]
pub struct ImageDataset {
    items: Vec<ImageItem>,
    classes: Vec<String>,
    image_size: usize,
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

impl ImageDataset {
    pub fn new(items: Vec<ImageItem>, classes: Vec<String>, image_size: usize) -> Self {
        Self {
            items,
            classes,
            image_size,
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Loads one CIFAR-100 split, downloading the archive if needed.
    pub fn cifar100(root: &Path, split: Split) -> Result<Self> {
        let dir = download_cifar100(root)?;
        let path = dir.join(format!("{}.bin", split.dir_name()));
        let bytes = fs::read(&path).map_err(Error::io(&path))?;
        let items = parse_cifar_records(&bytes, &path)?;

        let names_path = dir.join("fine_label_names.txt");
        let classes = match fs::read_to_string(&names_path) {
            Ok(names) => names
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => (0..CIFAR100_CLASSES).map(|i| i.to_string()).collect(),
        };

        log::info!("Loaded {} CIFAR-100 images from {}", items.len(), path.display());
        Ok(Self::new(items, classes, CIFAR_SIZE))
    }

    /// Loads one split of an image-folder tree, resizing every image to
    /// `image_size` x `image_size`. Class indices follow the sorted class
    /// directories of the `train` split.
    pub fn image_folder(root: &Path, split: Split, image_size: usize) -> Result<Self> {
        if !root.exists() {
            return Err(Error::MissingDataset(root.to_path_buf()));
        }

        let classes = list_classes(&root.join(Split::Train.dir_name()))?;
        let split_dir = root.join(split.dir_name());
        let mut files = Vec::new();

        for class in list_classes(&split_dir)? {
            let label = classes
                .iter()
                .position(|c| *c == class)
                .ok_or_else(|| Error::UnknownClass {
                    path: split_dir.clone(),
                    class: class.clone(),
                })?;

            let class_dir = split_dir.join(&class);
            let mut paths = list_images(&class_dir)?;
            paths.sort();
            files.extend(paths.into_iter().map(|path| (path, label)));
        }

        if files.is_empty() {
            return Err(Error::EmptyDataset(split_dir));
        }

        let items = files
            .par_iter()
            .map(|(path, label)| {
                Ok(ImageItem {
                    pixels: load_image_chw(path, image_size)?,
                    label: *label,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Loaded {} images in {} classes from {}",
            items.len(),
            classes.len(),
            split_dir.display()
        );
        Ok(Self::new(items, classes, image_size))
    }
}

/// Decodes an image, converts it to RGB, resizes it to a square and lays
/// the bytes out channel-major.
pub fn load_image_chw(path: &Path, image_size: usize) -> Result<Vec<u8>> {
    let img = image::open(path).map_err(|source| Error::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let side = image_size as u32;
    let rgb = img
        .resize_exact(side, side, image::imageops::FilterType::Lanczos3)
        .to_rgb8();

    Ok(hwc_to_chw(rgb.as_raw(), image_size, image_size))
}

pub(crate) fn hwc_to_chw(hwc: &[u8], height: usize, width: usize) -> Vec<u8> {
    let plane = height * width;
    let mut chw = vec![0u8; 3 * plane];
    for (i, pixel) in hwc.chunks_exact(3).enumerate() {
        for c in 0..3 {
            chw[c * plane + i] = pixel[c];
        }
    }
    chw
}

/// Parses CIFAR-100 binary records, labelling each image by its fine label.
pub fn parse_cifar_records(bytes: &[u8], path: &Path) -> Result<Vec<ImageItem>> {
    if bytes.len() % CIFAR_RECORD_LEN != 0 {
        return Err(Error::TruncatedRecords {
            path: path.to_path_buf(),
            len: bytes.len(),
            record_len: CIFAR_RECORD_LEN,
        });
    }

    bytes
        .chunks_exact(CIFAR_RECORD_LEN)
        .map(|record| {
            let label = record[1] as usize;
            if label >= CIFAR100_CLASSES {
                return Err(Error::LabelOutOfRange {
                    path: path.to_path_buf(),
                    label,
                    num_classes: CIFAR100_CLASSES,
                });
            }
            Ok(ImageItem {
                pixels: record[2..].to_vec(),
                label,
            })
        })
        .collect()
}

fn download_cifar100(root: &Path) -> Result<PathBuf> {
    let dataset_dir = root.join(CIFAR100_DIR);

    // Check if dataset is already downloaded
    if dataset_dir.join("train.bin").exists() && dataset_dir.join("test.bin").exists() {
        return Ok(dataset_dir);
    }

    fs::create_dir_all(root).map_err(Error::io(root))?;

    log::info!("Downloading CIFAR-100 into {}", root.display());
    let bytes = downloader::download_file_as_bytes(CIFAR100_URL, "cifar-100-binary.tar.gz");

    let mut archive = Archive::new(GzDecoder::new(&bytes[..]));
    archive.unpack(root).map_err(Error::io(root))?;

    if !dataset_dir.exists() {
        return Err(Error::MissingDataset(dataset_dir));
    }
    Ok(dataset_dir)
}

fn list_classes(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Err(Error::MissingDataset(dir.to_path_buf()));
    }

    let mut classes = fs::read_dir(dir)
        .map_err(Error::io(dir))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(String::from))
        .collect::<Vec<_>>();
    classes.sort();
    Ok(classes)
}

pub(crate) fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let paths = fs::read_dir(dir)
        .map_err(Error::io(dir))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn record(fine: u8, fill: u8) -> Vec<u8> {
        let mut bytes = vec![7, fine];
        bytes.extend(std::iter::repeat(fill).take(CIFAR_RECORD_LEN - 2));
        bytes
    }

    #[test]
    fn parses_fine_labels_and_pixels() {
        let mut bytes = record(3, 10);
        bytes.extend(record(99, 20));

        let items = parse_cifar_records(&bytes, Path::new("train.bin")).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].label, 3);
        assert_eq!(items[1].label, 99);
        assert_eq!(items[0].pixels.len(), 3 * 32 * 32);
        assert!(items[1].pixels.iter().all(|p| *p == 20));
    }

    #[test]
    fn rejects_truncated_records() {
        let mut bytes = record(1, 0);
        bytes.pop();

        let err = parse_cifar_records(&bytes, Path::new("test.bin")).unwrap_err();
        assert!(matches!(err, Error::TruncatedRecords { .. }));
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let err = parse_cifar_records(&record(100, 0), Path::new("test.bin")).unwrap_err();
        assert!(matches!(err, Error::LabelOutOfRange { label: 100, .. }));
    }

    #[test]
    fn converts_interleaved_to_planar() {
        let hwc = [1, 2, 3, 4, 5, 6];
        assert_eq!(hwc_to_chw(&hwc, 1, 2), vec![1, 4, 2, 5, 3, 6]);
    }

    fn write_image(path: &Path, color: [u8; 3]) {
        RgbImage::from_pixel(6, 4, Rgb(color)).save(path).unwrap();
    }

    #[test]
    fn loads_image_folder_with_train_class_indices() {
        let root = tempfile::tempdir().unwrap();
        for (split, class) in [("train", "cat"), ("train", "dog"), ("test", "dog")] {
            let dir = root.path().join(split).join(class);
            fs::create_dir_all(&dir).unwrap();
            write_image(&dir.join("a.png"), [255, 0, 0]);
        }
        fs::write(root.path().join("train/cat/notes.txt"), "skip me").unwrap();

        let train = ImageDataset::image_folder(root.path(), Split::Train, 8).unwrap();
        let test = ImageDataset::image_folder(root.path(), Split::Test, 8).unwrap();

        assert_eq!(train.classes(), ["cat", "dog"]);
        assert_eq!(train.len(), 2);
        assert_eq!(test.len(), 1);
        let item = test.get(0).unwrap();
        assert_eq!(item.label, 1);
        assert_eq!(item.pixels.len(), 3 * 8 * 8);
        // red plane saturated, green plane empty
        assert!(item.pixels[..64].iter().all(|p| *p > 200));
        assert!(item.pixels[64..128].iter().all(|p| *p < 50));
    }

    #[test]
    fn rejects_test_class_missing_from_train() {
        let root = tempfile::tempdir().unwrap();
        for (split, class) in [("train", "cat"), ("test", "bird")] {
            let dir = root.path().join(split).join(class);
            fs::create_dir_all(&dir).unwrap();
            write_image(&dir.join("a.png"), [0, 0, 255]);
        }

        let err = ImageDataset::image_folder(root.path(), Split::Test, 8).unwrap_err();
        assert!(matches!(err, Error::UnknownClass { class, .. } if class == "bird"));
    }

    #[test]
    fn missing_root_is_reported() {
        let err = ImageDataset::image_folder(Path::new("/nonexistent/images"), Split::Train, 8)
            .unwrap_err();
        assert!(matches!(err, Error::MissingDataset(_)));
    }
}
