use crate::{error::DataError, labels::Labels};
use anyhow::{Context, Result};
use burn::{
    data::dataloader::{batcher::Batcher, Dataset},
    prelude::*,
};
use image::{imageops::FilterType, DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use mime_guess::MimeGuess;
use rand::{thread_rng, Rng};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, error, info, warn};

/// An image file and the index of its class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// A dataset directory: one subdirectory per class, images anywhere below it.
#[derive(Debug, Clone)]
pub struct DatasetIndex {
    labels: Labels,
    samples: Vec<Sample>,
}

#[derive(Debug, Clone)]
pub struct Split {
    pub train: Vec<Sample>,
    pub valid: Vec<Sample>,
}

impl DatasetIndex {
    /// Classes are the sorted subdirectory names; samples are grouped by class, sorted by path.
    pub fn scan(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(DataError::MissingDataset(root.to_path_buf()).into());
        }
        let mut classes = vec![];
        for entry in fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))? {
            let entry = entry.with_context(|| format!("failed to read {}", root.display()))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            // a skipped class would shift the index of every class after it
            let name = entry.file_name().into_string().map_err(|name| {
                DataError::InvalidLabels(format!(
                    "class directory {} is not valid UTF-8",
                    name.to_string_lossy()
                ))
            })?;
            if !name.starts_with('.') {
                classes.push(name);
            }
        }
        classes.sort();
        if classes.is_empty() {
            return Err(DataError::NoClasses(root.to_path_buf()).into());
        }

        let mut samples = vec![];
        for (label, class) in classes.iter().enumerate() {
            let images = images_walk(root.join(class));
            debug!(class, label, images = images.len(), "scanned class directory");
            samples.extend(images.into_iter().map(|path| Sample { path, label }));
        }
        info!(
            classes = classes.len(),
            images = samples.len(),
            "found {} images in {}",
            samples.len(),
            root.display()
        );
        Ok(Self {
            labels: Labels::new(classes),
            samples,
        })
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Per class, the first `floor(validation_split * n)` images go to validation, the rest to training.
    pub fn split(&self, validation_split: f64) -> Result<Split> {
        if !(0.0..1.0).contains(&validation_split) {
            return Err(DataError::InvalidSplit(validation_split).into());
        }
        let mut split = Split {
            train: vec![],
            valid: vec![],
        };
        for label in 0..self.labels.len() {
            let class = self
                .samples
                .iter()
                .filter(|s| s.label == label)
                .cloned()
                .collect::<Vec<_>>();
            let cut = (validation_split * class.len() as f64) as usize;
            let mut class = class.into_iter();
            split.valid.extend(class.by_ref().take(cut));
            split.train.extend(class);
        }
        Ok(split)
    }
}

impl Split {
    pub fn ensure_non_empty(&self) -> Result<()> {
        if self.train.is_empty() {
            return Err(DataError::EmptySubset { subset: "training" }.into());
        }
        if self.valid.is_empty() {
            return Err(DataError::EmptySubset {
                subset: "validation",
            }
            .into());
        }
        Ok(())
    }
}

/// All image files below `root` that the `image` crate can decode, sorted.
pub fn images_walk(root: impl AsRef<Path>) -> Vec<PathBuf> {
    let mut res = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|res| res.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| match MimeGuess::from_path(e.path()).first() {
            Some(mime) => mime.type_() == "image",
            None => false,
        })
        .filter_map(|e| match decodable(e.path()) {
            true => Some(e.into_path()),
            false => {
                warn!("skipping {}, unsupported image format", e.path().display());
                None
            }
        })
        .collect::<Vec<_>>();
    res.sort();
    res
}

fn decodable(path: &Path) -> bool {
    ImageFormat::from_path(path).is_ok_and(|format| format.reading_enabled())
}

/// "Balanced" weights: `n_samples / (n_present_classes * count_c)`, 0 for classes without samples.
pub fn class_weights(samples: &[Sample], num_classes: usize) -> Vec<f32> {
    let mut counts = vec![0usize; num_classes];
    for sample in samples {
        counts[sample.label] += 1;
    }
    let present = counts.iter().filter(|c| **c > 0).count();
    counts
        .into_iter()
        .map(|count| match count {
            0 => 0.,
            count => samples.len() as f32 / (present as f32 * count as f32),
        })
        .collect()
}

#[derive(Config, Debug)]
pub struct AugmentConfig {
    /// Maximum rotation, in degrees, either direction
    #[config(default = 15.0)]
    pub rotation_degrees: f32,
    /// Zoom factor drawn from `[1 - zoom, 1 + zoom]`
    #[config(default = 0.15)]
    pub zoom: f32,
    #[config(default = true)]
    pub horizontal_flip: bool,
}

impl AugmentConfig {
    pub fn apply(&self, img: RgbImage, rng: &mut impl Rng) -> RgbImage {
        let mut img = img;
        if self.zoom > 0. {
            let factor = rng.gen_range(1. - self.zoom..=1. + self.zoom);
            img = zoom(&img, factor);
        }
        if self.rotation_degrees > 0. {
            let degrees = rng.gen_range(-self.rotation_degrees..=self.rotation_degrees);
            img = rotate_about_center(
                &img,
                degrees.to_radians(),
                Interpolation::Bilinear,
                Rgb([0, 0, 0]),
            );
        }
        if self.horizontal_flip && rng.gen_bool(0.5) {
            image::imageops::flip_horizontal_in_place(&mut img);
        }
        img
    }
}

/// `factor < 1` crops the centre and scales it up, `factor > 1` shrinks the image onto black.
fn zoom(img: &RgbImage, factor: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    let nwidth = ((width as f32 * factor).round() as u32).max(1);
    let nheight = ((height as f32 * factor).round() as u32).max(1);
    if factor < 1. {
        let x = (width - nwidth) / 2;
        let y = (height - nheight) / 2;
        let crop = image::imageops::crop_imm(img, x, y, nwidth, nheight).to_image();
        image::imageops::resize(&crop, width, height, FilterType::Triangle)
    } else {
        let small = image::imageops::resize(
            img,
            width * width / nwidth,
            height * height / nheight,
            FilterType::Triangle,
        );
        let mut background = RgbImage::new(width, height);
        image::imageops::overlay(
            &mut background,
            &small,
            (width as i64 - small.width() as i64) / 2,
            (height as i64 - small.height() as i64) / 2,
        );
        background
    }
}

/// Decode `path` and resize it to `size × size` RGB.
pub fn open_image(path: impl AsRef<Path>, size: usize) -> Result<RgbImage> {
    let path = path.as_ref();
    let img: DynamicImage =
        image::open(path).with_context(|| format!("failed to decode image {}", path.display()))?;
    Ok(img
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8())
}

/// HWC bytes to CHW floats in `[0, 1]`.
pub fn to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = pixel[c] as f32 / 255.0;
        }
    }
    data
}

#[derive(Debug, Clone)]
pub struct ImageItem {
    pub pixels: Vec<f32>,
    pub label: usize,
    pub path: PathBuf,
}

/// Lazily decoded images; training sets carry an augmentation.
#[derive(Debug)]
pub struct ImageDataSet {
    samples: Vec<Sample>,
    image_size: usize,
    augment: Option<AugmentConfig>,
}

impl ImageDataSet {
    pub fn train(samples: Vec<Sample>, image_size: usize, augment: AugmentConfig) -> Self {
        Self {
            samples,
            image_size,
            augment: Some(augment),
        }
    }

    pub fn valid(samples: Vec<Sample>, image_size: usize) -> Self {
        Self {
            samples,
            image_size,
            augment: None,
        }
    }

    /// Unlabelled images for prediction, from a single file or a directory.
    ///
    /// Every file is opened and its header decoded here, so unreadable input is an error
    /// instead of a failure inside the loader.
    pub fn predict(input: impl AsRef<Path>, image_size: usize) -> Result<Self> {
        let input = input.as_ref();
        let paths = match input.is_dir() {
            true => images_walk(input),
            false => vec![input.to_path_buf()],
        };
        if paths.is_empty() {
            return Err(DataError::NoImages(input.to_path_buf()).into());
        }
        for path in &paths {
            image::image_dimensions(path)
                .with_context(|| format!("failed to read image {}", path.display()))?;
        }
        Ok(Self {
            samples: paths
                .into_iter()
                .map(|path| Sample { path, label: 0 })
                .collect(),
            image_size,
            augment: None,
        })
    }

    pub fn item(&self, sample: &Sample) -> Result<ImageItem> {
        let mut img = open_image(&sample.path, self.image_size)?;
        if let Some(augment) = &self.augment {
            img = augment.apply(img, &mut thread_rng());
        }
        Ok(ImageItem {
            pixels: to_chw(&img),
            label: sample.label,
            path: sample.path.clone(),
        })
    }
}

impl Dataset<ImageItem> for ImageDataSet {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let sample = self.samples.get(index)?;
        // `None` would silently end the epoch, a broken file has to stop the run instead
        match self.item(sample) {
            Ok(item) => Some(item),
            Err(err) => {
                error!("{err:#}");
                panic!("failed to load {}", sample.path.display())
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    class_weights: Option<Arc<Vec<f32>>>,
}

#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    /// `[batch, 3, size, size]`
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    /// Loss weight of every item, from the weight of its class
    pub weights: Tensor<B, 1>,
    pub paths: Vec<PathBuf>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self {
            device,
            image_size,
            class_weights: None,
        }
    }

    pub fn with_class_weights(mut self, weights: Vec<f32>) -> Self {
        self.class_weights = Some(Arc::new(weights));
        self
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let size = self.image_size;
        let images = items
            .iter()
            .map(|item| TensorData::new(item.pixels.clone(), [3, size, size]))
            .map(|data| Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), &self.device))
            .map(|tensor| tensor.unsqueeze::<4>())
            .collect::<Vec<_>>();
        let targets = items.iter().map(|item| item.label as i64).collect::<Vec<_>>();
        let weights = items
            .iter()
            .map(|item| match &self.class_weights {
                Some(w) => w.get(item.label).copied().unwrap_or(1.),
                None => 1.,
            })
            .collect::<Vec<_>>();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::from_data(
            TensorData::new(targets, [items.len()]).convert::<B::IntElem>(),
            &self.device,
        );
        let weights = Tensor::from_data(
            TensorData::new(weights, [items.len()]).convert::<B::FloatElem>(),
            &self.device,
        );
        let paths = items.into_iter().map(|item| item.path).collect();

        ImageBatch {
            images,
            targets,
            weights,
            paths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::{rngs::StdRng, SeedableRng};

    fn touch_images(dir: &Path, class: &str, n: usize) {
        let class_dir = dir.join(class);
        fs::create_dir_all(&class_dir).unwrap();
        for i in 0..n {
            RgbImage::from_pixel(8, 6, Rgb([i as u8 * 20, 100, 200]))
                .save(class_dir.join(format!("{i:02}.png")))
                .unwrap();
        }
    }

    #[test]
    fn classes_are_sorted_directory_names() {
        let dir = tempfile::tempdir().unwrap();
        touch_images(dir.path(), "pothole", 2);
        touch_images(dir.path(), "garbage", 3);
        touch_images(dir.path(), ".cache", 1);
        fs::write(dir.path().join("pothole").join("notes.txt"), "x").unwrap();

        let index = DatasetIndex::scan(dir.path()).unwrap();
        assert_eq!(index.labels().names(), ["garbage", "pothole"]);
        assert_eq!(index.samples().len(), 5);
        assert!(index.samples()[..3].iter().all(|s| s.label == 0));
        assert!(index.samples()[0].path.ends_with("garbage/00.png"));
    }

    #[test]
    fn undecodable_images_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        touch_images(dir.path(), "garbage", 2);
        fs::write(
            dir.path().join("garbage").join("logo.svg"),
            r#"<svg xmlns="http://www.w3.org/2000/svg"/>"#,
        )
        .unwrap();

        let index = DatasetIndex::scan(dir.path()).unwrap();
        assert_eq!(index.samples().len(), 2);
        assert!(images_walk(dir.path()).iter().all(|p| p.extension().unwrap() == "png"));

        let dataset = ImageDataSet::predict(dir.path().join("garbage"), 4).unwrap();
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn unreadable_prediction_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageDataSet::predict(dir.path().join("missing.png"), 4).is_err());

        let fake = dir.path().join("fake.png");
        fs::write(&fake, "not an image").unwrap();
        assert!(ImageDataSet::predict(&fake, 4).is_err());

        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        let err = ImageDataSet::predict(&empty, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::NoImages(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_class_directory_is_rejected() {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

        let dir = tempfile::tempdir().unwrap();
        touch_images(dir.path(), "garbage", 1);
        fs::create_dir(dir.path().join(OsStr::from_bytes(b"pot\xffhole"))).unwrap();

        let err = DatasetIndex::scan(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::InvalidLabels(_))
        ));
    }

    #[test]
    fn missing_or_flat_dataset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = DatasetIndex::scan(dir.path().join("nope")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::MissingDataset(_))
        ));
        let err = DatasetIndex::scan(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::NoClasses(_))
        ));
    }

    #[test]
    fn split_takes_leading_fifth_of_each_class() {
        let dir = tempfile::tempdir().unwrap();
        touch_images(dir.path(), "a", 10);
        touch_images(dir.path(), "b", 4);
        let index = DatasetIndex::scan(dir.path()).unwrap();

        let split = index.split(0.2).unwrap();
        // floor(0.2 * 10) = 2, floor(0.2 * 4) = 0
        assert_eq!(split.valid.len(), 2);
        assert_eq!(split.train.len(), 12);
        assert!(split.valid[0].path.ends_with("a/00.png"));
        assert!(split.valid[1].path.ends_with("a/01.png"));
        assert!(split.train[0].path.ends_with("a/02.png"));

        let again = index.split(0.2).unwrap();
        assert_eq!(split.valid, again.valid);
        assert_eq!(split.train, again.train);
        assert!(index.split(1.0).is_err());
    }

    #[test]
    fn empty_subset_is_reported() {
        let split = Split {
            train: vec![Sample {
                path: "a.png".into(),
                label: 0,
            }],
            valid: vec![],
        };
        let err = split.ensure_non_empty().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::EmptySubset {
                subset: "validation"
            })
        ));
    }

    #[test]
    fn balanced_class_weights() {
        let samples = [0, 0, 0, 1]
            .into_iter()
            .map(|label| Sample {
                path: PathBuf::new(),
                label,
            })
            .collect::<Vec<_>>();
        let weights = class_weights(&samples, 3);
        // 4 / (2 * 3) and 4 / (2 * 1)
        assert!((weights[0] - 4. / 6.).abs() < 1e-6);
        assert!((weights[1] - 2.).abs() < 1e-6);
        assert_eq!(weights[2], 0.);
    }

    #[test]
    fn augmentation_keeps_the_size() {
        let img = RgbImage::from_fn(32, 32, |x, y| Rgb([x as u8 * 8, y as u8 * 8, 0]));
        let mut rng = StdRng::seed_from_u64(7);
        let config = AugmentConfig::new();
        for _ in 0..8 {
            assert_eq!(config.apply(img.clone(), &mut rng).dimensions(), (32, 32));
        }
        assert_eq!(zoom(&img, 0.85).dimensions(), (32, 32));
        assert_eq!(zoom(&img, 1.15).dimensions(), (32, 32));
    }

    #[test]
    fn chw_layout() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 51]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        assert_eq!(to_chw(&img), vec![1., 0., 0., 1., 0.2, 0.]);
    }

    #[test]
    fn batches_stack_images_and_weights() {
        let device = Default::default();
        let batcher =
            ImageBatcher::<NdArray>::new(device, 4).with_class_weights(vec![0.5, 2.0]);
        let items = (0..3)
            .map(|i| ImageItem {
                pixels: vec![i as f32; 3 * 4 * 4],
                label: i % 2,
                path: PathBuf::from(format!("{i}.png")),
            })
            .collect();
        let batch = batcher.batch(items);
        assert_eq!(batch.images.dims(), [3, 3, 4, 4]);
        assert_eq!(
            batch.targets.into_data().convert::<i64>().to_vec::<i64>().unwrap(),
            vec![0, 1, 0]
        );
        assert_eq!(
            batch.weights.into_data().convert::<f32>().to_vec::<f32>().unwrap(),
            vec![0.5, 2.0, 0.5]
        );
        assert_eq!(batch.paths.len(), 3);
    }
}
