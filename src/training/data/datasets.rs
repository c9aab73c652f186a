//! Labelled image sets and the dataset wrappers fed to the data loader

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::transforms::Compose;
use super::{DataError, Dataset, Sample};

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff", "gif"];

/// Decoded images with their labels, source paths and the class name table
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    images: Vec<RgbImage>,
    labels: Vec<u32>,
    paths: Vec<PathBuf>,
    classes: Vec<String>,
}

impl SampleSet {
    /// Build from in-memory images; paths are left empty
    pub fn new(images: Vec<RgbImage>, labels: Vec<u32>, classes: Vec<String>) -> Result<Self, DataError> {
        let paths = vec![PathBuf::new(); images.len()];
        Self::with_paths(images, labels, paths, classes)
    }

    pub fn with_paths(
        images: Vec<RgbImage>,
        labels: Vec<u32>,
        paths: Vec<PathBuf>,
        classes: Vec<String>,
    ) -> Result<Self, DataError> {
        if images.len() != labels.len() || images.len() != paths.len() {
            return Err(DataError::InconsistentSize {
                images: images.len(),
                labels: labels.len(),
            });
        }
        if let Some(&label) = labels.iter().find(|&&l| l as usize >= classes.len()) {
            return Err(DataError::LabelOutOfRange {
                label,
                num_classes: classes.len(),
            });
        }
        Ok(Self {
            images,
            labels,
            paths,
            classes,
        })
    }

    /// Load an image folder with one sub-directory per class
    ///
    /// Class indices follow the sorted directory names.
    #[instrument]
    pub fn from_folder(root: &Path) -> Result<Self, DataError> {
        if !root.is_dir() {
            return Err(DataError::DatasetNotFound {
                path: root.display().to_string(),
            });
        }

        let mut classes = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();
        info!("Found {} classes in {:?}", classes.len(), root);

        let mut images = Vec::new();
        let mut labels = Vec::new();
        let mut paths = Vec::new();
        for (label, class_name) in classes.iter().enumerate() {
            let files = image_files(&root.join(class_name));
            debug!("Class '{}' (label {}): {} images", class_name, label, files.len());
            for path in files {
                images.push(decode(&path)?);
                labels.push(label as u32);
                paths.push(path);
            }
        }

        info!("Loaded {} images", images.len());
        Self::with_paths(images, labels, paths, classes)
    }

    /// Load every image below the given directories for prediction
    ///
    /// Images carry label 0; `classes` is the table of the trained model.
    pub fn from_unlabeled<P: AsRef<Path>>(roots: &[P], classes: Vec<String>) -> Result<Self, DataError> {
        let mut images = Vec::new();
        let mut paths = Vec::new();
        for root in roots {
            let root = root.as_ref();
            if !root.exists() {
                return Err(DataError::DatasetNotFound {
                    path: root.display().to_string(),
                });
            }
            for path in image_files(root) {
                images.push(decode(&path)?);
                paths.push(path);
            }
        }

        info!("Loaded {} unlabeled images from {} directories", images.len(), roots.len());
        let labels = vec![0; images.len()];
        Self::with_paths(images, labels, paths, classes)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn image(&self, index: usize) -> Option<&RgbImage> {
        self.images.get(index)
    }

    /// Number of samples per class index
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for &label in &self.labels {
            counts[label as usize] += 1;
        }
        counts
    }

    /// Copy the samples at `indices` into a new set with the same class table
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            images: indices.iter().map(|&i| self.images[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            paths: indices.iter().map(|&i| self.paths[i].clone()).collect(),
            classes: self.classes.clone(),
        }
    }

    /// Stratified train/validation/test split
    ///
    /// Each class is shuffled with `seed` and contributes `round(count * fraction)`
    /// samples to the test and validation sets; the remainder goes to training.
    pub fn split(&self, val_fraction: f64, test_fraction: f64, seed: u64) -> Result<DataSplits, DataError> {
        if !(0.0..1.0).contains(&val_fraction)
            || !(0.0..1.0).contains(&test_fraction)
            || val_fraction + test_fraction >= 1.0
        {
            return Err(DataError::InvalidSplit {
                reason: format!("val {} + test {} must be within [0, 1)", val_fraction, test_fraction),
            });
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let (mut train, mut val, mut test) = (Vec::new(), Vec::new(), Vec::new());

        for class in 0..self.num_classes() as u32 {
            let mut members: Vec<usize> = (0..self.len()).filter(|&i| self.labels[i] == class).collect();
            members.shuffle(&mut rng);

            let n = members.len() as f64;
            let n_test = (n * test_fraction).round() as usize;
            let n_val = ((n * val_fraction).round() as usize).min(members.len() - n_test);

            test.extend_from_slice(&members[..n_test]);
            val.extend_from_slice(&members[n_test..n_test + n_val]);
            train.extend_from_slice(&members[n_test + n_val..]);
        }

        if train.is_empty() {
            return Err(DataError::InvalidSplit {
                reason: "training split is empty".to_string(),
            });
        }
        if val.is_empty() {
            warn!("Validation split is empty; validation metrics will be zero");
        }

        train.sort_unstable();
        val.sort_unstable();
        test.sort_unstable();
        info!(
            "Split {} samples into train={}, val={}, test={}",
            self.len(),
            train.len(),
            val.len(),
            test.len()
        );

        Ok(DataSplits {
            train: self.subset(&train),
            val: self.subset(&val),
            test: self.subset(&test),
        })
    }
}

/// Train/validation/test sample sets sharing one class table
#[derive(Debug, Clone)]
pub struct DataSplits {
    pub train: SampleSet,
    pub val: SampleSet,
    pub test: SampleSet,
}

fn image_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

fn decode(path: &Path) -> Result<RgbImage, DataError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| DataError::ImageDecode {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// Training dataset: every read runs the random augmentation chain
pub struct AugmentedDataset {
    samples: Arc<SampleSet>,
    transform: Compose,
}

impl AugmentedDataset {
    pub fn new(samples: SampleSet, image_size: u32) -> Self {
        Self {
            samples: Arc::new(samples),
            transform: Compose::augmentation(image_size),
        }
    }

    pub fn samples(&self) -> &SampleSet {
        &self.samples
    }
}

/// Evaluation dataset: resize and convert only
pub struct EvalDataset {
    samples: Arc<SampleSet>,
    transform: Compose,
}

impl EvalDataset {
    pub fn new(samples: SampleSet, image_size: u32) -> Self {
        Self {
            samples: Arc::new(samples),
            transform: Compose::evaluation(image_size),
        }
    }

    pub fn samples(&self) -> &SampleSet {
        &self.samples
    }
}

fn transformed(samples: &SampleSet, transform: &Compose, index: usize, rng: &mut StdRng) -> Result<Sample, DataError> {
    let image = samples.image(index).ok_or(DataError::InvalidIndex {
        index,
        dataset_size: samples.len(),
    })?;
    let (pixels, height, width) = transform.apply(image, rng);
    Ok(Sample {
        pixels,
        height,
        width,
        label: samples.labels()[index],
    })
}

impl Dataset for AugmentedDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample, DataError> {
        transformed(&self.samples, &self.transform, index, rng)
    }

    fn num_classes(&self) -> usize {
        self.samples.num_classes()
    }
}

impl Dataset for EvalDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample, DataError> {
        transformed(&self.samples, &self.transform, index, rng)
    }

    fn num_classes(&self) -> usize {
        self.samples.num_classes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn set_with_counts(counts: &[usize]) -> SampleSet {
        let mut images = Vec::new();
        let mut labels = Vec::new();
        for (class, &count) in counts.iter().enumerate() {
            for i in 0..count {
                images.push(RgbImage::from_pixel(4, 4, Rgb([i as u8, class as u8, 0])));
                labels.push(class as u32);
            }
        }
        let classes = (0..counts.len()).map(|c| format!("class_{}", c)).collect();
        SampleSet::new(images, labels, classes).unwrap()
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let result = SampleSet::new(vec![RgbImage::new(2, 2)], vec![0, 1], vec!["a".into(), "b".into()]);
        assert!(matches!(result, Err(DataError::InconsistentSize { images: 1, labels: 2 })));
    }

    #[test]
    fn test_rejects_label_out_of_range() {
        let result = SampleSet::new(vec![RgbImage::new(2, 2)], vec![3], vec!["a".into()]);
        assert!(matches!(result, Err(DataError::LabelOutOfRange { label: 3, .. })));
    }

    #[test]
    fn test_stratified_split_counts() {
        let set = set_with_counts(&[10, 20]);
        let splits = set.split(0.2, 0.1, 42).unwrap();

        assert_eq!(splits.test.class_counts(), vec![1, 2]);
        assert_eq!(splits.val.class_counts(), vec![2, 4]);
        assert_eq!(splits.train.class_counts(), vec![7, 14]);
        assert_eq!(splits.train.classes(), set.classes());
    }

    #[test]
    fn test_split_is_seeded() {
        let set = set_with_counts(&[8, 8]);
        let a = set.split(0.25, 0.0, 7).unwrap();
        let b = set.split(0.25, 0.0, 7).unwrap();
        assert_eq!(a.val.labels(), b.val.labels());
        assert_eq!(a.val.image(0), b.val.image(0));
        assert!(a.test.is_empty());
    }

    #[test]
    fn test_split_rejects_bad_fractions() {
        let set = set_with_counts(&[4]);
        assert!(set.split(0.6, 0.5, 0).is_err());
        assert!(set.split(-0.1, 0.0, 0).is_err());
    }

    #[test]
    fn test_eval_dataset_contract() {
        let dataset = EvalDataset::new(set_with_counts(&[2, 1]), 8);
        let mut rng = StdRng::seed_from_u64(0);

        let sample = dataset.get(2, &mut rng).unwrap();
        assert_eq!(sample.label, 1);
        assert_eq!((sample.height, sample.width), (8, 8));
        assert_eq!(sample.pixels.len(), 3 * 8 * 8);

        assert!(matches!(
            dataset.get(3, &mut rng),
            Err(DataError::InvalidIndex { index: 3, dataset_size: 3 })
        ));
    }

    #[test]
    fn test_eval_dataset_is_deterministic() {
        let dataset = EvalDataset::new(set_with_counts(&[3]), 8);
        let a = dataset.get(1, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = dataset.get(1, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_folder_sorts_classes() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        for (class, count) in [("zooplankton", 2), ("diatom", 1)] {
            let dir = temp_dir.path().join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..count {
                RgbImage::from_pixel(5, 3, Rgb([10, 20, 30]))
                    .save(dir.join(format!("img_{}.png", i)))
                    .unwrap();
            }
            std::fs::write(dir.join("notes.txt"), "ignored").unwrap();
        }

        let set = SampleSet::from_folder(temp_dir.path()).unwrap();
        assert_eq!(set.classes(), &["diatom".to_string(), "zooplankton".to_string()]);
        assert_eq!(set.labels(), &[0, 1, 1]);
        assert_eq!(set.image(0).unwrap().dimensions(), (5, 3));
    }

    #[test]
    fn test_missing_folder() {
        let result = SampleSet::from_folder(Path::new("/nonexistent/plankton"));
        assert!(matches!(result, Err(DataError::DatasetNotFound { .. })));
    }
}
