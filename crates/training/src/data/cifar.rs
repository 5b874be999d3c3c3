use std::{
    fs,
    path::{Path, PathBuf},
};

use cifar_model::NUM_CLASSES;
use tracing::info;

use super::{ImageDataset, IMAGE_BYTES};
use crate::{config::DataConfig, TrainingError};
use crate::error::Result;

pub const META_FILE: &str = "batches.meta.txt";
pub const TRAIN_BATCH_COUNT: usize = 5;

/// The labeled training pool and the unlabeled test rows, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Cifar10 {
    pub classes: Vec<String>,
    pub train: ImageDataset,
    pub test: ImageDataset,
}

impl Cifar10 {
    pub fn load(config: &DataConfig) -> Result<Self> {
        let directory = &config.directory;
        let meta_path = directory.join(META_FILE);
        let batch_paths: Vec<PathBuf> = (1..=TRAIN_BATCH_COUNT)
            .map(|idx| directory.join(format!("data_batch_{idx}.bin")))
            .collect();
        let test_path = directory.join(&config.test_file);

        for path in std::iter::once(&meta_path)
            .chain(batch_paths.iter())
            .chain(std::iter::once(&test_path))
        {
            if !path.is_file() {
                return Err(TrainingError::initialization(format!(
                    "required dataset file {} not found",
                    path.display()
                )));
            }
        }

        let classes = read_class_names(&meta_path)?;

        let mut images = Vec::new();
        let mut labels = Vec::new();
        for path in &batch_paths {
            let bytes = fs::read(path)?;
            let (batch_images, batch_labels) = parse_labeled_records(&bytes, path)?;
            images.extend_from_slice(&batch_images);
            labels.extend_from_slice(&batch_labels);
        }
        let train = ImageDataset::from_raw(images, Some(labels))?;

        let test_bytes = fs::read(&test_path)?;
        let test = ImageDataset::from_raw(parse_unlabeled_records(&test_bytes, &test_path)?, None)?;

        info!(
            train = train.len(),
            test = test.len(),
            directory = %directory.display(),
            "loaded CIFAR-10"
        );

        Ok(Self {
            classes,
            train,
            test,
        })
    }
}

pub fn read_class_names(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    let classes: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if classes.len() != NUM_CLASSES {
        return Err(TrainingError::initialization(format!(
            "{} lists {} classes, expected {}",
            path.display(),
            classes.len(),
            NUM_CLASSES
        )));
    }
    Ok(classes)
}

/// Splits `<label byte><3072 pixel bytes>` records into pixel and label stores.
pub fn parse_labeled_records(bytes: &[u8], path: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
    let record = IMAGE_BYTES + 1;
    if bytes.is_empty() || bytes.len() % record != 0 {
        return Err(TrainingError::initialization(format!(
            "{} is {} bytes, not a whole number of {}-byte records",
            path.display(),
            bytes.len(),
            record
        )));
    }

    let count = bytes.len() / record;
    let mut images = Vec::with_capacity(count * IMAGE_BYTES);
    let mut labels = Vec::with_capacity(count);
    for (idx, chunk) in bytes.chunks_exact(record).enumerate() {
        let label = chunk[0];
        if label as usize >= NUM_CLASSES {
            return Err(TrainingError::initialization(format!(
                "{}: record {} has label {} outside [0, {})",
                path.display(),
                idx,
                label,
                NUM_CLASSES
            )));
        }
        labels.push(label);
        images.extend_from_slice(&chunk[1..]);
    }
    Ok((images, labels))
}

pub fn parse_unlabeled_records(bytes: &[u8], path: &Path) -> Result<Vec<u8>> {
    if bytes.is_empty() || bytes.len() % IMAGE_BYTES != 0 {
        return Err(TrainingError::initialization(format!(
            "{} is {} bytes, not a whole number of {}-byte images",
            path.display(),
            bytes.len(),
            IMAGE_BYTES
        )));
    }
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(label: u8, fill: u8) -> Vec<u8> {
        let mut bytes = vec![label];
        bytes.extend(std::iter::repeat(fill).take(IMAGE_BYTES));
        bytes
    }

    #[test]
    fn labeled_records_split_into_stores() {
        let mut bytes = record(3, 7);
        bytes.extend(record(9, 1));
        let (images, labels) = parse_labeled_records(&bytes, Path::new("batch")).unwrap();
        assert_eq!(labels, vec![3, 9]);
        assert_eq!(images.len(), 2 * IMAGE_BYTES);
        assert_eq!(images[0], 7);
        assert_eq!(images[IMAGE_BYTES], 1);
    }

    #[test]
    fn truncated_or_mislabeled_records_are_rejected() {
        let mut truncated = record(0, 0);
        truncated.pop();
        assert!(parse_labeled_records(&truncated, Path::new("batch")).is_err());
        assert!(parse_labeled_records(&record(10, 0), Path::new("batch")).is_err());
        assert!(parse_unlabeled_records(&[0u8; 100], Path::new("test")).is_err());
    }

    #[test]
    fn missing_files_name_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = DataConfig {
            directory: dir.path().to_path_buf(),
            ..DataConfig::default()
        };
        let err = Cifar10::load(&config).unwrap_err();
        assert!(err.to_string().contains(META_FILE));
    }

    #[test]
    fn loads_minimal_distribution() {
        let dir = tempfile::tempdir().unwrap();
        let names = "airplane\nautomobile\nbird\ncat\ndeer\ndog\nfrog\nhorse\nship\ntruck\n";
        fs::write(dir.path().join(META_FILE), names).unwrap();
        for idx in 1..=TRAIN_BATCH_COUNT {
            fs::write(
                dir.path().join(format!("data_batch_{idx}.bin")),
                record(idx as u8, idx as u8),
            )
            .unwrap();
        }
        fs::write(dir.path().join("cifar_test_nolabels.bin"), vec![0u8; 2 * IMAGE_BYTES]).unwrap();

        let config = DataConfig {
            directory: dir.path().to_path_buf(),
            ..DataConfig::default()
        };
        let cifar = Cifar10::load(&config).unwrap();
        assert_eq!(cifar.classes[9], "truck");
        assert_eq!(cifar.train.len(), 5);
        assert_eq!(cifar.train.labels(), Some(&[1u8, 2, 3, 4, 5][..]));
        assert_eq!(cifar.test.len(), 2);
        assert!(cifar.test.labels().is_none());
    }
}
