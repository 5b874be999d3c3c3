use candle_core::{Device, Tensor};
use cifar_model::{IMAGE_CHANNELS, IMAGE_SIZE};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::error::Result;
use crate::TrainingError;

mod cifar;

pub use cifar::{
    parse_labeled_records, parse_unlabeled_records, read_class_names, Cifar10, META_FILE,
    TRAIN_BATCH_COUNT,
};

/// Bytes per image: three 32x32 channel planes.
pub const IMAGE_BYTES: usize = IMAGE_CHANNELS * IMAGE_SIZE * IMAGE_SIZE;

pub const CHANNEL_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
pub const CHANNEL_STD: [f32; 3] = [0.2023, 0.1994, 0.2010];

const CROP_PADDING: usize = 4;

/// Raw u8 images in channel-major layout with optional class labels.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    images: Vec<u8>,
    labels: Option<Vec<u8>>,
}

impl ImageDataset {
    pub fn from_raw(images: Vec<u8>, labels: Option<Vec<u8>>) -> Result<Self> {
        if images.len() % IMAGE_BYTES != 0 {
            return Err(TrainingError::initialization(format!(
                "image store of {} bytes is not a multiple of {}",
                images.len(),
                IMAGE_BYTES
            )));
        }
        if let Some(labels) = &labels {
            let count = images.len() / IMAGE_BYTES;
            if labels.len() != count {
                return Err(TrainingError::initialization(format!(
                    "{} labels for {} images",
                    labels.len(),
                    count
                )));
            }
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.images.len() / IMAGE_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn labels(&self) -> Option<&[u8]> {
        self.labels.as_deref()
    }

    pub fn image(&self, index: usize) -> &[u8] {
        &self.images[index * IMAGE_BYTES..(index + 1) * IMAGE_BYTES]
    }

    /// Copies the rows named by `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        let len = self.len();
        let mut images = Vec::with_capacity(indices.len() * IMAGE_BYTES);
        let mut labels = self.labels.as_ref().map(|_| Vec::with_capacity(indices.len()));
        for &index in indices {
            if index >= len {
                return Err(TrainingError::runtime(format!(
                    "subset index {index} out of range for {len} images"
                )));
            }
            images.extend_from_slice(self.image(index));
            if let (Some(out), Some(source)) = (labels.as_mut(), self.labels.as_ref()) {
                out.push(source[index]);
            }
        }
        Ok(Self { images, labels })
    }
}

/// Seeded permutation split: the first `round(len * fraction)` indices are validation.
pub fn split_indices(len: usize, validation_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let mut validation_len = (len as f64 * validation_fraction).round() as usize;
    if validation_fraction > 0.0 && len > 1 {
        validation_len = validation_len.max(1);
    }
    validation_len = validation_len.min(len);

    let train = indices.split_off(validation_len);
    (train, indices)
}

/// Returns `(train, validation)` subsets of a labeled pool.
pub fn train_validation_split(
    pool: &ImageDataset,
    validation_fraction: f64,
    seed: u64,
) -> Result<(ImageDataset, ImageDataset)> {
    let (train_idx, valid_idx) = split_indices(pool.len(), validation_fraction, seed);
    Ok((pool.subset(&train_idx)?, pool.subset(&valid_idx)?))
}

#[derive(Debug)]
pub struct ImageBatch {
    /// `(len, 3, 32, 32)` normalized f32 images.
    pub images: Tensor,
    /// `(len,)` u32 class ids, absent for the test set.
    pub labels: Option<Tensor>,
    /// Row indices into the source dataset.
    pub indices: Vec<usize>,
    pub len: usize,
}

/// Turns an [`ImageDataset`] into device tensors batch by batch.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: ImageDataset,
    batch_size: usize,
    shuffle: bool,
    augment: bool,
    seed: u64,
    device: Device,
}

impl DataLoader {
    pub fn new(dataset: ImageDataset, batch_size: usize, device: Device) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle: false,
            augment: false,
            seed: 0,
            device,
        })
    }

    /// Reshuffles every epoch and applies crop/flip augmentation when `augment` is set.
    pub fn for_training(mut self, seed: u64, augment: bool) -> Self {
        self.shuffle = true;
        self.augment = augment;
        self.seed = seed;
        self
    }

    pub fn dataset(&self) -> &ImageDataset {
        &self.dataset
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn batches(&self, epoch: usize) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed ^ epoch as u64);
        if self.shuffle {
            order.shuffle(&mut rng);
        }
        Batches {
            loader: self,
            order,
            cursor: 0,
            rng,
        }
    }

    fn build_batch(&self, indices: &[usize], rng: &mut StdRng) -> Result<ImageBatch> {
        let mut pixels = Vec::with_capacity(indices.len() * IMAGE_BYTES);
        let mut scratch = vec![0u8; IMAGE_BYTES];
        for &index in indices {
            let image = self.dataset.image(index);
            if self.augment {
                let dx = rng.gen_range(0..=2 * CROP_PADDING);
                let dy = rng.gen_range(0..=2 * CROP_PADDING);
                let flip = rng.gen_bool(0.5);
                random_crop_flip(image, &mut scratch, dx, dy, flip);
                normalize_into(&scratch, &mut pixels);
            } else {
                normalize_into(image, &mut pixels);
            }
        }

        let len = indices.len();
        let images = Tensor::from_vec(
            pixels,
            (len, IMAGE_CHANNELS, IMAGE_SIZE, IMAGE_SIZE),
            &self.device,
        )?;
        let labels = match self.dataset.labels() {
            Some(labels) => {
                let ids: Vec<u32> = indices.iter().map(|&i| labels[i] as u32).collect();
                Some(Tensor::from_vec(ids, len, &self.device)?)
            }
            None => None,
        };

        Ok(ImageBatch {
            images,
            labels,
            indices: indices.to_vec(),
            len,
        })
    }
}

pub struct Batches<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl Iterator for Batches<'_> {
    type Item = Result<ImageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;
        Some(self.loader.build_batch(indices, &mut self.rng))
    }
}

/// Scales to [0, 1] then standardizes each channel plane.
fn normalize_into(image: &[u8], out: &mut Vec<f32>) {
    let plane = IMAGE_SIZE * IMAGE_SIZE;
    for (channel, values) in image.chunks_exact(plane).enumerate() {
        let mean = CHANNEL_MEAN[channel];
        let std = CHANNEL_STD[channel];
        out.extend(
            values
                .iter()
                .map(|&value| (value as f32 / 255.0 - mean) / std),
        );
    }
}

/// Crops a 32x32 window at `(dx, dy)` from the image zero-padded by 4 on every side.
fn random_crop_flip(image: &[u8], out: &mut [u8], dx: usize, dy: usize, flip: bool) {
    let plane = IMAGE_SIZE * IMAGE_SIZE;
    for channel in 0..IMAGE_CHANNELS {
        let src = &image[channel * plane..(channel + 1) * plane];
        let dst = &mut out[channel * plane..(channel + 1) * plane];
        for y in 0..IMAGE_SIZE {
            for x in 0..IMAGE_SIZE {
                let target_x = if flip { IMAGE_SIZE - 1 - x } else { x };
                let sy = (y + dy).checked_sub(CROP_PADDING);
                let sx = (target_x + dx).checked_sub(CROP_PADDING);
                dst[y * IMAGE_SIZE + x] = match (sy, sx) {
                    (Some(sy), Some(sx)) if sy < IMAGE_SIZE && sx < IMAGE_SIZE => {
                        src[sy * IMAGE_SIZE + sx]
                    }
                    _ => 0,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic(count: usize) -> ImageDataset {
        let images: Vec<u8> = (0..count)
            .flat_map(|i| std::iter::repeat(i as u8).take(IMAGE_BYTES))
            .collect();
        let labels = (0..count).map(|i| (i % 10) as u8).collect();
        ImageDataset::from_raw(images, Some(labels)).unwrap()
    }

    #[test]
    fn split_is_deterministic_and_complete() {
        let (train_a, valid_a) = split_indices(50, 0.1, 42);
        let (train_b, valid_b) = split_indices(50, 0.1, 42);
        assert_eq!(train_a, train_b);
        assert_eq!(valid_a, valid_b);
        assert_eq!(valid_a.len(), 5);
        assert_eq!(train_a.len() + valid_a.len(), 50);

        let mut all: Vec<usize> = train_a.iter().chain(valid_a.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());

        let (_, valid_c) = split_indices(50, 0.1, 7);
        assert_ne!(valid_a, valid_c);
    }

    #[test]
    fn tiny_pools_keep_one_validation_row() {
        let (train, valid) = split_indices(4, 0.1, 42);
        assert_eq!(valid.len(), 1);
        assert_eq!(train.len(), 3);
    }

    #[test]
    fn subset_preserves_labels() {
        let data = synthetic(5);
        let subset = data.subset(&[4, 1]).unwrap();
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.labels(), Some(&[4u8, 1][..]));
        assert_eq!(subset.image(0)[0], 4);
        assert!(data.subset(&[5]).is_err());
    }

    #[test]
    fn loader_keeps_partial_batch() {
        let loader = DataLoader::new(synthetic(5), 2, Device::Cpu).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let lens: Vec<usize> = loader
            .batches(0)
            .map(|batch| batch.unwrap().len)
            .collect();
        assert_eq!(lens, vec![2, 2, 1]);
    }

    #[test]
    fn evaluation_order_is_fixed() {
        let loader = DataLoader::new(synthetic(4), 3, Device::Cpu).unwrap();
        let indices: Vec<usize> = loader
            .batches(3)
            .flat_map(|batch| batch.unwrap().indices)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn training_order_depends_on_epoch() {
        let loader = DataLoader::new(synthetic(32), 32, Device::Cpu)
            .unwrap()
            .for_training(1, false);
        let first = loader.batches(1).next().unwrap().unwrap().indices;
        let again = loader.batches(1).next().unwrap().unwrap().indices;
        let other = loader.batches(2).next().unwrap().unwrap().indices;
        assert_eq!(first, again);
        assert_ne!(first, other);
    }

    #[test]
    fn batches_are_normalized_image_tensors() {
        let loader = DataLoader::new(synthetic(2), 2, Device::Cpu).unwrap();
        let batch = loader.batches(0).next().unwrap().unwrap();
        assert_eq!(batch.images.dims(), &[2, 3, 32, 32]);
        let labels: Vec<u32> = batch.labels.unwrap().to_vec1().unwrap();
        assert_eq!(labels, vec![0, 1]);

        let first: f32 = batch.images.flatten_all().unwrap().get(0).unwrap().to_scalar().unwrap();
        let expected = (0.0 - CHANNEL_MEAN[0]) / CHANNEL_STD[0];
        assert!((first - expected).abs() < 1e-6);
    }

    #[test]
    fn crop_shifts_and_pads_with_zero() {
        let image: Vec<u8> = (0..IMAGE_BYTES).map(|i| (i % 251) as u8 + 1).collect();
        let mut out = vec![0u8; IMAGE_BYTES];

        random_crop_flip(&image, &mut out, CROP_PADDING, CROP_PADDING, false);
        assert_eq!(out, image);

        random_crop_flip(&image, &mut out, 0, 0, false);
        assert_eq!(out[0], 0);
        assert_eq!(out[CROP_PADDING * IMAGE_SIZE + CROP_PADDING], image[0]);

        random_crop_flip(&image, &mut out, CROP_PADDING, CROP_PADDING, true);
        assert_eq!(out[0], image[IMAGE_SIZE - 1]);
    }
}
