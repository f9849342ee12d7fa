//! Shuffled mini-batch iteration with optional background prefetch.

use std::{sync::Arc, thread};

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use burn_dataset::Dataset;
use crossbeam_channel::{bounded, Receiver};
use rand::{rngs::StdRng, seq::SliceRandom};
use tracing::{error, warn};
use wrn_core::{derive_seed, rng_from};

use crate::{
    dataset::{CifarDataset, IMAGE_BYTES, IMAGE_CHANNELS, IMAGE_SIDE},
    transform::{Image, Pipeline},
};

/// A preprocessed batch still in host memory.
#[derive(Clone, Debug, Default)]
pub struct HostBatch {
    /// `len * 3 * 32 * 32` values in NCHW order.
    pub images: Vec<f32>,
    pub labels: Vec<i64>,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Split into at most `parts` contiguous non-empty shards, the last possibly smaller.
    pub fn split(self, parts: usize) -> Vec<HostBatch> {
        let n = self.len();
        if parts <= 1 || n <= 1 {
            return vec![self];
        }
        let chunk = n.div_ceil(parts);
        self.labels
            .chunks(chunk)
            .zip(self.images.chunks(chunk * IMAGE_BYTES))
            .map(|(labels, images)| HostBatch {
                images: images.to_vec(),
                labels: labels.to_vec(),
            })
            .collect()
    }

    pub fn into_tensors<B: Backend>(self, device: &B::Device) -> (Tensor<B, 4>, Tensor<B, 1, Int>) {
        let n = self.labels.len();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(self.images, [n, IMAGE_CHANNELS, IMAGE_SIDE, IMAGE_SIDE]),
            device,
        );
        let labels = Tensor::<B, 1, Int>::from_ints(TensorData::new(self.labels, [n]), device);
        (images, labels)
    }
}

pub struct BatchLoader {
    dataset: Arc<CifarDataset>,
    pipeline: Arc<Pipeline>,
    batch_size: usize,
    shuffle: bool,
    workers: usize,
    seed: Option<u64>,
}

impl BatchLoader {
    pub fn new(
        dataset: CifarDataset,
        pipeline: Pipeline,
        batch_size: usize,
        shuffle: bool,
        workers: usize,
        seed: Option<u64>,
    ) -> Self {
        if workers > 1 {
            warn!(requested = workers, "batch loading uses a single prefetch thread");
        }
        Self {
            dataset: Arc::new(dataset),
            pipeline: Arc::new(pipeline),
            batch_size: batch_size.max(1),
            shuffle,
            // One producer keeps the augmentation stream reproducible under a seed.
            workers: workers.min(1),
            seed,
        }
    }

    /// Number of batches per epoch, counting a trailing partial batch.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.len() == 0
    }

    pub fn dataset(&self) -> &CifarDataset {
        &self.dataset
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Background producer threads actually used: 0 or 1.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start one pass over the data.
    pub fn epoch(&self, epoch: usize) -> BatchStream {
        let mut rng = rng_from(self.seed.map(|seed| derive_seed(seed, epoch as u64)));
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut rng);
        }

        let producer = BatchProducer {
            dataset: Arc::clone(&self.dataset),
            pipeline: Arc::clone(&self.pipeline),
            order,
            cursor: 0,
            batch_size: self.batch_size,
            rng,
        };

        if self.workers == 0 {
            return BatchStream::Inline(producer);
        }

        let (tx, rx) = bounded(2 * self.workers);
        let handle = thread::spawn(move || {
            for batch in producer {
                if tx.send(batch).is_err() {
                    break;
                }
            }
        });
        BatchStream::Prefetch {
            rx,
            handle: Some(handle),
        }
    }
}

pub struct BatchProducer {
    dataset: Arc<CifarDataset>,
    pipeline: Arc<Pipeline>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    rng: StdRng,
}

impl Iterator for BatchProducer {
    type Item = HostBatch;

    fn next(&mut self) -> Option<HostBatch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let mut batch = HostBatch {
            images: Vec::with_capacity(indices.len() * IMAGE_BYTES),
            labels: Vec::with_capacity(indices.len()),
        };
        for &index in indices {
            let Some(item) = self.dataset.get(index) else {
                continue;
            };
            let image = self.pipeline.apply(Image::cifar(&item.pixels), &mut self.rng);
            batch.images.extend_from_slice(&image.data);
            batch.labels.push(item.label as i64);
        }
        Some(batch)
    }
}

pub enum BatchStream {
    Inline(BatchProducer),
    Prefetch {
        rx: Receiver<HostBatch>,
        handle: Option<thread::JoinHandle<()>>,
    },
}

impl Iterator for BatchStream {
    type Item = HostBatch;

    fn next(&mut self) -> Option<HostBatch> {
        match self {
            BatchStream::Inline(producer) => producer.next(),
            BatchStream::Prefetch { rx, handle } => match rx.recv() {
                Ok(batch) => Some(batch),
                Err(_) => {
                    if let Some(handle) = handle.take() {
                        if handle.join().is_err() {
                            error!("batch prefetch worker panicked");
                        }
                    }
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{CifarVariant, IMAGE_BYTES};
    use burn_candle::{Candle, CandleDevice};

    fn dataset(n: usize) -> CifarDataset {
        let pixels: Vec<u8> = (0..n).flat_map(|i| vec![i as u8; IMAGE_BYTES]).collect();
        let labels: Vec<u8> = (0..n).map(|i| (i % 10) as u8).collect();
        CifarDataset::from_parts(CifarVariant::Cifar10, pixels, labels).unwrap()
    }

    fn identity() -> Pipeline {
        Pipeline::new(Vec::new())
    }

    fn collect_labels(stream: BatchStream) -> Vec<Vec<i64>> {
        stream.map(|batch| batch.labels).collect()
    }

    #[test]
    fn unshuffled_batches_keep_order_and_partial_tail() {
        let loader = BatchLoader::new(dataset(7), identity(), 3, false, 0, None);
        assert_eq!(loader.len(), 3);
        assert_eq!(
            collect_labels(loader.epoch(0)),
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]
        );
    }

    #[test]
    fn shuffled_epochs_cover_every_sample() {
        let loader = BatchLoader::new(dataset(10), identity(), 4, true, 0, Some(5));
        let mut seen: Vec<i64> = collect_labels(loader.epoch(0)).concat();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn seeded_epochs_are_reproducible_and_distinct() {
        let loader = BatchLoader::new(dataset(20), identity(), 20, true, 0, Some(9));
        let first = collect_labels(loader.epoch(0));
        assert_eq!(first, collect_labels(loader.epoch(0)));
        assert_ne!(first, collect_labels(loader.epoch(1)));
    }

    #[test]
    fn prefetch_matches_inline() {
        let inline = BatchLoader::new(dataset(9), identity(), 2, true, 0, Some(1));
        let prefetch = BatchLoader::new(dataset(9), identity(), 2, true, 4, Some(1));
        assert_eq!(inline.workers(), 0);
        assert_eq!(prefetch.workers(), 1);
        let a: Vec<HostBatch> = inline.epoch(3).collect();
        let b: Vec<HostBatch> = prefetch.epoch(3).collect();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.labels, y.labels);
            assert_eq!(x.images, y.images);
        }
    }

    #[test]
    fn split_keeps_samples_in_order() {
        let loader = BatchLoader::new(dataset(5), identity(), 5, false, 0, None);
        let batch = loader.epoch(0).next().unwrap();
        let shards = batch.clone().split(2);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].labels, vec![0, 1, 2]);
        assert_eq!(shards[1].labels, vec![3, 4]);
        for shard in &shards {
            assert_eq!(shard.images.len(), shard.len() * IMAGE_BYTES);
        }
        let joined: Vec<f32> = shards.iter().flat_map(|s| s.images.iter().copied()).collect();
        assert_eq!(joined, batch.images);

        let single = HostBatch {
            images: vec![0.0; IMAGE_BYTES],
            labels: vec![4],
        };
        assert_eq!(single.split(4).len(), 1);
    }

    #[test]
    fn batch_tensors_have_nchw_shape() {
        let loader = BatchLoader::new(dataset(5), identity(), 5, false, 0, None);
        let batch = loader.epoch(0).next().unwrap();
        let device = CandleDevice::Cpu;
        let (images, labels) = batch.into_tensors::<Candle<f32, i64>>(&device);
        assert_eq!(images.dims(), [5, 3, 32, 32]);
        assert_eq!(labels.dims(), [5]);
    }
}
