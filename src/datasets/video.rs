use super::frames::{load_clip, FrameSource};
use super::VideoSample;
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::sync::Arc;

/// Clip decoding threads; without a pool clips are decoded on the caller's thread.
pub struct Workers {
    pool: Option<rayon::ThreadPool>,
}

impl Workers {
    pub fn new(num_workers: usize) -> anyhow::Result<Self> {
        let pool = if num_workers == 0 {
            None
        } else {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .thread_name(|i| format!("clip-decoder-{i}"))
                    .build()?,
            )
        };
        Ok(Self { pool })
    }

    fn map<T, F>(&self, indices: &[usize], f: F) -> anyhow::Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> anyhow::Result<T> + Sync + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(|| indices.par_iter().map(|&i| f(i)).collect()),
            None => indices.iter().map(|&i| f(i)).collect(),
        }
    }
}

pub struct VideoDataset {
    samples: Vec<VideoSample>,
    n_frames: usize,
    frame_size: u32,
    source: Arc<dyn FrameSource>,
}

impl VideoDataset {
    pub fn new(
        samples: Vec<VideoSample>,
        n_frames: usize,
        frame_size: u32,
        source: Arc<dyn FrameSource>,
    ) -> Self {
        Self {
            samples,
            n_frames,
            frame_size,
            source,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    fn load(&self, index: usize) -> anyhow::Result<Tensor> {
        let sample = &self.samples[index];
        load_clip(
            self.source.as_ref(),
            &sample.path,
            self.n_frames,
            self.frame_size,
        )
    }

    /// Batches of `(videos (B, T, 3, H, W), labels (B,))`.
    ///
    /// With `shuffle = Some(seed)` the visiting order is a seeded permutation,
    /// otherwise samples come in dataset order. The last batch may be short.
    pub fn batcher<'a>(
        &'a self,
        batch_size: usize,
        shuffle: Option<u64>,
        workers: &'a Workers,
        device: &Device,
    ) -> Batcher<'a> {
        assert!(batch_size > 0, "batch size must be positive");
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(seed) = shuffle {
            let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
            order.shuffle(&mut rng);
        }
        Batcher {
            dataset: self,
            order,
            pos: 0,
            batch_size,
            workers,
            device: device.clone(),
        }
    }
}

pub struct Batcher<'a> {
    dataset: &'a VideoDataset,
    order: Vec<usize>,
    pos: usize,
    batch_size: usize,
    workers: &'a Workers,
    device: Device,
}

impl Batcher<'_> {
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    fn next_batch(&self, indices: &[usize]) -> anyhow::Result<(Tensor, Tensor)> {
        let clips = self.workers.map(indices, |i| self.dataset.load(i))?;
        let videos = Tensor::stack(&clips, 0)?.to_device(&self.device)?;
        let labels: Vec<u32> = indices
            .iter()
            .map(|&i| self.dataset.samples[i].label)
            .collect();
        let labels = Tensor::from_vec(labels, indices.len(), &self.device)?;
        Ok((videos, labels))
    }
}

impl Iterator for Batcher<'_> {
    type Item = anyhow::Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let indices = self.order[self.pos..end].to_vec();
        self.pos = end;
        Some(self.next_batch(&indices))
    }
}
