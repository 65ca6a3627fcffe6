use crate::datasets::WhichDataset;
use crate::models::WhichModel;
use candle_core::Device;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum WhichDevice {
    Cuda,
    Cpu,
}

impl WhichDevice {
    pub fn to_device(self) -> anyhow::Result<Device> {
        match self {
            WhichDevice::Cpu => Ok(Device::Cpu),
            WhichDevice::Cuda => {
                let device = Device::cuda_if_available(0)?;
                if !device.is_cuda() {
                    log::warn!("CUDA is not available, falling back to CPU");
                }
                Ok(device)
            }
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "Video action classification train with candle")]
#[command(version = "0.1")]
#[command(about = "Trains a ResNet + LSTM video classifier on UCF action datasets", long_about = None)]
pub struct Learner {
    /// Name of this train
    #[arg(short, long, default_value_t = String::from("resnet-lstm"))]
    pub name: String,

    /// epochs
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..), default_value_t = 200)]
    pub epochs: u32,

    /// batch size
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..), default_value_t = 8)]
    pub batch_size: u32,

    /// device to train on, falls back to cpu without cuda
    #[arg(long, value_enum, default_value_t = WhichDevice::Cuda)]
    pub device: WhichDevice,

    /// learning rate
    #[arg(short, long, default_value_t = 1e-4)]
    pub learning_rate: f64,

    /// clip decoding threads, 0 decodes on the training thread
    #[arg(long, default_value_t = 0)]
    pub num_workers: usize,

    /// number of clips taken per class
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 50)]
    pub videos_per_class: u64,

    /// number of frames sampled per clip
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 10)]
    pub n_frames: u64,

    /// side of the square frames fed to the backbone
    #[arg(long, value_parser = clap::value_parser!(u32).range(16..), default_value_t = 112)]
    pub frame_size: u32,

    /// model architecture
    #[arg(short, long, value_enum, default_value_t = WhichModel::ResnetLstm)]
    pub model: WhichModel,

    /// dataset class list and folder name
    #[arg(short, long, value_enum, default_value_t = WhichDataset::Ucf101)]
    pub dataset: WhichDataset,

    /// folder holding <UCF101|UCF11>/train/<Class>/
    #[arg(long, default_value = "data")]
    pub dataset_path: PathBuf,

    /// share of clips held out for validation
    #[arg(long, default_value_t = 0.2)]
    pub val_ratio: f64,

    /// seed
    #[arg(short, long, default_value_t = 42)]
    pub seed: u64,

    /// epochs without validation loss improvement before the rate is cut
    #[arg(long, default_value_t = 3)]
    pub patience: usize,

    /// multiplier applied to the learning rate on a plateau
    #[arg(long, default_value_t = 0.5)]
    pub lr_factor: f64,

    /// epochs to wait after a rate cut before counting plateaus again
    #[arg(long, default_value_t = 0)]
    pub lr_cooldown: usize,

    /// lower bound for the learning rate
    #[arg(long, default_value_t = 0.0)]
    pub min_lr: f64,

    /// best checkpoint folder
    #[arg(long, default_value = "checkpoint")]
    pub checkpoint_dir: PathBuf,

    /// load checkpoint
    #[arg(long, default_value_t = false)]
    pub load: bool,

    /// recoder home path
    #[arg(short, long, default_value = "tmp")]
    pub recoder_home: PathBuf,
}

impl Learner {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.val_ratio > 0.0 && self.val_ratio < 1.0) {
            anyhow::bail!("--val-ratio must be in (0, 1), got {}", self.val_ratio);
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            anyhow::bail!("--lr-factor must be in (0, 1), got {}", self.lr_factor);
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            anyhow::bail!("--learning-rate must be positive, got {}", self.learning_rate);
        }
        if !(self.min_lr >= 0.0 && self.min_lr <= self.learning_rate) {
            anyhow::bail!(
                "--min-lr must be in [0, --learning-rate], got {}",
                self.min_lr
            );
        }
        Ok(())
    }

    pub fn run_dir(&self) -> PathBuf {
        self.recoder_home.join(&self.name)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}.safetensors", self.model.name()))
    }
}
