use anyhow::Context;
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use std::path::{Path, PathBuf};

const FRAME_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resolves a clip path to its ordered frame images.
///
/// Decoding video containers is left to an external tool (e.g. `ffmpeg -i X.avi X/%05d.jpg`);
/// implementations only have to find the frames it produced.
pub trait FrameSource: Send + Sync {
    fn frames(&self, clip: &Path) -> anyhow::Result<Vec<PathBuf>>;
}

/// Frames extracted to a folder: either the clip is that folder, or a video
/// file `X.avi` whose frames live in the sibling folder `X/`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractedFrames;

impl ExtractedFrames {
    /// Folder holding a clip's frames: the clip itself, or `X/` next to video `X.avi`.
    pub(crate) fn frame_dir(clip: &Path) -> PathBuf {
        if clip.is_dir() {
            clip.to_path_buf()
        } else {
            clip.with_extension("")
        }
    }
}

impl FrameSource for ExtractedFrames {
    fn frames(&self, clip: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let dir = Self::frame_dir(clip);
        if !dir.is_dir() {
            anyhow::bail!(
                "no extracted frames for {} (expected folder {})",
                clip.display(),
                dir.display()
            );
        }
        let mut frames = walkdir::WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| FRAME_EXTENSIONS.iter().any(|f| f.eq_ignore_ascii_case(e)))
            })
            .collect::<Vec<_>>();
        if frames.is_empty() {
            anyhow::bail!("frame folder {} holds no images", dir.display());
        }
        frames.sort();
        Ok(frames)
    }
}

/// `n` evenly spaced indices into `0..total`, repeating frames when the clip is short.
pub fn sample_indices(total: usize, n: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    (0..n).map(|i| (i * total / n).min(total - 1)).collect()
}

fn load_frame(path: &Path, size: u32, out: &mut Vec<f32>) -> anyhow::Result<()> {
    let img = image::open(path)
        .with_context(|| format!("decoding frame {}", path.display()))?
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8();
    let plane = (size * size) as usize;
    let start = out.len();
    out.resize(start + 3 * plane, 0.0);
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            out[start + c * plane + i] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }
    Ok(())
}

/// Decodes `n_frames` frames of `clip` into a `(n_frames, 3, size, size)` tensor on the CPU.
pub fn load_clip<S: FrameSource + ?Sized>(
    source: &S,
    clip: &Path,
    n_frames: usize,
    size: u32,
) -> anyhow::Result<Tensor> {
    let frames = source.frames(clip)?;
    let mut data = Vec::with_capacity(n_frames * 3 * (size * size) as usize);
    for idx in sample_indices(frames.len(), n_frames) {
        load_frame(&frames[idx], size, &mut data)?;
    }
    let s = size as usize;
    Ok(Tensor::from_vec(data, (n_frames, 3, s, s), &Device::Cpu)?)
}
