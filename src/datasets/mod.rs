mod frames;
mod video;
use anyhow::Context;
use clap::ValueEnum;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
pub use frames::{ExtractedFrames, FrameSource};
pub use video::{VideoDataset, Workers};

const UCF101_CLASSES: [&str; 101] = [
    "ApplyEyeMakeup", "ApplyLipstick", "Archery", "BabyCrawling", "BalanceBeam",
    "BandMarching", "BaseballPitch", "Basketball", "BasketballDunk", "BenchPress",
    "Biking", "Billiards", "BlowDryHair", "BlowingCandles", "BodyWeightSquats",
    "Bowling", "BoxingPunchingBag", "BoxingSpeedBag", "BreastStroke", "BrushingTeeth",
    "CleanAndJerk", "CliffDiving", "CricketBowling", "CricketShot", "CuttingInKitchen",
    "Diving", "Drumming", "Fencing", "FieldHockeyPenalty", "FloorGymnastics",
    "FrisbeeCatch", "FrontCrawl", "GolfSwing", "Haircut", "HammerThrow",
    "Hammering", "HandstandPushups", "HandstandWalking", "HeadMassage", "HighJump",
    "HorseRace", "HorseRiding", "HulaHoop", "IceDancing", "JavelinThrow",
    "JugglingBalls", "JumpingJack", "JumpRope", "Kayaking", "Knitting",
    "LongJump", "Lunges", "MilitaryParade", "Mixing", "MoppingFloor",
    "Nunchucks", "ParallelBars", "PizzaTossing", "PlayingCello", "PlayingDaf",
    "PlayingDhol", "PlayingFlute", "PlayingGuitar", "PlayingPiano", "PlayingSitar",
    "PlayingTabla", "PlayingViolin", "PoleVault", "PommelHorse", "PullUps",
    "Punch", "PushUps", "Rafting", "RockClimbingIndoor", "RopeClimbing",
    "Rowing", "SalsaSpin", "ShavingBeard", "Shotput", "SkateBoarding",
    "Skiing", "Skijet", "SkyDiving", "SoccerJuggling", "SoccerPenalty",
    "StillRings", "SumoWrestling", "Surfing", "Swing", "TableTennisShot",
    "TaiChi", "TennisSwing", "ThrowDiscus", "TrampolineJumping", "Typing",
    "UnevenBars", "VolleyballSpiking", "WalkingWithDog", "WallPushups", "WritingOnBoard",
    "YoYo",
];

const UCF11_CLASSES: [&str; 11] = [
    "basketball", "biking", "diving", "golf_swing", "horse_riding",
    "soccer_juggling", "swing", "tennis_swing", "trampoline_jumping",
    "volleyball_spiking", "walking",
];

const VIDEO_EXTENSIONS: [&str; 3] = ["avi", "mp4", "mkv"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum WhichDataset {
    Ucf101,
    Ucf11,
}

impl WhichDataset {
    pub fn dir_name(self) -> &'static str {
        match self {
            WhichDataset::Ucf101 => "UCF101",
            WhichDataset::Ucf11 => "UCF11",
        }
    }

    pub fn classes(self) -> &'static [&'static str] {
        match self {
            WhichDataset::Ucf101 => &UCF101_CLASSES,
            WhichDataset::Ucf11 => &UCF11_CLASSES,
        }
    }

    pub fn num_classes(self) -> usize {
        self.classes().len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoSample {
    pub path: PathBuf,
    pub label: u32,
}

fn is_clip(path: &Path) -> bool {
    if path.is_dir() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| {
            VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(e))
        })
}

fn class_clips(class_dir: &Path, limit: usize) -> anyhow::Result<Vec<PathBuf>> {
    let mut clips = walkdir::WalkDir::new(class_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .collect::<Vec<_>>();
    clips.sort();

    // A video file and its extracted frame folder are the same clip.
    let mut kept: Vec<PathBuf> = Vec::new();
    for clip in clips.into_iter().filter(|p| is_clip(p)) {
        let stem = clip.with_extension("");
        if kept.iter().any(|k| k.with_extension("") == stem) {
            continue;
        }
        if !ExtractedFrames::frame_dir(&clip).is_dir() {
            log::warn!("skipping {}, no extracted frames next to it", clip.display());
            continue;
        }
        kept.push(clip);
        if kept.len() == limit {
            break;
        }
    }
    Ok(kept)
}

/// Lists up to `videos_per_class` clips under `<root>/<dataset>/train/<class>/`.
pub fn discover(
    root: &Path,
    dataset: WhichDataset,
    videos_per_class: usize,
) -> anyhow::Result<Vec<VideoSample>> {
    let train_dir = root.join(dataset.dir_name()).join("train");
    log::info!("Load dataset: {:?} from {}", dataset, train_dir.display());
    let mut samples = Vec::new();
    for (i, class) in dataset.classes().iter().enumerate() {
        let class_dir = train_dir.join(class);
        if !class_dir.is_dir() {
            log::warn!("class folder {} is missing", class_dir.display());
            continue;
        }
        let clips = class_clips(&class_dir, videos_per_class)
            .with_context(|| format!("listing {}", class_dir.display()))?;
        log::debug!("{class}: {} clips", clips.len());
        samples.extend(clips.into_iter().map(|path| VideoSample {
            path,
            label: i as u32,
        }));
    }
    if samples.is_empty() {
        anyhow::bail!("no clips found under {}", train_dir.display());
    }
    Ok(samples)
}

/// Seeded shuffle, then the first `ceil(n * val_ratio)` samples become validation.
pub fn train_val_split(
    mut samples: Vec<VideoSample>,
    val_ratio: f64,
    seed: u64,
) -> anyhow::Result<(Vec<VideoSample>, Vec<VideoSample>)> {
    let n = samples.len();
    let n_val = (n as f64 * val_ratio).ceil() as usize;
    if n_val == 0 || n_val >= n {
        anyhow::bail!(
            "cannot split {n} clips with validation ratio {val_ratio}: one side would be empty"
        );
    }
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
    samples.shuffle(&mut rng);
    let train = samples.split_off(n_val);
    Ok((train, samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn class_lists_have_expected_sizes() {
        assert_eq!(WhichDataset::Ucf101.num_classes(), 101);
        assert_eq!(WhichDataset::Ucf11.num_classes(), 11);
        assert_eq!(WhichDataset::Ucf101.classes()[2], "Archery");
        assert_eq!(WhichDataset::Ucf101.classes()[100], "YoYo");
    }

    #[test]
    fn discovers_sorted_capped_clips_per_class() {
        let temp = tempfile::tempdir().unwrap();
        let train = temp.path().join("UCF11").join("train");
        let biking = train.join("biking");
        let diving = train.join("diving");
        fs::create_dir_all(&biking).unwrap();
        fs::create_dir_all(&diving).unwrap();
        for name in ["v_c.avi", "v_a.avi", "v_b.avi", "notes.txt"] {
            fs::write(biking.join(name), b"").unwrap();
        }
        // extracted frames next to their source video count once
        fs::create_dir_all(biking.join("v_a")).unwrap();
        fs::create_dir_all(biking.join("v_c")).unwrap();
        fs::create_dir_all(diving.join("clip01")).unwrap();

        // v_b.avi has no frames, so v_c takes the second slot
        let samples = discover(temp.path(), WhichDataset::Ucf11, 2).unwrap();
        assert_eq!(
            samples,
            vec![
                VideoSample { path: biking.join("v_a"), label: 1 },
                VideoSample { path: biking.join("v_c"), label: 1 },
                VideoSample { path: diving.join("clip01"), label: 2 },
            ]
        );
    }

    #[test]
    fn videos_without_frames_are_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let walking = temp.path().join("UCF11").join("train").join("walking");
        fs::create_dir_all(&walking).unwrap();
        for name in ["a.avi", "b.mp4", "c.avi"] {
            fs::write(walking.join(name), b"").unwrap();
        }
        fs::create_dir_all(walking.join("c")).unwrap();

        let samples = discover(temp.path(), WhichDataset::Ucf11, 1).unwrap();
        assert_eq!(samples, vec![VideoSample { path: walking.join("c"), label: 10 }]);

        fs::remove_dir(walking.join("c")).unwrap();
        assert!(discover(temp.path(), WhichDataset::Ucf11, 1).is_err());
    }

    #[test]
    fn empty_dataset_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        assert!(discover(temp.path(), WhichDataset::Ucf101, 50).is_err());
    }

    fn samples(n: usize) -> Vec<VideoSample> {
        (0..n)
            .map(|i| VideoSample {
                path: PathBuf::from(format!("clip{i}")),
                label: (i % 3) as u32,
            })
            .collect()
    }

    #[test]
    fn split_is_deterministic_and_disjoint() {
        let (train, val) = train_val_split(samples(10), 0.2, 42).unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(val.len(), 2);
        assert!(val.iter().all(|v| !train.contains(v)));

        let (train2, val2) = train_val_split(samples(10), 0.2, 42).unwrap();
        assert_eq!(train, train2);
        assert_eq!(val, val2);
    }

    #[test]
    fn split_rounds_validation_up() {
        let (train, val) = train_val_split(samples(11), 0.2, 7).unwrap();
        assert_eq!(val.len(), 3);
        assert_eq!(train.len(), 8);
    }

    #[test]
    fn split_needs_both_sides() {
        assert!(train_val_split(samples(1), 0.2, 42).is_err());
        assert!(train_val_split(Vec::new(), 0.2, 42).is_err());
    }
}
