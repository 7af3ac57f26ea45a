pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use capture::frame::{ColorMode, FrameGeometry};
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use error::{AttemptOutcome, BufferError, PipelineError, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display: DisplayConfig,
    pub video: VideoConfig,
    pub pipeline: PipelineConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub color_mode: ColorMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub play_audio: bool,
    /// Keep a copy of remote videos so replays skip the network
    pub save_video: bool,
    /// Download the whole video before starting playback
    pub predownload: bool,
    pub default_fps: f64,
    /// Delay applied to the video clock when audio is playing
    pub audio_sync_offset_ms: u64,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_buffer_capacity: usize,
    pub max_attempts: u32,
    /// Log every n-th consecutive lagging tick (and the first)
    pub lag_warn_every: u64,
    pub yield_when_idle: bool,
    pub fifo_dir: PathBuf,
    pub fifo_prefix: String,
}

/// External programs making up the acquisition/transcode pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub yt_dlp: String,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub ffplay: String,
    pub mbuffer: String,
    pub tee: String,
    /// Program and arguments run once before retrying a failed acquisition
    pub remediation: Vec<String>,
    pub download_buffer_bytes: u64,
    pub audio_buffer_bytes: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 32,
            color_mode: ColorMode::Color,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            play_audio: true,
            save_video: false,
            predownload: false,
            default_fps: 30.0,
            audio_sync_offset_ms: 150,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_buffer_capacity: 1024,
            max_attempts: 2,
            lag_warn_every: 1000,
            yield_when_idle: true,
            fifo_dir: std::env::temp_dir(),
            fifo_prefix: "ledstream_fifo".into(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            yt_dlp: "yt-dlp".into(),
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            ffplay: "ffplay".into(),
            mbuffer: "mbuffer".into(),
            tee: "tee".into(),
            remediation: vec!["yt-dlp".into(), "-U".into()],
            download_buffer_bytes: 50 * 1024 * 1024,
            audio_buffer_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file layered under
    /// `LEDSTREAM__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or_else(|| Path::new("ledstream.toml"));
        let settings = config::Config::builder()
            .add_source(config::File::from(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix("LEDSTREAM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values playback cannot work with.
    pub fn validate(&self) -> Result<()> {
        let fps = self.video.default_fps;
        if !(fps.is_finite() && fps > 0.0) {
            return Err(invalid(format!("video.default_fps must be positive, got {fps}")));
        }
        if self.display.width == 0 || self.display.height == 0 {
            return Err(invalid(format!(
                "display size must be non-zero, got {}x{}",
                self.display.width, self.display.height
            )));
        }
        if self.pipeline.frame_buffer_capacity == 0 {
            return Err(invalid("pipeline.frame_buffer_capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Make this the process-wide configuration.
    pub fn publish(self) -> Arc<Self> {
        let config = Arc::new(self);
        CONFIG.store(Arc::clone(&config));
        config
    }

    /// The configuration last passed to [`Config::publish`].
    pub fn current() -> Arc<Self> {
        CONFIG.load_full()
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(
            self.display.width,
            self.display.height,
            self.display.color_mode,
        )
    }
}

fn invalid(msg: String) -> PipelineError {
    PipelineError::Config(config::ConfigError::Message(msg))
}

/// Counters collected by the playback loop
#[derive(Debug, Default)]
pub struct PlaybackStats {
    pub frames_ingested: AtomicU64,
    pub frames_displayed: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub lag_ticks: AtomicU64,
}

impl PlaybackStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_ingested: self.frames_ingested.load(Ordering::Relaxed),
            frames_displayed: self.frames_displayed.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            lag_ticks: self.lag_ticks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_ingested: u64,
    pub frames_displayed: u64,
    pub frames_skipped: u64,
    pub lag_ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.pipeline.frame_buffer_capacity, 1024);
        assert_eq!(config.pipeline.max_attempts, 2);
        assert_eq!(config.video.default_fps, 30.0);
        assert_eq!(config.video.audio_sync_offset_ms, 150);
        assert_eq!(config.geometry().frame_size(), 64 * 32 * 3);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[display]\nwidth = 28\nheight = 18\ncolor_mode = \"bw\"\n\n[video]\nplay_audio = false"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.display.width, 28);
        assert_eq!(config.display.color_mode, ColorMode::Bw);
        assert!(!config.video.play_audio);
        assert_eq!(config.geometry().frame_size(), 28 * 18);
        // untouched sections keep their defaults
        assert_eq!(config.pipeline.frame_buffer_capacity, 1024);
    }

    #[test]
    fn unusable_values_are_rejected_on_load() {
        for body in [
            "[video]\ndefault_fps = 0.0",
            "[video]\ndefault_fps = -25.0",
            "[display]\nwidth = 0",
            "[pipeline]\nframe_buffer_capacity = 0",
        ] {
            let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
            writeln!(file, "{body}").unwrap();
            let err = Config::load(Some(file.path())).unwrap_err();
            assert!(matches!(err, PipelineError::Config(_)), "{body}: {err}");
        }
    }

    #[test]
    fn published_config_is_current() {
        let mut config = Config::default();
        config.display.width = 28;
        let published = config.publish();
        assert_eq!(published.display.width, 28);
        assert_eq!(Config::current().display.width, 28);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/ledstream.toml"))).is_err());
    }
}
