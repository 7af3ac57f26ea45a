//! One video play request: acquisition, transcode and playback

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::capture::{FifoReader, FpsProbe, FrameIngestor, PipelineBuilder, ResolvedFps, VideoSource};
use crate::display::DisplaySink;
use crate::error::{AttemptOutcome, Result};
use crate::pipeline::housekeeping::Housekeeper;
use crate::pipeline::scheduler::{LoopSettings, PlaybackLoop, SystemClock};
use crate::pipeline::supervisor::{AttemptRunner, CommandRemediation, RetryPolicy};
use crate::{utils, Config, PlaybackStats, StatsSnapshot};

/// Plays one source on one display, retrying acquisition failures.
pub struct VideoSession<D> {
    config: Arc<Config>,
    url: String,
    sink: D,
    housekeeper: Housekeeper,
    stats: Arc<PlaybackStats>,
}

impl<D: DisplaySink> VideoSession<D> {
    pub fn new(config: Arc<Config>, url: impl Into<String>, sink: D, housekeeper: Housekeeper) -> Self {
        Self {
            config,
            url: url.into(),
            sink,
            housekeeper,
            stats: Arc::new(PlaybackStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PlaybackStats> {
        Arc::clone(&self.stats)
    }

    pub fn into_sink(self) -> D {
        self.sink
    }

    #[instrument(skip(self), fields(url = %self.url))]
    pub fn play(&mut self) -> Result<StatsSnapshot> {
        info!("Starting playback, display: {:?}", self.config.display);
        self.sink.clear_screen()?;
        match self.housekeeper.sweep_stale_fifos() {
            Ok(0) => {}
            Ok(n) => info!("Removed {} stale fifo(s)", n),
            Err(e) => warn!("Unable to sweep stale fifos: {}", e),
        }

        let policy = RetryPolicy::new(self.config.pipeline.max_attempts);
        let mut remediation = CommandRemediation::new(self.config.tools.remediation.clone());
        policy.run(self, &mut remediation)?;
        Ok(self.stats.snapshot())
    }

    fn attempt(&mut self) -> Result<AttemptOutcome> {
        let config = Arc::clone(&self.config);
        let video = &config.video;
        let geometry = config.geometry();
        let mut source = VideoSource::resolve(&self.url, &video.data_dir);

        let partial = (video.save_video && source.is_remote() && !source.is_local)
            .then(|| utils::partial_path(&source.save_path));
        if let Some(dir) = partial.as_deref().and_then(|p| p.parent()) {
            fs::create_dir_all(dir)?;
        }
        let builder = PipelineBuilder::new(&config.tools, geometry)
            .play_audio(video.play_audio)
            .save_to(partial.clone());

        if video.predownload && source.is_remote() && !source.is_local {
            let outcome = self.predownload(&builder, &mut source)?;
            if !outcome.is_clean() {
                return Ok(outcome);
            }
        }

        let fps = FpsProbe::new(&config.tools, video.default_fps).probe(&source, &builder.video_format());

        // Read end first: opening the write end blocks until a reader exists
        let frames_fifo = self.housekeeper.make_fifo("frames")?;
        let reader = FifoReader::open(&frames_fifo, geometry.frame_size())?;
        let writer = FifoReader::open_writer(&frames_fifo)?;

        let keeper = self.housekeeper.clone();
        let mut pipeline = builder.launch(&source, writer, |tag| keeper.make_fifo(tag))?;
        self.housekeeper.track_process_group(pipeline.pgid());

        let settings = self.loop_settings(&fps);
        let snapshot = {
            let ingestor = FrameIngestor::new(reader, &mut pipeline);
            PlaybackLoop::new(ingestor, &mut self.sink, SystemClock, settings)
                .with_stats(Arc::clone(&self.stats))
                .run()?
        };
        info!(
            "Displayed {} of {} frame(s), skipped {}",
            snapshot.frames_displayed, snapshot.frames_ingested, snapshot.frames_skipped
        );

        let outcome = pipeline.wait()?;
        if outcome.is_clean() {
            if let Some(partial) = partial.filter(|p| p.exists()) {
                promote(&partial, &source.save_path)?;
            }
        }
        Ok(outcome)
    }

    /// Fetch the whole video before playing it.
    fn predownload(&mut self, builder: &PipelineBuilder<'_>, source: &mut VideoSource) -> Result<AttemptOutcome> {
        let partial = utils::partial_path(&source.save_path);
        if let Some(dir) = partial.parent() {
            fs::create_dir_all(dir)?;
        }
        info!("Downloading video to {}", partial.display());

        let dest = File::create(&partial)?;
        let keeper = self.housekeeper.clone();
        let mut download = builder.launch_download(source, dest, |tag| keeper.make_fifo(tag))?;
        self.housekeeper.track_process_group(download.pgid());

        let outcome = download.wait()?;
        if outcome.is_clean() {
            promote(&partial, &source.save_path)?;
            source.mark_local();
        }
        Ok(outcome)
    }

    fn loop_settings(&self, fps: &ResolvedFps) -> LoopSettings {
        let pipeline = &self.config.pipeline;
        let mut settings = LoopSettings::from_fps(fps.fps, pipeline.frame_buffer_capacity.max(1));
        settings.lag_warn_every = pipeline.lag_warn_every;
        settings.yield_when_idle = pipeline.yield_when_idle;
        if self.config.video.play_audio {
            settings.sync_offset = Duration::from_millis(self.config.video.audio_sync_offset_ms);
        }
        settings
    }
}

impl<D: DisplaySink> AttemptRunner for VideoSession<D> {
    fn run_attempt(&mut self, attempt: u32) -> AttemptOutcome {
        info!("Starting attempt {}", attempt);
        self.attempt().unwrap_or_else(AttemptOutcome::from)
    }

    fn cleanup(&mut self, will_retry: bool) -> Result<()> {
        let cleaned = self.housekeeper.cleanup();
        // A retry follows right away; leave the last picture up
        if !will_retry {
            self.sink.clear_screen()?;
        }
        cleaned
    }
}

/// Move a finished download to its cache path.
fn promote(partial: &Path, save_path: &Path) -> Result<()> {
    fs::rename(partial, save_path)?;
    info!("Video saved: {}", save_path.display());
    Ok(())
}

/// Resolve `url`'s frame rate the way a session would.
pub fn probe_fps(config: &Config, url: &str) -> ResolvedFps {
    let source = VideoSource::resolve(url, &config.video.data_dir);
    let builder = PipelineBuilder::new(&config.tools, config.geometry());
    FpsProbe::new(&config.tools, config.video.default_fps).probe(&source, &builder.video_format())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ColorMode;
    use crate::display::RawSink;
    use crate::PipelineError;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// 2x1 rgb display, no audio, fake tools living in `dir`.
    fn config(dir: &Path, transcode: &str) -> Config {
        let mut config = Config::default();
        config.display.width = 2;
        config.display.height = 1;
        config.display.color_mode = ColorMode::Color;
        config.video.play_audio = false;
        config.video.data_dir = dir.join("data");
        config.pipeline.fifo_dir = dir.to_path_buf();
        config.pipeline.fifo_prefix = "session_test_fifo".into();
        config.pipeline.yield_when_idle = false;
        config.tools.ffmpeg = script(dir, "fake-ffmpeg", transcode);
        config.tools.ffprobe = script(dir, "fake-ffprobe", "echo 10/1");
        config.tools.remediation = vec!["true".into()];
        config
    }

    fn session(config: Config, url: &str) -> VideoSession<RawSink<Vec<u8>>> {
        let config = Arc::new(config);
        let geometry = config.geometry();
        let keeper = Housekeeper::from_config(&config);
        VideoSession::new(config, url, RawSink::new(Vec::new(), geometry), keeper)
    }

    const CLIP: &[u8] = b"ABCDEFabcdef012345";
    const URL: &str = "https://example.com/v";

    /// Fake remote toolchain in `dir`. The downloader serves `CLIP` as the
    /// video track and a long audio track. The muxer reads only the start of
    /// the audio before passing the video through, so the audio side is cut
    /// off with a broken pipe the way `-shortest` does it.
    fn remote_tools(config: &mut Config, dir: &Path) {
        config.tools.yt_dlp = script(
            dir,
            "fake-yt-dlp",
            r#"case "$*" in
  *bestaudio*) head -c 1000000 /dev/zero ;;
  *) printf 'ABCDEFabcdef012345' ;;
esac"#,
        );
        config.tools.mbuffer = script(
            dir,
            "fake-mbuffer",
            r#"out=""; in=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    -i) in="$2"; shift ;;
  esac
  shift
done
if [ -n "$out" ]; then exec cat > "$out"; fi
if [ -n "$in" ]; then exec cat "$in"; fi
exec cat"#,
        );
        config.tools.ffmpeg = script(
            dir,
            "fake-ffmpeg",
            r#"prev=""; inputs=""
for arg in "$@"; do
  if [ "$prev" = "-i" ]; then inputs="$inputs $arg"; fi
  prev="$arg"
done
case "$*" in
  *mpegts*)
    set -- $inputs
    head -c 10 "$2" > /dev/null
    exec cat "$1" ;;
  *) exec cat ;;
esac"#,
        );
        config.tools.tee = script(dir, "fake-tee", "[ \"$1\" = -p ] && shift\nexec tee \"$@\"");
        config.tools.ffplay = script(dir, "fake-ffplay", &format!("exec cat > '{}'", dir.join("audio.out").display()));
        let marker = dir.join("remediated");
        config.tools.remediation = vec![script(dir, "fake-update", &format!("touch '{}'", marker.display()))];
    }

    #[test]
    fn remote_video_is_saved_after_a_clean_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), "cat");
        remote_tools(&mut config, dir.path());
        config.video.play_audio = true;
        config.video.save_video = true;
        let cache = utils::cache_path(&config.video.data_dir, URL);

        let mut first = session(config.clone(), URL);
        let stats = first.play().unwrap();
        assert_eq!(stats.frames_ingested, 3);
        // the cut-off audio download did not count as a failed attempt
        assert!(!dir.path().join("remediated").exists());

        assert_eq!(fs::read(&cache).unwrap(), CLIP);
        assert!(!utils::partial_path(&cache).exists());
        // the audio branch saw the whole stream alongside the transcoder
        assert_eq!(fs::read(dir.path().join("audio.out")).unwrap(), CLIP);

        // replays come from the cache without touching the network
        config.tools.yt_dlp = script(dir.path(), "fake-yt-dlp", "exit 1");
        let mut replay = session(config, URL);
        assert_eq!(replay.play().unwrap().frames_ingested, 3);
    }

    #[test]
    fn failed_download_never_reaches_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), "cat");
        remote_tools(&mut config, dir.path());
        config.video.save_video = true;
        // the muxer passes one frame through, then fails
        config.tools.ffmpeg = script(
            dir.path(),
            "fake-ffmpeg",
            r#"prev=""; inputs=""
for arg in "$@"; do
  if [ "$prev" = "-i" ]; then inputs="$inputs $arg"; fi
  prev="$arg"
done
case "$*" in
  *mpegts*)
    set -- $inputs
    head -c 10 "$2" > /dev/null
    head -c 6 "$1"
    exit 1 ;;
  *) exec cat ;;
esac"#,
        );
        let cache = utils::cache_path(&config.video.data_dir, URL);

        let mut session = session(config, URL);
        let err = session.play().unwrap_err();
        assert!(matches!(err, PipelineError::AcquisitionFailed { attempts: 2, .. }));
        assert!(dir.path().join("remediated").exists());
        assert!(!cache.exists());
    }

    #[test]
    fn predownloaded_video_plays_from_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), "cat");
        remote_tools(&mut config, dir.path());
        config.video.predownload = true;
        let data_dir = config.video.data_dir.clone();

        let mut session = session(config, URL);
        let stats = session.play().unwrap();
        assert_eq!(stats.frames_ingested, 3);

        let cache = utils::cache_path(&data_dir, URL);
        assert_eq!(fs::read(&cache).unwrap(), CLIP);
        assert!(!utils::partial_path(&cache).exists());
        assert!(VideoSource::resolve(URL, &data_dir).is_local);
    }

    #[test]
    fn local_file_plays_to_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.raw");
        let frames: Vec<u8> = (1..=18).collect();
        fs::write(&video, &frames).unwrap();

        // The fake transcoder passes the raw bytes straight through
        let mut session = session(config(dir.path(), "cat"), video.to_str().unwrap());
        let stats = session.play().unwrap();
        assert_eq!(stats.frames_ingested, 3);
        assert!(stats.frames_displayed >= 1);

        let out = session.into_sink().into_inner();
        assert_eq!(out.len(), 12 + 6 * stats.frames_displayed as usize);
        assert_eq!(&out[..6], &[0; 6]);
        assert_eq!(&out[6..12], &frames[..6]);
        assert_eq!(&out[out.len() - 6..], &[0; 6]);

        let leftover = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("session_test_fifo"))
            .count();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn failing_transcoder_is_retried_once_then_reported() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.raw");
        fs::write(&video, [0u8; 6]).unwrap();

        let mut session = session(config(dir.path(), "exit 1"), video.to_str().unwrap());
        let err = session.play().unwrap_err();
        assert!(matches!(err, PipelineError::AcquisitionFailed { attempts: 2, .. }));

        // cleared at start and after the final attempt only
        assert_eq!(session.into_sink().into_inner(), [0; 12]);
    }
}
