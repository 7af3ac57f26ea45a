//! Wall-clock playback scheduler
//!
//! One loop interleaves ingestion and playback. Which frame is on screen is
//! always derived from elapsed wall-clock time, never from how many frames
//! have been decoded; the buffer only smooths out ingestion jitter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::capture::{Frame, FrameSource, Ingest};
use crate::display::DisplaySink;
use crate::error::Result;
use crate::pipeline::ringbuf::FrameBuffer;
use crate::{PlaybackStats, StatsSnapshot};

/// Source of "now" for the scheduler.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset_nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set(&self, since_start: Duration) {
        self.offset_nanos
            .store(since_start.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.offset_nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}

/// Maps wall-clock time to a frame index.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    pub start: Instant,
    pub frame_length: Duration,
}

impl PlaybackClock {
    pub fn new(start: Instant, frame_length: Duration) -> Self {
        Self {
            start,
            frame_length,
        }
    }

    /// `floor(elapsed / frame_length)`, 0 while `now` is before the start.
    pub fn target_frame(&self, now: Instant) -> usize {
        let elapsed = now.saturating_duration_since(self.start).as_nanos();
        let period = self.frame_length.as_nanos().max(1);
        (elapsed / period) as usize
    }
}

/// Tunables for one playback loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub buffer_capacity: usize,
    pub frame_length: Duration,
    /// Added to the video clock when audio is playing
    pub sync_offset: Duration,
    pub lag_warn_every: u64,
    pub yield_when_idle: bool,
}

impl LoopSettings {
    pub fn from_fps(fps: f64, buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity,
            frame_length: Duration::from_secs_f64(1.0 / fps),
            sync_offset: Duration::ZERO,
            lag_warn_every: 1000,
            yield_when_idle: true,
        }
    }
}

/// Outcome of one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Keep going; `busy` is false when neither step had anything to do
    Continue { busy: bool },
    Done,
}

/// Single-threaded ingestion + playback loop.
pub struct PlaybackLoop<S, D, C = SystemClock> {
    buffer: FrameBuffer,
    source: S,
    sink: D,
    clock: C,
    settings: LoopSettings,
    stats: Arc<PlaybackStats>,

    created_at: Instant,
    /// Unset until the first transcoded frame shows up
    vid_start: Option<Instant>,
    last_displayed: Option<usize>,
    source_exhausted: bool,
    lag_counter: u64,
}

impl<S, D, C> PlaybackLoop<S, D, C>
where
    S: FrameSource,
    D: DisplaySink,
    C: Clock,
{
    pub fn new(source: S, sink: D, clock: C, settings: LoopSettings) -> Self {
        let created_at = clock.now();
        Self {
            buffer: FrameBuffer::new(settings.buffer_capacity),
            source,
            sink,
            clock,
            settings,
            stats: Arc::new(PlaybackStats::default()),
            created_at,
            vid_start: None,
            last_displayed: None,
            source_exhausted: false,
            lag_counter: 0,
        }
    }

    /// Share counters with an observer.
    pub fn with_stats(mut self, stats: Arc<PlaybackStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Spin until the video is done playing.
    pub fn run(&mut self) -> Result<StatsSnapshot> {
        loop {
            match self.tick()? {
                Tick::Done => break,
                Tick::Continue { busy: false } if self.settings.yield_when_idle => {
                    std::thread::yield_now()
                }
                Tick::Continue { .. } => {}
            }
        }
        Ok(self.stats.snapshot())
    }

    pub fn tick(&mut self) -> Result<Tick> {
        let ingested = self.ingest()?;
        match self.play()? {
            Tick::Done => Ok(Tick::Done),
            Tick::Continue { busy } => Ok(Tick::Continue {
                busy: busy || ingested,
            }),
        }
    }

    /// Pull at most one frame from the source. Returns whether anything
    /// happened.
    fn ingest(&mut self) -> Result<bool> {
        if self.source_exhausted || self.buffer.is_full() {
            return Ok(false);
        }

        match self.source.poll_frame()? {
            Ingest::Pending => Ok(false),
            Ingest::EndOfStream => {
                self.source_exhausted = true;
                if self.vid_start.is_none() {
                    // Nothing was ever produced; give playback a start time
                    // so it can observe the end instead of waiting forever.
                    error!("No video start time set. The acquisition pipeline may have crashed.");
                    self.vid_start = Some(self.clock.now());
                }
                Ok(true)
            }
            Ingest::Frame(data) => {
                let now = self.clock.now();
                let index = self.buffer.len();
                self.buffer.append(Frame {
                    data,
                    index,
                    timestamp: now,
                })?;
                self.stats.frames_ingested.fetch_add(1, Ordering::Relaxed);

                if self.vid_start.is_none() {
                    // Start the video clock as soon as output appears; the
                    // audio branch started producing at about the same time.
                    self.vid_start = Some(now + self.settings.sync_offset);
                }
                Ok(true)
            }
        }
    }

    fn play(&mut self) -> Result<Tick> {
        let Some(start) = self.vid_start else {
            return Ok(Tick::Continue { busy: false });
        };

        let clock = PlaybackClock::new(start, self.settings.frame_length);
        let mut target = clock.target_frame(self.clock.now());

        if target >= self.buffer.len() {
            if self.source_exhausted {
                info!(
                    "Video done playing. Video processing lag counter: {}.",
                    self.lag_counter
                );
                return Ok(Tick::Done);
            }

            self.lag_counter += 1;
            self.stats.lag_ticks.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("ledstream_lag_ticks").increment(1);
            let every = self.settings.lag_warn_every.max(1);
            if self.lag_counter == 1 || self.lag_counter % every == 0 {
                warn!(
                    "Video processing is lagging. Counter: {}. Frames available: {}.",
                    self.lag_counter,
                    self.buffer.unread_len()
                );
            }
            // Keep showing the newest frame we have
            target = self.buffer.len().saturating_sub(1);
        }

        if Some(target) == self.last_displayed {
            return Ok(Tick::Continue { busy: false });
        }

        let skipped = match self.last_displayed {
            None => target,
            Some(last) => target - last - 1,
        };
        if skipped > 0 {
            warn!(
                "Video playing unable to keep up in real-time. Skipped playing {} frame(s).",
                skipped
            );
            self.stats
                .frames_skipped
                .fetch_add(skipped as u64, Ordering::Relaxed);
            metrics::counter!("ledstream_frames_skipped").increment(skipped as u64);
        }

        let frame = self.buffer.read(target)?;
        self.sink.play_frame(frame)?;
        if self.last_displayed.is_none() {
            let waited = self.clock.now().saturating_duration_since(self.created_at);
            info!("Started playing video after {:.3} s.", waited.as_secs_f64());
        }
        self.last_displayed = Some(target);
        self.stats.frames_displayed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ledstream_frames_displayed").increment(1);
        Ok(Tick::Continue { busy: true })
    }

    pub fn lag_counter(&self) -> u64 {
        self.lag_counter
    }

    pub fn last_displayed(&self) -> Option<usize> {
        self.last_displayed
    }

    pub fn is_source_exhausted(&self) -> bool {
        self.source_exhausted
    }

    pub fn has_started(&self) -> bool {
        self.vid_start.is_some()
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }

    pub fn into_parts(self) -> (S, D) {
        (self.source, self.sink)
    }
}
