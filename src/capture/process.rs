//! External acquisition/transcode pipeline
//!
//! Every stage is a real child process. Stages hand bytes to each other
//! through anonymous pipes or session fifos, and all of them share one
//! process group so a single `killpg` tears the whole chain down.

use std::fs::File;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::capture::frame::FrameGeometry;
use crate::capture::source::VideoSource;
use crate::error::{AttemptOutcome, PipelineError, Result};
use crate::ToolsConfig;

/// Whether a stage's exit status decides the attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    /// On the byte path from the source to the frame fifo
    Main,
    /// Feeds or taps the main path (downloads, buffers, audio). These are
    /// routinely cut off with a broken pipe, e.g. when the muxer stops at the
    /// shorter input, so their exits are logged but never classified.
    Auxiliary,
}

struct Stage {
    name: String,
    role: StageRole,
    child: Child,
}

struct Finished {
    name: String,
    role: StageRole,
    status: ExitStatus,
}

/// A launched set of stages sharing one process group.
pub struct PipelineProcess {
    pgid: Option<Pid>,
    running: Vec<Stage>,
    finished: Vec<Finished>,
}

impl PipelineProcess {
    pub fn new() -> Self {
        Self {
            pgid: None,
            running: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Spawn `cmd` as a main-path member of this pipeline's process group.
    /// The first stage spawned becomes the group leader.
    pub fn spawn(&mut self, name: &str, cmd: &mut Command) -> Result<&mut Child> {
        self.spawn_stage(name, StageRole::Main, cmd)
    }

    /// Spawn a stage whose exit status is not part of the outcome.
    pub fn spawn_auxiliary(&mut self, name: &str, cmd: &mut Command) -> Result<&mut Child> {
        self.spawn_stage(name, StageRole::Auxiliary, cmd)
    }

    fn spawn_stage(&mut self, name: &str, role: StageRole, cmd: &mut Command) -> Result<&mut Child> {
        cmd.process_group(self.pgid.map_or(0, Pid::as_raw));
        debug!("Spawning {:?} stage {}: {:?}", role, name, cmd);

        let child = cmd.spawn().map_err(|e| PipelineError::spawn(name, e))?;
        if self.pgid.is_none() {
            self.pgid = Some(Pid::from_raw(child.id() as i32));
        }
        self.running.push(Stage {
            name: name.to_owned(),
            role,
            child,
        });

        let idx = self.running.len() - 1;
        Ok(&mut self.running[idx].child)
    }

    pub fn pgid(&self) -> Option<Pid> {
        self.pgid
    }

    pub fn stage_count(&self) -> usize {
        self.running.len() + self.finished.len()
    }

    /// Reap any stages that have exited. Returns true once all have.
    pub fn has_exited(&mut self) -> Result<bool> {
        let mut i = 0;
        while i < self.running.len() {
            if let Some(status) = self.running[i].child.try_wait()? {
                let stage = self.running.swap_remove(i);
                self.record(stage, status);
            } else {
                i += 1;
            }
        }
        Ok(self.running.is_empty())
    }

    /// Block until every stage exits and classify the main-path stages,
    /// `pipefail` style.
    pub fn wait(&mut self) -> Result<AttemptOutcome> {
        let running = std::mem::take(&mut self.running);
        for mut stage in running {
            let status = stage.child.wait()?;
            self.record(stage, status);
        }
        Ok(AttemptOutcome::from_exit_statuses(
            self.finished
                .iter()
                .filter(|stage| stage.role == StageRole::Main)
                .map(|stage| (stage.name.as_str(), stage.status)),
        ))
    }

    fn record(&mut self, stage: Stage, status: ExitStatus) {
        match stage.role {
            StageRole::Auxiliary if is_broken_pipe(status) => {
                debug!("Stage {} was cut off by a closed pipe", stage.name)
            }
            StageRole::Auxiliary if !status.success() => {
                warn!("Auxiliary stage {} exited with {}", stage.name, status)
            }
            _ => debug!("Stage {} exited with {}", stage.name, status),
        }
        self.finished.push(Finished {
            name: stage.name,
            role: stage.role,
            status,
        });
    }

    /// Send SIGTERM to the whole process group.
    pub fn kill(&self) {
        if let Some(pgid) = self.pgid {
            kill_group(pgid);
        }
    }
}

/// Killed by SIGPIPE, or a shell reporting it as `128 + SIGPIPE`.
pub fn is_broken_pipe(status: ExitStatus) -> bool {
    let sigpipe = Signal::SIGPIPE as i32;
    status.signal() == Some(sigpipe) || status.code() == Some(128 + sigpipe)
}

impl Default for PipelineProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PipelineProcess {
    fn drop(&mut self) {
        if self.running.is_empty() {
            return;
        }
        self.kill();
        for stage in self.running.iter_mut() {
            let _ = stage.child.wait();
        }
    }
}

/// SIGTERM a process group, ignoring groups that are already gone.
pub fn kill_group(pgid: Pid) {
    info!("Killing pipeline process group (PGID: {})...", pgid);
    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to signal process group {}: {}", pgid, e),
    }
}

/// Build the stage commands of one play attempt.
pub struct PipelineBuilder<'a> {
    tools: &'a ToolsConfig,
    geometry: FrameGeometry,
    play_audio: bool,
    /// Partial-download path for the save branch
    save_to: Option<PathBuf>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(tools: &'a ToolsConfig, geometry: FrameGeometry) -> Self {
        Self {
            tools,
            geometry,
            play_audio: false,
            save_to: None,
        }
    }

    pub fn play_audio(mut self, enabled: bool) -> Self {
        self.play_audio = enabled;
        self
    }

    pub fn save_to(mut self, path: Option<PathBuf>) -> Self {
        self.save_to = path;
        self
    }

    /// Format selector for the video download: the cheapest h264 stream that
    /// is still at least as tall as the display.
    pub fn video_format(&self) -> String {
        let h = self.geometry.height;
        format!("worstvideo[vcodec^=avc1][height>={h}]/worst[vcodec^=avc1][height>={h}]/worst")
    }

    /// Launch acquire → tee → {transcode, audio, save}. The transcoder's
    /// stdout is `frames`, the write end of the session's frame fifo.
    ///
    /// `make_fifo` creates a session fifo for the given tag.
    pub fn launch<F>(&self, source: &VideoSource, frames: File, mut make_fifo: F) -> Result<PipelineProcess>
    where
        F: FnMut(&str) -> Result<PathBuf>,
    {
        let mut proc = PipelineProcess::new();
        let stream = self.acquire(&mut proc, source, &mut make_fifo)?;

        let audio_fifo = if self.play_audio {
            Some(make_fifo("audio")?)
        } else {
            None
        };
        let save_to = self.save_to.as_deref().filter(|_| !source.is_local);
        if let Some(path) = save_to {
            info!("Video will be saved to: {}", path.display());
        }

        let transcode_input = if audio_fifo.is_some() || save_to.is_some() {
            let mut tee = self.tee_cmd(audio_fifo.as_deref(), save_to);
            let tee = proc.spawn("tee", tee.stdin(stream).stdout(Stdio::piped()))?;
            take_stdout(tee, "tee")?
        } else {
            stream
        };

        proc.spawn(
            "transcode",
            self.transcode_cmd()
                .stdin(transcode_input)
                .stdout(Stdio::from(frames)),
        )?;

        if let Some(fifo) = audio_fifo {
            let mut buffer = self.mbuffer_cmd(self.tools.audio_buffer_bytes);
            buffer.arg("-i").arg(&fifo);
            let buffer = proc.spawn_auxiliary("audio-buffer", buffer.stdin(Stdio::null()).stdout(Stdio::piped()))?;
            let audio = take_stdout(buffer, "audio-buffer")?;
            proc.spawn_auxiliary("play-audio", self.ffplay_cmd().stdin(audio).stdout(Stdio::null()))?;
        }

        info!("Launched {} pipeline stage(s)", proc.stage_count());
        Ok(proc)
    }

    /// Launch only the acquisition stages, writing the muxed stream to `dest`.
    pub fn launch_download<F>(&self, source: &VideoSource, dest: File, mut make_fifo: F) -> Result<PipelineProcess>
    where
        F: FnMut(&str) -> Result<PathBuf>,
    {
        let mut proc = PipelineProcess::new();
        self.spawn_muxed_download(&mut proc, &source.id, Stdio::from(dest), &mut make_fifo)?;
        Ok(proc)
    }

    /// Produce the source byte stream: the saved file, or a muxed download.
    fn acquire<F>(&self, proc: &mut PipelineProcess, source: &VideoSource, make_fifo: &mut F) -> Result<Stdio>
    where
        F: FnMut(&str) -> Result<PathBuf>,
    {
        if source.is_local {
            return Ok(Stdio::from(File::open(&source.save_path)?));
        }
        let mux = self.spawn_muxed_download(proc, &source.id, Stdio::piped(), make_fifo)?;
        take_stdout(mux, "mux")
    }

    /// Video and audio are fetched separately, each behind its own bounded
    /// buffer, then remuxed into one MPEG-TS stream. A download that fails
    /// outright leaves the muxer without input, which fails the mux.
    fn spawn_muxed_download<'p, F>(
        &self,
        proc: &'p mut PipelineProcess,
        url: &str,
        out: Stdio,
        make_fifo: &mut F,
    ) -> Result<&'p mut Child>
    where
        F: FnMut(&str) -> Result<PathBuf>,
    {
        let video_fifo = make_fifo("dl_video")?;
        let audio_fifo = make_fifo("dl_audio")?;

        for (tag, format, fifo) in [
            ("video", self.video_format(), &video_fifo),
            ("audio", "bestaudio/bestaudio*".to_owned(), &audio_fifo),
        ] {
            let name = format!("download-{tag}");
            let dl = proc.spawn_auxiliary(&name, self.download_cmd(&format, url).stdout(Stdio::piped()))?;
            let bytes = take_stdout(dl, &name)?;

            let mut buffer = self.mbuffer_cmd(self.tools.download_buffer_bytes);
            buffer.arg("-o").arg(fifo);
            proc.spawn_auxiliary(&format!("{tag}-buffer"), buffer.stdin(bytes).stdout(Stdio::null()))?;
        }

        proc.spawn(
            "mux",
            self.mux_cmd(&video_fifo, &audio_fifo)
                .stdin(Stdio::null())
                .stdout(out),
        )
    }

    pub fn download_cmd(&self, format: &str, url: &str) -> Command {
        let mut cmd = Command::new(&self.tools.yt_dlp);
        cmd.args(["--retries", "infinite", "--format", format, "--output", "-"]);
        if !tracing::enabled!(tracing::Level::DEBUG) {
            cmd.arg("--no-progress");
        }
        cmd.arg("--newline").arg(url).stdin(Stdio::null());
        cmd
    }

    pub fn mux_cmd(&self, video: &Path, audio: &Path) -> Command {
        let mut cmd = self.ffmpeg_cmd();
        cmd.arg("-i").arg(video).arg("-i").arg(audio);
        cmd.args(["-c", "copy", "-map", "0:v:0", "-map", "1:a:0", "-shortest"]);
        cmd.args(["-f", "mpegts", "-"]);
        cmd
    }

    pub fn transcode_cmd(&self) -> Command {
        let FrameGeometry { width, height, color_mode } = self.geometry;
        let mut cmd = self.ffmpeg_cmd();
        cmd.args(["-i", "pipe:0"]);
        cmd.arg("-filter:v").arg(format!("scale={width}x{height}"));
        cmd.args(["-an", "-f", "rawvideo", "-pix_fmt", color_mode.ffmpeg_pix_fmt(), "pipe:1"]);
        cmd
    }

    pub fn tee_cmd(&self, audio: Option<&Path>, save: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.tools.tee);
        // Keep feeding the transcoder if the audio player exits early
        cmd.arg("-p");
        cmd.args(audio).args(save);
        cmd
    }

    pub fn ffplay_cmd(&self) -> Command {
        let mut cmd = Command::new(&self.tools.ffplay);
        cmd.args(["-nodisp", "-vn", "-autoexit", "-v", "quiet", "-i", "pipe:0"]);
        cmd
    }

    pub fn mbuffer_cmd(&self, bytes: u64) -> Command {
        let mut cmd = Command::new(&self.tools.mbuffer);
        cmd.args(["-q", "-Q", "-m"]).arg(format!("{bytes}b"));
        cmd
    }

    fn ffmpeg_cmd(&self) -> Command {
        let mut cmd = Command::new(&self.tools.ffmpeg);
        cmd.args(["-hide_banner", "-nostats"]);
        if !tracing::enabled!(tracing::Level::DEBUG) {
            cmd.args(["-loglevel", "error"]);
        }
        cmd
    }
}

fn take_stdout(child: &mut Child, stage: &str) -> Result<Stdio> {
    child.stdout.take().map(Stdio::from).ok_or_else(|| {
        PipelineError::spawn(
            stage,
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout was not piped"),
        )
    })
}
