//! ledstream: play videos on a low-resolution LED matrix

use std::fs::File;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::EnvFilter;

use ledstream::capture::{ColorMode, FrameGeometry};
use ledstream::display::{DisplaySink, NullSink, RawSink};
use ledstream::pipeline::{probe_fps, Housekeeper, VideoSession};
use ledstream::{Config, PipelineError};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream video onto an LED matrix in real time")]
struct Args {
    /// TOML configuration file (defaults to ./ledstream.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play a URL or local file
    Play {
        source: String,

        /// Do not play the audio track
        #[arg(long)]
        no_audio: bool,

        /// Keep a copy of remote videos in the data directory
        #[arg(long)]
        save: bool,

        /// Download the whole video before playing it
        #[arg(long)]
        predownload: bool,

        #[arg(long)]
        color_mode: Option<ColorMode>,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        #[arg(long, value_enum, default_value_t = SinkKind::Raw)]
        sink: SinkKind,

        /// Where the raw sink writes frames (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the frame rate a session would use for a source
    ProbeFps { source: String },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SinkKind {
    /// Raw frame bytes for an external matrix driver
    Raw,
    /// Discard frames
    Null,
    /// Desktop preview window (needs the `sdl-preview` feature)
    Sdl,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    // stdout may be carrying frames; logs go to stderr
    let default_filter = if args.verbose { "ledstream=debug" } else { "ledstream=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_timer(uptime())
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref())?;

    match args.command {
        Command::ProbeFps { source } => {
            config.publish();
            let fps = probe_fps(&Config::current(), &source);
            println!("{}", fps.fps);
        }
        Command::Play {
            source,
            no_audio,
            save,
            predownload,
            color_mode,
            width,
            height,
            sink,
            output,
        } => {
            if no_audio {
                config.video.play_audio = false;
            }
            config.video.save_video |= save;
            config.video.predownload |= predownload;
            if let Some(mode) = color_mode {
                config.display.color_mode = mode;
            }
            if let Some(width) = width {
                config.display.width = width;
            }
            if let Some(height) = height {
                config.display.height = height;
            }

            config.validate()?;
            config.publish();
            play(source, sink, output).await?;
        }
    }

    Ok(())
}

async fn play(source: String, sink: SinkKind, output: Option<PathBuf>) -> Result<()> {
    info!("ledstream launching...");
    let config = Config::current();
    let housekeeper = Housekeeper::from_config(&config);

    let keeper = housekeeper.clone();
    let session = tokio::task::spawn_blocking(move || {
        // Display handles are not Send; build the sink on the session thread
        let sink = open_sink(sink, output, config.geometry())?;
        VideoSession::new(config, source, sink, keeper).play()
    });

    tokio::select! {
        joined = session => {
            let stats = joined??;
            info!(
                "Done. Frames displayed: {}, skipped: {}, lagging ticks: {}",
                stats.frames_displayed, stats.frames_skipped, stats.lag_ticks
            );
            Ok(())
        }
        signo = shutdown_signal() => {
            let signo = signo?;
            info!("Caught signal {}, exiting gracefully...", signo);
            if let Err(e) = housekeeper.cleanup() {
                error!("Cleanup failed: {}", e);
            }
            std::process::exit(128 + signo);
        }
    }
}

fn open_sink(kind: SinkKind, output: Option<PathBuf>, geometry: FrameGeometry) -> ledstream::Result<Box<dyn DisplaySink>> {
    match kind {
        SinkKind::Raw => match output {
            Some(path) => Ok(Box::new(RawSink::new(File::create(path)?, geometry))),
            None => Ok(Box::new(RawSink::new(std::io::stdout().lock(), geometry))),
        },
        SinkKind::Null => Ok(Box::new(NullSink::default())),
        SinkKind::Sdl => open_preview(geometry),
    }
}

#[cfg(feature = "sdl-preview")]
fn open_preview(geometry: FrameGeometry) -> ledstream::Result<Box<dyn DisplaySink>> {
    let sdl_context = sdl2::init().map_err(PipelineError::display)?;
    let display = ledstream::display::Sdl2Display::new(&sdl_context, geometry, 10)?;
    Ok(Box::new(display))
}

#[cfg(not(feature = "sdl-preview"))]
fn open_preview(_geometry: FrameGeometry) -> ledstream::Result<Box<dyn DisplaySink>> {
    Err(PipelineError::display("built without the sdl-preview feature"))
}

/// Resolves with the number of the first termination signal received.
async fn shutdown_signal() -> std::io::Result<i32> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut abort = signal(SignalKind::from_raw(libc::SIGABRT))?;

    Ok(tokio::select! {
        _ = interrupt.recv() => libc::SIGINT,
        _ = hangup.recv() => libc::SIGHUP,
        _ = terminate.recv() => libc::SIGTERM,
        _ = quit.recv() => libc::SIGQUIT,
        _ = abort.recv() => libc::SIGABRT,
    })
}
