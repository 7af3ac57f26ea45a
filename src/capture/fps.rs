//! Frame rate probing with a metadata and default fallback chain

use std::process::{Command, Stdio};

use tracing::{debug, error, info, instrument, warn};

use crate::capture::source::VideoSource;
use crate::ToolsConfig;

/// Where a session's frame rate came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FpsOrigin {
    Probe,
    Metadata,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedFps {
    pub fps: f64,
    pub origin: FpsOrigin,
}

impl ResolvedFps {
    /// Seconds each frame stays on screen
    pub fn frame_length(&self) -> f64 {
        1.0 / self.fps
    }
}

/// Parse the first line of a stream probe, e.g. `30000/1001`.
pub fn parse_frame_rate(output: &str) -> Option<f64> {
    let line = output.lines().next()?.trim();
    let (num, den) = line.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    let fps = num / den;
    is_usable(fps).then_some(fps)
}

/// Parse a bare metadata value such as `29.97`. Downloaders print `NA`
/// when the field is unknown.
pub fn parse_metadata_fps(output: &str) -> Option<f64> {
    let fps: f64 = output.lines().next()?.trim().parse().ok()?;
    is_usable(fps).then_some(fps)
}

fn is_usable(fps: f64) -> bool {
    fps.is_finite() && fps > 0.0
}

/// Pick the first usable rate: probe, then metadata, then the default.
pub fn resolve_fps(probed: Option<f64>, metadata: Option<f64>, default_fps: f64) -> ResolvedFps {
    match (probed, metadata) {
        (Some(fps), _) => ResolvedFps {
            fps,
            origin: FpsOrigin::Probe,
        },
        (None, Some(fps)) => ResolvedFps {
            fps,
            origin: FpsOrigin::Metadata,
        },
        (None, None) => ResolvedFps {
            fps: default_fps,
            origin: FpsOrigin::Default,
        },
    }
}

/// Runs the external inspection calls for a source.
pub struct FpsProbe<'a> {
    tools: &'a ToolsConfig,
    default_fps: f64,
}

impl<'a> FpsProbe<'a> {
    pub fn new(tools: &'a ToolsConfig, default_fps: f64) -> Self {
        Self { tools, default_fps }
    }

    /// Determine the source's frame rate. Never fails: unparseable output
    /// walks the fallback chain down to the configured default.
    #[instrument(skip(self, source), fields(source = %source.id))]
    pub fn probe(&self, source: &VideoSource, format: &str) -> ResolvedFps {
        let probed = self.run_stream_probe(source.input());
        let metadata = if probed.is_none() && source.is_remote() && !source.is_local {
            self.run_metadata_probe(&source.id, format)
        } else {
            None
        };

        let resolved = resolve_fps(probed, metadata, self.default_fps);
        match resolved.origin {
            FpsOrigin::Default => {
                error!("Unable to determine the fps, assuming {} fps for this video", resolved.fps)
            }
            FpsOrigin::Metadata => warn!("Using fps reported by video metadata: {}", resolved.fps),
            FpsOrigin::Probe => {}
        }
        info!("Calculated video fps: {}", resolved.fps);
        resolved
    }

    fn run_stream_probe(&self, input: &str) -> Option<f64> {
        let output = run_capture(
            Command::new(&self.tools.ffprobe)
                .args(["-v", "0", "-of", "csv=p=0", "-select_streams", "v:0"])
                .args(["-show_entries", "stream=r_frame_rate"])
                .arg(input),
        )?;
        let fps = parse_frame_rate(&output);
        if fps.is_none() {
            warn!("Unparseable frame rate from {}: {:?}", self.tools.ffprobe, output);
        }
        fps
    }

    fn run_metadata_probe(&self, url: &str, format: &str) -> Option<f64> {
        let output = run_capture(
            Command::new(&self.tools.yt_dlp)
                .args(["--skip-download", "--no-warnings", "--print", "fps"])
                .args(["--format", format])
                .arg(url),
        )?;
        parse_metadata_fps(&output)
    }
}

fn run_capture(cmd: &mut Command) -> Option<String> {
    debug!("Running {:?}", cmd);
    match cmd.stdin(Stdio::null()).stderr(Stdio::null()).output() {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            warn!("{:?} exited with {}", cmd.get_program(), out.status);
            None
        }
        Err(e) => {
            warn!("Failed to run {:?}: {}", cmd.get_program(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rational_frame_rates() {
        assert_eq!(parse_frame_rate("30/1\n"), Some(30.0));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
    }

    #[test]
    fn only_first_line_counts() {
        assert_eq!(parse_frame_rate("25/1\n0/0\n"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0\n25/1\n"), None);
    }

    #[test]
    fn rejects_malformed_probe_output() {
        for bad in ["", "30", "abc/1", "30/0", "0/0", "N/A", "-30/1"] {
            assert_eq!(parse_frame_rate(bad), None, "input {bad:?}");
        }
    }

    #[test]
    fn parses_metadata_values() {
        assert_eq!(parse_metadata_fps("24\n"), Some(24.0));
        assert_eq!(parse_metadata_fps("29.97"), Some(29.97));
        assert_eq!(parse_metadata_fps("NA"), None);
        assert_eq!(parse_metadata_fps(""), None);
    }

    #[test]
    fn fallback_chain_prefers_probe_then_metadata() {
        assert_eq!(resolve_fps(Some(25.0), Some(24.0), 30.0).origin, FpsOrigin::Probe);
        let meta = resolve_fps(None, Some(24.0), 30.0);
        assert_eq!((meta.fps, meta.origin), (24.0, FpsOrigin::Metadata));
        let default = resolve_fps(None, None, 30.0);
        assert_eq!((default.fps, default.origin), (30.0, FpsOrigin::Default));
        assert!((default.frame_length() - 1.0 / 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_probe_tool_falls_back_to_default() {
        let tools = ToolsConfig {
            ffprobe: "/nonexistent/ffprobe".into(),
            yt_dlp: "/nonexistent/yt-dlp".into(),
            ..ToolsConfig::default()
        };
        let source = VideoSource {
            id: "https://example.com/v".into(),
            save_path: "/tmp/none.mp4".into(),
            is_local: false,
        };
        let resolved = FpsProbe::new(&tools, 30.0).probe(&source, "worst");
        assert_eq!(resolved.origin, FpsOrigin::Default);
        assert_eq!(resolved.fps, 30.0);
    }
}
