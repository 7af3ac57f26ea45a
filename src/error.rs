//! Error types for the frame pipeline.

use std::process::ExitStatus;

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Errors raised by [`FrameBuffer`](crate::pipeline::FrameBuffer).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("frame buffer is full")]
    Full,

    /// The index was consumed earlier (or lies behind one that was).
    #[error("frame {index} already read (highest read index: {max_read})")]
    AlreadyRead { index: usize, max_read: usize },

    #[error("frame {index} not yet appended (appended so far: {len})")]
    NotYetAppended { index: usize, len: usize },
}

/// Errors surfaced by a playback session.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("Failed to spawn pipeline stage `{stage}`: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    /// The transcoder closed the fifo in the middle of a frame.
    #[error("Expected {expected} bytes per frame from the transcoder, but got {got}")]
    ShortFrame { expected: usize, got: usize },

    #[error("Frame buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Video acquisition failed after {attempts} attempt(s): {reason}")]
    AcquisitionFailed { attempts: u32, reason: String },

    #[error("Remediation command failed: {0}")]
    Remediation(String),

    #[error("Display sink error: {0}")]
    Display(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl PipelineError {
    pub fn spawn(stage: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            stage: stage.into(),
            source,
        }
    }

    pub fn display(msg: impl std::fmt::Display) -> Self {
        Self::Display(msg.to_string())
    }
}

/// How a single playback attempt ended.
///
/// The supervisor's retry policy only looks at this value, never at raw
/// exit codes.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Video played to the end and every stage exited zero.
    Clean,
    /// Acquisition failed in a way that a tool update and a second try may fix.
    Retryable(String),
    /// Anything else; the session is over.
    Fatal(PipelineError),
}

impl AttemptOutcome {
    /// Classify the exit statuses of every pipeline stage.
    ///
    /// Any stage that exited non-zero (or was killed by a signal) makes the
    /// attempt retryable, mirroring `pipefail`.
    pub fn from_exit_statuses<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, ExitStatus)>,
    {
        let failed: Vec<String> = statuses
            .into_iter()
            .filter(|(_, status)| !status.success())
            .map(|(stage, status)| format!("{stage} exited with {status}"))
            .collect();

        if failed.is_empty() {
            Self::Clean
        } else {
            Self::Retryable(format!(
                "pipeline exited non-zero ({}); the acquisition tool may need updating",
                failed.join(", ")
            ))
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<PipelineError> for AttemptOutcome {
    fn from(err: PipelineError) -> Self {
        Self::Fatal(err)
    }
}
