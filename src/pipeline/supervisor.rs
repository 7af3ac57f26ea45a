//! Retry policy around play attempts

use std::process::{Command, Stdio};

use tracing::{error, info, instrument, warn};

use crate::error::{AttemptOutcome, PipelineError, Result};

/// One playback attempt and its teardown.
pub trait AttemptRunner {
    /// Run attempt number `attempt` (1-based) to completion.
    fn run_attempt(&mut self, attempt: u32) -> AttemptOutcome;

    /// Called after every attempt, whatever its outcome. `will_retry` is set
    /// when another attempt follows immediately.
    fn cleanup(&mut self, will_retry: bool) -> Result<()>;
}

/// Something that may fix a retryable failure, e.g. updating the
/// acquisition tool.
pub trait Remediation {
    fn remediate(&mut self) -> Result<()>;
}

/// Runs an external command as the remediation step.
#[derive(Debug, Clone)]
pub struct CommandRemediation {
    argv: Vec<String>,
}

impl CommandRemediation {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl Remediation for CommandRemediation {
    fn remediate(&mut self) -> Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            info!("No remediation command configured");
            return Ok(());
        };

        info!("Running remediation: {}", self.argv.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| PipelineError::Remediation(format!("{program}: {e}")))?;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        info!("Remediation output: {}", combined.trim());

        if output.status.success() {
            Ok(())
        } else {
            Err(PipelineError::Remediation(format!(
                "{program} exited with {}",
                output.status
            )))
        }
    }
}

/// Attempt → (remediate → retry)* → fail.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Drive `runner` until it succeeds, fails fatally or runs out of
    /// attempts. Cleanup runs after every attempt; a cleanup failure is
    /// itself terminal.
    #[instrument(skip_all, fields(max_attempts = self.max_attempts))]
    pub fn run<R, M>(&self, runner: &mut R, remediation: &mut M) -> Result<()>
    where
        R: AttemptRunner + ?Sized,
        M: Remediation + ?Sized,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = runner.run_attempt(attempt);
            let will_retry = outcome.is_retryable() && attempt < max_attempts;
            let cleaned = runner.cleanup(will_retry);

            match outcome {
                AttemptOutcome::Clean => {
                    cleaned?;
                    info!("Finished playback after {} attempt(s)", attempt);
                    return Ok(());
                }
                AttemptOutcome::Fatal(err) => {
                    if let Err(cleanup_err) = cleaned {
                        error!("Cleanup after a failed attempt also failed: {}", cleanup_err);
                    }
                    return Err(err);
                }
                AttemptOutcome::Retryable(reason) => {
                    cleaned?;
                    if !will_retry {
                        error!("Attempt {} failed and no attempts remain: {}", attempt, reason);
                        return Err(PipelineError::AcquisitionFailed {
                            attempts: attempt,
                            reason,
                        });
                    }
                    warn!("Attempt {} failed: {}. Remediating and retrying...", attempt, reason);
                    if let Err(e) = remediation.remediate() {
                        warn!("Remediation failed, retrying anyway: {}", e);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
