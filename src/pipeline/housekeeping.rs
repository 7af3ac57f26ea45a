//! Per-session cleanup shared with the signal handler

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::unistd::Pid;
use tracing::{info, warn};

use crate::capture::process::kill_group;
use crate::error::Result;
use crate::utils;

#[derive(Debug, Default)]
struct Resources {
    pgid: Option<Pid>,
    fifos: Vec<PathBuf>,
}

/// Tracks everything a session must tear down: the pipeline's process
/// group, the fifos it created and unfinished downloads.
///
/// Cheap to clone; clones share state so the signal path sees what the
/// session registered.
#[derive(Debug, Clone)]
pub struct Housekeeper {
    resources: Arc<Mutex<Resources>>,
    fifo_dir: PathBuf,
    fifo_prefix: String,
    data_dir: PathBuf,
}

impl Housekeeper {
    pub fn new(fifo_dir: impl Into<PathBuf>, fifo_prefix: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            resources: Arc::default(),
            fifo_dir: fifo_dir.into(),
            fifo_prefix: fifo_prefix.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn from_config(config: &crate::Config) -> Self {
        Self::new(
            &config.pipeline.fifo_dir,
            &config.pipeline.fifo_prefix,
            &config.video.data_dir,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Remove fifos left behind by a session that never got to clean up.
    pub fn sweep_stale_fifos(&self) -> Result<usize> {
        Ok(utils::remove_with_prefix(&self.fifo_dir, &self.fifo_prefix)?)
    }

    /// Create a session fifo and remember it for cleanup.
    pub fn make_fifo(&self, tag: &str) -> Result<PathBuf> {
        let path = utils::make_fifo(&self.fifo_dir, &self.fifo_prefix, tag)?;
        self.lock().fifos.push(path.clone());
        Ok(path)
    }

    pub fn track_process_group(&self, pgid: Option<Pid>) {
        self.lock().pgid = pgid;
    }

    pub fn tracked_fifos(&self) -> Vec<PathBuf> {
        self.lock().fifos.clone()
    }

    /// Kill the process group, delete fifos and partial downloads.
    ///
    /// Runs every step even if an earlier one fails; the first error is
    /// returned.
    pub fn cleanup(&self) -> Result<()> {
        let (pgid, fifos) = {
            let mut res = self.lock();
            (res.pgid.take(), std::mem::take(&mut res.fifos))
        };

        if let Some(pgid) = pgid {
            kill_group(pgid);
        }

        info!("Deleting fifos and incomplete video downloads...");
        let mut first_err = None;
        for fifo in &fifos {
            if let Err(e) = utils::remove_if_exists(fifo) {
                warn!("Failed to remove fifo {}: {}", fifo.display(), e);
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = utils::remove_with_prefix(&self.fifo_dir, &self.fifo_prefix) {
            warn!("Failed to sweep fifos in {}: {}", self.fifo_dir.display(), e);
            first_err.get_or_insert(e);
        }
        if let Err(e) = utils::remove_partial_downloads(&self.data_dir) {
            warn!("Failed to remove partial downloads: {}", e);
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn cleanup_removes_fifos_and_partials() {
        let fifo_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        let keeper = Housekeeper::new(fifo_dir.path(), "hk_fifo", data_dir.path());

        let a = keeper.make_fifo("frames").unwrap();
        let b = keeper.clone().make_fifo("audio").unwrap();
        assert_eq!(keeper.tracked_fifos(), [a.clone(), b.clone()]);

        let partial = data_dir.path().join("x.mp4.dl_part");
        std::fs::write(&partial, b"x").unwrap();

        keeper.cleanup().unwrap();
        assert!(!a.exists() && !b.exists() && !partial.exists());
        assert!(keeper.tracked_fifos().is_empty());
        // idempotent
        keeper.cleanup().unwrap();
    }

    #[test]
    fn stale_sweep_only_touches_our_prefix() {
        let fifo_dir = tempfile::tempdir().unwrap();
        let stale = utils::make_fifo(fifo_dir.path(), "hk_fifo", "frames").unwrap();
        let foreign = utils::make_fifo(fifo_dir.path(), "other", "frames").unwrap();

        let keeper = Housekeeper::new(fifo_dir.path(), "hk_fifo", "/nonexistent");
        assert_eq!(keeper.sweep_stale_fifos().unwrap(), 1);
        assert!(!stale.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn cleanup_kills_tracked_process_group() {
        let fifo_dir = tempfile::tempdir().unwrap();
        let keeper = Housekeeper::new(fifo_dir.path(), "hk_fifo", "/nonexistent");

        let mut child = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
        keeper.track_process_group(Some(Pid::from_raw(child.id() as i32)));
        keeper.cleanup().unwrap();

        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
