//! Where a session's video bytes come from

use std::path::{Path, PathBuf};

use tracing::info;

use crate::utils;

/// A video play request's source, resolved against the on-disk cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    /// URL or path exactly as requested
    pub id: String,

    /// Content-addressed location of a saved copy
    pub save_path: PathBuf,

    /// A complete copy is on local storage; acquisition is skipped
    pub is_local: bool,
}

impl VideoSource {
    /// Resolve `id` against `data_dir`.
    ///
    /// Local files are always treated as available. Remote sources become
    /// local once a previous session has saved them under their cache path.
    pub fn resolve(id: &str, data_dir: &Path) -> Self {
        let save_path = if is_remote(id) {
            utils::cache_path(data_dir, id)
        } else {
            PathBuf::from(id)
        };

        let is_local = save_path.is_file();
        if is_local && is_remote(id) {
            info!(
                "Video has already been downloaded. Using saved video: {}",
                save_path.display()
            );
        }

        Self {
            id: id.to_owned(),
            save_path,
            is_local,
        }
    }

    pub fn is_remote(&self) -> bool {
        is_remote(&self.id)
    }

    /// What the fps probe and transcoder should be pointed at.
    pub fn input(&self) -> &str {
        if self.is_local {
            self.save_path.to_str().unwrap_or(&self.id)
        } else {
            &self.id
        }
    }

    /// Mark the saved copy as complete, e.g. after a pre-download.
    pub fn mark_local(&mut self) {
        self.is_local = true;
    }
}

fn is_remote(id: &str) -> bool {
    id.contains("://")
}
