use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, info};

/// Extension given to saved videos in the data directory
pub const VIDEO_EXTENSION: &str = "mp4";

/// Suffix of a save-to-disk copy that has not finished downloading
pub const PARTIAL_DOWNLOAD_SUFFIX: &str = ".dl_part";

static FIFO_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Content-addressed location of a saved copy of `source`.
pub fn cache_path(data_dir: &Path, source: &str) -> PathBuf {
    let digest = Md5::digest(source.as_bytes());
    data_dir.join(format!("{digest:x}.{VIDEO_EXTENSION}"))
}

/// Where the save branch writes before the download is known to be complete.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_DOWNLOAD_SUFFIX);
    PathBuf::from(name)
}

/// Create a uniquely named fifo `<dir>/<prefix>__<tag>__<suffix>` readable
/// and writable by the owner only.
pub fn make_fifo(dir: &Path, prefix: &str, tag: &str) -> Result<PathBuf, nix::Error> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let seq = FIFO_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!(
        "{prefix}__{tag}__{:x}{nanos:08x}{seq:x}",
        std::process::id()
    ));

    mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR)?;
    debug!("Created fifo {}", path.display());
    Ok(path)
}

/// Remove every entry in `dir` whose file name starts with `prefix`.
///
/// Returns how many entries were removed. Entries that vanish while we scan
/// are not an error.
pub fn remove_with_prefix(dir: &Path, prefix: &str) -> io::Result<usize> {
    remove_matching(dir, |name| name.starts_with(prefix))
}

/// Remove every unfinished save-to-disk file in `data_dir`.
pub fn remove_partial_downloads(data_dir: &Path) -> io::Result<usize> {
    if !data_dir.exists() {
        return Ok(0);
    }
    remove_matching(data_dir, |name| name.ends_with(PARTIAL_DOWNLOAD_SUFFIX))
}

fn remove_matching(dir: &Path, matches: impl Fn(&str) -> bool) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !matches(name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    if removed > 0 {
        info!("Removed {} file(s) from {}", removed, dir.display());
    }
    Ok(removed)
}

/// Remove a single file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn cache_path_is_stable_and_content_addressed() {
        let dir = Path::new("/var/lib/ledstream");
        let a = cache_path(dir, "https://www.youtube.com/watch?v=abc");
        let b = cache_path(dir, "https://www.youtube.com/watch?v=abc");
        let c = cache_path(dir, "https://www.youtube.com/watch?v=xyz");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            cache_path(dir, ""),
            dir.join("d41d8cd98f00b204e9800998ecf8427e.mp4")
        );
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/data/abc.mp4")),
            PathBuf::from("/data/abc.mp4.dl_part")
        );
    }

    #[test]
    fn fifos_are_unique_and_swept_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let a = make_fifo(dir.path(), "ledstream_fifo", "frames").unwrap();
        let b = make_fifo(dir.path(), "ledstream_fifo", "frames").unwrap();
        assert_ne!(a, b);
        assert!(fs::metadata(&a).unwrap().file_type().is_fifo());

        fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        assert_eq!(remove_with_prefix(dir.path(), "ledstream_fifo").unwrap(), 2);
        assert!(!a.exists());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn partial_downloads_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp4.dl_part"), b"x").unwrap();
        fs::write(dir.path().join("b.mp4"), b"x").unwrap();
        assert_eq!(remove_partial_downloads(dir.path()).unwrap(), 1);
        assert!(dir.path().join("b.mp4").exists());
        assert_eq!(remove_partial_downloads(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn removing_a_missing_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        remove_if_exists(&dir.path().join("nope")).unwrap();
    }
}
