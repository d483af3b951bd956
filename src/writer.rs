//! Writes verified pieces to the output file at their correct byte offsets.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use tokio::{sync::mpsc, task};

use crate::{error::Error, session::WriteJob};

/// Writes every [`WriteJob`] it receives to `file` at its offset, until the
/// channel is closed (the session's senders are all dropped once the
/// download completes).
///
/// Each write is dispatched via `spawn_blocking`, mirroring how disk IO is
/// kept off the async reactor elsewhere in this crate, since positional
/// writes are a blocking syscall.
pub(crate) async fn run(
    file: File,
    path: PathBuf,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
) -> Result<(), Error> {
    let file = std::sync::Arc::new(file);
    while let Some(job) = jobs.recv().await {
        log::debug!("writing {} bytes at offset {}", job.data.len(), job.offset);
        let file = std::sync::Arc::clone(&file);
        let path = path.clone();
        let offset = job.offset;
        task::spawn_blocking(move || file.write_at(&job.data, offset))
            .await
            .expect("writer blocking task panicked")
            .map_err(|source| Error::WriteFailed { path, offset, source })?;
    }
    Ok(())
}

/// Opens the output file at a non-colliding path under `download_dir`,
/// disambiguating with a `-(n)` suffix if `name` is already taken.
pub(crate) fn create_output_file(download_dir: &Path, name: &str) -> Result<(File, PathBuf), Error> {
    let path = find_available_path(download_dir, name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|source| Error::OutputCreateFailed { path: path.clone(), source })?;
    Ok((file, path))
}

fn find_available_path(download_dir: &Path, name: &str) -> PathBuf {
    let mut candidate = download_dir.join(name);
    let mut suffix = 0;
    while candidate.exists() {
        suffix += 1;
        candidate = download_dir.join(format!("{name}-({suffix})"));
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_candidate_is_used_when_free() {
        let dir = tempfile_dir();
        let path = find_available_path(&dir, "movie.mp4");
        assert_eq!(path, dir.join("movie.mp4"));
    }

    #[test]
    fn disambiguates_with_numeric_suffix_on_collision() {
        let dir = tempfile_dir();
        std::fs::write(dir.join("movie.mp4"), b"x").unwrap();
        std::fs::write(dir.join("movie.mp4-(1)"), b"x").unwrap();
        let path = find_available_path(&dir, "movie.mp4");
        assert_eq!(path, dir.join("movie.mp4-(2)"));
    }

    #[tokio::test]
    async fn writes_jobs_at_their_offset_until_channel_closes() {
        let dir = tempfile_dir();
        let (file, path) = create_output_file(&dir, "out.bin").unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WriteJob { offset: 4, data: vec![1, 2, 3] }).unwrap();
        drop(tx);

        run(file, path.clone(), rx).await.unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(&written[4..7], &[1, 2, 3]);
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "leechtorrent-writer-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
