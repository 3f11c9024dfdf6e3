//! Terminal file moves.
//!
//! Published files move to the archive root, abandoned files to the failed
//! root, each under a per-category subdirectory. Name collisions get a
//! numeric suffix rather than overwriting. Rename first; fall back to
//! copy-and-remove when the destination is on another filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::FileMover;

pub struct LocalFileMover {
    archive_root: PathBuf,
    failed_root: PathBuf,
}

impl LocalFileMover {
    pub fn new(archive_root: PathBuf, failed_root: PathBuf) -> Self {
        Self {
            archive_root,
            failed_root,
        }
    }

    async fn move_into(&self, root: &Path, file: &Path, category: &str) -> std::io::Result<PathBuf> {
        let dir = root.join(category);
        tokio::fs::create_dir_all(&dir).await?;
        let dest = unique_destination(&dir, file).await;

        match tokio::fs::rename(file, &dest).await {
            Ok(()) => {}
            Err(_) => {
                // Cross-device move: copy then remove the source.
                tokio::fs::copy(file, &dest).await?;
                tokio::fs::remove_file(file).await?;
            }
        }
        debug!(from = %file.display(), to = %dest.display(), "file moved");
        Ok(dest)
    }
}

/// First free name in `dir` for `file`: the original name, then
/// `stem_1.ext`, `stem_2.ext`, ...
async fn unique_destination(dir: &Path, file: &Path) -> PathBuf {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mut dest = dir.join(&name);
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let ext = file
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1;
    while tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        dest = dir.join(format!("{stem}_{counter}{ext}"));
        counter += 1;
    }
    dest
}

#[async_trait]
impl FileMover for LocalFileMover {
    async fn archive(&self, file: &Path, category: &str) -> std::io::Result<PathBuf> {
        self.move_into(&self.archive_root, file, category).await
    }

    async fn quarantine(&self, file: &Path, category: &str) -> std::io::Result<PathBuf> {
        self.move_into(&self.failed_root, file, category).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mover(base: &Path) -> LocalFileMover {
        LocalFileMover::new(base.join("archive"), base.join("failed"))
    }

    #[tokio::test]
    async fn archive_moves_under_category() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.jpg");
        tokio::fs::write(&src, b"img").await.unwrap();

        let dest = mover(dir.path()).archive(&src, "cats").await.unwrap();
        assert_eq!(dest, dir.path().join("archive/cats/a.jpg"));
        assert!(!src.exists());
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn collisions_get_numeric_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let mover = mover(dir.path());

        for round in 0..3 {
            let src = dir.path().join("a.jpg");
            tokio::fs::write(&src, format!("img {round}")).await.unwrap();
            mover.quarantine(&src, "cats").await.unwrap();
        }

        let failed = dir.path().join("failed/cats");
        assert!(failed.join("a.jpg").exists());
        assert!(failed.join("a_1.jpg").exists());
        assert!(failed.join("a_2.jpg").exists());
    }
}
