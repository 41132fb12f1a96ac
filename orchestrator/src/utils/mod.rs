//! Filesystem helpers shared by startup, the scheduler and the result server

use std::path::{Path, PathBuf};
use tokio::fs as async_fs;

use shared::{DetectorError, Result};

/// Create `root/folder` if it does not exist yet.
pub async fn create_folder(root: &Path, folder: &str) -> Result<PathBuf> {
    let path = root.join(folder);
    if !async_fs::try_exists(&path).await.unwrap_or(false) {
        async_fs::create_dir_all(&path).await.map_err(|e| {
            DetectorError::Operational(format!("Unable to create folder {}: {}", path.display(), e))
        })?;
    }
    Ok(path)
}

pub async fn create_folders(root: &Path, folders: &[&str]) -> Result<()> {
    for folder in folders {
        create_folder(root, folder).await?;
    }
    Ok(())
}

/// Free space in MB on the volume holding `path`.
pub fn free_space_mb(path: &Path) -> Result<u64> {
    fs2::available_space(path)
        .map(|bytes| bytes / (1024 * 1024))
        .map_err(|e| {
            DetectorError::Operational(format!(
                "Unable to determine free space of {}: {}",
                path.display(),
                e
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_folders_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        create_folders(dir.path(), &["logs", "shots"]).await.unwrap();
        create_folders(dir.path(), &["logs", "shots"]).await.unwrap();
        assert!(dir.path().join("logs").is_dir());
        assert!(dir.path().join("shots").is_dir());
    }

    #[tokio::test]
    async fn test_create_folder_under_a_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let err = create_folder(&blocker, "logs").await.unwrap_err();
        assert!(matches!(err, DetectorError::Operational(_)));
    }

    #[test]
    fn test_free_space_of_missing_path() {
        assert!(free_space_mb(Path::new("/nonexistent/detector/storage")).is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(free_space_mb(dir.path()).is_ok());
    }
}
