/// Startup checks run before the result server and the scheduler
///
/// Every failure here is a [`DetectorError::Startup`] and aborts the process.

use std::path::Path;

use shared::{DetectorError, Result};

use crate::utils;

/// Directories created under the root on every start.
pub const STRUCTURE: &[&str] = &[
    "log",
    "storage",
    "storage/analyses",
    "storage/binaries",
    "storage/baseline",
    "db",
];

pub fn check_working_directory(root: &Path) -> Result<()> {
    if !root.is_dir() {
        return Err(DetectorError::Startup(format!(
            "You specified a non-existing root directory: {}",
            root.display()
        )));
    }
    Ok(())
}

pub fn check_configs(root: &Path, machinery: &str) -> Result<()> {
    let path = root.join("conf").join(format!("{}.conf", machinery));
    if !path.is_file() {
        return Err(DetectorError::Startup(format!(
            "Config file does not exist at path: {}",
            path.display()
        )));
    }
    Ok(())
}

pub async fn create_structure(root: &Path) -> Result<()> {
    utils::create_folders(root, STRUCTURE)
        .await
        .map_err(|e| DetectorError::Startup(format!("Can't create folders: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_root() {
        let err = check_working_directory(Path::new("/nonexistent/detector")).unwrap_err();
        assert!(matches!(err, DetectorError::Startup(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_check_configs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_configs(dir.path(), "virtualbox").is_err());

        std::fs::create_dir(dir.path().join("conf")).unwrap();
        std::fs::write(dir.path().join("conf/virtualbox.conf"), "[virtualbox]\n").unwrap();
        assert!(check_configs(dir.path(), "virtualbox").is_ok());
    }

    #[tokio::test]
    async fn test_create_structure() {
        let dir = tempfile::tempdir().unwrap();
        create_structure(dir.path()).await.unwrap();
        for folder in STRUCTURE {
            assert!(dir.path().join(folder).is_dir(), "{} missing", folder);
        }
    }
}
