// Files collaborator for file downloads.
// The transport deletes its own temporary file as soon as the finish callback
// returns, so downloads are moved out synchronously first.

use crate::error::FilesAccessError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

pub trait FilesAccess: Send + Sync + fmt::Debug {
    /// Move a file the transport is about to delete into a location we own.
    fn move_file_to_temporary_location(&self, from: &Path) -> Result<PathBuf, FilesAccessError>;

    /// Move a completed download to its final destination.
    fn move_file(&self, from: &Path, to: &Path, overwrite: bool) -> Result<PathBuf, FilesAccessError>;

    /// Read the error body a failed download wrote to disk, then remove the file.
    fn error_data(&self, from: &Path) -> Result<Vec<u8>, FilesAccessError>;
}

#[derive(Debug, Clone)]
pub struct FilesAccessImpl {
    temp_folder: PathBuf,
}

impl FilesAccessImpl {
    pub fn new() -> Result<Self, FilesAccessError> {
        Self::with_temp_folder(std::env::temp_dir())
    }

    pub fn with_temp_folder(temp_folder: impl Into<PathBuf>) -> Result<Self, FilesAccessError> {
        let temp_folder = temp_folder.into();
        fs::create_dir_all(&temp_folder)
            .map_err(|e| FilesAccessError::MovingToTempLocation(e.to_string()))?;
        Ok(Self { temp_folder })
    }

    pub fn temp_folder(&self) -> &Path {
        &self.temp_folder
    }
}

impl FilesAccess for FilesAccessImpl {
    fn move_file_to_temporary_location(&self, from: &Path) -> Result<PathBuf, FilesAccessError> {
        let temp_output = self.temp_folder.join(Uuid::new_v4().to_string());
        move_item(from, &temp_output).map_err(|e| FilesAccessError::MovingToTempLocation(e.to_string()))?;
        debug!(from = %from.display(), to = %temp_output.display(), "Moved download to temporary location");
        Ok(temp_output)
    }

    fn move_file(&self, from: &Path, to: &Path, overwrite: bool) -> Result<PathBuf, FilesAccessError> {
        if to.exists() {
            if !overwrite {
                return Err(FilesAccessError::DestinationCollision(to.to_path_buf()));
            }
            fs::remove_file(to).map_err(|e| FilesAccessError::MovingFromTempLocation(e.to_string()))?;
        }

        move_item(from, to).map_err(|e| FilesAccessError::MovingFromTempLocation(e.to_string()))?;
        Ok(to.to_path_buf())
    }

    fn error_data(&self, from: &Path) -> Result<Vec<u8>, FilesAccessError> {
        let data = fs::read(from).map_err(|e| FilesAccessError::ReadingErrorData(e.to_string()))?;
        fs::remove_file(from).map_err(|e| FilesAccessError::ReadingErrorData(e.to_string()))?;
        Ok(data)
    }
}

/// Rename, falling back to copy + remove across filesystems.
fn move_item(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, FilesAccessImpl) {
        let dir = tempfile::tempdir().unwrap();
        let files = FilesAccessImpl::with_temp_folder(dir.path().join("tmp")).unwrap();
        (dir, files)
    }

    #[test]
    fn test_move_to_temporary_location() {
        let (dir, files) = setup();
        let source = dir.path().join("download");
        fs::write(&source, b"payload").unwrap();

        let moved = files.move_file_to_temporary_location(&source).unwrap();
        assert!(!source.exists());
        assert!(moved.starts_with(files.temp_folder()));
        assert_eq!(fs::read(moved).unwrap(), b"payload");
    }

    #[test]
    fn test_move_file_collision() {
        let (dir, files) = setup();
        let source = dir.path().join("a");
        let destination = dir.path().join("b");
        fs::write(&source, b"new").unwrap();
        fs::write(&destination, b"old").unwrap();

        let err = files.move_file(&source, &destination, false).unwrap_err();
        assert_eq!(err, FilesAccessError::DestinationCollision(destination.clone()));
        assert!(source.exists());

        files.move_file(&source, &destination, true).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"new");
    }

    #[test]
    fn test_error_data_reads_and_removes() {
        let (dir, files) = setup();
        let source = dir.path().join("error");
        fs::write(&source, br#"{"error": "path"}"#).unwrap();

        assert_eq!(files.error_data(&source).unwrap(), br#"{"error": "path"}"#);
        assert!(!source.exists());
    }

    #[test]
    fn test_missing_source() {
        let (dir, files) = setup();
        let err = files
            .move_file_to_temporary_location(&dir.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, FilesAccessError::MovingToTempLocation(_)));
    }
}
