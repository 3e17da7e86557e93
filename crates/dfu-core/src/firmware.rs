//! Firmware image sources.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::FirmwareError;

/// Provides the image written in the flashing stage.
pub trait FirmwareSource: Send + Sync {
    /// Fetch the complete image. Empty images are an error.
    fn load(&self) -> Result<Vec<u8>, FirmwareError>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// Image read from a file on every `load`.
#[derive(Debug, Clone)]
pub struct FileFirmware {
    path: PathBuf,
}

impl FileFirmware {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FirmwareSource for FileFirmware {
    fn load(&self) -> Result<Vec<u8>, FirmwareError> {
        let data = fs::read(&self.path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => FirmwareError::NotFound(self.path.clone()),
            _ => FirmwareError::Io {
                path: self.path.clone(),
                source,
            },
        })?;
        if data.is_empty() {
            return Err(FirmwareError::Empty(self.describe()));
        }
        info!(path = %self.path.display(), size = data.len(), "Loaded firmware");
        Ok(data)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Image held in memory.
#[derive(Debug, Clone)]
pub struct StaticFirmware {
    name: String,
    data: Vec<u8>,
}

impl StaticFirmware {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

impl FirmwareSource for StaticFirmware {
    fn load(&self) -> Result<Vec<u8>, FirmwareError> {
        if self.data.is_empty() {
            return Err(FirmwareError::Empty(self.name.clone()));
        }
        Ok(self.data.clone())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_firmware_errors() {
        let dir = tempdir().unwrap();

        let missing = FileFirmware::new(dir.path().join("zephyr.signed.bin"));
        assert!(matches!(missing.load(), Err(FirmwareError::NotFound(_))));

        let empty_path = dir.path().join("empty.bin");
        fs::write(&empty_path, b"").unwrap();
        assert!(matches!(
            FileFirmware::new(&empty_path).load(),
            Err(FirmwareError::Empty(_))
        ));

        // Reading a directory is an I/O error, not a missing file.
        assert!(matches!(
            FileFirmware::new(dir.path()).load(),
            Err(FirmwareError::Io { .. })
        ));
    }

    #[test]
    fn test_file_firmware_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        fs::write(&path, [1u8, 2, 3]).unwrap();
        assert_eq!(FileFirmware::new(&path).load().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_static_firmware() {
        assert!(StaticFirmware::new("blank", Vec::new()).load().is_err());
        assert_eq!(StaticFirmware::new("img", vec![9]).load().unwrap(), vec![9]);
    }
}
