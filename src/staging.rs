use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, NamedTempFile};

use crate::domain::ArchiveIdentifier;
use crate::error::HoardError;

/// Local working area. A file's existence is the only signal that a stage
/// already ran for it.
#[derive(Debug, Clone)]
pub struct Staging {
    root: Utf8PathBuf,
}

impl Staging {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), HoardError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| HoardError::Filesystem(format!("create {}: {err}", self.root)))
    }

    pub fn archive_path(&self, id: &ArchiveIdentifier) -> Utf8PathBuf {
        self.root.join(id.file_name())
    }

    /// Directory members are unpacked under; archives carry their own top-level folder.
    pub fn extract_root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn mirror_path(&self, file_name: &str) -> Utf8PathBuf {
        self.root.join("mirror").join(file_name)
    }

    /// Temp file next to `dest`, so persisting it is a same-filesystem rename.
    pub fn temp_beside(dest: &Utf8Path) -> Result<NamedTempFile, HoardError> {
        let parent = dest
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| HoardError::Filesystem(format!("create {parent}: {err}")))?;
        Builder::new()
            .prefix(".hoard-partial")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| HoardError::Filesystem(err.to_string()))
    }

    pub fn persist(temp: NamedTempFile, dest: &Utf8Path) -> Result<(), HoardError> {
        temp.persist(dest.as_std_path())
            .map_err(|err| HoardError::Filesystem(format!("persist {dest}: {}", err.error)))?;
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HoardError> {
        let mut temp = Self::temp_beside(path)?;
        temp.write_all(content)
            .map_err(|err| HoardError::Filesystem(err.to_string()))?;
        Self::persist(temp, path)
    }

    pub fn file_size(path: &Utf8Path) -> Option<u64> {
        fs::metadata(path.as_std_path()).ok().map(|meta| meta.len())
    }

    pub fn remove_file(path: &Utf8Path) -> Result<(), HoardError> {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(HoardError::Filesystem(format!("remove {path}: {err}"))),
        }
    }
}
