use camino::Utf8PathBuf;

use crate::domain::ArchiveIdentifier;
use crate::error::HoardError;
use crate::source::ArchiveSource;
use crate::staging::Staging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAction {
    /// A local copy already existed and was reused unchecked.
    Cached,
    Downloaded,
}

#[derive(Debug, Clone)]
pub struct FetchedArchive {
    pub path: Utf8PathBuf,
    pub bytes: u64,
    pub action: FetchAction,
}

pub struct ArchiveFetcher<'a, S: ArchiveSource> {
    source: &'a S,
    staging: &'a Staging,
    min_bytes: u64,
}

impl<'a, S: ArchiveSource> ArchiveFetcher<'a, S> {
    pub fn new(source: &'a S, staging: &'a Staging, min_bytes: u64) -> Self {
        Self {
            source,
            staging,
            min_bytes,
        }
    }

    /// Returns the local copy of `id`, downloading it when absent.
    ///
    /// Bytes land in a temp file beside the final path and are renamed into
    /// place only after the transfer finished, so an interrupted download
    /// never looks complete. Anything at or below the size floor is discarded and
    /// reported as [`HoardError::UndersizedFetch`].
    pub fn fetch(&self, id: &ArchiveIdentifier) -> Result<FetchedArchive, HoardError> {
        let local = self.staging.archive_path(id);

        if let Some(size) = Staging::file_size(&local) {
            if size <= self.min_bytes {
                Staging::remove_file(&local)?;
                return Err(self.undersized(&local, size));
            }
            tracing::debug!(archive = %id, path = %local, "archive already staged");
            return Ok(FetchedArchive {
                path: local,
                bytes: size,
                action: FetchAction::Cached,
            });
        }

        self.staging.ensure_root()?;
        let temp = Staging::temp_beside(&local)?;
        tracing::info!(archive = %id, "downloading archive");
        let bytes = self.source.retrieve(id.as_str(), temp.path())?;
        if bytes <= self.min_bytes {
            return Err(self.undersized(&local, bytes));
        }
        Staging::persist(temp, &local)?;
        tracing::info!(archive = %id, path = %local, bytes, "archive downloaded");

        Ok(FetchedArchive {
            path: local,
            bytes,
            action: FetchAction::Downloaded,
        })
    }

    fn undersized(&self, path: &Utf8PathBuf, size: u64) -> HoardError {
        HoardError::UndersizedFetch {
            path: path.to_string(),
            size,
            floor: self.min_bytes,
        }
    }
}
