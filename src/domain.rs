use std::fmt;

use serde::Serialize;

use crate::error::HoardError;

/// Remote location of one archive on the archive source, relative to its base URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ArchiveIdentifier(String);

impl ArchiveIdentifier {
    pub fn new(remote_path: impl Into<String>) -> Self {
        Self(remote_path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// File name up to its first dot, e.g. `escherichia_coli__03`.
    pub fn stem(&self) -> &str {
        let name = self.file_name();
        name.split('.').next().unwrap_or(name)
    }
}

impl fmt::Display for ArchiveIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Yields `{release_dir}/{species}__NN{suffix}` for NN in `00..count`.
#[derive(Debug, Clone)]
pub struct ArchiveEnumerator {
    pub release_dir: String,
    pub species: String,
    pub count: usize,
    pub suffix: String,
}

impl ArchiveEnumerator {
    pub fn identifiers(&self) -> impl Iterator<Item = ArchiveIdentifier> + '_ {
        let dir = self.release_dir.trim_end_matches('/');
        (0..self.count).map(move |index| {
            let name = format!("{}__{index:02}{}", self.species, self.suffix);
            if dir.is_empty() {
                ArchiveIdentifier::new(name)
            } else {
                ArchiveIdentifier::new(format!("{dir}/{name}"))
            }
        })
    }
}

/// Sharded object key relative to the hoard prefix: `AAAAAAA/AAAAAAAAAA/<file name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StorageKey {
    dir: String,
    file_name: String,
}

impl StorageKey {
    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dir, self.file_name)
    }
}

/// Maps a flat file name onto its nested storage key.
///
/// The two trailing extensions are dropped to get the base name; the first
/// 7 and first 10 characters of the base name become the two directory
/// levels. Existing objects were stored with exactly this layout, so it must
/// not change.
pub fn shard(file_name: &str) -> Result<StorageKey, HoardError> {
    if file_name.is_empty() || file_name.contains('/') {
        return Err(HoardError::InvalidFilename(file_name.to_string()));
    }
    let base = strip_extension(strip_extension(file_name));
    let level1: String = base.chars().take(7).collect();
    let level2: String = base.chars().take(10).collect();
    Ok(StorageKey {
        dir: format!("{level1}/{level2}"),
        file_name: file_name.to_string(),
    })
}

// A dot that only follows leading dots does not start an extension.
fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if name[..idx].chars().any(|ch| ch != '.') => &name[..idx],
        _ => name,
    }
}

/// Sample identifier carried by a member file name: the base name up to its first dot.
pub fn sample_id(member_name: &str) -> String {
    let base = member_name.rsplit('/').next().unwrap_or(member_name);
    base.split('.').next().unwrap_or(base).to_string()
}

/// Where sharded keys live in the bucket and how they resolve to public URLs.
#[derive(Debug, Clone)]
pub struct HoardLayout {
    prefix: String,
    public_base: String,
}

impl HoardLayout {
    pub fn new(prefix: &str, public_base: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Listing prefix for the remote index, with a trailing slash.
    pub fn list_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    pub fn object_key(&self, key: &StorageKey) -> String {
        format!("{}/{key}", self.prefix)
    }

    pub fn object_dir(&self, key: &StorageKey) -> String {
        format!("{}/{}", self.prefix, key.dir())
    }

    pub fn url(&self, key: &StorageKey) -> String {
        format!("{}/{}", self.public_base, self.object_key(key))
    }
}
