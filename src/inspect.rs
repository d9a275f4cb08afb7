use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Component;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use tar::Archive;
use xz2::read::XzDecoder;

use crate::domain::{HoardLayout, StorageKey, sample_id, shard};
use crate::error::HoardError;
use crate::remote_index::RemoteIndex;
use crate::staging::Staging;

/// One per-sample file listed in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveMember {
    /// Path as stored in the archive, e.g. `escherichia_coli__00/SAMD00000344.fa`.
    pub name: String,
    pub sample_id: String,
}

impl ArchiveMember {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let sample_id = sample_id(&name);
        Self { name, sample_id }
    }

    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn compressed_name(&self) -> String {
        format!("{}.gz", self.file_name())
    }

    pub fn storage_key(&self) -> Result<StorageKey, HoardError> {
        shard(&self.compressed_name())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PresentMember {
    pub member: ArchiveMember,
    pub object_key: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Inspection {
    pub missing: Vec<ArchiveMember>,
    pub present: Vec<PresentMember>,
}

impl Inspection {
    /// Every member is already in the store; nothing needs extracting.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ExtractedMember {
    pub member: ArchiveMember,
    pub path: Utf8PathBuf,
}

pub struct ArchiveInspector {
    layout: HoardLayout,
    member_suffix: String,
}

impl ArchiveInspector {
    pub fn new(layout: HoardLayout, member_suffix: &str) -> Self {
        Self {
            layout,
            member_suffix: member_suffix.to_string(),
        }
    }

    /// Reads the table of contents. Payload bytes are decompressed in passing
    /// but never written out.
    pub fn members(&self, archive: &Utf8Path) -> Result<Vec<ArchiveMember>, HoardError> {
        let mut tar = open_archive(archive)?;
        let entries = tar.entries().map_err(|err| archive_err(archive, err))?;

        let mut members = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| archive_err(archive, err))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(|err| archive_err(archive, err))?;
            let name = path.to_string_lossy().replace('\\', "/");
            if name.ends_with(&self.member_suffix) {
                members.push(ArchiveMember::new(name));
            }
        }
        Ok(members)
    }

    /// Splits the archive's members into those whose sharded key is already
    /// in `index` and those that still need uploading, in listing order.
    pub fn inspect(
        &self,
        archive: &Utf8Path,
        index: &RemoteIndex,
    ) -> Result<Inspection, HoardError> {
        let mut inspection = Inspection::default();
        for member in self.members(archive)? {
            let key = member.storage_key()?;
            let object_key = self.layout.object_key(&key);
            if index.contains(&object_key) {
                inspection.present.push(PresentMember {
                    url: self.layout.url(&key),
                    object_key,
                    member,
                });
            } else {
                inspection.missing.push(member);
            }
        }
        tracing::debug!(
            archive = %archive,
            present = inspection.present.len(),
            missing = inspection.missing.len(),
            "archive inspected"
        );
        Ok(inspection)
    }

    /// Unpacks only `wanted` under `dest`, keeping the archive's own paths.
    ///
    /// Members whose raw or compressed file already sits in `dest` are not
    /// written again. Each member goes through a temp file so a half-written
    /// file never appears under its final name.
    pub fn extract(
        &self,
        archive: &Utf8Path,
        wanted: &[ArchiveMember],
        dest: &Utf8Path,
    ) -> Result<Vec<ExtractedMember>, HoardError> {
        let names: HashSet<&str> = wanted.iter().map(|member| member.name.as_str()).collect();
        let mut extracted = Vec::new();
        if names.is_empty() {
            return Ok(extracted);
        }

        tracing::info!(archive = %archive, members = names.len(), "extracting missing members");
        let mut tar = open_archive(archive)?;
        let entries = tar.entries().map_err(|err| archive_err(archive, err))?;

        for entry in entries {
            let mut entry = entry.map_err(|err| archive_err(archive, err))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(|err| archive_err(archive, err))?.into_owned();
            if path
                .components()
                .any(|part| !matches!(part, Component::Normal(_) | Component::CurDir))
            {
                return Err(HoardError::Archive {
                    path: archive.to_string(),
                    message: format!("entry escapes extraction root: {}", path.display()),
                });
            }
            let name = path.to_string_lossy().replace('\\', "/");
            if !names.contains(name.as_str()) {
                continue;
            }

            let target = dest.join(&name);
            let compressed = Utf8PathBuf::from(format!("{target}.gz"));
            if !target.exists() && !compressed.exists() {
                let mut temp = Staging::temp_beside(&target)?;
                io::copy(&mut entry, temp.as_file_mut())
                    .map_err(|err| archive_err(archive, err))?;
                Staging::persist(temp, &target)?;
            }
            extracted.push(ExtractedMember {
                member: ArchiveMember::new(name),
                path: target,
            });
        }
        Ok(extracted)
    }
}

fn open_archive(path: &Utf8Path) -> Result<Archive<Box<dyn Read>>, HoardError> {
    let name = path.as_str();
    let codec = if name.ends_with(".xz") {
        Codec::Xz
    } else if name.ends_with(".gz") || name.ends_with(".tgz") {
        Codec::Gzip
    } else if name.ends_with(".tar") {
        Codec::Plain
    } else {
        return Err(HoardError::Archive {
            path: path.to_string(),
            message: "unsupported archive format".to_string(),
        });
    };

    let file = File::open(path.as_std_path())
        .map_err(|err| HoardError::Filesystem(format!("open archive {path}: {err}")))?;
    let reader = BufReader::new(file);
    let stream: Box<dyn Read> = match codec {
        Codec::Xz => Box::new(XzDecoder::new_multi_decoder(reader)),
        Codec::Gzip => Box::new(MultiGzDecoder::new(reader)),
        Codec::Plain => Box::new(reader),
    };
    Ok(Archive::new(stream))
}

enum Codec {
    Xz,
    Gzip,
    Plain,
}

fn archive_err(path: &Utf8Path, err: io::Error) -> HoardError {
    HoardError::Archive {
        path: path.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn write_tar(path: &Utf8Path, files: &[(&str, &str)]) {
        let file = File::create(path.as_std_path()).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn member_keys() {
        let member = ArchiveMember::new("escherichia_coli__00/SAMD00000344.fa");
        assert_eq!(member.sample_id, "SAMD00000344");
        assert_eq!(member.compressed_name(), "SAMD00000344.fa.gz");
        assert_eq!(
            member.storage_key().unwrap().to_string(),
            "SAMD000/SAMD000003/SAMD00000344.fa.gz"
        );
    }

    #[test]
    fn members_filters_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("plain.tar")).unwrap();
        write_tar(
            &path,
            &[
                ("batch/SAMA0000001.fa", ">a\nACGT\n"),
                ("batch/README", "notes"),
            ],
        );
        let inspector = ArchiveInspector::new(HoardLayout::new("hoard", "https://b.example"), ".fa");
        let members = inspector.members(&path).unwrap();
        assert_eq!(members, vec![ArchiveMember::new("batch/SAMA0000001.fa")]);
    }

    #[test]
    fn inspect_splits_present_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("batch.tar")).unwrap();
        write_tar(
            &path,
            &[
                ("batch/SAMA0000001.fa", ">a\nACGT\n"),
                ("batch/SAMA0000002.fa", ">b\nGGCC\n"),
                ("batch/SAMA0000003.fa", ">c\nTTAA\n"),
            ],
        );
        let layout = HoardLayout::new("hoard", "https://bucket.s3.climb.ac.uk");
        let index = RemoteIndex::from_keys(
            "hoard/",
            ["hoard/SAMA000/SAMA000000/SAMA0000001.fa.gz"],
        );
        let inspector = ArchiveInspector::new(layout, ".fa");

        let inspection = inspector.inspect(&path, &index).unwrap();

        assert!(!inspection.is_complete());
        assert_eq!(
            inspection.missing,
            vec![
                ArchiveMember::new("batch/SAMA0000002.fa"),
                ArchiveMember::new("batch/SAMA0000003.fa"),
            ]
        );
        assert_eq!(inspection.present.len(), 1);
        assert_eq!(inspection.present[0].member.sample_id, "SAMA0000001");
        assert_eq!(
            inspection.present[0].object_key,
            "hoard/SAMA000/SAMA000000/SAMA0000001.fa.gz"
        );
        assert_eq!(
            inspection.present[0].url,
            "https://bucket.s3.climb.ac.uk/hoard/SAMA000/SAMA000000/SAMA0000001.fa.gz"
        );
    }

    #[test]
    fn extract_only_wanted() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("plain.tar")).unwrap();
        write_tar(
            &path,
            &[
                ("batch/SAMA0000001.fa", ">a\nACGT\n"),
                ("batch/SAMA0000002.fa", ">b\nTTTT\n"),
            ],
        );
        let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
        let inspector = ArchiveInspector::new(HoardLayout::new("hoard", "https://b.example"), ".fa");
        let wanted = vec![ArchiveMember::new("batch/SAMA0000002.fa")];

        let extracted = inspector.extract(&path, &wanted, &dest).unwrap();
        assert_eq!(extracted.len(), 1);
        assert_eq!(
            std::fs::read(extracted[0].path.as_std_path()).unwrap(),
            b">b\nTTTT\n"
        );
        assert!(!dest.join("batch/SAMA0000001.fa").exists());
    }

    #[test]
    fn unknown_format_is_archive_error() {
        let err = open_archive(Utf8Path::new("thing.zip")).err().unwrap();
        assert_matches!(err, HoardError::Archive { .. });
        assert!(err.is_recoverable());
    }
}
