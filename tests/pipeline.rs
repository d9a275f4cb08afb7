use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;

use bacteria_hoard::catalog::AccessionRecord;
use bacteria_hoard::compress::{Backend, Compressor};
use bacteria_hoard::domain::{ArchiveEnumerator, HoardLayout};
use bacteria_hoard::error::HoardError;
use bacteria_hoard::metadata::MetadataEnricher;
use bacteria_hoard::object_store::{FsObjectStore, ObjectStore};
use bacteria_hoard::pipeline::{FailureStage, NoopSink, Pipeline, PipelineSettings};
use bacteria_hoard::source::{ArchiveSource, RemoteEntry};
use bacteria_hoard::upload::RetryPolicy;

const BASE_URL: &str = "https://bucket.s3.example.org";

#[derive(Default)]
struct MockSource {
    files: HashMap<String, Vec<u8>>,
    retrieved: Mutex<usize>,
}

impl MockSource {
    fn with(mut self, path: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(path.to_string(), bytes);
        self
    }

    fn retrieved(&self) -> usize {
        *self.retrieved.lock().unwrap()
    }
}

impl ArchiveSource for MockSource {
    fn list(&self, _dir: &str) -> Result<Vec<RemoteEntry>, HoardError> {
        Ok(Vec::new())
    }

    fn retrieve(&self, path: &str, destination: &Path) -> Result<u64, HoardError> {
        let Some(bytes) = self.files.get(path) else {
            return Err(HoardError::SourceMissing {
                status: 403,
                path: path.to_string(),
            });
        };
        std::fs::write(destination, bytes).unwrap();
        *self.retrieved.lock().unwrap() += 1;
        Ok(bytes.len() as u64)
    }
}

/// Filesystem store that records every put and can refuse some keys.
struct RecordingStore {
    inner: FsObjectStore,
    puts: Mutex<Vec<String>>,
    refuse: Vec<String>,
}

impl RecordingStore {
    fn new(root: Utf8PathBuf) -> Self {
        Self {
            inner: FsObjectStore::new(root),
            puts: Mutex::new(Vec::new()),
            refuse: Vec::new(),
        }
    }

    fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }
}

impl ObjectStore for RecordingStore {
    fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), HoardError> {
        self.puts.lock().unwrap().push(key.to_string());
        if self.refuse.iter().any(|refused| refused == key) {
            return Err(HoardError::StorePut {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "access denied".to_string(),
            });
        }
        self.inner.put(bucket, key, source)
    }

    fn get(&self, bucket: &str, key: &str, destination: &Path) -> Result<u64, HoardError> {
        self.inner.get(bucket, key, destination)
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, HoardError> {
        self.inner.list(bucket, prefix)
    }
}

fn tar_xz(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn record(biosample: &str, acc: &str) -> AccessionRecord {
    AccessionRecord {
        acc: acc.to_string(),
        biosample: biosample.to_string(),
        ..AccessionRecord::default()
    }
}

fn enricher() -> MetadataEnricher {
    MetadataEnricher::from_records([
        record("SAMA0000001", "SRR1"),
        record("SAMA0000002", "SRR2"),
        record("SAMA0000003", "SRR3"),
        record("SAMZ9999999", "SRR9"),
    ])
}

fn settings(root: &Utf8Path, count: usize) -> PipelineSettings {
    PipelineSettings {
        bucket: "bucket".to_string(),
        layout: HoardLayout::new("hoard", BASE_URL),
        enumerator: ArchiveEnumerator {
            release_dir: "assembly".to_string(),
            species: "escherichia_coli".to_string(),
            count,
            suffix: ".asm.tar.xz".to_string(),
        },
        member_suffix: ".fa".to_string(),
        min_archive_bytes: 16,
        staging_dir: root.join("temp"),
        output_file: root.join("metadata/all_url_accessions.tsv"),
        workers: 3,
        retry: RetryPolicy {
            attempts: 2,
            base_delay: Duration::ZERO,
        },
    }
}

fn key(file: &str) -> String {
    let base = file.split('.').next().unwrap();
    format!("hoard/{}/{}/{file}", &base[..7], &base[..10])
}

fn three_member_archive() -> Vec<u8> {
    tar_xz(&[
        ("escherichia_coli__00/SAMA0000001.fa", ">a\nACGT\n"),
        ("escherichia_coli__00/SAMA0000002.fa", ">b\nGGCC\n"),
        ("escherichia_coli__00/SAMA0000003.fa", ">c\nTTAA\n"),
    ])
}

fn workspace() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

fn seed(store: &RecordingStore, root: &Utf8Path, object_key: &str) {
    let seed = root.join("seed.gz");
    std::fs::write(seed.as_std_path(), b"already there").unwrap();
    store.inner.put("bucket", object_key, seed.as_std_path()).unwrap();
}

#[test]
fn missing_members_are_uploaded_and_present_ones_resolved() {
    let (_dir, root) = workspace();
    let store = Arc::new(RecordingStore::new(root.join("store")));
    seed(&store, &root, &key("SAMA0000001.fa.gz"));

    let source = MockSource::default().with(
        "assembly/escherichia_coli__00.asm.tar.xz",
        three_member_archive(),
    );
    let pipeline = Pipeline::new(
        source,
        Arc::clone(&store),
        Compressor::with_backend(Backend::InProcess),
        settings(&root, 2),
    );

    let summary = pipeline.run(enricher(), &NoopSink).unwrap();

    assert_eq!(summary.members_present, 1);
    assert_eq!(summary.members_scheduled, 2);
    assert_eq!(summary.uploads_succeeded, 2);
    assert_eq!(summary.uploads_failed, 0);
    assert!(!summary.has_failures());

    let mut puts = store.puts();
    puts.sort();
    assert_eq!(puts, vec![key("SAMA0000002.fa.gz"), key("SAMA0000003.fa.gz")]);

    let uploaded = root.join("store/bucket").join(key("SAMA0000002.fa.gz"));
    let mut text = String::new();
    GzDecoder::new(std::fs::File::open(uploaded.as_std_path()).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    assert_eq!(text, ">b\nGGCC\n");

    let staged = root.join("temp/escherichia_coli__00");
    for file in ["SAMA0000002.fa", "SAMA0000002.fa.gz", "SAMA0000003.fa.gz"] {
        assert!(!staged.join(file).exists(), "{file} left in staging");
    }

    let table = std::fs::read_to_string(root.join("metadata/all_url_accessions.tsv")).unwrap();
    let lines: Vec<_> = table.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[1].starts_with("SAMA0000001\tSRR1\t"));
    assert!(lines[1].ends_with(&format!(
        "\t{BASE_URL}/hoard/SAMA000/SAMA000000/SAMA0000001.fa.gz"
    )));
    assert!(!table.contains("SAMZ9999999"));
    assert_eq!(summary.records_written, 3);
}

#[test]
fn permission_denied_archive_is_skipped() {
    let (_dir, root) = workspace();
    let store = Arc::new(RecordingStore::new(root.join("store")));
    let source = MockSource::default().with(
        "assembly/escherichia_coli__01.asm.tar.xz",
        three_member_archive(),
    );
    let pipeline = Pipeline::new(
        source,
        Arc::clone(&store),
        Compressor::with_backend(Backend::InProcess),
        settings(&root, 2),
    );

    let summary = pipeline.run(enricher(), &NoopSink).unwrap();

    assert_eq!(summary.archives_skipped, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].stage, FailureStage::Fetch);
    assert!(summary.failures[0].subject.ends_with("escherichia_coli__00.asm.tar.xz"));
    assert_eq!(summary.uploads_succeeded, 3);
    assert!(!summary.has_failures());
}

#[test]
fn undersized_archive_is_skipped_and_removed() {
    let (_dir, root) = workspace();
    let store = Arc::new(RecordingStore::new(root.join("store")));
    let source =
        MockSource::default().with("assembly/escherichia_coli__00.asm.tar.xz", b"tiny".to_vec());
    let pipeline = Pipeline::new(
        source,
        Arc::clone(&store),
        Compressor::with_backend(Backend::InProcess),
        settings(&root, 1),
    );

    let summary = pipeline.run(enricher(), &NoopSink).unwrap();

    assert_eq!(summary.archives_skipped, 1);
    assert!(summary.failures[0].message.contains("bytes"));
    assert!(!root.join("temp/escherichia_coli__00.asm.tar.xz").exists());
    assert!(store.puts().is_empty());
}

#[test]
fn rerun_uploads_nothing_and_drops_complete_archive() {
    let (_dir, root) = workspace();
    let store = Arc::new(RecordingStore::new(root.join("store")));
    let source = Arc::new(MockSource::default().with(
        "assembly/escherichia_coli__00.asm.tar.xz",
        three_member_archive(),
    ));

    let first = Pipeline::new(
        Arc::clone(&source),
        Arc::clone(&store),
        Compressor::with_backend(Backend::InProcess),
        settings(&root, 1),
    )
    .run(enricher(), &NoopSink)
    .unwrap();
    assert_eq!(first.uploads_succeeded, 3);
    assert!(root.join("temp/escherichia_coli__00.asm.tar.xz").exists());

    let second = Pipeline::new(
        Arc::clone(&source),
        Arc::clone(&store),
        Compressor::with_backend(Backend::InProcess),
        settings(&root, 1),
    )
    .run(enricher(), &NoopSink)
    .unwrap();

    assert_eq!(second.uploads_succeeded, 0);
    assert_eq!(second.members_scheduled, 0);
    assert_eq!(second.members_present, 3);
    assert_eq!(second.archives_cached, 1);
    assert_eq!(second.archives_complete, 1);
    assert_eq!(store.puts().len(), 3);
    assert_eq!(source.retrieved(), 1);
    assert!(!root.join("temp/escherichia_coli__00.asm.tar.xz").exists());
    assert_eq!(second.records_written, 3);
}

#[test]
fn complete_archive_is_never_extracted() {
    let (_dir, root) = workspace();
    let store = Arc::new(RecordingStore::new(root.join("store")));
    for file in ["SAMA0000001.fa.gz", "SAMA0000002.fa.gz", "SAMA0000003.fa.gz"] {
        seed(&store, &root, &key(file));
    }
    let source = MockSource::default().with(
        "assembly/escherichia_coli__00.asm.tar.xz",
        three_member_archive(),
    );
    let pipeline = Pipeline::new(
        source,
        Arc::clone(&store),
        Compressor::with_backend(Backend::InProcess),
        settings(&root, 1),
    );

    let summary = pipeline.run(enricher(), &NoopSink).unwrap();

    assert_eq!(summary.archives_complete, 1);
    assert_eq!(summary.members_scheduled, 0);
    assert!(store.puts().is_empty());
    assert!(!root.join("temp/escherichia_coli__00").exists());
    assert!(!root.join("temp/escherichia_coli__00.asm.tar.xz").exists());
}

#[test]
fn refused_upload_is_reported_and_url_withheld() {
    let (_dir, root) = workspace();
    let mut store = RecordingStore::new(root.join("store"));
    store.refuse.push(key("SAMA0000002.fa.gz"));
    let store = Arc::new(store);
    let source = MockSource::default().with(
        "assembly/escherichia_coli__00.asm.tar.xz",
        three_member_archive(),
    );
    let pipeline = Pipeline::new(
        source,
        Arc::clone(&store),
        Compressor::with_backend(Backend::InProcess),
        settings(&root, 1),
    );

    let summary = pipeline.run(enricher(), &NoopSink).unwrap();

    assert_eq!(summary.uploads_succeeded, 2);
    assert_eq!(summary.uploads_failed, 1);
    assert!(summary.has_failures());
    let failure = summary
        .failures
        .iter()
        .find(|failure| failure.stage == FailureStage::Upload)
        .unwrap();
    assert_eq!(failure.subject, key("SAMA0000002.fa.gz"));

    let attempts = store
        .puts()
        .iter()
        .filter(|put| **put == key("SAMA0000002.fa.gz"))
        .count();
    assert_eq!(attempts, 2);

    let staged = root.join("temp/escherichia_coli__00");
    assert!(staged.join("SAMA0000002.fa.gz").exists());
    assert!(!staged.join("SAMA0000001.fa.gz").exists());
    assert!(!staged.join("SAMA0000003.fa.gz").exists());

    let table = std::fs::read_to_string(root.join("metadata/all_url_accessions.tsv")).unwrap();
    assert!(table.contains("SAMA0000001"));
    assert!(!table.contains("SAMA0000002"));
    assert!(table.contains("SAMA0000003"));
}

#[test]
fn member_repeated_across_archives_uploads_once() {
    let (_dir, root) = workspace();
    let store = Arc::new(RecordingStore::new(root.join("store")));
    let source = MockSource::default()
        .with(
            "assembly/escherichia_coli__00.asm.tar.xz",
            tar_xz(&[("escherichia_coli__00/SAMA0000001.fa", ">a\nACGT\n")]),
        )
        .with(
            "assembly/escherichia_coli__01.asm.tar.xz",
            tar_xz(&[
                ("escherichia_coli__01/SAMA0000001.fa", ">a\nACGT\n"),
                ("escherichia_coli__01/SAMA0000002.fa", ">b\nGGCC\n"),
            ]),
        );
    let pipeline = Pipeline::new(
        source,
        Arc::clone(&store),
        Compressor::with_backend(Backend::InProcess),
        settings(&root, 2),
    );

    let summary = pipeline.run(enricher(), &NoopSink).unwrap();

    assert_eq!(summary.members_scheduled, 2);
    assert_eq!(summary.members_deduplicated, 1);
    assert_eq!(store.puts().len(), 2);
}

#[test]
fn listing_failure_aborts_before_any_fetch() {
    struct BrokenStore;

    impl ObjectStore for BrokenStore {
        fn put(&self, bucket: &str, key: &str, _source: &Path) -> Result<(), HoardError> {
            Err(HoardError::StorePut {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "unreachable".to_string(),
            })
        }

        fn get(&self, bucket: &str, key: &str, _destination: &Path) -> Result<u64, HoardError> {
            Err(HoardError::StoreGet {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "unreachable".to_string(),
            })
        }

        fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, HoardError> {
            Err(HoardError::StoreList {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                message: "connection reset".to_string(),
            })
        }
    }

    let (_dir, root) = workspace();
    let source = Arc::new(MockSource::default().with(
        "assembly/escherichia_coli__00.asm.tar.xz",
        three_member_archive(),
    ));
    let pipeline = Pipeline::new(
        Arc::clone(&source),
        Arc::new(BrokenStore),
        Compressor::with_backend(Backend::InProcess),
        settings(&root, 1),
    );

    let err = pipeline.run(enricher(), &NoopSink).unwrap_err();
    assert_matches!(err, HoardError::StoreList { .. });
    assert_eq!(source.retrieved(), 0);
}
