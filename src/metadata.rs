use std::collections::{BTreeMap, HashMap};

use camino::Utf8Path;
use serde::Serialize;

use crate::catalog::AccessionRecord;
use crate::error::HoardError;
use crate::staging::Staging;
use crate::upload::UploadOutcome;

#[derive(Debug, Clone)]
struct PendingUrl {
    sample_id: String,
    url: String,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    biosample: &'a str,
    acc: &'a str,
    experiment: &'a str,
    sample_name: &'a str,
    sample_acc: &'a str,
    bioproject: &'a str,
    sra_study: &'a str,
    url: &'a str,
}

/// Per-sample catalog records plus the public URL of each sample's object.
///
/// A URL is resolved only once its object is known to be in the store:
/// either it was in the remote index, or the upload pool acknowledged the
/// put. URLs for uploads still in flight sit in a pending set keyed by object
/// key and never reach the output.
#[derive(Debug, Default)]
pub struct MetadataEnricher {
    records: BTreeMap<String, AccessionRecord>,
    urls: BTreeMap<String, String>,
    pending: HashMap<String, PendingUrl>,
}

impl MetadataEnricher {
    /// Keys records by biosample. Several runs of one sample collapse onto
    /// the last one listed.
    pub fn from_records(records: impl IntoIterator<Item = AccessionRecord>) -> Self {
        let records = records
            .into_iter()
            .filter(|record| !record.biosample.is_empty())
            .map(|record| (record.biosample.clone(), record))
            .collect();
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn knows(&self, sample_id: &str) -> bool {
        self.records.contains_key(sample_id)
    }

    /// Object already in the store. Returns false for samples the catalog
    /// does not list; those never get a row.
    pub fn record_present(&mut self, sample_id: &str, url: &str) -> bool {
        if !self.knows(sample_id) {
            return false;
        }
        self.urls.insert(sample_id.to_string(), url.to_string());
        true
    }

    pub fn schedule(&mut self, object_key: &str, sample_id: &str, url: &str) {
        self.pending.insert(
            object_key.to_string(),
            PendingUrl {
                sample_id: sample_id.to_string(),
                url: url.to_string(),
            },
        );
    }

    pub fn confirm(&mut self, object_key: &str) -> bool {
        match self.pending.remove(object_key) {
            Some(pending) => self.record_present(&pending.sample_id, &pending.url),
            None => false,
        }
    }

    pub fn abandon(&mut self, object_key: &str) {
        self.pending.remove(object_key);
    }

    pub fn apply(&mut self, outcomes: &[UploadOutcome]) {
        for outcome in outcomes {
            if outcome.is_uploaded() {
                self.confirm(outcome.key());
            } else {
                self.abandon(outcome.key());
            }
        }
    }

    pub fn url(&self, sample_id: &str) -> Option<&str> {
        self.urls.get(sample_id).map(String::as_str)
    }

    pub fn resolved_count(&self) -> usize {
        self.urls.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Rewrites `path` in full with every record that has a resolved URL,
    /// ordered by biosample. Returns the number of rows written.
    pub fn write_snapshot(&self, path: &Utf8Path) -> Result<usize, HoardError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(Vec::new());
        let mut rows = 0;
        for (biosample, url) in &self.urls {
            let Some(record) = self.records.get(biosample) else {
                continue;
            };
            writer
                .serialize(OutputRow {
                    biosample: &record.biosample,
                    acc: &record.acc,
                    experiment: &record.experiment,
                    sample_name: &record.sample_name,
                    sample_acc: &record.sample_acc,
                    bioproject: &record.bioproject,
                    sra_study: &record.sra_study,
                    url,
                })
                .map_err(|err| HoardError::Tsv(err.to_string()))?;
            rows += 1;
        }
        if rows == 0 {
            writer
                .write_record([
                    "biosample",
                    "acc",
                    "experiment",
                    "sample_name",
                    "sample_acc",
                    "bioproject",
                    "sra_study",
                    "url",
                ])
                .map_err(|err| HoardError::Tsv(err.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| HoardError::Tsv(err.to_string()))?;
        Staging::write_bytes_atomic(path, &bytes)?;
        tracing::debug!(path = %path, rows, "metadata snapshot written");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn record(biosample: &str, acc: &str) -> AccessionRecord {
        AccessionRecord {
            acc: acc.to_string(),
            biosample: biosample.to_string(),
            ..AccessionRecord::default()
        }
    }

    #[test]
    fn pending_urls_need_confirmation() {
        let mut enricher =
            MetadataEnricher::from_records([record("SAMA1", "SRR1"), record("SAMA2", "SRR2")]);
        enricher.schedule(
            "hoard/SAMA1/SAMA1/SAMA1.fa.gz",
            "SAMA1",
            "https://b/hoard/SAMA1/SAMA1/SAMA1.fa.gz",
        );
        assert_eq!(enricher.url("SAMA1"), None);
        assert_eq!(enricher.pending_count(), 1);

        enricher.apply(&[UploadOutcome::Uploaded {
            key: "hoard/SAMA1/SAMA1/SAMA1.fa.gz".to_string(),
            attempts: 1,
        }]);
        assert_eq!(enricher.url("SAMA1"), Some("https://b/hoard/SAMA1/SAMA1/SAMA1.fa.gz"));
        assert_eq!(enricher.pending_count(), 0);
    }

    #[test]
    fn failed_upload_drops_url() {
        let mut enricher = MetadataEnricher::from_records([record("SAMA1", "SRR1")]);
        enricher.schedule("k", "SAMA1", "https://b/k");
        enricher.apply(&[UploadOutcome::Failed {
            key: "k".to_string(),
            local_path: "x".to_string(),
            attempts: 3,
            error: "denied".to_string(),
        }]);
        assert_eq!(enricher.url("SAMA1"), None);
        assert_eq!(enricher.pending_count(), 0);
    }

    #[test]
    fn unknown_sample_is_ignored() {
        let mut enricher = MetadataEnricher::from_records([record("SAMA1", "SRR1")]);
        assert!(!enricher.record_present("SAMZ9", "https://b/z"));
        assert_eq!(enricher.resolved_count(), 0);
    }

    #[test]
    fn snapshot_only_resolved_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("urls.tsv")).unwrap();
        let mut enricher = MetadataEnricher::from_records([
            record("SAMA2", "SRR2"),
            record("SAMA1", "SRR1"),
            record("SAMA3", "SRR3"),
        ]);
        enricher.record_present("SAMA2", "https://b/2");
        enricher.record_present("SAMA1", "https://b/1");

        assert_eq!(enricher.write_snapshot(&path).unwrap(), 2);
        let text = std::fs::read_to_string(path.as_std_path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[0],
            "biosample\tacc\texperiment\tsample_name\tsample_acc\tbioproject\tsra_study\turl"
        );
        assert!(lines[1].starts_with("SAMA1\tSRR1\t"));
        assert!(lines[2].ends_with("\thttps://b/2"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn empty_snapshot_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("urls.tsv")).unwrap();
        let enricher = MetadataEnricher::default();
        assert_eq!(enricher.write_snapshot(&path).unwrap(), 0);
        let text = std::fs::read_to_string(path.as_std_path()).unwrap();
        assert!(text.starts_with("biosample\t"));
    }
}
