use std::fs;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::error::HoardError;
use crate::source::{is_retryable_error, is_retryable_status};
use crate::staging::Staging;

const PORTAL_FIELDS: &str = "run_accession,experiment_accession,sample_alias,secondary_sample_accession,sample_accession,study_accession,secondary_study_accession";

/// One sequencing run as listed by the metadata catalog. Column order is the
/// cache file's column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessionRecord {
    pub acc: String,
    pub experiment: String,
    pub sample_name: String,
    pub sample_acc: String,
    pub biosample: String,
    pub bioproject: String,
    pub sra_study: String,
}

pub trait MetadataCatalog {
    fn query(&self) -> Result<Vec<AccessionRecord>, HoardError>;
}

/// ENA portal search over `read_run`, returned as TSV.
pub struct EnaPortalCatalog {
    client: Client,
    base_url: String,
    query: String,
}

impl EnaPortalCatalog {
    pub fn new(base_url: &str, query: &str) -> Result<Self, HoardError> {
        let client = Client::builder()
            .user_agent(format!("bacteria-hoard/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(3600))
            .build()
            .map_err(|err| HoardError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            query: query.to_string(),
        })
    }

    fn send_with_retries(&self) -> Result<Response, HoardError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 1000;
        let url = format!("{}/search", self.base_url);
        let params = [
            ("result", "read_run"),
            ("query", self.query.as_str()),
            ("fields", PORTAL_FIELDS),
            ("format", "tsv"),
            ("limit", "0"),
        ];
        let mut attempt = 0usize;
        loop {
            match self.client.get(&url).query(&params).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        tracing::debug!(status, attempt, "retrying catalog query");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        tracing::debug!(attempt, error = %err, "retrying catalog query");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(HoardError::CatalogHttp(err.to_string()));
                }
            }
        }
    }
}

impl MetadataCatalog for EnaPortalCatalog {
    fn query(&self) -> Result<Vec<AccessionRecord>, HoardError> {
        tracing::info!(query = %self.query, "querying metadata catalog");
        let response = self.send_with_retries()?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| HoardError::CatalogHttp(err.to_string()))?;
        if !status.is_success() {
            return Err(HoardError::CatalogStatus {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }
        let records = parse_portal_tsv(&body)?;
        tracing::info!(records = records.len(), "catalog query returned");
        Ok(records)
    }
}

#[derive(Debug, Deserialize)]
struct PortalRow {
    run_accession: String,
    #[serde(default)]
    experiment_accession: String,
    #[serde(default)]
    sample_alias: String,
    #[serde(default)]
    secondary_sample_accession: String,
    #[serde(default)]
    sample_accession: String,
    #[serde(default)]
    study_accession: String,
    #[serde(default)]
    secondary_study_accession: String,
}

impl From<PortalRow> for AccessionRecord {
    fn from(row: PortalRow) -> Self {
        Self {
            acc: row.run_accession,
            experiment: row.experiment_accession,
            sample_name: row.sample_alias,
            sample_acc: row.secondary_sample_accession,
            biosample: row.sample_accession,
            bioproject: row.study_accession,
            sra_study: row.secondary_study_accession,
        }
    }
}

pub fn parse_portal_tsv(body: &str) -> Result<Vec<AccessionRecord>, HoardError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_reader(body.as_bytes());
    reader
        .deserialize::<PortalRow>()
        .map(|row| {
            row.map(AccessionRecord::from)
                .map_err(|err| HoardError::Tsv(err.to_string()))
        })
        .collect()
}

/// Local TSV copy of the catalog, refreshed when older than `max_age_hours`.
#[derive(Debug, Clone)]
pub struct CatalogCache {
    path: Utf8PathBuf,
    max_age_hours: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogAction {
    Fresh,
    Refreshed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogReport {
    pub path: String,
    pub records: usize,
    pub action: CatalogAction,
}

impl CatalogCache {
    pub fn new(path: Utf8PathBuf, max_age_hours: i64) -> Self {
        Self {
            path,
            max_age_hours,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        let meta = fs::metadata(self.path.as_std_path()).ok()?;
        meta.modified().ok().map(DateTime::<Utc>::from)
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.modified() {
            Some(modified) => {
                now.signed_duration_since(modified).num_seconds() <= self.max_age_hours * 3600
            }
            None => false,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    pub fn load(&self) -> Result<Vec<AccessionRecord>, HoardError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(self.path.as_std_path())
            .map_err(|err| HoardError::Tsv(format!("{}: {err}", self.path)))?;
        reader
            .deserialize::<AccessionRecord>()
            .map(|row| row.map_err(|err| HoardError::Tsv(format!("{}: {err}", self.path))))
            .collect()
    }

    pub fn store(&self, records: &[AccessionRecord]) -> Result<(), HoardError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(Vec::new());
        for record in records {
            writer
                .serialize(record)
                .map_err(|err| HoardError::Tsv(err.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| HoardError::Tsv(err.to_string()))?;
        Staging::write_bytes_atomic(&self.path, &bytes)
    }

    /// Returns the cached records, querying `catalog` first when the cache is
    /// missing, stale, or `force` is set.
    pub fn resolve<C: MetadataCatalog + ?Sized>(
        &self,
        catalog: &C,
        force: bool,
    ) -> Result<(Vec<AccessionRecord>, CatalogAction), HoardError> {
        if !force && self.is_fresh() {
            tracing::debug!(path = %self.path, "catalog cache is fresh");
            return Ok((self.load()?, CatalogAction::Fresh));
        }
        let records = catalog.query()?;
        self.store(&records)?;
        tracing::info!(path = %self.path, records = records.len(), "catalog cache written");
        Ok((records, CatalogAction::Refreshed))
    }
}
