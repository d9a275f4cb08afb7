use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{ArchiveEnumerator, HoardLayout};
use crate::error::HoardError;

pub const DEFAULT_CONFIG_FILE: &str = "hoard.json";

const DEFAULT_CATALOG_QUERY: &str = "(tax_tree(561) OR tax_tree(620)) AND library_strategy=\"WGS\" AND instrument_platform=\"ILLUMINA\"";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: Option<StoreSection>,
    #[serde(default)]
    pub source: Option<SourceSection>,
    #[serde(default)]
    pub local: Option<LocalSection>,
    #[serde(default)]
    pub upload: Option<UploadSection>,
    #[serde(default)]
    pub catalog: Option<CatalogSection>,
    #[serde(default)]
    pub mirror: Option<MirrorSection>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StoreSection {
    pub bucket: Option<String>,
    pub endpoint_url: Option<String>,
    pub public_url_base: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SourceSection {
    pub base_url: Option<String>,
    pub release_dir: Option<String>,
    pub species: Option<String>,
    pub archive_count: Option<usize>,
    pub archive_suffix: Option<String>,
    pub member_suffix: Option<String>,
    pub min_archive_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LocalSection {
    pub staging_dir: Option<String>,
    pub metadata_dir: Option<String>,
    pub catalog_file: Option<String>,
    pub output_file: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UploadSection {
    pub workers: Option<usize>,
    pub put_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CatalogSection {
    pub base_url: Option<String>,
    pub query: Option<String>,
    pub max_age_hours: Option<i64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MirrorSection {
    pub release_root: Option<String>,
    pub version: Option<String>,
    pub dirs: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub bucket: String,
    pub endpoint_url: String,
    pub public_url_base: String,
    pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub base_url: String,
    pub release_dir: String,
    pub species: String,
    pub archive_count: usize,
    pub archive_suffix: String,
    pub member_suffix: String,
    pub min_archive_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub staging_dir: Utf8PathBuf,
    pub metadata_dir: Utf8PathBuf,
    pub catalog_file: Utf8PathBuf,
    pub output_file: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub base_url: String,
    pub query: String,
    pub max_age_hours: i64,
}

#[derive(Debug, Clone)]
pub struct MirrorSettings {
    pub release_root: String,
    pub version: String,
    pub dirs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub store: StoreSettings,
    pub source: SourceSettings,
    pub local: LocalSettings,
    pub workers: usize,
    pub put_attempts: u32,
    pub catalog: CatalogSettings,
    pub mirror: MirrorSettings,
}

impl ResolvedConfig {
    pub fn layout(&self) -> HoardLayout {
        HoardLayout::new(&self.store.prefix, &self.store.public_url_base)
    }

    pub fn enumerator(&self) -> ArchiveEnumerator {
        ArchiveEnumerator {
            release_dir: self.source.release_dir.clone(),
            species: self.source.species.clone(),
            count: self.source.archive_count,
            suffix: self.source.archive_suffix.clone(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `hoard.json` from the working directory when present.
    /// Without either, every setting takes its default.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HoardError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HoardError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HoardError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HoardError> {
        let store = config.store.unwrap_or_default();
        let source = config.source.unwrap_or_default();
        let local = config.local.unwrap_or_default();
        let upload = config.upload.unwrap_or_default();
        let catalog = config.catalog.unwrap_or_default();
        let mirror = config.mirror.unwrap_or_default();

        let bucket = store
            .bucket
            .unwrap_or_else(|| "quadram-bioinfo-allthebacteria".to_string());
        let endpoint_url = store
            .endpoint_url
            .unwrap_or_else(|| "https://s3.climb.ac.uk".to_string());
        let public_url_base = match store.public_url_base {
            Some(base) => base,
            None => virtual_host_base(&bucket, &endpoint_url)?,
        };

        let metadata_dir = Utf8PathBuf::from(local.metadata_dir.unwrap_or_else(|| "metadata".to_string()));
        let catalog_file = metadata_dir.join(
            local
                .catalog_file
                .unwrap_or_else(|| "all_accessions.tsv".to_string()),
        );
        let output_file = metadata_dir.join(
            local
                .output_file
                .unwrap_or_else(|| "all_url_accessions.tsv".to_string()),
        );

        let resolved = ResolvedConfig {
            store: StoreSettings {
                bucket,
                endpoint_url,
                public_url_base,
                prefix: store.prefix.unwrap_or_else(|| "hoard".to_string()),
            },
            source: SourceSettings {
                base_url: source
                    .base_url
                    .unwrap_or_else(|| "https://ftp.ebi.ac.uk".to_string()),
                release_dir: source.release_dir.unwrap_or_else(|| {
                    "pub/databases/AllTheBacteria/Releases/0.2/assembly/".to_string()
                }),
                species: source
                    .species
                    .unwrap_or_else(|| "escherichia_coli".to_string()),
                archive_count: source.archive_count.unwrap_or(75),
                archive_suffix: source
                    .archive_suffix
                    .unwrap_or_else(|| ".asm.tar.xz".to_string()),
                member_suffix: source.member_suffix.unwrap_or_else(|| ".fa".to_string()),
                min_archive_bytes: source.min_archive_bytes.unwrap_or(100),
            },
            local: LocalSettings {
                staging_dir: Utf8PathBuf::from(local.staging_dir.unwrap_or_else(|| "temp".to_string())),
                metadata_dir,
                catalog_file,
                output_file,
            },
            workers: upload.workers.unwrap_or(10),
            put_attempts: upload.put_attempts.unwrap_or(3),
            catalog: CatalogSettings {
                base_url: catalog
                    .base_url
                    .unwrap_or_else(|| "https://www.ebi.ac.uk/ena/portal/api".to_string()),
                query: catalog
                    .query
                    .unwrap_or_else(|| DEFAULT_CATALOG_QUERY.to_string()),
                max_age_hours: catalog.max_age_hours.unwrap_or(8),
            },
            mirror: MirrorSettings {
                release_root: mirror.release_root.unwrap_or_else(|| {
                    "pub/databases/AllTheBacteria/Releases/0.2/".to_string()
                }),
                version: mirror.version.unwrap_or_else(|| "0.2".to_string()),
                dirs: mirror.dirs.unwrap_or_else(default_mirror_dirs),
            },
        };

        resolved.validate()?;
        Ok(resolved)
    }
}

impl ResolvedConfig {
    pub fn validate(&self) -> Result<(), HoardError> {
        if self.workers == 0 {
            return Err(HoardError::InvalidConfig("upload.workers must be at least 1".to_string()));
        }
        if self.put_attempts == 0 {
            return Err(HoardError::InvalidConfig(
                "upload.put_attempts must be at least 1".to_string(),
            ));
        }
        if self.source.archive_count == 0 {
            return Err(HoardError::InvalidConfig(
                "source.archive_count must be at least 1".to_string(),
            ));
        }
        if self.store.bucket.trim().is_empty() {
            return Err(HoardError::InvalidConfig("store.bucket is empty".to_string()));
        }
        Ok(())
    }
}

pub fn default_mirror_dirs() -> Vec<String> {
    vec![
        ".".to_string(),
        "assembly".to_string(),
        "indexes/phylign".to_string(),
        "indexes/sketchlib".to_string(),
        "metadata".to_string(),
    ]
}

/// `https://s3.example.org` + `bucket` -> `https://bucket.s3.example.org`.
fn virtual_host_base(bucket: &str, endpoint_url: &str) -> Result<String, HoardError> {
    let (scheme, host) = endpoint_url
        .split_once("://")
        .ok_or_else(|| HoardError::InvalidConfig(format!("endpoint url without scheme: {endpoint_url}")))?;
    let host = host.trim_end_matches('/');
    if host.is_empty() {
        return Err(HoardError::InvalidConfig(format!("endpoint url without host: {endpoint_url}")));
    }
    Ok(format!("{scheme}://{bucket}.{host}"))
}
