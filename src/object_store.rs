use std::fs;
use std::path::Path;
use std::sync::Arc;

use aws_sdk_s3::config::{Credentials, Region, StalledStreamProtectionConfig};
use aws_sdk_s3::primitives::ByteStream;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::error::HoardError;
use crate::staging::Staging;

/// Remote object store. Puts overwrite unconditionally.
pub trait ObjectStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), HoardError>;

    fn get(&self, bucket: &str, key: &str, destination: &Path) -> Result<u64, HoardError>;

    /// Every key under `prefix`, unstripped.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, HoardError>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), HoardError> {
        (**self).put(bucket, key, source)
    }

    fn get(&self, bucket: &str, key: &str, destination: &Path) -> Result<u64, HoardError> {
        (**self).get(bucket, key, destination)
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, HoardError> {
        (**self).list(bucket, prefix)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectDownload {
    pub bucket: String,
    pub key: String,
    pub path: String,
    pub bytes: u64,
}

/// S3-compatible store. One client and one runtime are built up front and
/// shared by every caller; the type is cheap to clone.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    runtime: Arc<Runtime>,
}

impl S3ObjectStore {
    /// Reads `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY` from the environment.
    pub fn from_env(endpoint_url: &str) -> Result<Self, HoardError> {
        let access_key = require_env("AWS_ACCESS_KEY_ID")?;
        let secret_key = require_env("AWS_SECRET_ACCESS_KEY")?;
        Self::new(endpoint_url, &access_key, &secret_key)
    }

    pub fn new(endpoint_url: &str, access_key: &str, secret_key: &str) -> Result<Self, HoardError> {
        let creds = Credentials::new(access_key, secret_key, None, None, "hoard-env");
        let config = aws_sdk_s3::Config::builder()
            .endpoint_url(endpoint_url)
            .region(Region::new("us-east-1"))
            .credentials_provider(creds)
            .force_path_style(true)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("hoard-s3")
            .build()
            .map_err(|err| HoardError::StoreConfig(err.to_string()))?;

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(config),
            runtime: Arc::new(runtime),
        })
    }
}

impl ObjectStore for S3ObjectStore {
    fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), HoardError> {
        let put_err = |message: String| HoardError::StorePut {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };
        self.runtime.block_on(async {
            let body = ByteStream::from_path(source)
                .await
                .map_err(|err| put_err(err.to_string()))?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|err| put_err(aws_sdk_s3::error::DisplayErrorContext(&err).to_string()))?;
            Ok::<(), HoardError>(())
        })
    }

    fn get(&self, bucket: &str, key: &str, destination: &Path) -> Result<u64, HoardError> {
        let get_err = |message: String| HoardError::StoreGet {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };
        let bytes = self.runtime.block_on(async {
            let output = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| get_err(aws_sdk_s3::error::DisplayErrorContext(&err).to_string()))?;
            let data = output
                .body
                .collect()
                .await
                .map_err(|err| get_err(err.to_string()))?;
            Ok::<_, HoardError>(data.into_bytes())
        })?;

        let dest = utf8(destination)?;
        Staging::write_bytes_atomic(&dest, &bytes)?;
        Ok(bytes.len() as u64)
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, HoardError> {
        self.runtime.block_on(async {
            let mut keys = Vec::new();
            let mut continuation_token: Option<String> = None;

            loop {
                let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
                if let Some(token) = &continuation_token {
                    request = request.continuation_token(token);
                }

                let output = request.send().await.map_err(|err| HoardError::StoreList {
                    bucket: bucket.to_string(),
                    prefix: prefix.to_string(),
                    message: aws_sdk_s3::error::DisplayErrorContext(&err).to_string(),
                })?;

                for obj in output.contents() {
                    if let Some(key) = obj.key() {
                        keys.push(key.to_string());
                    }
                }

                match next_page(output.is_truncated(), output.next_continuation_token()) {
                    Ok(Some(token)) => continuation_token = Some(token),
                    Ok(None) => break,
                    Err(message) => {
                        return Err(HoardError::StoreList {
                            bucket: bucket.to_string(),
                            prefix: prefix.to_string(),
                            message,
                        });
                    }
                }
            }

            Ok::<_, HoardError>(keys)
        })
    }
}

/// Objects as plain files under `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: Utf8PathBuf,
}

impl FsObjectStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<Utf8PathBuf, HoardError> {
        if key.split('/').any(|part| part == "..") {
            return Err(HoardError::InvalidFilename(key.to_string()));
        }
        Ok(self.root.join(bucket).join(key))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), HoardError> {
        let dest = self.object_path(bucket, key)?;
        let temp = Staging::temp_beside(&dest)?;
        fs::copy(source, temp.path()).map_err(|err| HoardError::StorePut {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: err.to_string(),
        })?;
        Staging::persist(temp, &dest)
    }

    fn get(&self, bucket: &str, key: &str, destination: &Path) -> Result<u64, HoardError> {
        let path = self.object_path(bucket, key)?;
        fs::copy(path.as_std_path(), destination).map_err(|err| HoardError::StoreGet {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: err.to_string(),
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, HoardError> {
        let bucket_root = self.root.join(bucket);
        let mut keys = Vec::new();
        if !bucket_root.as_std_path().exists() {
            return Ok(keys);
        }
        let mut stack = vec![bucket_root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(dir.as_std_path()).map_err(|err| HoardError::StoreList {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                message: err.to_string(),
            })?;
            for entry in entries.flatten() {
                let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                    continue;
                };
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path
                    .file_name()
                    .is_some_and(|name| name.starts_with(".hoard-partial"))
                {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_root) else {
                    continue;
                };
                let key = relative.as_str().replace('\\', "/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Token for the next listing page, `None` once the listing is complete.
/// A truncated page without a token would restart the listing from the top.
fn next_page(truncated: Option<bool>, token: Option<&str>) -> Result<Option<String>, String> {
    if truncated != Some(true) {
        return Ok(None);
    }
    match token {
        Some(token) if !token.is_empty() => Ok(Some(token.to_string())),
        _ => Err("truncated listing without a continuation token".to_string()),
    }
}

fn require_env(name: &str) -> Result<String, HoardError> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| HoardError::MissingEnv(name.to_string()))
}

fn utf8(path: &Path) -> Result<Utf8PathBuf, HoardError> {
    Utf8Path::from_path(path)
        .map(Utf8Path::to_path_buf)
        .ok_or_else(|| HoardError::Filesystem(format!("non-utf8 path: {}", path.display())))
}
