use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;

use crate::error::HoardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Size marker as printed by the listing, e.g. `1.2G`.
    pub size: Option<String>,
}

/// Read-only remote archive: directory listing and binary retrieval.
pub trait ArchiveSource: Send + Sync {
    fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>, HoardError>;

    /// Streams `path` into `destination` and returns the byte count.
    fn retrieve(&self, path: &str, destination: &Path) -> Result<u64, HoardError>;
}

impl<T: ArchiveSource + ?Sized> ArchiveSource for Arc<T> {
    fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>, HoardError> {
        (**self).list(dir)
    }

    fn retrieve(&self, path: &str, destination: &Path) -> Result<u64, HoardError> {
        (**self).retrieve(path, destination)
    }
}

#[derive(Clone)]
pub struct HttpArchiveSource {
    client: Client,
    base_url: String,
}

impl HttpArchiveSource {
    pub fn new(base_url: &str) -> Result<Self, HoardError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("bacteria-hoard/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HoardError::SourceHttp(err.to_string()))?,
        );

        // Archives run to tens of gigabytes; only the connect phase is bounded.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|err| HoardError::SourceHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn send_with_retries(&self, url: &str) -> Result<Response, HoardError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(url, status, attempt, "retrying archive source request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(url, attempt, error = %err, "retrying archive source request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(HoardError::SourceHttp(format!("{url}: {err}")));
                }
            }
        }
    }

    fn checked(&self, path: &str) -> Result<Response, HoardError> {
        let response = self.send_with_retries(&self.url(path))?;
        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND {
            return Err(HoardError::SourceMissing {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            return Err(HoardError::SourceStatus {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        Ok(response)
    }
}

impl ArchiveSource for HttpArchiveSource {
    fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>, HoardError> {
        let dir = format!("{}/", dir.trim_end_matches('/'));
        let response = self.checked(&dir)?;
        let body = response
            .text()
            .map_err(|err| HoardError::SourceHttp(err.to_string()))?;
        parse_listing(&body)
    }

    /// A body that breaks off mid-transfer is fetched again from the start,
    /// truncating `destination`, up to `MAX_RETRIES` times.
    fn retrieve(&self, path: &str, destination: &Path) -> Result<u64, HoardError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            let mut response = self.checked(path)?;
            let mut file = File::create(destination).map_err(|err| {
                HoardError::Filesystem(format!("create {}: {err}", destination.display()))
            })?;
            match std::io::copy(&mut response, &mut file) {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt < MAX_RETRIES => {
                    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                    tracing::warn!(path, attempt, error = %err, "transfer interrupted, restarting");
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                }
                // Still a connectivity failure, not a local one.
                Err(err) => return Err(HoardError::SourceHttp(format!("{path}: {err}"))),
            }
        }
    }
}

/// Parses an HTML directory index into entries. Sort links and the parent
/// link are dropped; a trailing slash marks a directory.
pub fn parse_listing(body: &str) -> Result<Vec<RemoteEntry>, HoardError> {
    let pattern = Regex::new(
        r#"<a href="([^"?]+)">[^<]*</a>\s*(?:\d{4}-\d{2}-\d{2} \d{2}:\d{2}\s+([0-9.]+[KMGTP]?|-))?"#,
    )
    .map_err(|err| HoardError::SourceHttp(err.to_string()))?;

    let mut entries = Vec::new();
    for caps in pattern.captures_iter(body) {
        let href = &caps[1];
        if href.starts_with('/') || href.starts_with("..") || href.contains("://") {
            continue;
        }
        let (name, kind) = match href.strip_suffix('/') {
            Some(dir) => (dir, EntryKind::Directory),
            None => (href, EntryKind::File),
        };
        let size = caps
            .get(2)
            .map(|m| m.as_str())
            .filter(|value| *value != "-")
            .map(str::to_string);
        entries.push(RemoteEntry {
            name: name.to_string(),
            kind,
            size,
        });
    }
    Ok(entries)
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub(crate) fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const INDEX: &str = r#"<html><body><pre>
<a href="?C=N;O=D">Name</a>  <a href="?C=M;O=A">Last modified</a>
<a href="/pub/databases/AllTheBacteria/Releases/">Parent Directory</a>                             -
<a href="assembly/">assembly/</a>              2024-03-01 10:12    -
<a href="README.md">README.md</a>              2024-03-01 10:12  4.1K
<a href="escherichia_coli__00.asm.tar.xz">escherichia_coli__00.asm.tar.xz</a> 2024-03-01 10:12  1.2G
</pre></body></html>"#;

    #[test]
    fn listing_entries() {
        let entries = parse_listing(INDEX).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "assembly");
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[1].name, "README.md");
        assert_eq!(entries[1].kind, EntryKind::File);
        assert_eq!(entries[1].size.as_deref(), Some("4.1K"));
        assert_eq!(entries[2].size.as_deref(), Some("1.2G"));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
    }

    fn read_request_head(stream: &mut TcpStream) {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|window| window == b"\r\n\r\n") {
            let read = stream.read(&mut buf).unwrap();
            if read == 0 {
                break;
            }
            head.extend_from_slice(&buf[..read]);
        }
    }

    #[test]
    fn interrupted_body_is_fetched_again() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let served = Arc::clone(&connections);
        let server = thread::spawn(move || {
            let payload = vec![b'x'; 1000];
            for stream in listener.incoming().take(2) {
                let mut stream = stream.unwrap();
                read_request_head(&mut stream);
                let first = served.fetch_add(1, Ordering::SeqCst) == 0;
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\n")
                    .unwrap();
                let body = if first { &payload[..10] } else { &payload[..] };
                stream.write_all(body).unwrap();
                stream.flush().unwrap();
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("escherichia_coli__00.asm.tar.xz");
        let source = HttpArchiveSource::new(&format!("http://{addr}")).unwrap();
        let bytes = source
            .retrieve("assembly/escherichia_coli__00.asm.tar.xz", &destination)
            .unwrap();
        server.join().unwrap();

        assert_eq!(bytes, 1000);
        assert_eq!(std::fs::metadata(&destination).unwrap().len(), 1000);
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }
}
