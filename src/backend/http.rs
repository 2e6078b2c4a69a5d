//! Remote backend over HTTP
//!
//! Pack files live at `<base_url>/<store>/<pack>.<ext>`. Sizes come from
//! `HEAD`, ranges from `GET` with a `Range` header. The pack list is the
//! newline-separated `<base_url>/<store>/packs.list` manifest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use super::{check_range, PackBackend, PackChannel};
use crate::cache::key::{PackExt, PackIdentity};
use crate::error::{Error, Result};

/// Name of the per-store pack manifest
pub const PACK_MANIFEST: &str = "packs.list";

/// HTTP backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    /// Base URL, without trailing slash
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

struct Remote {
    config: HttpBackendConfig,
    client: Client,
}

impl Remote {
    fn url(&self, store: &str, file: &str) -> String {
        format!("{}/{}/{}", self.config.base_url.trim_end_matches('/'), store, file)
    }
}

/// Packs served by an HTTP object store
pub struct HttpBackend {
    remote: Arc<Remote>,
}

impl HttpBackend {
    /// Create a new HTTP backend
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            remote: Arc::new(Remote { config, client }),
        })
    }

    /// URL of one pack file
    pub fn file_url(&self, pack: &PackIdentity, ext: PackExt) -> String {
        self.remote.url(pack.store_id(), &ext.file_name(pack))
    }
}

#[async_trait]
impl PackBackend for HttpBackend {
    #[instrument(skip_all, fields(pack = %pack, ext = %ext))]
    async fn open(&self, pack: &PackIdentity, ext: PackExt) -> Result<Option<Arc<dyn PackChannel>>> {
        let url = self.file_url(pack, ext);
        let response = self.remote.client.head(&url).send().await.map_err(|e| {
            error!(%url, "HEAD request failed: {}", e);
            Error::BackendIo {
                pack: format!("{}.{}", pack, ext),
                offset: 0,
                length: 0,
                reason: e.to_string(),
            }
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::BackendIo {
                pack: format!("{}.{}", pack, ext),
                offset: 0,
                length: 0,
                reason: format!("HEAD failed with status {}", response.status()),
            });
        }

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::BackendIo {
                pack: format!("{}.{}", pack, ext),
                offset: 0,
                length: 0,
                reason: "HEAD response has no Content-Length".into(),
            })?;

        debug!(%url, size, "opened remote pack file");
        Ok(Some(Arc::new(HttpChannel {
            remote: Arc::clone(&self.remote),
            pack: pack.clone(),
            ext,
            url,
            size,
        })))
    }

    async fn list_packs(&self, store_id: &str) -> Result<Vec<PackIdentity>> {
        let url = self.remote.url(store_id, PACK_MANIFEST);
        let io_error = |reason: String| Error::BackendIo {
            pack: format!("{}/{}", store_id, PACK_MANIFEST),
            offset: 0,
            length: 0,
            reason,
        };
        let response = self.remote.client.get(&url).send().await.map_err(|e| {
            error!(%url, "listing request failed: {}", e);
            io_error(e.to_string())
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(io_error(format!("listing failed with status {}", response.status())));
        }

        let body = response.text().await.map_err(|e| io_error(e.to_string()))?;
        let mut packs: Vec<PackIdentity> = body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|name| PackIdentity::new(store_id, name))
            .collect();
        packs.sort_by(|a, b| a.pack_name().cmp(b.pack_name()));
        packs.dedup();
        Ok(packs)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

struct HttpChannel {
    remote: Arc<Remote>,
    pack: PackIdentity,
    ext: PackExt,
    url: String,
    size: u64,
}

#[async_trait]
impl PackChannel for HttpChannel {
    async fn read_range(&self, offset: u64, length: u32) -> Result<Bytes> {
        check_range(&self.pack, self.ext, offset, length, self.size)?;
        if length == 0 {
            return Ok(Bytes::new());
        }

        let io_error = |reason: String| Error::BackendIo {
            pack: format!("{}.{}", self.pack, self.ext),
            offset,
            length: length as u64,
            reason,
        };

        let last = offset + length as u64 - 1;
        let response = self
            .remote
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", offset, last))
            .send()
            .await
            .map_err(|e| {
                error!(url = %self.url, "range request failed: {}", e);
                io_error(e.to_string())
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| io_error(e.to_string()))?;
        let data = match status {
            StatusCode::PARTIAL_CONTENT => body,
            // Server ignored the range header
            StatusCode::OK if body.len() as u64 >= offset + length as u64 => {
                body.slice(offset as usize..(offset + length as u64) as usize)
            }
            _ => return Err(io_error(format!("range request failed with status {}", status))),
        };

        if data.len() != length as usize {
            return Err(io_error(format!(
                "short read: {} of {} bytes",
                data.len(),
                length
            )));
        }
        Ok(data)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const PACK_BODY: &[u8] = b"0123456789abcdefghij";

    /// Minimal HTTP/1.1 server: HEAD and ranged GET of one pack, plus a
    /// manifest. One request per connection.
    async fn serve() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    let request = String::from_utf8_lossy(&buf).to_string();
                    let mut parts = request.split_whitespace();
                    let method = parts.next().unwrap_or("").to_string();
                    let path = parts.next().unwrap_or("").to_string();
                    let range = request.lines().find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower.strip_prefix("range: bytes=").map(|r| r.trim().to_string())
                    });

                    let (status, body): (&str, Vec<u8>) = match path.as_str() {
                        "/repo/pack-a.pack" => match range {
                            Some(r) => {
                                let (a, b) = r.split_once('-').unwrap();
                                let a: usize = a.parse().unwrap();
                                let b: usize = b.parse().unwrap();
                                ("206 Partial Content", PACK_BODY[a..=b].to_vec())
                            }
                            None => ("200 OK", PACK_BODY.to_vec()),
                        },
                        "/repo/packs.list" => ("200 OK", b"pack-b\npack-a\n\n".to_vec()),
                        _ => ("404 Not Found", Vec::new()),
                    };

                    let length = if method == "HEAD" && status.starts_with("200") {
                        PACK_BODY.len()
                    } else {
                        body.len()
                    };
                    let mut response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        status, length
                    )
                    .into_bytes();
                    if method != "HEAD" {
                        response.extend_from_slice(&body);
                    }
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn backend(base_url: String) -> HttpBackend {
        HttpBackend::new(HttpBackendConfig {
            base_url,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_file_url() {
        let backend = backend("http://objects.local/".into());
        let pack = PackIdentity::new("repo", "pack-a");
        assert_eq!(
            backend.file_url(&pack, PackExt::Index),
            "http://objects.local/repo/pack-a.idx"
        );
    }

    #[tokio::test]
    async fn test_ranged_reads() {
        let backend = backend(serve().await);
        let pack = PackIdentity::new("repo", "pack-a");

        let channel = backend.open(&pack, PackExt::Pack).await.unwrap().unwrap();
        assert_eq!(channel.size(), PACK_BODY.len() as u64);
        assert_eq!(channel.read_range(10, 6).await.unwrap().as_ref(), b"abcdef");
        assert_matches!(channel.read_range(18, 4).await, Err(Error::OutOfRange { .. }));

        assert!(backend.open(&pack, PackExt::Bitmap).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manifest_listing() {
        let backend = backend(serve().await);
        let listed = backend.list_packs("repo").await.unwrap();
        assert_eq!(
            listed,
            vec![PackIdentity::new("repo", "pack-a"), PackIdentity::new("repo", "pack-b")]
        );
        assert!(backend.list_packs("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_backend_io() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = backend(format!("http://{}", addr));
        let pack = PackIdentity::new("repo", "pack-a");
        let err = backend.open(&pack, PackExt::Pack).await.err().expect("open must fail");
        assert_matches!(
            err,
            Error::BackendIo { pack: name, offset: 0, .. } if name == "repo/pack-a.pack"
        );
        assert_matches!(
            backend.list_packs("repo").await,
            Err(Error::BackendIo { pack: name, .. }) if name == "repo/packs.list"
        );
    }
}
