//! Source archive retrieval.
//!
//! The pipeline only needs `GET(url) -> bytes`; [`Transport`] is that seam.
//! [`HttpTransport`] is the production implementation (reqwest for
//! `http(s)://`, plain file reads for `file://` and bare paths). Tests plug in
//! an in-memory transport.

use crate::manifest::Source;
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("failed to fetch {url}: {reason}")]
    TransportFailure { url: String, reason: String },
}

impl FetchError {
    /// Only transport failures are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::TransportFailure { .. })
    }
}

/// Upper bound on buffer preallocation from an untrusted `Content-Length`
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Retrieves the bytes behind a URL
pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// reqwest-backed transport with an optional download bar
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    show_progress: bool,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("keg/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            show_progress: std::io::stderr().is_terminal(),
        })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    async fn get_http(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let failure = |reason: String| FetchError::TransportFailure {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failure(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(failure(format!("HTTP {}", status)));
        }

        let pb = self.show_progress.then(|| {
            let pb = ProgressBar::new(response.content_length().unwrap_or(0));
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb.set_message(format!("⬇ {}", file_name(url)));
            pb
        });

        let capacity = response
            .content_length()
            .unwrap_or(0)
            .min(MAX_PREALLOCATION);
        let mut body = Vec::with_capacity(capacity as usize);
        while let Some(chunk) = response.chunk().await.map_err(|e| failure(e.to_string()))? {
            body.extend_from_slice(&chunk);
            if let Some(pb) = &pb {
                pb.set_position(body.len() as u64);
            }
        }

        if let Some(pb) = &pb {
            pb.finish_and_clear();
        }

        debug!("Downloaded {} bytes from {}", body.len(), url);
        Ok(body)
    }
}

impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        match local_path(url) {
            Some(path) => tokio::fs::read(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FetchError::NotFound(url.to_string())
                } else {
                    FetchError::TransportFailure {
                        url: url.to_string(),
                        reason: e.to_string(),
                    }
                }
            }),
            None => self.get_http(url).await,
        }
    }
}

/// `file://` URLs and scheme-less strings name local files
fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if url.contains("://") {
        None
    } else {
        Some(PathBuf::from(url))
    }
}

fn file_name(url: &str) -> &str {
    url.rsplit('/').find(|s| !s.is_empty()).unwrap_or(url)
}

/// The URL actually requested for a source.
///
/// A GitHub `.git` head locator is fetched as its `HEAD` snapshot tarball.
pub fn source_url(source: &Source) -> String {
    match source {
        Source::Release { url, .. } => url.clone(),
        Source::Head { url } => github_head_archive(url).unwrap_or_else(|| url.clone()),
    }
}

fn github_head_archive(url: &str) -> Option<String> {
    let repo = url
        .strip_prefix("https://github.com/")?
        .strip_suffix(".git")?;
    let mut parts = repo.split('/');
    let (owner, name) = (parts.next()?, parts.next()?);
    if owner.is_empty() || name.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(format!("https://github.com/{owner}/{name}/archive/HEAD.tar.gz"))
}

/// Fetch with bounded retries for transient failures.
///
/// Every retry is a fresh request; `NotFound` is returned immediately.
pub async fn fetch_with_retry<T: Transport>(
    transport: &T,
    url: &str,
    retries: u32,
    backoff: Duration,
) -> Result<Vec<u8>, FetchError> {
    let mut attempt = 0;
    loop {
        match transport.get(url).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                warn!("{} (retry {} of {})", e, attempt, retries);
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with a transport error a fixed number of times, then succeeds
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Transport for Flaky {
        async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if url.ends_with("missing") {
                return Err(FetchError::NotFound(url.to_string()));
            }
            if call < self.failures {
                Err(FetchError::TransportFailure {
                    url: url.to_string(),
                    reason: "connection reset".to_string(),
                })
            } else {
                Ok(b"archive".to_vec())
            }
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn test_retry_refetches_until_success() {
        let t = flaky(2);
        let bytes = fetch_with_retry(&t, "https://x/a.tar.gz", 2, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(bytes, b"archive");
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let t = flaky(5);
        let err = fetch_with_retry(&t, "https://x/a.tar.gz", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let t = flaky(0);
        let err = fetch_with_retry(&t, "https://x/missing", 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::NotFound("https://x/missing".into()));
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_file_transport() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        std::fs::write(&path, b"bytes").unwrap();

        let transport = HttpTransport::new().unwrap().with_progress(false);
        let url = format!("file://{}", path.display());
        assert_eq!(transport.get(&url).await.unwrap(), b"bytes");

        let missing = format!("file://{}", dir.path().join("nope").display());
        assert!(matches!(
            transport.get(&missing).await,
            Err(FetchError::NotFound(_))
        ));
    }

    /// Serve one canned HTTP response on a loopback port
    async fn serve_once(response: &'static [u8]) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket.write_all(response).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}/tfswitch.tar.gz", addr)
    }

    #[tokio::test]
    async fn test_oversized_content_length_is_a_transport_failure() {
        let url =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 4611686018427387904\r\n\r\nabc")
                .await;
        let transport = HttpTransport::new().unwrap().with_progress(false);

        let err = transport.get(&url).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn test_http_not_found() {
        let url = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await;
        let transport = HttpTransport::new().unwrap().with_progress(false);

        assert_eq!(transport.get(&url).await, Err(FetchError::NotFound(url.clone())));
    }

    #[test]
    fn test_github_head_rewrite() {
        let head = Source::Head {
            url: "https://github.com/warrensbox/terraform-switcher.git".into(),
        };
        assert_eq!(
            source_url(&head),
            "https://github.com/warrensbox/terraform-switcher/archive/HEAD.tar.gz"
        );

        let other = Source::Head {
            url: "https://example.com/snapshots/latest.tar.gz".into(),
        };
        assert_eq!(source_url(&other), "https://example.com/snapshots/latest.tar.gz");

        let release = Source::Release {
            url: "https://github.com/o/r/archive/1.0.tar.gz".into(),
            checksum: "00".into(),
        };
        assert_eq!(source_url(&release), "https://github.com/o/r/archive/1.0.tar.gz");
    }
}
