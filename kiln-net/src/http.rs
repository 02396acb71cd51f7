// kiln-net/src/http.rs
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kiln_common::error::{KilnError, Result};
use kiln_common::SourceTransport;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const MAX_REDIRECTS: usize = 10;
const USER_AGENT_STRING: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"), " (formula builder)");

/// Streams `http(s)://` sources to disk.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
        })
    }
}

fn build_http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .build()
        .map_err(|e| KilnError::Generic(format!("Failed to build HTTP client: {e}")))
}

/// Server errors and throttling may clear up; other statuses will not.
pub fn status_is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn request_error(url: &str, e: &reqwest::Error) -> KilnError {
    let transient = e.is_timeout() || e.is_connect() || e.is_body() || e.is_request();
    KilnError::Fetch {
        url: url.to_string(),
        transient,
        reason: e.to_string(),
    }
}

#[async_trait]
impl SourceTransport for HttpTransport {
    async fn download(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
        debug!("GET {}", url);
        let response = tokio::select! {
            r = self.client.get(url).send() => r.map_err(|e| {
                debug!("HTTP request failed for {url}: {e}");
                request_error(url, &e)
            })?,
            _ = cancel.cancelled() => return Err(KilnError::Cancelled),
        };

        let status = response.status();
        debug!("Received HTTP status: {} for {}", status, url);
        if !status.is_success() {
            error!("HTTP error {} for URL {}", status, url);
            return Err(KilnError::Fetch {
                url: url.to_string(),
                transient: status_is_transient(status),
                reason: match status {
                    StatusCode::NOT_FOUND => "resource not found (404)".to_string(),
                    StatusCode::FORBIDDEN => "access forbidden (403)".to_string(),
                    other => format!("HTTP status {other}"),
                },
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                c = stream.next() => c,
                _ = cancel.cancelled() => return Err(KilnError::Cancelled),
            };
            match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                }
                Some(Err(e)) => return Err(request_error(url, &e)),
                None => break,
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        debug!("Downloaded {} bytes from {} to {}", written, url, dest.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    /// Serves exactly one canned response on a loopback port.
    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(body).await.unwrap();
            sock.shutdown().await.unwrap();
        });
        format!("http://{addr}/guise-0.1.0.tar.gz")
    }

    #[tokio::test]
    async fn streams_body_to_disk() {
        let url = serve_once("200 OK", b"tarball bytes").await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out");
        let n = HttpTransport::new()
            .unwrap()
            .download(&url, &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 13);
        assert_eq!(std::fs::read(&dest).unwrap(), b"tarball bytes");
    }

    #[tokio::test]
    async fn classifies_failures() {
        let dir = TempDir::new().unwrap();
        let transport = HttpTransport::new().unwrap();

        let url = serve_once("503 Service Unavailable", b"").await;
        let err = transport
            .download(&url, &dir.path().join("a"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let url = serve_once("404 Not Found", b"").await;
        let err = transport
            .download(&url, &dir.path().join("b"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.exit_code(), 4);
    }
}
