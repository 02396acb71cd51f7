// kiln-net/src/router.rs
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_common::error::Result;
use kiln_common::SourceTransport;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::file::FileTransport;
use crate::http::HttpTransport;
use crate::validation::validate_url;

/// Dispatches on URL scheme after validating it.
#[derive(Clone)]
pub struct TransportRouter {
    http: Arc<dyn SourceTransport>,
    file: Arc<dyn SourceTransport>,
    allow_http: bool,
}

impl TransportRouter {
    pub fn new(allow_http: bool) -> Result<Self> {
        Ok(Self {
            http: Arc::new(HttpTransport::new()?),
            file: Arc::new(FileTransport),
            allow_http,
        })
    }

    /// Replace the network transport, e.g. with an authenticated client.
    pub fn with_http(mut self, http: Arc<dyn SourceTransport>) -> Self {
        self.http = http;
        self
    }

    fn pick(&self, url: &Url) -> &Arc<dyn SourceTransport> {
        match url.scheme() {
            "file" => &self.file,
            _ => &self.http,
        }
    }
}

#[async_trait]
impl SourceTransport for TransportRouter {
    async fn download(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
        let parsed = validate_url(url, self.allow_http)?;
        self.pick(&parsed).download(url, dest, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use kiln_common::KilnError;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn refuses_plain_http_by_default() {
        let dir = TempDir::new().unwrap();
        let router = TransportRouter::new(false).unwrap();
        let err = router
            .download(
                "http://127.0.0.1:9/x.tar.gz",
                &dir.path().join("x"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Fetch { transient: false, .. }));
        assert!(!dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn routes_file_urls_locally() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, "a").unwrap();
        let router = TransportRouter::new(false).unwrap();
        let url = Url::from_file_path(&src).unwrap();
        let n = router
            .download(url.as_str(), &dir.path().join("b"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 1);
    }
}
