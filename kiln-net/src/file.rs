// kiln-net/src/file.rs
use std::path::Path;

use async_trait::async_trait;
use kiln_common::error::{KilnError, Result};
use kiln_common::SourceTransport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

const COPY_CHUNK: usize = 64 * 1024;

/// Copies sources referenced by `file://` URLs. Used for local mirrors and
/// vendored tarballs.
#[derive(Debug, Default, Clone)]
pub struct FileTransport;

#[async_trait]
impl SourceTransport for FileTransport {
    async fn download(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
        let source = Url::parse(url)
            .ok()
            .filter(|u| u.scheme() == "file")
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| KilnError::Fetch {
                url: url.to_string(),
                transient: false,
                reason: "not a local file URL".to_string(),
            })?;
        debug!("Copying local source {} -> {}", source.display(), dest.display());

        let mut input = tokio::fs::File::open(&source).await.map_err(|e| KilnError::Fetch {
            url: url.to_string(),
            transient: false,
            reason: format!("cannot open {}: {e}", source.display()),
        })?;
        let mut output = tokio::fs::File::create(dest).await?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut written = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(KilnError::Cancelled);
            }
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            output.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        output.flush().await?;
        output.sync_all().await?;
        Ok(written)
    }
}
