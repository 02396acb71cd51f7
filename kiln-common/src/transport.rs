// kiln-common/src/transport.rs
use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Moves the bytes behind a source URL onto local disk.
///
/// Implementations write to `dest` (creating or truncating it) and return the
/// number of bytes written. Network-level failures are reported as
/// `KilnError::Fetch` with `transient` set when a retry may succeed. A fired
/// `cancel` token must abort the transfer with `KilnError::Cancelled`.
/// Integrity checking is the caller's job.
#[async_trait]
pub trait SourceTransport: Send + Sync {
    async fn download(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<u64>;
}
