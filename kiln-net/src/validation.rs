// kiln-net/src/validation.rs
use kiln_common::error::{KilnError, Result};
use url::Url;

/// Schemes a source URL may use. Plain `http` is refused unless explicitly
/// allowed; the digest still guards content but not the request itself.
pub fn validate_url(url_str: &str, allow_http: bool) -> Result<Url> {
    let url = Url::parse(url_str).map_err(|e| KilnError::Fetch {
        url: url_str.to_string(),
        transient: false,
        reason: format!("invalid URL: {e}"),
    })?;
    match url.scheme() {
        "https" | "file" => Ok(url),
        "http" if allow_http => Ok(url),
        "http" => Err(KilnError::Fetch {
            url: url_str.to_string(),
            transient: false,
            reason: "plain http is disabled (set KILN_ALLOW_HTTP=1 to permit it)".to_string(),
        }),
        other => Err(KilnError::Fetch {
            url: url_str.to_string(),
            transient: false,
            reason: format!("unsupported URL scheme '{other}'"),
        }),
    }
}
