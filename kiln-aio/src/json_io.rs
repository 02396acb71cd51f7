// kiln-aio/src/json_io.rs
use std::path::Path;

use kiln_common::error::{KilnError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::fs::atomic_write_file;

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("Reading JSON from {}", path.display());
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        KilnError::Generic(format!("Failed to parse JSON in {}: {e}", path.display()))
    })
}

/// Serialises `value` as pretty JSON and writes it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_file(path, &bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn writes_then_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("value.json");
        let value = BTreeMap::from([("name".to_string(), "guise".to_string())]);
        write_json_atomic(&path, &value).unwrap();
        let back: BTreeMap<String, String> = read_json(&path).unwrap();
        assert_eq!(back, value);
    }
}
