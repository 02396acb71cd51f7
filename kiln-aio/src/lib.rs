// kiln-aio/src/lib.rs
//! IO primitives for kiln (filesystem, json, checksums, archives, locks, processes)

pub mod checksum;
pub mod extract;
pub mod fs;
pub mod json_io;
pub mod lock;
pub mod process;

pub use checksum::{digest_matches, sha256_file_async};
pub use extract::{extract_archive, extract_archive_async};
pub use json_io::{read_json, write_json_atomic};
pub use lock::PathLock;
pub use process::{run_captured, CommandOutcome, CommandSpec};
