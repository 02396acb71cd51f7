// kiln-net/src/lib.rs
//! Source transports: how the bytes behind a formula URL reach the disk.
pub mod file;
pub mod http;
pub mod router;
pub mod validation;

pub use file::FileTransport;
pub use http::HttpTransport;
pub use router::TransportRouter;
pub use validation::validate_url;
