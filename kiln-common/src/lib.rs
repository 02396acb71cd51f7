// kiln-common/src/lib.rs
pub mod cache;
pub mod config;
pub mod dependency;
pub mod error;
pub mod formulary;
pub mod keg;
pub mod model;
pub mod pipeline;
pub mod receipt;
pub mod transport;

// Re-export key types
pub use cache::DownloadCache;
pub use config::Config;
pub use error::{KilnError, Result, Stage};
pub use formulary::Formulary;
pub use keg::{InstalledKeg, KegRegistry};
pub use model::{Formula, Step};
pub use receipt::InstalledReceipt;
pub use transport::SourceTransport;
