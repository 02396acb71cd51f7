// kiln-core/src/install/mod.rs
// Install Transaction: the only code that writes to the cellar and prefix.

pub mod link;
pub mod transaction;

pub use transaction::{active_install, install, InstallOutcome};
