// kiln-core/src/build/mod.rs
pub mod env;
pub mod sandbox;

pub use env::{BuildEnvironment, SandboxPaths};
pub use sandbox::{build, BuildResult, DependencyPrefixes, StepLog};
