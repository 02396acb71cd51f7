// kiln-common/src/model/mod.rs
// Declares the modules within the model directory.
pub mod formula;
pub mod step;
pub mod template;

// Re-export
pub use formula::Formula;
pub use step::Step;
pub use template::{Placeholder, TemplateContext};
