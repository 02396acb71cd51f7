// kiln-core/src/interpreter/mod.rs
pub mod report;
pub mod session;

pub use report::{FormulaRecord, SessionReport};
pub use session::{Plan, Session, SessionOptions};
