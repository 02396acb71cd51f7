pub mod definition;
pub mod resolver;

pub use definition::{Dependency, DependencyExt, DependencyKind, DependencyTag};
pub use resolver::{resolve, resolve_all, ResolveOptions, ResolvedGraph, ResolvedNode};
