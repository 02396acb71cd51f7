// kiln-common/src/dependency/definition.rs
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DependencyTag: u8 {
        const RUNTIME     = 0b00000001;
        const BUILD       = 0b00000010;
        const OPTIONAL    = 0b00000100;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The `kind` of a dependency as written in a formula file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Build,
    #[default]
    Runtime,
    Optional,
}

impl From<DependencyKind> for DependencyTag {
    fn from(kind: DependencyKind) -> Self {
        match kind {
            DependencyKind::Build => DependencyTag::BUILD,
            DependencyKind::Runtime => DependencyTag::RUNTIME,
            DependencyKind::Optional => DependencyTag::OPTIONAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub tags: DependencyTag,
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: DependencyTag::RUNTIME,
        }
    }

    pub fn new_with_tags(name: impl Into<String>, tags: DependencyTag) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }

    pub fn is_optional(&self) -> bool {
        self.tags.contains(DependencyTag::OPTIONAL)
    }

    pub fn kind_label(&self) -> &'static str {
        if self.tags.contains(DependencyTag::BUILD) && !self.tags.contains(DependencyTag::RUNTIME)
        {
            "build"
        } else if self.is_optional() {
            "optional"
        } else {
            "runtime"
        }
    }
}

pub trait DependencyExt {
    fn filter_by_tags(&self, include: DependencyTag, exclude: DependencyTag) -> Vec<&Dependency>;
    fn runtime(&self) -> Vec<&Dependency>;
    fn build_time(&self) -> Vec<&Dependency>;
}

impl DependencyExt for Vec<Dependency> {
    fn filter_by_tags(&self, include: DependencyTag, exclude: DependencyTag) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| dep.tags.contains(include) && !dep.tags.intersects(exclude))
            .collect()
    }

    fn runtime(&self) -> Vec<&Dependency> {
        // Optional dependencies are linked at runtime when they were included.
        self.iter()
            .filter(|dep| {
                dep.tags
                    .intersects(DependencyTag::RUNTIME | DependencyTag::OPTIONAL)
            })
            .collect()
    }

    fn build_time(&self) -> Vec<&Dependency> {
        self.filter_by_tags(DependencyTag::BUILD, DependencyTag::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_tags() {
        let deps = vec![
            Dependency::new_with_tags("go", DependencyKind::Build.into()),
            Dependency::new_runtime("libfoo"),
            Dependency::new_with_tags("docs", DependencyKind::Optional.into()),
        ];
        let build: Vec<_> = deps.build_time().iter().map(|d| d.name.as_str()).collect();
        let runtime: Vec<_> = deps.runtime().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(build, vec!["go"]);
        assert_eq!(runtime, vec!["libfoo", "docs"]);
        assert_eq!(deps[0].kind_label(), "build");
        assert_eq!(deps[2].kind_label(), "optional");
    }
}
