use derive_more::{AsRef, Display};
use serde::{Deserialize, Serialize};

pub mod build_log;
pub mod build_package;
pub mod build_plan;
pub mod builder;
pub mod changes;
pub mod config;
pub mod cycle;
pub mod dep_graph;
pub mod git;
pub mod nvchecker;
pub mod pacman_repo;
pub mod pkgbuild;
pub mod recipe;
pub mod report;
pub mod state;
pub mod tracing;

/// Canonical package identifier within the repository: the name of the
/// directory holding the package's recipe and PKGBUILD.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, AsRef, Display)]
#[serde(transparent)]
pub struct Pkgbase(String);

impl From<String> for Pkgbase {
    fn from(value: String) -> Self {
        Pkgbase(value)
    }
}

impl From<&str> for Pkgbase {
    fn from(value: &str) -> Self {
        Pkgbase(value.to_string())
    }
}

/// An unambiguous git commit hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, AsRef, Display)]
pub struct CommitHash(pub String);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Maintainer {
    pub name: String,
    pub email: String,
    pub handle: String,
}

impl Maintainer {
    /// RFC-822 style address for use in mail headers and `PACKAGER`.
    pub fn address(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}
