//! Recognition and rewriting of GitHub resource URLs.

pub mod classify;
pub mod normalize;
pub mod rewrite;

use std::fmt;

pub use classify::{Classification, Classifier, ResourceKind};
pub use normalize::fix_url;

/// Owner and repository (or gist id) extracted from a recognized URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    owner: String,
    repo: String,
}

impl Identity {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn components(&self) -> [&str; 2] {
        [self.owner.as_str(), self.repo.as_str()]
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}
