use std::fmt;
use std::sync::Arc;

/// One line of a rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEntry {
    /// `owner`: every repository of that owner.
    Owner(Arc<str>),
    /// `owner/repo`: exactly one repository.
    Repo { owner: Arc<str>, repo: Arc<str> },
    /// `*/repo`: that repository name under any owner.
    AnyOwnerRepo { repo: Arc<str> },
}

impl RuleEntry {
    /// Builds an entry from trimmed `/`-separated parts. Returns `None` for an empty owner
    /// part; parts past the second are ignored.
    pub fn from_parts(parts: &[&str]) -> Option<Self> {
        let owner = parts.first().copied().filter(|owner| !owner.is_empty())?;
        match parts.get(1) {
            None => Some(RuleEntry::Owner(Arc::from(owner))),
            Some(repo) if owner == "*" => Some(RuleEntry::AnyOwnerRepo {
                repo: Arc::from(*repo),
            }),
            Some(repo) => Some(RuleEntry::Repo {
                owner: Arc::from(owner),
                repo: Arc::from(*repo),
            }),
        }
    }
}

impl fmt::Display for RuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleEntry::Owner(owner) => write!(f, "{owner}"),
            RuleEntry::Repo { owner, repo } => write!(f, "{owner}/{repo}"),
            RuleEntry::AnyOwnerRepo { repo } => write!(f, "*/{repo}"),
        }
    }
}

/// Ordered, immutable collection of rule entries. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct RuleList {
    entries: Arc<[RuleEntry]>,
}

impl RuleList {
    pub fn new(entries: Vec<RuleEntry>) -> Self {
        Self {
            entries: Arc::from(entries.into_boxed_slice()),
        }
    }

    pub fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
