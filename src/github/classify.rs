use once_cell::sync::Lazy;
use regex::Regex;

use super::Identity;

/// Shapes of GitHub URLs the proxy will serve, in match priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// `github.com/{owner}/{repo}/releases/...` and `/archive/...`
    Release,
    /// `github.com/{owner}/{repo}/blob/...` and `/raw/...`
    Blob,
    /// Smart-HTTP git endpoints: `info/refs`, `git-upload-pack`, `git-receive-pack`.
    GitProtocol,
    /// `raw.githubusercontent.com/{owner}/{repo}/{ref}/{path}`
    RawContent,
    /// `gist.githubusercontent.com/{owner}/{id}/...`
    Gist,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Release => "release",
            ResourceKind::Blob => "blob",
            ResourceKind::GitProtocol => "git",
            ResourceKind::RawContent => "raw",
            ResourceKind::Gist => "gist",
        }
    }
}

const GITHUB_PATTERNS: [(ResourceKind, &str); 5] = [
    (
        ResourceKind::Release,
        r"^(?:https?://)?github\.com/(?P<owner>.+?)/(?P<repo>.+?)/(?:releases|archive)/.*$",
    ),
    (
        ResourceKind::Blob,
        r"^(?:https?://)?github\.com/(?P<owner>.+?)/(?P<repo>.+?)/(?:blob|raw)/.*$",
    ),
    (
        ResourceKind::GitProtocol,
        r"^(?:https?://)?github\.com/(?P<owner>.+?)/(?P<repo>.+?)/(?:info|git-).*$",
    ),
    (
        ResourceKind::RawContent,
        r"^(?:https?://)?raw\.(?:githubusercontent|github)\.com/(?P<owner>.+?)/(?P<repo>.+?)/.+?/.+$",
    ),
    (
        ResourceKind::Gist,
        r"^(?:https?://)?gist\.(?:githubusercontent|github)\.com/(?P<owner>.+?)/(?P<repo>.+?)/.+$",
    ),
];

static GITHUB: Lazy<Classifier> = Lazy::new(|| {
    let patterns = GITHUB_PATTERNS
        .iter()
        .map(|(kind, pattern)| {
            ResourcePattern::new(*kind, pattern).expect("built-in resource pattern compiles")
        })
        .collect();
    Classifier::new(patterns)
});

/// One recognized URL shape. The regex must name `owner` and `repo` capture groups.
#[derive(Debug, Clone)]
pub struct ResourcePattern {
    kind: ResourceKind,
    regex: Regex,
}

impl ResourcePattern {
    pub fn new(kind: ResourceKind, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            kind,
            regex: Regex::new(pattern)?,
        })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_match(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    fn identity(&self, url: &str) -> Option<Identity> {
        let captures = self.regex.captures(url)?;
        let owner = captures.name("owner")?.as_str();
        let repo = captures.name("repo")?.as_str();
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        Some(Identity::new(owner, repo))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ResourceKind,
    pub identity: Identity,
}

/// Ordered pattern table; the first pattern that matches decides the classification.
#[derive(Debug, Clone)]
pub struct Classifier {
    patterns: Vec<ResourcePattern>,
}

impl Classifier {
    pub fn new(patterns: Vec<ResourcePattern>) -> Self {
        Self { patterns }
    }

    /// The built-in GitHub table.
    pub fn github() -> &'static Classifier {
        &GITHUB
    }

    pub fn classify(&self, url: &str) -> Option<Classification> {
        self.patterns.iter().find_map(|pattern| {
            pattern.identity(url).map(|identity| Classification {
                kind: pattern.kind(),
                identity,
            })
        })
    }

    /// Whether the pattern registered for `kind` matches, regardless of priority.
    pub fn matches_kind(&self, kind: ResourceKind, url: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.kind() == kind && pattern.is_match(url))
    }
}
