use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{Classifier, ResourceKind};

/// Host and path prefix of the jsDelivr GitHub mirror.
pub const MIRROR_PREFIX: &str = "cdn.jsdelivr.net/gh";

static BLOB_LAYOUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<scheme>(?:https?://)?)github\.com/(?P<owner>.+?)/(?P<repo>.+?)/(?:blob|raw)/(?P<rest>.*)$",
    )
    .expect("blob layout pattern compiles")
});

static RAW_LAYOUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<scheme>(?:https?://)?)raw\.(?:githubusercontent|github)\.com/(?P<owner>.+?)/(?P<repo>.+?)/(?P<rest>.+?/.+)$",
    )
    .expect("raw layout pattern compiles")
});

/// Turns a `github.com/.../blob/...` page URL into the matching raw download URL.
/// Anything else is returned unchanged.
pub fn blob_to_raw(url: &str) -> Cow<'_, str> {
    if Classifier::github().matches_kind(ResourceKind::Blob, url) {
        Cow::Owned(url.replacen("/blob/", "/raw/", 1))
    } else {
        Cow::Borrowed(url)
    }
}

/// Rewrites a blob or raw-content URL to `{scheme}cdn.jsdelivr.net/gh/{owner}/{repo}@{ref}/{path}`.
pub fn to_mirror(url: &str) -> Option<String> {
    let captures = BLOB_LAYOUT
        .captures(url)
        .or_else(|| RAW_LAYOUT.captures(url))?;
    let scheme = captures.name("scheme").map_or("", |m| m.as_str());
    let owner = captures.name("owner")?.as_str();
    let repo = captures.name("repo")?.as_str();
    let rest = captures.name("rest")?.as_str();
    Some(format!("{scheme}{MIRROR_PREFIX}/{owner}/{repo}@{rest}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_becomes_raw() {
        assert_eq!(
            blob_to_raw("https://github.com/octocat/hello/blob/main/README.md"),
            "https://github.com/octocat/hello/raw/main/README.md"
        );
    }

    #[test]
    fn blob_to_raw_replaces_first_occurrence_only() {
        assert_eq!(
            blob_to_raw("https://github.com/octocat/hello/blob/main/blob/x.md"),
            "https://github.com/octocat/hello/raw/main/blob/x.md"
        );
    }

    #[test]
    fn non_blob_urls_pass_through() {
        let url = "https://github.com/octocat/hello/releases/download/v1/a.zip";
        assert!(matches!(blob_to_raw(url), Cow::Borrowed(_)));
        let raw = "https://raw.githubusercontent.com/octocat/hello/main/blob/x";
        assert_eq!(blob_to_raw(raw), raw);
    }

    #[test]
    fn mirror_for_blob() {
        assert_eq!(
            to_mirror("https://github.com/octocat/hello/blob/main/README.md").as_deref(),
            Some("https://cdn.jsdelivr.net/gh/octocat/hello@main/README.md")
        );
    }

    #[test]
    fn mirror_for_raw_link_on_github() {
        assert_eq!(
            to_mirror("https://github.com/octocat/hello/raw/v1.2/dist/app.js").as_deref(),
            Some("https://cdn.jsdelivr.net/gh/octocat/hello@v1.2/dist/app.js")
        );
    }

    #[test]
    fn mirror_for_raw_content_host() {
        assert_eq!(
            to_mirror("https://raw.githubusercontent.com/octocat/hello/main/dir/file.txt")
                .as_deref(),
            Some("https://cdn.jsdelivr.net/gh/octocat/hello@main/dir/file.txt")
        );
        assert_eq!(
            to_mirror("raw.github.com/octocat/hello/main/file.txt").as_deref(),
            Some("cdn.jsdelivr.net/gh/octocat/hello@main/file.txt")
        );
    }

    #[test]
    fn mirror_rejects_other_shapes() {
        assert!(to_mirror("https://github.com/octocat/hello/releases/download/v1/a").is_none());
        assert!(to_mirror("https://gist.githubusercontent.com/octocat/abc/raw/x").is_none());
    }
}
