use anyhow::{Context, Result, anyhow, bail};
use http::Uri;
use url::form_urlencoded;

/// Request target split into its raw path and raw query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTarget {
    pub path: String,
    pub query: Option<String>,
}

impl InboundTarget {
    /// The path without its leading slash: the URL the client wants proxied.
    pub fn proxied_url(&self) -> &str {
        self.path.strip_prefix('/').unwrap_or(&self.path)
    }

    /// Named query parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

/// Accepts origin-form (`/path?query`) and absolute-form (`http://host/path?query`) targets.
pub fn parse_inbound_target(target: &str) -> Result<InboundTarget> {
    if target.starts_with('/') {
        return Ok(split_path_and_query(target));
    }

    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        bail!("request target must be origin-form (start with '/')");
    }
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;
    let path_and_query = uri
        .path_and_query()
        .ok_or_else(|| anyhow!("request target '{target}' has no path"))?;
    Ok(split_path_and_query(path_and_query.as_str()))
}

fn split_path_and_query(value: &str) -> InboundTarget {
    match value.split_once('?') {
        Some((path, query)) => InboundTarget {
            path: path.to_string(),
            query: Some(query.to_string()),
        },
        None => InboundTarget {
            path: value.to_string(),
            query: None,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRoute<'a> {
    Index,
    /// `/?q=<url>`: bounce the browser to `/<url>`.
    QueryRedirect(String),
    Static(&'a str),
    Proxy,
}

pub fn route(target: &InboundTarget) -> InboundRoute<'_> {
    if target.path == "/" {
        return match target.query_param("q").filter(|q| !q.is_empty()) {
            Some(q) => InboundRoute::QueryRedirect(q),
            None => InboundRoute::Index,
        };
    }
    if let Some(name) = target.path.strip_prefix("/static/") {
        return InboundRoute::Static(name);
    }
    InboundRoute::Proxy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form_keeps_raw_path_and_query() -> Result<()> {
        let target =
            parse_inbound_target("/https://github.com/o/r/info/refs?service=git-upload-pack")?;
        assert_eq!(target.path, "/https://github.com/o/r/info/refs");
        assert_eq!(target.query.as_deref(), Some("service=git-upload-pack"));
        assert_eq!(target.proxied_url(), "https://github.com/o/r/info/refs");
        Ok(())
    }

    #[test]
    fn absolute_form_uses_path() -> Result<()> {
        let target = parse_inbound_target("http://proxy.local:8080/github.com/o/r/archive/x.zip")?;
        assert_eq!(target.path, "/github.com/o/r/archive/x.zip");
        assert_eq!(target.query, None);
        Ok(())
    }

    #[test]
    fn rejects_other_forms() {
        assert!(parse_inbound_target("*").is_err());
        assert!(parse_inbound_target("github.com/o/r").is_err());
    }

    #[test]
    fn routes_index_and_query_redirect() -> Result<()> {
        assert_eq!(route(&parse_inbound_target("/")?), InboundRoute::Index);
        assert_eq!(route(&parse_inbound_target("/?q=")?), InboundRoute::Index);
        assert_eq!(
            route(&parse_inbound_target("/?q=https%3A%2F%2Fgithub.com%2Fo%2Fr")?),
            InboundRoute::QueryRedirect("https://github.com/o/r".to_string())
        );
        Ok(())
    }

    #[test]
    fn routes_static_and_proxy() -> Result<()> {
        let target = parse_inbound_target("/static/script.js")?;
        assert_eq!(route(&target), InboundRoute::Static("script.js"));
        let target = parse_inbound_target("/github.com/o/r/releases/x")?;
        assert_eq!(route(&target), InboundRoute::Proxy);
        Ok(())
    }
}
