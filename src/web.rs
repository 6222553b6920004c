//! Landing page and bundled static assets.

const INDEX_HTML: &str = include_str!("../assets/index.html");
const SCRIPT_JS: &str = include_str!("../assets/script.js");

#[derive(Debug, Clone, Copy)]
pub struct Asset {
    pub content_type: &'static str,
    pub body: &'static [u8],
}

pub fn index_page() -> Asset {
    Asset {
        content_type: "text/html; charset=utf-8",
        body: INDEX_HTML.as_bytes(),
    }
}

/// Looks up a file served under `/static/`.
pub fn static_asset(name: &str) -> Option<Asset> {
    match name {
        "script.js" => Some(Asset {
            content_type: "application/javascript; charset=utf-8",
            body: SCRIPT_JS.as_bytes(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_references_script() {
        let page = std::str::from_utf8(index_page().body).unwrap();
        assert!(page.contains("/static/script.js"));
    }

    #[test]
    fn unknown_assets_are_missing() {
        assert!(static_asset("script.js").is_some());
        assert!(static_asset("../Cargo.toml").is_none());
        assert!(static_asset("").is_none());
    }
}
