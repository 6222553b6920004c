/// Repairs a proxied path into an absolute URL.
///
/// Intermediaries commonly collapse `//` into `/`, so `https:/host` and `http:/host` get their
/// missing slash back. Inputs with no scheme at all are assumed to be HTTPS.
pub fn fix_url(url: &str) -> String {
    if url.starts_with("https://") || url.starts_with("http://") {
        return url.to_string();
    }
    if let Some(rest) = url.strip_prefix("https:/") {
        return format!("https://{rest}");
    }
    if let Some(rest) = url.strip_prefix("http:/") {
        return format!("http://{rest}");
    }
    format!("https://{url}")
}
