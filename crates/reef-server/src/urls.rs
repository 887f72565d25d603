use url::Url;

/// Base used to resolve relative request URLs.
pub const DEFAULT_BASE_URL: &str = "http://example.com";

/// Parses a request URL, dropping any fragment (it is not meant for the
/// server). Relative URLs resolve against [`DEFAULT_BASE_URL`].
pub fn parse_request_url(raw: &str) -> Result<Url, url::ParseError> {
    let raw = raw.split('#').next().unwrap_or("");
    if raw.starts_with("http://") || raw.starts_with("https://") {
        Url::parse(raw)
    } else {
        Url::parse(DEFAULT_BASE_URL)?.join(raw)
    }
}

/// Decodes percent-escapes. Invalid escapes pass through unchanged; the
/// result is interpreted as UTF-8 lossily.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = bytes.get(i + 1..i + 3) {
                if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(hex).unwrap_or(""), 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Strips `prefix` from the front of `path` when present.
pub fn remove_path_prefix(path: &str, prefix: &str) -> String {
    if prefix.is_empty() || !path.starts_with(prefix) {
        return path.to_string();
    }
    path[prefix.len()..].to_string()
}

/// Prepends `prefix` to `path` unless it is already there.
pub fn ensure_path_prefix(path: &str, prefix: &str) -> String {
    if prefix.is_empty() || path.starts_with(prefix) {
        return path.to_string();
    }
    format!("{prefix}{path}")
}

/// Path plus query string of a URL, without scheme and authority.
pub fn to_relative_url(url: &Url) -> String {
    match url.query() {
        Some(query) if !query.is_empty() => format!("{}?{}", url.path(), query),
        _ => url.path().to_string(),
    }
}

/// Joins a root directory and a server path without doubling separators.
pub fn join_paths(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        if root.is_empty() {
            "/".to_string()
        } else {
            root.to_string()
        }
    } else {
        format!("{root}/{path}")
    }
}
