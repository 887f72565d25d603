use std::collections::BTreeMap;

/// Cookie store refreshed from `set-cookie` response headers and replayed
/// as the `cookie` request header on subsequent dispatches. Last write
/// wins per name; cleared only by an explicit reset.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds every `set-cookie` header into the jar. Attributes after the
    /// first `;` are ignored; the jar only replays name/value pairs.
    pub fn remember_from_headers(&mut self, headers: &BTreeMap<String, Vec<String>>) {
        let Some(values) = headers.get("set-cookie") else {
            return;
        };
        for value in values {
            let pair = value.split(';').next().unwrap_or("");
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    self.cookies
                        .insert(name.to_string(), value.trim().to_string());
                }
            }
        }
    }

    /// The accumulated cookies as one `cookie` header value. Empty when
    /// the jar is empty.
    pub fn request_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn reset(&mut self) {
        self.cookies.clear();
    }
}
