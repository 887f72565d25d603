use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::RuntimeError;
use crate::vfs::VirtFs;

/// Where the engine leaves the response for the runtime to pick up.
pub const STDOUT_PATH: &str = "/tmp/stdout";
pub const STDERR_PATH: &str = "/tmp/stderr";
pub const HEADERS_PATH: &str = "/tmp/headers.json";

/// Structured response extracted after one interpreter run.
///
/// Header names are lowercased; values keep their multiplicity (several
/// `set-cookie` lines stay several entries).
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
    /// Captured error stream, useful for diagnostics.
    pub errors: String,
    pub exit_code: i32,
}

impl Response {
    pub fn with_status(status: u16, headers: BTreeMap<String, Vec<String>>, body: &str) -> Self {
        Self {
            status,
            headers,
            body: body.as_bytes().to_vec(),
            errors: String::new(),
            exit_code: 0,
        }
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Deserialize)]
struct HeadersFile {
    status: u16,
    headers: Vec<String>,
}

/// Reads the response the engine left in the instance filesystem.
pub(crate) fn extract_response(fs: &VirtFs, exit_code: i32) -> Result<Response, RuntimeError> {
    if !fs.exists(HEADERS_PATH) {
        return Err(RuntimeError::Protocol(
            "could not find the response headers file".to_string(),
        ));
    }
    let raw = fs.read_to_string(HEADERS_PATH)?;
    let parsed: HeadersFile = serde_json::from_str(&raw)
        .map_err(|err| RuntimeError::Protocol(format!("malformed response headers file: {err}")))?;

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in &parsed.headers {
        let Some(idx) = line.find(": ") else {
            continue;
        };
        let name = line[..idx].to_ascii_lowercase();
        let value = line[idx + 2..].to_string();
        headers.entry(name).or_default().push(value);
    }

    Ok(Response {
        status: parsed.status,
        headers,
        body: fs.read(STDOUT_PATH)?,
        errors: fs.read_to_string(STDERR_PATH)?,
        exit_code,
    })
}
