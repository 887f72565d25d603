use std::collections::BTreeMap;

/// An uploaded file to be registered with the interpreter for one request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub key: String,
    pub name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

/// Options for one interpreter invocation. The dispatcher fills these in
/// from the incoming request; header names must already be lowercased.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub script_path: String,
    pub relative_uri: String,
    /// `http` or `https`.
    pub protocol: String,
    /// Empty means "no explicit method": GET unless a body, form data, or
    /// uploaded files forced POST upstream.
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub files: Vec<UploadedFile>,
    pub server_entries: BTreeMap<String, String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            script_path: String::new(),
            relative_uri: "/".to_string(),
            protocol: "http".to_string(),
            method: String::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
            files: Vec::new(),
            server_entries: BTreeMap::new(),
        }
    }
}

/// A registered upload, already written into the instance filesystem.
#[derive(Debug, Clone)]
pub struct BoundUpload {
    pub key: String,
    pub name: String,
    pub mime: String,
    pub tmp_path: String,
    pub size: usize,
}

/// Interpreter-visible request state, bound to an instance for the
/// duration of exactly one run. The concurrency gate guarantees a single
/// binding at a time.
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    pub script_path: String,
    pub relative_uri: String,
    pub query_string: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub body: Vec<u8>,
    pub uploads: Vec<BoundUpload>,
    pub server_entries: BTreeMap<String, String>,
}
