use reef_vm::UploadedFile;

use crate::headers::Headers;

/// Body of a logical request: raw bytes, or form fields the dispatcher
/// multipart-encodes before handing them to the interpreter.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Bytes(Vec<u8>),
    Form(Vec<(String, String)>),
}

/// A logical HTTP request handed to the dispatcher. `url` may be
/// absolute or relative; a missing method defaults to GET unless a body,
/// form data, or uploaded files force POST.
#[derive(Debug, Clone, Default)]
pub struct ServerRequest {
    pub url: String,
    pub method: Option<String>,
    pub headers: Headers,
    pub body: Option<RequestBody>,
    pub files: Vec<UploadedFile>,
}

impl ServerRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}
