use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use url::Url;

use reef_vm::{Gate, Response, RunOptions, Runtime, RuntimeError};

use crate::classify::is_dynamic_path;
use crate::cookies::CookieJar;
use crate::headers::Headers;
use crate::mime::content_type_for_path;
use crate::multipart::encode_as_multipart;
use crate::request::{RequestBody, ServerRequest};
use crate::rewrite::{apply_rewrite_rules, RewriteRule};
use crate::urls::{
    ensure_path_prefix, join_paths, parse_request_url, percent_decode, remove_path_prefix,
    to_relative_url, DEFAULT_BASE_URL,
};

/// Header tagging a request as issued by code running inside the
/// interpreter. Combined with an in-flight request it means an
/// unrecoverable deadlock, answered with 502 instead of queueing.
pub const SELF_REQUEST_HEADER: &str = "x-request-issuer";
pub const SELF_REQUEST_ISSUER: &str = "engine";

/// Marker header on a static 404 telling the caller no static file
/// exists and a real network fetch may be attempted instead.
pub const STATIC_MARKER_HEADER: &str = "x-file-type";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Directory in the virtual filesystem the server serves from.
    pub document_root: String,
    /// Absolute URL of this server; populates the synthesized host
    /// header and the derived server state.
    pub base_url: String,
    /// Extension marking dynamic scripts, dot included.
    pub script_ext: String,
    pub rewrite_rules: Vec<RewriteRule>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            document_root: "/www".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            script_ext: ".php".to_string(),
            rewrite_rules: Vec::new(),
        }
    }
}

/// Errors from [`RequestDispatcher::serve`]. `BadUrl` is a caller bug;
/// `Runtime` is an infrastructure fault (a poisoned instance calls for a
/// fresh runtime, not a retry against this one).
#[derive(Debug)]
pub enum ServeError {
    BadUrl { url: String, reason: String },
    Runtime(RuntimeError),
}

impl std::fmt::Display for ServeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServeError::BadUrl { url, reason } => {
                write!(f, "malformed request url {url:?}: {reason}")
            }
            ServeError::Runtime(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ServeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServeError::BadUrl { .. } => None,
            ServeError::Runtime(err) => Some(err),
        }
    }
}

impl From<RuntimeError> for ServeError {
    fn from(err: RuntimeError) -> Self {
        ServeError::Runtime(err)
    }
}

/// Serves logical HTTP requests against one runtime: static files come
/// straight from the virtual filesystem, dynamic paths resolve to a
/// script and run through the interpreter one at a time.
pub struct RequestDispatcher {
    runtime: Arc<Runtime>,
    document_root: String,
    script_ext: String,
    protocol: String,
    host: String,
    pathname: String,
    absolute_url: String,
    rewrite_rules: Vec<RewriteRule>,
    gate: Gate,
    jar: Mutex<CookieJar>,
}

impl RequestDispatcher {
    pub fn new(runtime: Arc<Runtime>, config: DispatcherConfig) -> Result<Self, ServeError> {
        let url = Url::parse(&config.base_url).map_err(|err| ServeError::BadUrl {
            url: config.base_url.clone(),
            reason: err.to_string(),
        })?;
        let protocol = url.scheme().to_string();
        let hostname = url.host_str().unwrap_or("localhost").to_string();
        let port = url
            .port()
            .unwrap_or(if protocol == "https" { 443 } else { 80 });
        let is_nonstandard_port = port != 443 && port != 80;
        let host = if is_nonstandard_port {
            format!("{hostname}:{port}")
        } else {
            hostname
        };
        let pathname = url.path().trim_end_matches('/').to_string();
        let absolute_url = format!("{protocol}://{host}{pathname}");

        Ok(Self {
            runtime,
            document_root: config.document_root,
            script_ext: config.script_ext,
            protocol,
            host,
            pathname,
            absolute_url,
            rewrite_rules: config.rewrite_rules,
            gate: Gate::new(),
            jar: Mutex::new(CookieJar::new()),
        })
    }

    pub fn absolute_url(&self) -> &str {
        &self.absolute_url
    }

    pub fn document_root(&self) -> &str {
        &self.document_root
    }

    /// Whether a request is currently executing against the runtime.
    pub fn is_request_running(&self) -> bool {
        self.gate.running() > 0
    }

    /// Converts a server path to an absolute URL rooted at this server.
    pub fn path_to_internal_url(&self, path: &str) -> String {
        format!("{}{}", self.absolute_url, path)
    }

    /// Converts an absolute URL rooted at this server back to a relative
    /// path without the mount-point prefix.
    pub fn internal_url_to_path(&self, internal_url: &str) -> Result<String, ServeError> {
        let url = Url::parse(internal_url).map_err(|err| ServeError::BadUrl {
            url: internal_url.to_string(),
            reason: err.to_string(),
        })?;
        let path = remove_path_prefix(url.path(), &self.pathname);
        Ok(match url.query() {
            Some(query) if !query.is_empty() => format!("{path}?{query}"),
            _ => path,
        })
    }

    pub fn reset_cookies(&self) {
        lock_jar(&self.jar).reset();
    }

    /// Serves one request: either a static file from the virtual
    /// filesystem, or a dynamic dispatch into the interpreter.
    pub async fn serve(&self, request: ServerRequest) -> Result<Response, ServeError> {
        let requested_url = parse_request_url(&request.url).map_err(|err| ServeError::BadUrl {
            url: request.url.clone(),
            reason: err.to_string(),
        })?;

        let normalized_path = apply_rewrite_rules(
            &remove_path_prefix(&percent_decode(requested_url.path()), &self.pathname),
            &self.rewrite_rules,
        );
        let fs_path = join_paths(&self.document_root, &normalized_path);
        if is_dynamic_path(&fs_path, &self.script_ext) {
            self.dispatch_to_engine(request, &requested_url).await
        } else {
            self.serve_static(&fs_path)
        }
    }

    fn serve_static(&self, fs_path: &str) -> Result<Response, ServeError> {
        let body = match self.runtime.read_file(fs_path) {
            Ok(body) => body,
            Err(RuntimeError::Fs(_)) => {
                // Tell the caller no static file was found; it may fall
                // back to a real network fetch.
                let mut headers = BTreeMap::new();
                headers.insert(
                    STATIC_MARKER_HEADER.to_string(),
                    vec!["static".to_string()],
                );
                return Ok(Response::with_status(404, headers, "404 File not found"));
            }
            Err(other) => return Err(other.into()),
        };

        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        headers.insert(
            "content-length".to_string(),
            vec![body.len().to_string()],
        );
        headers.insert(
            "content-type".to_string(),
            vec![content_type_for_path(fs_path).to_string()],
        );
        headers.insert("accept-ranges".to_string(), vec!["bytes".to_string()]);
        headers.insert(
            "cache-control".to_string(),
            vec!["public, max-age=0".to_string()],
        );
        Ok(Response {
            status: 200,
            headers,
            body,
            errors: String::new(),
            exit_code: 0,
        })
    }

    async fn dispatch_to_engine(
        &self,
        request: ServerRequest,
        requested_url: &Url,
    ) -> Result<Response, ServeError> {
        if self.gate.running() > 0
            && request.headers.get(SELF_REQUEST_HEADER) == Some(SELF_REQUEST_ISSUER)
        {
            tracing::warn!(
                url = %request.url,
                "request issued from inside the interpreter while another request holds \
                 the gate; answering 502 instead of queueing into a deadlock"
            );
            return Ok(Response::with_status(502, BTreeMap::new(), "502 Bad Gateway"));
        }

        let _guard = self.gate.acquire().await;

        let mut preferred_method = "GET";
        let mut headers = Headers::new();
        headers.append("host", &self.host);

        // Jar cookies first, the request's own after: the interpreter's
        // last-occurrence parse lets request-supplied values win.
        let jar_header = lock_jar(&self.jar).request_header();
        if !jar_header.is_empty() {
            headers.append("cookie", jar_header);
        }
        for (name, value) in request.headers.iter() {
            if name.eq_ignore_ascii_case("host") {
                headers.set("host", value);
            } else {
                headers.append(name, value);
            }
        }

        let body = match request.body {
            Some(RequestBody::Form(fields)) => {
                preferred_method = "POST";
                let (bytes, content_type) = encode_as_multipart(&fields, &[]);
                headers.set("content-type", content_type);
                bytes
            }
            Some(RequestBody::Bytes(bytes)) => {
                if !bytes.is_empty() {
                    preferred_method = "POST";
                }
                bytes
            }
            None => Vec::new(),
        };
        if !request.files.is_empty() {
            preferred_method = "POST";
        }

        let Some(script_path) = self.resolve_script_path(&percent_decode(requested_url.path()))
        else {
            return Ok(Response::with_status(
                404,
                BTreeMap::new(),
                "404 File not found",
            ));
        };

        let mut server_entries = BTreeMap::new();
        server_entries.insert("REMOTE_ADDR".to_string(), "127.0.0.1".to_string());
        server_entries.insert("DOCUMENT_ROOT".to_string(), self.document_root.clone());
        if self.absolute_url.starts_with("https://") {
            server_entries.insert("HTTPS".to_string(), "on".to_string());
        }

        let opts = RunOptions {
            script_path,
            relative_uri: ensure_path_prefix(&to_relative_url(requested_url), &self.pathname),
            protocol: self.protocol.clone(),
            method: request
                .method
                .unwrap_or_else(|| preferred_method.to_string()),
            headers: headers.to_request_map(),
            body,
            files: request.files,
            server_entries,
        };

        let response = self.runtime.run(opts).await?;
        lock_jar(&self.jar).remember_from_headers(&response.headers);
        Ok(response)
    }

    /// Resolves the requested path to the script file to run: truncate at
    /// the script extension when present, use the directory index script
    /// for directories, fall back to the root index script otherwise.
    /// `None` when the resolved file does not exist.
    fn resolve_script_path(&self, requested_path: &str) -> Option<String> {
        let mut path = apply_rewrite_rules(
            &remove_path_prefix(requested_path, &self.pathname),
            &self.rewrite_rules,
        );

        if let Some(idx) = path.find(&self.script_ext) {
            path.truncate(idx + self.script_ext.len());
        } else if self
            .runtime
            .is_dir(&join_paths(&self.document_root, &path))
        {
            if !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(&format!("index{}", self.script_ext));
        } else {
            path = format!("/index{}", self.script_ext);
        }

        let resolved = join_paths(&self.document_root, &path);
        if self.runtime.exists(&resolved) {
            Some(resolved)
        } else {
            None
        }
    }
}

fn lock_jar(jar: &Mutex<CookieJar>) -> std::sync::MutexGuard<'_, CookieJar> {
    match jar.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
