//! Virtual HTTP server over an embedded interpreter runtime.
//!
//! The dispatcher accepts logical HTTP requests without binding any port:
//! static files are served straight from the runtime's virtual
//! filesystem, everything else resolves to a script path and runs through
//! the interpreter, one request at a time. A cookie jar carries session
//! state across dispatches, and the relay module ferries intercepted
//! requests from other execution contexts by correlation id.

mod classify;
mod cookies;
mod dispatcher;
mod headers;
mod mime;
mod multipart;
mod relay;
mod request;
mod rewrite;
mod urls;

pub use classify::is_dynamic_path;
pub use cookies::CookieJar;
pub use dispatcher::{
    DispatcherConfig, RequestDispatcher, ServeError, SELF_REQUEST_HEADER, SELF_REQUEST_ISSUER,
    STATIC_MARKER_HEADER,
};
pub use headers::Headers;
pub use mime::content_type_for_path;
pub use multipart::encode_as_multipart;
pub use relay::{Envelope, Mailbox, PendingReply, RelayError, DEFAULT_REPLY_TIMEOUT};
pub use request::{RequestBody, ServerRequest};
pub use rewrite::{apply_rewrite_rules, RewriteRule};
pub use urls::{
    ensure_path_prefix, join_paths, parse_request_url, percent_decode, remove_path_prefix,
    to_relative_url, DEFAULT_BASE_URL,
};
