use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use reef_bridge::ExecutionBridge;

use crate::engine::{EngineCtx, EngineStep, ScriptEngine};
use crate::error::RuntimeError;
use crate::request::{BoundUpload, RequestState, RunOptions};
use crate::vfs::VirtFs;

/// Everything a fresh interpreter instance is made of. The bridge is
/// constructed per instance and torn down with it, so process/socket
/// bookkeeping never leaks across a rotation.
pub struct InstanceParts {
    pub fs: VirtFs,
    pub bridge: Arc<ExecutionBridge>,
    pub engine: Box<dyn ScriptEngine>,
}

/// Builds fresh instances: at runtime creation and on every rotation.
pub trait InstanceFactory: Send + Sync {
    fn create(&self) -> Result<InstanceParts>;
}

pub(crate) struct InstanceState {
    pub fs: Arc<Mutex<VirtFs>>,
    pub bridge: Arc<ExecutionBridge>,
    pub engine: Box<dyn ScriptEngine>,
    pub booted: bool,
}

impl InstanceState {
    /// Runs the engine's step machine to completion, servicing each
    /// suspended call through the bridge. Exactly one call is outstanding
    /// at any time; the filesystem lock is never held across an await.
    pub async fn drive(&mut self, request: &RequestState) -> Result<i32> {
        let mut resumed = None;
        loop {
            let step = {
                let mut fs = lock(&self.fs);
                let mut ctx = EngineCtx {
                    fs: &mut fs,
                    request,
                };
                self.engine.step(&mut ctx, resumed.take())?
            };
            match step {
                EngineStep::Done { exit_code } => return Ok(exit_code),
                EngineStep::Blocked(call) => {
                    resumed = Some(self.bridge.service(call).await);
                }
            }
        }
    }
}

pub(crate) fn lock(fs: &Mutex<VirtFs>) -> MutexGuard<'_, VirtFs> {
    match fs.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Populates the interpreter-visible request state: normalized headers,
/// a synthesized host, server entries, the body, and uploaded files
/// written under `/tmp`.
pub(crate) fn bind_request(
    fs: &Arc<Mutex<VirtFs>>,
    opts: &RunOptions,
) -> Result<RequestState, RuntimeError> {
    let headers = &opts.headers;
    let host = headers
        .get("host")
        .cloned()
        .unwrap_or_else(|| "example.com:443".to_string());

    let port = host
        .rsplit_once(':')
        .and_then(|(_, p)| p.parse::<u16>().ok())
        .filter(|p| *p != 0 && *p != 80)
        .unwrap_or(if opts.protocol == "https" { 443 } else { 80 });

    let mut server_entries: BTreeMap<String, String> = opts.server_entries.clone();
    if opts.protocol == "https" || port == 443 {
        server_entries.insert("HTTPS".to_string(), "on".to_string());
    }
    for (name, value) in headers {
        let entry = name.to_ascii_uppercase().replace('-', "_");
        // content-type and content-length keep their bare names.
        let key = if name == "content-type" || name == "content-length" {
            entry
        } else {
            format!("HTTP_{entry}")
        };
        server_entries.insert(key, value.clone());
    }
    if !opts.body.is_empty() {
        server_entries.insert("CONTENT_LENGTH".to_string(), opts.body.len().to_string());
    }

    let mut uploads = Vec::with_capacity(opts.files.len());
    {
        let mut fs = lock(fs);
        for file in &opts.files {
            let tmp_path = format!("/tmp/upload_{}", UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed));
            fs.mkdir_tree("/tmp")?;
            fs.write_file(&tmp_path, file.data.clone())?;
            uploads.push(BoundUpload {
                key: file.key.clone(),
                name: file.name.clone(),
                mime: file.mime.clone(),
                tmp_path,
                size: file.data.len(),
            });
        }
    }

    let query_string = opts
        .relative_uri
        .split_once('?')
        .map(|(_, q)| q.to_string())
        .unwrap_or_default();

    let method = if opts.method.is_empty() {
        "GET".to_string()
    } else {
        opts.method.clone()
    };

    Ok(RequestState {
        script_path: opts.script_path.clone(),
        relative_uri: opts.relative_uri.clone(),
        query_string,
        method,
        headers: opts.headers.clone(),
        host,
        port,
        scheme: opts.protocol.clone(),
        body: opts.body.clone(),
        uploads,
        server_entries,
    })
}
