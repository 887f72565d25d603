use anyhow::{anyhow, Result};
use reef_bridge::{Fd, HostCall, WakeValue};
use serde_json::json;

use crate::engine::{BootConfig, EngineCtx, EngineStep, ScriptEngine};
use crate::instance::{InstanceFactory, InstanceParts};
use crate::response::{HEADERS_PATH, STDERR_PATH, STDOUT_PATH};
use crate::vfs::VirtFs;

/// A deliberately small engine that serves the resolved script file's
/// bytes back as the response body.
///
/// Scripts may start with directive lines:
///
/// ```text
/// #!status: 201
/// #!header: X-Custom: yes
/// #!echo-header: cookie
/// #!spawn: list-files
/// ```
///
/// `#!echo-header:` appends the named request header's value to the
/// body. `#!spawn:` runs the command through the runtime's spawn handler
/// and appends the child's stdout to the body, exercising the full
/// suspend/resume cycle (spawn, wait, read). Every response carries an
/// `X-Request-Method` header with the method the engine observed. This
/// is the default engine for tests and demos; it is not an interpreter.
pub struct EchoEngine {
    identity: Option<String>,
    state: State,
}

enum State {
    Idle,
    AwaitSpawn(Pending),
    AwaitExit(Pending, Fd),
    AwaitRead(Pending),
}

struct Pending {
    status: u16,
    headers: Vec<String>,
    body: Vec<u8>,
    stderr: Vec<u8>,
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoEngine {
    pub fn new() -> Self {
        Self {
            identity: None,
            state: State::Idle,
        }
    }

    fn start(&mut self, ctx: &mut EngineCtx<'_>) -> Result<EngineStep> {
        let script = match ctx.fs.read(&ctx.request.script_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                let pending = Pending {
                    status: 500,
                    headers: Vec::new(),
                    body: Vec::new(),
                    stderr: err.to_string().into_bytes(),
                };
                return self.finish(ctx, pending, 1);
            }
        };

        let mut pending = Pending {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
            stderr: Vec::new(),
        };
        let mut spawn_command = None;

        if script.starts_with(b"#!") {
            let text = String::from_utf8_lossy(&script).into_owned();
            let mut rest = String::new();
            let mut in_directives = true;
            for line in text.split_inclusive('\n') {
                if in_directives {
                    let trimmed = line.trim_end();
                    if let Some(value) = trimmed.strip_prefix("#!status:") {
                        if let Ok(status) = value.trim().parse::<u16>() {
                            pending.status = status;
                        }
                        continue;
                    }
                    if let Some(value) = trimmed.strip_prefix("#!header:") {
                        pending.headers.push(value.trim().to_string());
                        continue;
                    }
                    if let Some(value) = trimmed.strip_prefix("#!echo-header:") {
                        let name = value.trim().to_ascii_lowercase();
                        let echoed = ctx.request.headers.get(&name).cloned().unwrap_or_default();
                        pending.body.extend_from_slice(echoed.as_bytes());
                        pending.body.push(b'\n');
                        continue;
                    }
                    if let Some(value) = trimmed.strip_prefix("#!spawn:") {
                        spawn_command = Some(value.trim().to_string());
                        continue;
                    }
                    in_directives = false;
                }
                rest.push_str(line);
            }
            pending.body.extend_from_slice(rest.as_bytes());
        } else {
            pending.body = script;
        }

        if let Some(command) = spawn_command {
            self.state = State::AwaitSpawn(pending);
            return Ok(EngineStep::Blocked(HostCall::Spawn { command }));
        }
        self.finish(ctx, pending, 0)
    }

    fn finish(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        pending: Pending,
        exit_code: i32,
    ) -> Result<EngineStep> {
        let mut headers = pending.headers;
        if !headers
            .iter()
            .any(|h| h.to_ascii_lowercase().starts_with("content-type:"))
        {
            headers.insert(0, "Content-Type: text/html; charset=UTF-8".to_string());
        }
        if let Some(identity) = &self.identity {
            headers.push(format!("X-Powered-By: {identity}"));
        }
        headers.push(format!("X-Request-Method: {}", ctx.request.method));

        ctx.fs.mkdir_tree("/tmp")?;
        ctx.fs.write_file(STDOUT_PATH, pending.body)?;
        ctx.fs.write_file(STDERR_PATH, pending.stderr)?;
        let headers_doc = json!({ "status": pending.status, "headers": headers });
        ctx.fs
            .write_file(HEADERS_PATH, serde_json::to_vec(&headers_doc)?)?;

        self.state = State::Idle;
        Ok(EngineStep::Done { exit_code })
    }
}

impl ScriptEngine for EchoEngine {
    fn boot(&mut self, fs: &mut VirtFs, config: &BootConfig) -> Result<()> {
        fs.mkdir_tree("/tmp")?;
        self.identity = config.identity.clone();
        Ok(())
    }

    fn step(&mut self, ctx: &mut EngineCtx<'_>, resumed: Option<WakeValue>) -> Result<EngineStep> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => self.start(ctx),
            State::AwaitSpawn(mut pending) => match resumed {
                Some(WakeValue::Spawned(child)) => {
                    self.state = State::AwaitExit(pending, child.stdout);
                    Ok(EngineStep::Blocked(HostCall::WaitProcess { pid: child.pid }))
                }
                Some(WakeValue::SpawnFailed(err)) => {
                    pending.status = 500;
                    pending.stderr.extend_from_slice(err.to_string().as_bytes());
                    self.finish(ctx, pending, 1)
                }
                other => Err(anyhow!("unexpected wake value after spawn: {other:?}")),
            },
            State::AwaitExit(pending, stdout) => match resumed {
                Some(WakeValue::ProcessExited(_)) => {
                    self.state = State::AwaitRead(pending);
                    Ok(EngineStep::Blocked(HostCall::ReadStream { fd: stdout }))
                }
                Some(WakeValue::UnknownProcess) => {
                    let mut pending = pending;
                    pending.stderr.extend_from_slice(b"spawned process vanished");
                    self.finish(ctx, pending, 1)
                }
                other => Err(anyhow!("unexpected wake value while waiting: {other:?}")),
            },
            State::AwaitRead(mut pending) => match resumed {
                Some(WakeValue::Bytes(data)) => {
                    pending.body.extend_from_slice(&data);
                    self.finish(ctx, pending, 0)
                }
                Some(WakeValue::WouldBlock) | Some(WakeValue::StreamClosed) => {
                    self.finish(ctx, pending, 0)
                }
                other => Err(anyhow!("unexpected wake value while reading: {other:?}")),
            },
        }
    }
}

/// Factory for instances backed by the echo engine: an empty filesystem
/// with `/tmp` and the document root pre-created.
pub struct EchoEngineFactory {
    document_root: String,
}

impl EchoEngineFactory {
    pub fn new(document_root: impl Into<String>) -> Self {
        Self {
            document_root: document_root.into(),
        }
    }
}

impl InstanceFactory for EchoEngineFactory {
    fn create(&self) -> Result<InstanceParts> {
        let mut fs = VirtFs::new();
        fs.mkdir_tree("/tmp")?;
        fs.mkdir_tree(&self.document_root)?;
        Ok(InstanceParts {
            fs,
            bridge: std::sync::Arc::new(reef_bridge::ExecutionBridge::new()),
            engine: Box::new(EchoEngine::new()),
        })
    }
}
