use anyhow::Result;
use reef_bridge::{HostCall, WakeValue};

use crate::request::RequestState;
use crate::vfs::VirtFs;

/// One-time configuration handed to the engine at bootstrap: the ini file
/// path, accumulated ini overrides (including the auto-prepended
/// constants-loader entry), and the server-identity string.
#[derive(Debug, Clone, Default)]
pub struct BootConfig {
    pub ini_path: Option<String>,
    pub ini_entries: Vec<(String, String)>,
    pub identity: Option<String>,
}

/// What the engine sees while advancing one request.
pub struct EngineCtx<'a> {
    pub fs: &'a mut VirtFs,
    pub request: &'a RequestState,
}

/// Outcome of one engine step.
pub enum EngineStep {
    /// The request finished; the response is in the filesystem
    /// (`/tmp/headers.json`, `/tmp/stdout`, `/tmp/stderr`).
    Done { exit_code: i32 },
    /// The interpreter hit a blocking call and suspended. The step loop
    /// services the call and resumes with its wake value.
    Blocked(HostCall),
}

/// The sandboxed interpreter boundary.
///
/// The interpreter's control flow is synchronous; suspension is modeled
/// as an explicit state machine rather than a stackful coroutine. Each
/// call stack has at most one outstanding [`HostCall`]; `step` is called
/// again with the wake value once the host has serviced it. An `Err`
/// from `boot` or `step` is an unrecoverable internal fault and poisons
/// the instance, as opposed to a script error, which is reported through
/// the response's exit code and error stream.
pub trait ScriptEngine: Send {
    fn boot(&mut self, fs: &mut VirtFs, config: &BootConfig) -> Result<()>;

    fn step(&mut self, ctx: &mut EngineCtx<'_>, resumed: Option<WakeValue>) -> Result<EngineStep>;
}
