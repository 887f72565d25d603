//! Runtime instances for an embedded, synchronous script interpreter.
//!
//! One [`Runtime`] owns a rotating sequence of interpreter instances. Each
//! instance couples a virtual filesystem, a per-instance execution bridge,
//! and a [`ScriptEngine`]. The lifecycle manager serializes requests
//! through the [`Gate`], rotates instances after a configurable number of
//! completed requests (interpreter memory fragments monotonically and
//! eventually allocation fails), and poisons an instance on an internal
//! fault so no further calls reach corrupted state.

mod echo;
mod engine;
mod error;
mod gate;
mod instance;
mod lifecycle;
mod request;
mod response;
mod vfs;

pub use echo::{EchoEngine, EchoEngineFactory};
pub use engine::{BootConfig, EngineCtx, EngineStep, ScriptEngine};
pub use error::RuntimeError;
pub use gate::{Gate, GateGuard};
pub use instance::{InstanceFactory, InstanceParts};
pub use lifecycle::{Runtime, RuntimeConfig, BOOT_DEFINES_SCRIPT, DEFINES_PATH};
pub use request::{BoundUpload, RequestState, RunOptions, UploadedFile};
pub use response::{Response, HEADERS_PATH, STDERR_PATH, STDOUT_PATH};
pub use vfs::{FsError, FsReason, SharedBytes, VirtFs};
