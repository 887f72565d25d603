//! Suspend/resume bridge between a synchronous interpreter and the
//! asynchronous host event loop.
//!
//! The interpreter expects blocking calls (`poll`, `read`, `waitpid`,
//! spawn-and-wait) to return a result before it continues. The host is a
//! single asynchronous process. The bridge reconciles the two: a blocking
//! call suspends the interpreter's step loop, registers interest in a host
//! event, and resumes the loop with a [`WakeValue`] once the event fires or
//! the deadline elapses. The interpreter only ever observes a (possibly
//! long) synchronous call.
//!
//! All socket and process bookkeeping is owned by the
//! [`ExecutionBridge`] instance: one bridge per runtime instance, torn
//! down with it, so overlapping instances never share descriptor state.

mod bridge;
mod events;
mod pending;
mod procs;
mod sockets;
mod spawn;

pub use bridge::{
    ExecutionBridge, HostCall, MessageHandler, SpawnedProcess, WakeValue, READ_RETRY_TIMEOUT,
    RETRY_INTERVAL,
};
pub use events::{EventSink, ListenerGuard, ListenerId, StreamEvent};
pub use pending::{CancelHandle, PendingOperation, PollVerdict};
pub use procs::{Pid, ProcPollView, ProcessTable, ReadOutcome};
pub use sockets::{Fd, PeerId, PeerState, PeerView, PollInterest, SocketTable};
pub use spawn::{script_spawn_handler, ChildProcess, ProcessApi, SpawnError, SpawnHandler};
