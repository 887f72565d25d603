use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::events::StreamEvent;
use crate::pending::{PendingOperation, PollVerdict};
use crate::procs::{Pid, ProcessRecord, ProcessTable, ReadOutcome};
use crate::sockets::{Fd, PollInterest, SocketTable};
use crate::spawn::{ChildProcess, SpawnError, SpawnHandler};

/// Interval between retries of a would-block read or an unfinished wait.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// How long a would-block read on a process-backed stream is retried
/// before giving up.
pub const READ_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Descriptors handed back to the interpreter for a spawned child.
#[derive(Debug, Clone, Copy)]
pub struct SpawnedProcess {
    pub pid: Pid,
    pub stdout: Fd,
    pub stderr: Fd,
}

/// A blocking interpreter call that must be serviced by the host before
/// the interpreter can continue. One call stack has at most one of these
/// outstanding at a time.
#[derive(Debug)]
pub enum HostCall {
    PollDescriptor {
        fd: Fd,
        interest: PollInterest,
        timeout: Option<Duration>,
    },
    Spawn {
        command: String,
    },
    WaitProcess {
        pid: Pid,
    },
    ReadStream {
        fd: Fd,
    },
    PostMessage {
        payload: Vec<u8>,
    },
}

/// The result fed back into the interpreter when a suspended call resumes.
#[derive(Debug)]
pub enum WakeValue {
    PollReady,
    PollTimedOut,
    Spawned(SpawnedProcess),
    SpawnFailed(SpawnError),
    ProcessExited(i32),
    UnknownProcess,
    Bytes(Vec<u8>),
    WouldBlock,
    StreamClosed,
    Reply(Vec<u8>),
}

/// Host-side handler for interpreter-posted messages. Returning
/// `Ok(None)` passes the message to the next handler; the first non-empty
/// reply wins.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
}

/// The suspend/resume machinery for one runtime instance.
pub struct ExecutionBridge {
    next_fd: AtomicU32,
    next_pid: AtomicU32,
    next_op: AtomicU64,
    pub sockets: Arc<SocketTable>,
    pub procs: Arc<ProcessTable>,
    spawn_handler: Mutex<Option<Arc<dyn SpawnHandler>>>,
    message_handlers: Mutex<Vec<Arc<dyn MessageHandler>>>,
}

impl Default for ExecutionBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBridge {
    pub fn new() -> Self {
        Self {
            // 0..=2 are left for the conventional standard descriptors.
            next_fd: AtomicU32::new(3),
            next_pid: AtomicU32::new(1),
            next_op: AtomicU64::new(1),
            sockets: Arc::new(SocketTable::new()),
            procs: Arc::new(ProcessTable::new()),
            spawn_handler: Mutex::new(None),
            message_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn alloc_fd(&self) -> Fd {
        self.next_fd.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_spawn_handler(&self, handler: Arc<dyn SpawnHandler>) {
        *lock(&self.spawn_handler) = Some(handler);
    }

    pub fn add_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        lock(&self.message_handlers).push(handler);
    }

    /// Services one suspended interpreter call and produces its wake
    /// value. This is the single entry the runtime's step loop awaits.
    pub async fn service(&self, call: HostCall) -> WakeValue {
        let op = self.next_op.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(op, ?call, "servicing suspended call");
        match call {
            HostCall::PollDescriptor {
                fd,
                interest,
                timeout,
            } => self.poll_descriptor(fd, interest, timeout).await,
            HostCall::Spawn { command } => self.spawn(&command).await,
            HostCall::WaitProcess { pid } => self.wait_process(pid).await,
            HostCall::ReadStream { fd } => self.read_stream(fd).await,
            HostCall::PostMessage { payload } => self.post_message(&payload).await,
        }
    }

    /// Polls a descriptor for the requested conditions.
    ///
    /// Already-satisfied conditions resolve immediately; a zero timeout
    /// with nothing ready resolves `PollTimedOut` without waiting; a
    /// `None` timeout waits indefinitely. When listeners are registered,
    /// the first to fire wins and the rest are unregistered.
    pub async fn poll_descriptor(
        &self,
        fd: Fd,
        interest: PollInterest,
        timeout: Option<Duration>,
    ) -> WakeValue {
        // Process-backed descriptor: readiness is "the child produced
        // output or exited".
        if let Some(view) = self.procs.poll_view(fd) {
            if view.exited {
                return WakeValue::PollTimedOut;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let id = view.sink.listen(StreamEvent::DataReceived, tx);
            let guards = vec![view.sink.guard(id)];
            return verdict_to_wake(
                PendingOperation::new(self.next_op(), rx, guards, timeout)
                    .wait()
                    .await,
            );
        }

        let Some(peers) = self.sockets.poll_view(fd) else {
            return WakeValue::PollTimedOut;
        };

        if interest.readable && peers.iter().any(|p| p.has_data) {
            return WakeValue::PollReady;
        }
        if peers.is_empty() {
            return WakeValue::PollTimedOut;
        }
        if interest.writable
            && peers
                .iter()
                .any(|p| p.state == crate::sockets::PeerState::Open)
        {
            return WakeValue::PollReady;
        }
        if interest.hangup
            && peers
                .iter()
                .any(|p| p.state == crate::sockets::PeerState::Closed)
        {
            return WakeValue::PollReady;
        }
        if interest.error
            && peers
                .iter()
                .any(|p| p.state == crate::sockets::PeerState::Errored)
        {
            return WakeValue::PollReady;
        }

        if timeout == Some(Duration::ZERO) {
            return WakeValue::PollTimedOut;
        }

        if interest.is_empty() {
            tracing::warn!(fd, "poll with no requested conditions, waiting out the timeout");
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => {}
            }
            return WakeValue::PollTimedOut;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut guards = Vec::new();
        for peer in &peers {
            if interest.readable {
                let id = peer.sink.listen(StreamEvent::DataReceived, tx.clone());
                guards.push(peer.sink.guard(id));
            }
            if interest.writable {
                let id = peer.sink.listen(StreamEvent::Connected, tx.clone());
                guards.push(peer.sink.guard(id));
            }
            if interest.hangup {
                let id = peer.sink.listen(StreamEvent::Closed, tx.clone());
                guards.push(peer.sink.guard(id));
            }
            if interest.error {
                let id = peer.sink.listen(StreamEvent::ErrorRaised, tx.clone());
                guards.push(peer.sink.guard(id));
            }
        }
        drop(tx);

        verdict_to_wake(
            PendingOperation::new(self.next_op(), rx, guards, timeout)
                .wait()
                .await,
        )
    }

    /// Spawns a child process through the registered handler and wires its
    /// streams: child output is appended to interpreter-visible buffers as
    /// it arrives, exit records the code and wakes blocked pollers.
    pub async fn spawn(&self, command: &str) -> WakeValue {
        let handler = lock(&self.spawn_handler).clone();
        let Some(handler) = handler else {
            return WakeValue::SpawnFailed(SpawnError::Unsupported);
        };

        let child = match handler.spawn(command) {
            Ok(child) => child,
            Err(err) => return WakeValue::SpawnFailed(err),
        };

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let stdout_fd = self.alloc_fd();
        let stderr_fd = self.alloc_fd();

        let ChildProcess {
            stdout,
            stderr,
            exit,
            stdin,
        } = child;

        let record = ProcessRecord {
            pid,
            stdout: stdout_fd,
            stderr: stderr_fd,
            stdin,
            exited: false,
            exit_code: None,
            stdout_sink: crate::events::EventSink::new(),
            stderr_sink: crate::events::EventSink::new(),
        };
        self.procs.insert(record);

        let procs = Arc::clone(&self.procs);
        let mut stdout = stdout;
        tokio::spawn(async move {
            while let Some(chunk) = stdout.recv().await {
                procs.append_stream(stdout_fd, &chunk);
            }
        });

        let procs = Arc::clone(&self.procs);
        let mut stderr = stderr;
        tokio::spawn(async move {
            while let Some(chunk) = stderr.recv().await {
                procs.append_stream(stderr_fd, &chunk);
            }
        });

        let procs = Arc::clone(&self.procs);
        tokio::spawn(async move {
            // A handler that drops its ProcessApi without exiting counts
            // as an exited child; otherwise waiters would block forever.
            let code = exit.await.unwrap_or(-1);
            procs.mark_exited(pid, code);
        });

        tracing::debug!(pid, command, "spawned child process");
        WakeValue::Spawned(SpawnedProcess {
            pid,
            stdout: stdout_fd,
            stderr: stderr_fd,
        })
    }

    /// Waits for a child to exit, polling its record on a fixed interval.
    pub async fn wait_process(&self, pid: Pid) -> WakeValue {
        loop {
            match self.procs.status(pid) {
                None => return WakeValue::UnknownProcess,
                Some(Some(code)) => return WakeValue::ProcessExited(code),
                Some(None) => tokio::time::sleep(RETRY_INTERVAL).await,
            }
        }
    }

    /// Reads from a process-backed stream. A would-block result is
    /// retried on a fixed interval up to a bounded timeout; retrying stops
    /// immediately once the owning process has exited or the stream has
    /// been closed.
    pub async fn read_stream(&self, fd: Fd) -> WakeValue {
        let give_up = Instant::now() + READ_RETRY_TIMEOUT;
        let mut drain_grace = true;
        loop {
            match self.procs.read_stream(fd) {
                ReadOutcome::Data(data) => return WakeValue::Bytes(data),
                ReadOutcome::Closed => return WakeValue::StreamClosed,
                ReadOutcome::WouldBlock => {
                    let owner_exited = self
                        .procs
                        .owner_of(fd)
                        .map(|pid| self.procs.is_exited(pid))
                        .unwrap_or(true);
                    if owner_exited {
                        // Let the output pump drain anything already in
                        // flight before reporting the stream empty.
                        if drain_grace {
                            drain_grace = false;
                            tokio::task::yield_now().await;
                            continue;
                        }
                        return WakeValue::WouldBlock;
                    }
                    if Instant::now() >= give_up {
                        return WakeValue::WouldBlock;
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Posts a payload to the registered message handlers and blocks for
    /// the reply. The first non-empty reply wins; a handler error is
    /// logged and resolved as an empty reply rather than propagated into
    /// the interpreter.
    pub async fn post_message(&self, payload: &[u8]) -> WakeValue {
        let handlers: Vec<Arc<dyn MessageHandler>> = lock(&self.message_handlers).clone();
        for handler in handlers {
            match handler.handle(payload) {
                Ok(Some(reply)) if !reply.is_empty() => return WakeValue::Reply(reply),
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "message handler failed, replying empty");
                    return WakeValue::Reply(Vec::new());
                }
            }
        }
        WakeValue::Reply(Vec::new())
    }

    fn next_op(&self) -> u64 {
        self.next_op.fetch_add(1, Ordering::Relaxed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn verdict_to_wake(verdict: PollVerdict) -> WakeValue {
    match verdict {
        PollVerdict::Ready => WakeValue::PollReady,
        PollVerdict::TimedOut | PollVerdict::Cancelled => WakeValue::PollTimedOut,
    }
}
