use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

/// Why a spawn request could not produce a child process.
#[derive(Debug)]
pub enum SpawnError {
    /// No spawn handler is registered with the bridge. Surfaced to the
    /// interpreter as a distinct condition, never as a generic error.
    Unsupported,
    Failed(String),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Unsupported => f.write_str(
                "process spawning is unsupported: no spawn handler is registered with the runtime",
            ),
            SpawnError::Failed(reason) => write!(f, "spawn failed: {reason}"),
        }
    }
}

impl std::error::Error for SpawnError {}

/// Host-supplied process launcher. The returned [`ChildProcess`] exposes
/// the child through typed channels the bridge wires into interpreter
/// stream buffers.
pub trait SpawnHandler: Send + Sync {
    fn spawn(&self, command: &str) -> Result<ChildProcess, SpawnError>;
}

/// The bridge's end of one spawned child.
pub struct ChildProcess {
    pub(crate) stdout: mpsc::UnboundedReceiver<Vec<u8>>,
    pub(crate) stderr: mpsc::UnboundedReceiver<Vec<u8>>,
    pub(crate) exit: oneshot::Receiver<i32>,
    pub(crate) stdin: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChildProcess {
    /// Creates a connected `(ChildProcess, ProcessApi)` pair for
    /// hand-rolled spawn handlers.
    pub fn pair() -> (ChildProcess, ProcessApi) {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        (
            ChildProcess {
                stdout: stdout_rx,
                stderr: stderr_rx,
                exit: exit_rx,
                stdin: stdin_tx,
            },
            ProcessApi {
                stdout: stdout_tx,
                stderr: stderr_tx,
                exit: Some(exit_tx),
                stdin: stdin_rx,
            },
        )
    }
}

/// The handler program's side of a spawned child: emit output, consume
/// stdin, exit once.
pub struct ProcessApi {
    stdout: mpsc::UnboundedSender<Vec<u8>>,
    stderr: mpsc::UnboundedSender<Vec<u8>>,
    exit: Option<oneshot::Sender<i32>>,
    stdin: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ProcessApi {
    pub fn stdout(&self, data: impl Into<Vec<u8>>) {
        let _ = self.stdout.send(data.into());
    }

    pub fn stderr(&self, data: impl Into<Vec<u8>>) {
        let _ = self.stderr.send(data.into());
    }

    /// Reports the exit code. Later calls are ignored.
    pub fn exit(&mut self, code: i32) {
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(code);
        }
    }

    /// Drains everything the interpreter has written to stdin so far.
    pub fn flush_stdin(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = self.stdin.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

/// Wraps a plain closure as a [`SpawnHandler`]. The program runs on the
/// host event loop one tick after the spawn call returns, so the bridge
/// has wired its listeners before any output is produced.
pub fn script_spawn_handler<F>(program: F) -> Arc<dyn SpawnHandler>
where
    F: Fn(String, ProcessApi) + Send + Sync + 'static,
{
    struct ScriptHandler<F> {
        program: Arc<F>,
    }

    impl<F> SpawnHandler for ScriptHandler<F>
    where
        F: Fn(String, ProcessApi) + Send + Sync + 'static,
    {
        fn spawn(&self, command: &str) -> Result<ChildProcess, SpawnError> {
            let (child, api) = ChildProcess::pair();
            let program = Arc::clone(&self.program);
            let command = command.to_string();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                program(command, api);
            });
            Ok(child)
        }
    }

    Arc::new(ScriptHandler {
        program: Arc::new(program),
    })
}
