use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::events::{EventSink, StreamEvent};
use crate::sockets::Fd;

pub type Pid = u32;

/// Result of a non-blocking read against a process-backed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    WouldBlock,
    Closed,
}

struct StreamBuf {
    data: VecDeque<u8>,
    closed: bool,
}

pub(crate) struct ProcessRecord {
    pub pid: Pid,
    pub stdout: Fd,
    pub stderr: Fd,
    pub stdin: mpsc::UnboundedSender<Vec<u8>>,
    pub exited: bool,
    pub exit_code: Option<i32>,
    pub stdout_sink: EventSink,
    pub stderr_sink: EventSink,
}

pub struct ProcPollView {
    pub exited: bool,
    pub sink: EventSink,
}

/// Process bookkeeping for one runtime instance: pid → record, stream
/// descriptor → owning pid, and the byte buffers behind each stream. A
/// record is destroyed once the process has exited and every descriptor
/// referencing it has been closed.
#[derive(Default)]
pub struct ProcessTable {
    inner: Mutex<ProcsInner>,
}

#[derive(Default)]
struct ProcsInner {
    procs: HashMap<Pid, ProcessRecord>,
    owner: HashMap<Fd, Pid>,
    streams: HashMap<Fd, StreamBuf>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProcsInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn insert(&self, record: ProcessRecord) {
        let mut inner = self.lock();
        for fd in [record.stdout, record.stderr] {
            inner.owner.insert(fd, record.pid);
            inner.streams.insert(
                fd,
                StreamBuf {
                    data: VecDeque::new(),
                    closed: false,
                },
            );
        }
        inner.procs.insert(record.pid, record);
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lock().procs.contains_key(&pid)
    }

    /// `None` for an unknown pid, `Some(None)` while running,
    /// `Some(Some(code))` once exited.
    pub fn status(&self, pid: Pid) -> Option<Option<i32>> {
        let inner = self.lock();
        let record = inner.procs.get(&pid)?;
        Some(if record.exited { record.exit_code } else { None })
    }

    pub fn owner_of(&self, fd: Fd) -> Option<Pid> {
        self.lock().owner.get(&fd).copied()
    }

    pub fn is_exited(&self, pid: Pid) -> bool {
        self.lock().procs.get(&pid).is_some_and(|p| p.exited)
    }

    /// Records the exit and wakes pollers blocked on either output stream.
    pub fn mark_exited(&self, pid: Pid, code: i32) {
        let sinks = {
            let mut inner = self.lock();
            let Some(record) = inner.procs.get_mut(&pid) else {
                return;
            };
            record.exited = true;
            record.exit_code = Some(code);
            (record.stdout_sink.clone(), record.stderr_sink.clone())
        };
        for sink in [sinks.0, sinks.1] {
            sink.fire(StreamEvent::Exited);
            // Exit counts as readability for anyone polling the streams.
            sink.fire(StreamEvent::DataReceived);
        }
    }

    /// Appends child output to the interpreter-visible stream buffer and
    /// wakes readable-pollers.
    pub fn append_stream(&self, fd: Fd, data: &[u8]) {
        let sink = {
            let mut inner = self.lock();
            let Some(buf) = inner.streams.get_mut(&fd) else {
                return;
            };
            if buf.closed {
                return;
            }
            buf.data.extend(data.iter().copied());
            let pid = inner.owner.get(&fd).copied();
            pid.and_then(|pid| {
                let record = inner.procs.get(&pid)?;
                Some(if fd == record.stdout {
                    record.stdout_sink.clone()
                } else {
                    record.stderr_sink.clone()
                })
            })
        };
        if let Some(sink) = sink {
            sink.fire(StreamEvent::DataReceived);
        }
    }

    /// Drains the buffered bytes of a stream, if any.
    pub fn read_stream(&self, fd: Fd) -> ReadOutcome {
        let mut inner = self.lock();
        let Some(buf) = inner.streams.get_mut(&fd) else {
            return ReadOutcome::Closed;
        };
        if !buf.data.is_empty() {
            let data: Vec<u8> = buf.data.drain(..).collect();
            return ReadOutcome::Data(data);
        }
        if buf.closed {
            return ReadOutcome::Closed;
        }
        ReadOutcome::WouldBlock
    }

    pub fn close_stream(&self, fd: Fd) {
        let mut inner = self.lock();
        if let Some(buf) = inner.streams.get_mut(&fd) {
            buf.closed = true;
        }
        if let Some(pid) = inner.owner.get(&fd).copied() {
            Self::reap_if_done(&mut inner, pid);
        }
    }

    /// Forwards interpreter-written stdin bytes to the child.
    pub fn write_stdin(&self, pid: Pid, data: Vec<u8>) -> bool {
        let inner = self.lock();
        let Some(record) = inner.procs.get(&pid) else {
            return false;
        };
        record.stdin.send(data).is_ok()
    }

    pub fn poll_view(&self, fd: Fd) -> Option<ProcPollView> {
        let inner = self.lock();
        let pid = inner.owner.get(&fd)?;
        let record = inner.procs.get(pid)?;
        Some(ProcPollView {
            exited: record.exited,
            sink: if fd == record.stdout {
                record.stdout_sink.clone()
            } else {
                record.stderr_sink.clone()
            },
        })
    }

    fn reap_if_done(inner: &mut ProcsInner, pid: Pid) {
        let done = inner.procs.get(&pid).is_some_and(|record| {
            record.exited
                && [record.stdout, record.stderr]
                    .iter()
                    .all(|fd| inner.streams.get(fd).map(|b| b.closed).unwrap_or(true))
        });
        if !done {
            return;
        }
        if let Some(record) = inner.procs.remove(&pid) {
            for fd in [record.stdout, record.stderr] {
                inner.owner.remove(&fd);
                inner.streams.remove(&fd);
            }
        }
    }
}
