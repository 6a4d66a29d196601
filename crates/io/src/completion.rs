//! Bridge between pool worker threads and the reactor-thread-only endpoint
//! state. §4.3 has `work` run on a worker and `reap` run back on the
//! reactor thread, responsible for resuming the owning task — but a
//! `reap` closure boxed for `dispatch-pool::Job` can't soundly borrow
//! `Core<R>` (it must be `'static` and is constructed before `Core`
//! itself is reentered). Instead, `work` sends a [`RawCompletion`] over an
//! mpsc channel (safe from any thread), and each `Job`'s `reap` is a
//! trivial no-op that exists only to satisfy the pool's job-accounting
//! contract. `Core::run` drains the channel immediately after
//! `Pool::reap_completed`, which is the only point it ever runs — so the
//! spec's "reap only runs on the reactor thread" invariant holds for the
//! channel drain, just not for the (deliberately inert) `Job::reap`
//! itself.
//!
//! [`RawCompletion`] is what a worker thread can build: fds and
//! classification results with no endpoint-table access. Resolving a
//! freshly opened/adopted fd into a live [`Endpoint`](crate::endpoint::Endpoint)
//! requires the reactor-thread-only endpoint [`slab`](slab::Slab), so
//! `Core::deliver_completion` turns each `RawCompletion` into a
//! [`Completion`] — the public shape a [`CompletionSink`](crate::core::CompletionSink)
//! actually receives — inserting the endpoint (and registering it with the
//! reactor, for streams) along the way.

use std::sync::mpsc;

use crate::error::IoError;
use crate::spawn::SpawnOutcome;
use dispatch_task_host::TaskHandle;

/// What a worker thread's `open`/`from_fd` job produced, before the
/// reactor thread has had a chance to register it as a live endpoint.
pub enum RawOpenOutcome {
    File(std::os::fd::RawFd),
    Stream(std::os::fd::RawFd),
}

pub enum RawCompletion<H: TaskHandle> {
    Open {
        task: H,
        result: Result<RawOpenOutcome, IoError>,
    },
    FromFd {
        task: H,
        result: Result<crate::endpoint::ClassifiedFd, IoError>,
    },
    FileRead {
        task: H,
        result: Result<Vec<u8>, IoError>,
    },
    FileWrite {
        task: H,
        result: Result<usize, IoError>,
    },
    FileSeek {
        task: H,
        result: Result<u64, IoError>,
    },
    FileSize {
        task: H,
        result: Result<u64, IoError>,
    },
    FileLock {
        task: H,
        result: Result<(), IoError>,
    },
    Resolve {
        task: H,
        result: Result<std::net::SocketAddr, IoError>,
    },
    Spawn {
        task: H,
        result: Result<SpawnOutcome, IoError>,
    },
    Waitpid {
        task: H,
        result: Result<crate::spawn::WaitOutcome, IoError>,
    },
    StreamFileOpened {
        task: H,
        result: Result<std::os::fd::RawFd, IoError>,
    },
    Popen {
        task: H,
        result: Result<RawPopenOutcome, IoError>,
    },
    PtyOpen {
        task: H,
        result: Result<(std::os::fd::RawFd, std::os::fd::RawFd), IoError>,
    },
}

impl<H: TaskHandle> RawCompletion<H> {
    pub fn task(&self) -> H {
        match self {
            RawCompletion::Open { task, .. }
            | RawCompletion::FromFd { task, .. }
            | RawCompletion::FileRead { task, .. }
            | RawCompletion::FileWrite { task, .. }
            | RawCompletion::FileSeek { task, .. }
            | RawCompletion::FileSize { task, .. }
            | RawCompletion::FileLock { task, .. }
            | RawCompletion::Resolve { task, .. }
            | RawCompletion::Spawn { task, .. }
            | RawCompletion::Waitpid { task, .. }
            | RawCompletion::StreamFileOpened { task, .. }
            | RawCompletion::Popen { task, .. }
            | RawCompletion::PtyOpen { task, .. } => *task,
        }
    }
}

/// What a `popen` pool job produced, before the reactor thread has turned
/// each caller-side fd into a live stream endpoint.
pub struct RawPopenOutcome {
    pub pid: i32,
    pub stdin_fd: Option<std::os::fd::RawFd>,
    pub stdout_fd: Option<std::os::fd::RawFd>,
    pub socket_fd: Option<std::os::fd::RawFd>,
}

/// An endpoint freshly classified by `open`/`from_fd`, already inserted
/// into the endpoint table by `Core::deliver_completion` — this is what a
/// [`CompletionSink`](crate::core::CompletionSink) actually gets to build
/// a script-level value from.
#[derive(Debug, Clone, Copy)]
pub enum OpenOutcome {
    File(usize),
    Stream(usize),
}

#[derive(Debug, Clone, Copy)]
pub enum FromFdOutcome {
    File(usize),
    Stream(usize),
    Server(usize),
}

pub enum Completion<H: TaskHandle> {
    Open {
        task: H,
        result: Result<OpenOutcome, IoError>,
    },
    FromFd {
        task: H,
        result: Result<FromFdOutcome, IoError>,
    },
    FileRead {
        task: H,
        result: Result<Vec<u8>, IoError>,
    },
    FileWrite {
        task: H,
        result: Result<usize, IoError>,
    },
    FileSeek {
        task: H,
        result: Result<u64, IoError>,
    },
    FileSize {
        task: H,
        result: Result<u64, IoError>,
    },
    FileLock {
        task: H,
        result: Result<(), IoError>,
    },
    Resolve {
        task: H,
        result: Result<std::net::SocketAddr, IoError>,
    },
    Spawn {
        task: H,
        result: Result<SpawnOutcome, IoError>,
    },
    Waitpid {
        task: H,
        result: Result<crate::spawn::WaitOutcome, IoError>,
    },
    /// `key` is the stream endpoint the caller reads from; the sendfile
    /// pump runs independently in the background.
    StreamFileOpened {
        task: H,
        result: Result<usize, IoError>,
    },
    Popen {
        task: H,
        result: Result<PopenResult, IoError>,
    },
    PtyOpen {
        task: H,
        result: Result<PtyKeys, IoError>,
    },
}

/// The caller-side stream keys `popen` hands back, mirroring
/// [`crate::spawn::PopenOutcome`] once its fds have become live endpoints.
#[derive(Debug, Clone, Copy)]
pub struct PopenResult {
    pub pid: i32,
    pub stdin_key: Option<usize>,
    pub stdout_key: Option<usize>,
    pub socket_key: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct PtyKeys {
    pub master_key: usize,
    pub slave_key: usize,
}

pub type CompletionSender<H> = mpsc::Sender<RawCompletion<H>>;
pub type CompletionReceiver<H> = mpsc::Receiver<RawCompletion<H>>;

pub fn channel<H: TaskHandle>() -> (CompletionSender<H>, CompletionReceiver<H>) {
    mpsc::channel()
}
