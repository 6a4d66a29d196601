//! The tagged-union I/O endpoint (spec §3/§9): `File`, `Stream`, `Server`,
//! expressed as a Rust enum with a shared discriminator rather than an
//! inheritance hierarchy.

use std::os::fd::RawFd;

use dispatch_reactor::IoToken;
use dispatch_task_host::TaskHandle;

use crate::buffer::StreamBuffer;

/// Borrow discipline for a [`Stream`]'s fd (spec §3, "Stream"; §9,
/// "Borrowed fds"). `Owned` streams close their fd on drop; `Borrowed`
/// streams (stdin/stdout/stderr) never close but are switched back to
/// blocking mode on reactor shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenState {
    Closed,
    Owned,
    Borrowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    StreamListener,
    DatagramListener,
}

/// What `from_fd`'s classification step (§4.4) decided.
pub enum ClassifiedFd {
    File(RawFd),
    Stream(RawFd),
    Server(RawFd, ServerKind),
}

/// Per-direction watcher slot: at most one task may be suspended here at
/// a time (spec §3, "Endpoint Invariants").
pub struct WatcherSlot<H: TaskHandle> {
    pub waiting: Option<H>,
}

impl<H: TaskHandle> Default for WatcherSlot<H> {
    fn default() -> Self {
        Self { waiting: None }
    }
}

impl<H: TaskHandle> WatcherSlot<H> {
    pub fn is_busy(&self) -> bool {
        self.waiting.is_some()
    }

    /// Takes the waiting task, if any, leaving the slot free. Copies to a
    /// local before clearing — the fix for the "non-null-then-queue" race
    /// spec §9's open question flags in the original.
    pub fn take(&mut self) -> Option<H> {
        self.waiting.take()
    }
}

pub struct FileState {
    pub fd: RawFd,
    pub open: bool,
}

pub struct StreamState<H: TaskHandle> {
    pub fd: RawFd,
    pub open: OpenState,
    pub token: Option<IoToken>,
    pub read: WatcherSlot<H>,
    pub write: WatcherSlot<H>,
    pub input: StreamBuffer,
    /// Bytes still to be written plus how many of them already landed,
    /// carried across suspensions so a caller's `write` need not re-supply
    /// the tail after an `EAGAIN` (spec §4.4 "Stream write contract").
    pub pending_write: Option<(Vec<u8>, usize)>,
}

impl<H: TaskHandle> StreamState<H> {
    pub fn new(fd: RawFd, open: OpenState) -> Self {
        Self {
            fd,
            open,
            token: None,
            read: WatcherSlot::default(),
            write: WatcherSlot::default(),
            input: StreamBuffer::new(crate::buffer::DEFAULT_BUFFER_CAPACITY),
            pending_write: None,
        }
    }
}

pub struct ServerState<H: TaskHandle> {
    pub fd: RawFd,
    pub open: bool,
    pub token: Option<IoToken>,
    pub kind: ServerKind,
    pub pending: WatcherSlot<H>,
    /// Set once an `autospawn`/datagram handler is installed; accept loop
    /// keeps running indefinitely rather than resuming a single waiter.
    pub autospawning: bool,
}

impl<H: TaskHandle> ServerState<H> {
    pub fn new(fd: RawFd, kind: ServerKind) -> Self {
        Self {
            fd,
            open: true,
            token: None,
            kind,
            pending: WatcherSlot::default(),
            autospawning: false,
        }
    }
}

pub enum Endpoint<H: TaskHandle> {
    File(FileState),
    Stream(StreamState<H>),
    Server(ServerState<H>),
}

impl<H: TaskHandle> Endpoint<H> {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Endpoint::File(_) => "file",
            Endpoint::Stream(_) => "stream",
            Endpoint::Server(_) => "server",
        }
    }
}
