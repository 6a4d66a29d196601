//! I/O endpoint state machines, network/PTY/process setup, the sendfile
//! bridge, and the HTTP line parser — the dispatch core's §4.4 surface.
//! [`core::Core`] is the engine that ties these, plus `dispatch-reactor`,
//! `dispatch-pool`, `dispatch-runqueue` and `dispatch-task-host`, into one
//! runnable event loop.

pub mod buffer;
pub mod classify;
pub mod completion;
pub mod core;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod net;
pub mod operations;
pub mod pty;
pub mod sendfile;
pub mod spawn;
pub mod test_support;

pub use buffer::{StreamBuffer, StreamParser, DEFAULT_BUFFER_CAPACITY};
pub use completion::{
    Completion, CompletionReceiver, CompletionSender, FromFdOutcome, OpenOutcome, RawCompletion,
    RawOpenOutcome,
};
pub use core::{AutospawnHandler, CompletionSink, Core, CoreConfig, CoreError};
pub use endpoint::{ClassifiedFd, Endpoint, FileState, OpenState, ServerKind, ServerState, StreamState, WatcherSlot};
pub use error::IoError;
pub use http::{HttpRequest, HttpRequestParser, HttpResponse, HttpResponseParser};
pub use operations::{
    AcceptOutcome, Datagram, LockKind, OpenMode, ReadOutcome, SeekFrom, WriteOutcome, DATAGRAM_BUFFER,
};
pub use spawn::{FdAction, SpawnFlags, SpawnOptions, SpawnOutcome, WaitOutcome};
