//! Error kinds surfaced to user tasks as `(nil, message)` pairs (spec §7).

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Operation attempted on a closed endpoint.
    #[error("closed")]
    Closed,
    /// Endpoint already has a task suspended on this direction.
    #[error("busy")]
    Busy,
    /// A pending accept was cancelled by `close`/`interrupt`.
    #[error("interrupted")]
    Interrupted,
    #[error("parse error")]
    ParseError,
    #[error("out of buffer space")]
    OutOfBufferSpace,
    /// Any underlying syscall error, pre-formatted via `strerror`.
    #[error("{0}")]
    Errno(String),
    #[error("invalid permissions")]
    InvalidPermissions,
    #[error("invalid mode string")]
    InvalidModeString,
    #[error("path too long")]
    PathTooLong,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not busy")]
    NotBusy,
}

impl IoError {
    pub fn from_errno(err: nix::errno::Errno) -> Self {
        IoError::Errno(err.desc().to_string())
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => IoError::Errno(nix::errno::Errno::from_raw(code).desc().to_string()),
            None => IoError::Errno(err.to_string()),
        }
    }

    /// The `(nil, message)` contract's message half.
    pub fn message(&self) -> String {
        self.to_string()
    }
}
