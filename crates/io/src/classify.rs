//! Fd classification shared by `open` and `from_fd` (spec §4.4): turn a
//! freshly opened or adopted fd into one of {File, Stream, Server} by
//! `fstat`, with a `SO_ACCEPTCONN` probe to split listening sockets from
//! connected ones. Grounded on `original_source/lem/io/core.c`'s
//! `io_new`/`io_fromfd`, which run this same `fstat` switch before
//! deciding which variant's vtable to install.

use std::os::fd::RawFd;

use nix::sys::socket::sockopt::AcceptConn;
use nix::sys::socket::{getsockopt, SockType};
use nix::sys::stat::{fstat, SFlag};

use crate::endpoint::{ClassifiedFd, ServerKind};
use crate::error::IoError;

/// Sets `O_NONBLOCK`, ignoring fds that are already non-blocking (sockets
/// created with `SOCK_NONBLOCK` upstream of this call).
pub fn set_nonblocking(fd: RawFd) -> Result<(), IoError> {
    let flags = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFL).map_err(IoError::from_errno)?;
    let mut flags = nix::fcntl::OFlag::from_bits_truncate(flags);
    if flags.contains(nix::fcntl::OFlag::O_NONBLOCK) {
        return Ok(());
    }
    flags.insert(nix::fcntl::OFlag::O_NONBLOCK);
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFL(flags)).map_err(IoError::from_errno)?;
    Ok(())
}

/// Classifies a fd just returned by `open(2)` (spec §4.4 "Opening a
/// path"): regular/block devices become `File`s (all their I/O is pool
/// work; never registered with the reactor); char devices and fifos are
/// made non-blocking and wrapped as `Stream`s; anything else is an error.
/// Intended to run on a pool thread alongside the `open` call itself.
pub fn classify_opened(fd: RawFd) -> Result<ClassifiedFd, IoError> {
    let st = fstat(fd).map_err(IoError::from_errno)?;
    let mode = SFlag::from_bits_truncate(st.st_mode);
    if mode.contains(SFlag::S_IFREG) || mode.contains(SFlag::S_IFBLK) {
        Ok(ClassifiedFd::File(fd))
    } else if mode.contains(SFlag::S_IFCHR) || mode.contains(SFlag::S_IFIFO) {
        set_nonblocking(fd)?;
        Ok(ClassifiedFd::Stream(fd))
    } else {
        Err(IoError::InvalidArgument)
    }
}

/// Classifies an adopted fd (spec §4.4 "Adopting a raw fd"): like
/// `classify_opened`, plus a `SO_ACCEPTCONN` probe on socket fds to split
/// listening sockets (`Server`) from connected ones (`Stream`). All
/// adopted non-file fds are made non-blocking.
pub fn classify_adopted(fd: RawFd) -> Result<ClassifiedFd, IoError> {
    let st = fstat(fd).map_err(IoError::from_errno)?;
    let mode = SFlag::from_bits_truncate(st.st_mode);

    if mode.contains(SFlag::S_IFREG) || mode.contains(SFlag::S_IFBLK) {
        return Ok(ClassifiedFd::File(fd));
    }

    if mode.contains(SFlag::S_IFSOCK) {
        set_nonblocking(fd)?;
        if let Ok(true) = getsockopt(&unsafe { borrow(fd) }, AcceptConn) {
            let kind = socket_kind(fd)?;
            return Ok(ClassifiedFd::Server(fd, kind));
        }
        return Ok(ClassifiedFd::Stream(fd));
    }

    set_nonblocking(fd)?;
    Ok(ClassifiedFd::Stream(fd))
}

fn socket_kind(fd: RawFd) -> Result<ServerKind, IoError> {
    use nix::sys::socket::sockopt::SockType as SockTypeOpt;
    let sock_type: SockType = getsockopt(&unsafe { borrow(fd) }, SockTypeOpt).map_err(IoError::from_errno)?;
    Ok(match sock_type {
        SockType::Datagram => ServerKind::DatagramListener,
        _ => ServerKind::StreamListener,
    })
}

/// Borrows `fd` as a `BorrowedFd` for the lifetime of one `getsockopt`
/// call without taking ownership — `fd` remains owned by the endpoint
/// table.
unsafe fn borrow<'a>(fd: RawFd) -> std::os::fd::BorrowedFd<'a> {
    unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn regular_file_classifies_as_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let fd = tmp.as_file().as_raw_fd();
        assert!(matches!(classify_opened(fd), Ok(ClassifiedFd::File(_))));
    }

    #[test]
    fn connected_socket_classifies_as_stream() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        assert!(matches!(classify_adopted(fd), Ok(ClassifiedFd::Stream(_))));
    }

    #[test]
    fn listening_socket_classifies_as_server() {
        let listener = std::os::unix::net::UnixListener::bind(
            tempfile::NamedTempFile::new().unwrap().path().with_extension("sock"),
        )
        .unwrap();
        let fd = listener.as_raw_fd();
        assert!(matches!(
            classify_adopted(fd),
            Ok(ClassifiedFd::Server(_, ServerKind::StreamListener))
        ));
    }
}
