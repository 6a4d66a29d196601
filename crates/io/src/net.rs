//! TCP/UDP/Unix socket setup, name resolution, socketpairs, and fd passing
//! (spec §4/§5). Grounded on `original_source/lem/io/server.c` (listener
//! setup, the `autospawn`/datagram accept loop, the transient-errno retry
//! list) and the non-blocking-by-default posture `core.c` establishes for
//! every fd handed to the reactor.

use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
    UnixAddr,
};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::IoError;

/// Errno values the accept/recv loop retries rather than propagates
/// (`server.c`'s `server__accept`: EAGAIN/EWOULDBLOCK/EINTR/ECONNABORTED,
/// plus the historical Linux proto-errors a dying peer can leave behind).
pub fn is_transient_accept_error(err: Errno) -> bool {
    matches!(
        err,
        Errno::EAGAIN
            | Errno::EINTR
            | Errno::ECONNABORTED
            | Errno::EPROTO
            | Errno::ENETDOWN
            | Errno::ENONET
            | Errno::ENETUNREACH
            | Errno::EHOSTDOWN
            | Errno::EHOSTUNREACH
            | Errno::EOPNOTSUPP
    )
}

/// Resolves `host:port` (or a unix path prefixed `unix:`) to a connectable
/// address. Runs on a pool thread: `getaddrinfo` is a blocking call.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, IoError> {
    let spec = format!("{host}:{port}");
    spec.to_socket_addrs()
        .map_err(|e| IoError::from_io(&e))?
        .next()
        .ok_or(IoError::InvalidArgument)
}

/// Opens a non-blocking TCP connection to `addr`. The connect itself may
/// still be in progress (`EINPROGRESS`) when this returns; the reactor
/// watches the fd for writability to learn of completion.
pub fn connect_tcp(addr: SocketAddr) -> Result<OwnedFd, IoError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|e| IoError::from_io(&e))?;
    socket.set_nonblocking(true).map_err(|e| IoError::from_io(&e))?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(IoError::from_io(&e)),
    }
    Ok(socket.into())
}

pub fn listen_tcp(addr: SocketAddr, backlog: i32) -> Result<OwnedFd, IoError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|e| IoError::from_io(&e))?;
    socket.set_reuse_address(true).map_err(|e| IoError::from_io(&e))?;
    socket.set_nonblocking(true).map_err(|e| IoError::from_io(&e))?;
    socket.bind(&addr.into()).map_err(|e| IoError::from_io(&e))?;
    socket.listen(backlog).map_err(|e| IoError::from_io(&e))?;
    Ok(socket.into())
}

pub fn listen_udp(addr: SocketAddr) -> Result<OwnedFd, IoError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| IoError::from_io(&e))?;
    socket.set_nonblocking(true).map_err(|e| IoError::from_io(&e))?;
    socket.bind(&addr.into()).map_err(|e| IoError::from_io(&e))?;
    Ok(socket.into())
}

pub fn connect_unix(path: &str) -> Result<OwnedFd, IoError> {
    let addr = UnixAddr::new(path).map_err(IoError::from_errno)?;
    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(IoError::from_errno)?;
    match socket::connect(fd.as_raw_fd(), &addr) {
        Ok(()) => {}
        Err(Errno::EINPROGRESS) => {}
        Err(e) => return Err(IoError::from_errno(e)),
    }
    Ok(fd)
}

pub fn listen_unix(path: &str, backlog: usize) -> Result<OwnedFd, IoError> {
    let _ = std::fs::remove_file(path);
    let addr = UnixAddr::new(path).map_err(IoError::from_errno)?;
    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(IoError::from_errno)?;
    socket::bind(fd.as_raw_fd(), &addr).map_err(IoError::from_errno)?;
    socket::listen(&fd, backlog).map_err(IoError::from_errno)?;
    Ok(fd)
}

/// Accepts one connection off a listening fd, translating the transient
/// retry set into `Ok(None)` (caller should keep watching readability).
pub fn accept_one(listen_fd: RawFd) -> Result<Option<OwnedFd>, IoError> {
    match socket::accept4(listen_fd, SockFlag::SOCK_NONBLOCK) {
        Ok(fd) => Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) })),
        Err(e) if is_transient_accept_error(e) => Ok(None),
        Err(e) => Err(IoError::from_errno(e)),
    }
}

/// A connected pair of non-blocking Unix-domain sockets (spec §5's
/// `socketpair` surface; also the bridge half of the `sendfile` path).
pub fn socketpair() -> Result<(OwnedFd, OwnedFd), IoError> {
    let (a, b) = socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_NONBLOCK,
    )
    .map_err(IoError::from_errno)?;
    Ok((a, b))
}

/// Sends a single byte plus one fd over `SCM_RIGHTS` on a connected Unix
/// socket (spec §5, "passfd").
pub fn send_fd(sock: RawFd, fd: RawFd) -> Result<(), IoError> {
    let iov = [std::io::IoSlice::new(&[0u8])];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    socket::sendmsg::<()>(sock, &iov, &cmsg, MsgFlags::empty(), None).map_err(IoError::from_errno)?;
    Ok(())
}

/// Receives one fd passed via `send_fd`. Returns `Ok(None)` if the peer
/// closed without sending one.
pub fn recv_fd(sock: RawFd) -> Result<Option<OwnedFd>, IoError> {
    let mut buf = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut buf)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let msg = socket::recvmsg::<()>(
        sock,
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )
    .map_err(IoError::from_errno)?;

    for cmsg in msg.cmsgs().map_err(IoError::from_errno)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
    }
    Ok(None)
}

pub fn into_raw(fd: OwnedFd) -> RawFd {
    fd.into_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_listen_and_connect_round_trip() {
        let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = listen_tcp(listen_addr, 16).unwrap();
        let bound = socket2::SockAddr::from(listen_addr);
        let local = unsafe {
            let sock = Socket::from_raw_fd(listener.as_raw_fd());
            let addr = sock.local_addr().unwrap();
            std::mem::forget(sock);
            addr
        };
        let _ = bound;
        let local_addr = local.as_socket().unwrap();

        let _client = connect_tcp(local_addr).unwrap();
        let accepted = accept_one(listener.as_raw_fd());
        assert!(accepted.is_ok());
    }

    #[test]
    fn socketpair_round_trips_an_fd() {
        let (a, b) = socketpair().unwrap();
        let (donor_r, donor_w) = socketpair().unwrap();
        send_fd(a.as_raw_fd(), donor_r.as_raw_fd()).unwrap();
        let received = recv_fd(b.as_raw_fd());
        assert!(matches!(received, Ok(Some(_))));
        drop(donor_w);
    }

    #[test]
    fn transient_accept_errors_are_classified() {
        assert!(is_transient_accept_error(Errno::EAGAIN));
        assert!(!is_transient_accept_error(Errno::EBADF));
    }
}
