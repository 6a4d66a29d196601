//! `stream_file`: open a regular file and hand back a readable stream fed
//! by a background `sendfile(2)` pump, without ever blocking the reactor
//! on disk I/O (spec §5, "stream_file"). Grounded on
//! `original_source/lem/io/core.c`'s `io_streamfile_open`/`_worker`/`_reap`
//! trio: open the file on a pool thread, create a socketpair, hand the
//! read end back to the caller immediately, and keep pumping the write end
//! from the file on a second pool job until EOF.

use std::fs::File;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::error::IoError;
use crate::net::socketpair;

pub struct StreamFileHandle {
    /// The fd to hand back to the caller as a readable stream.
    pub read_end: OwnedFd,
}

/// Opens `path` and wires up the socketpair + pump. Run the open step on a
/// pool thread (`open(2)` on arbitrary paths can block on network
/// filesystems); the returned `pump` closure is the second pool job and
/// must also run off the reactor thread.
pub fn open(path: &str) -> Result<(StreamFileHandle, impl FnOnce() + Send), IoError> {
    let file = File::open(path).map_err(|e| IoError::from_io(&e))?;
    let (read_end, write_end) = socketpair()?;

    // The caller only ever reads; shut the read half of its end down so a
    // write by a confused caller surfaces as EPIPE immediately rather than
    // silently buffering (`shutdown(s->pipe[0], SHUT_WR)` in the original,
    // mirrored here on our own peer of the pair).
    nix::sys::socket::shutdown(read_end.as_raw_fd(), nix::sys::socket::Shutdown::Write)
        .map_err(IoError::from_errno)?;

    let pump = move || pump_file_to_socket(file, write_end);

    Ok((StreamFileHandle { read_end }, pump))
}

fn pump_file_to_socket(file: File, write_end: OwnedFd) {
    let file_fd: RawFd = file.into_raw_fd();
    let out_fd = write_end.into_raw_fd();
    loop {
        let sent = unsafe { libc::sendfile(out_fd, file_fd, std::ptr::null_mut(), 2_147_483_647) };
        if sent <= 0 {
            break;
        }
    }
    unsafe {
        libc::close(file_fd);
        libc::close(out_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn streams_file_contents_through_the_pump() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello from disk").unwrap();
        tmp.flush().unwrap();

        let (handle, pump) = open(tmp.path().to_str().unwrap()).unwrap();
        let pump_thread = std::thread::spawn(pump);

        let mut sock = unsafe {
            use std::os::fd::FromRawFd;
            std::os::unix::net::UnixStream::from_raw_fd(handle.read_end.into_raw_fd())
        };
        let mut out = Vec::new();
        sock.read_to_end(&mut out).unwrap();
        pump_thread.join().unwrap();

        assert_eq!(out, b"hello from disk");
    }
}
