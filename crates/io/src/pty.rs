//! PTY pair allocation and window-size control (spec §5). Grounded on
//! `original_source/lem/io/pty.c` (`posix_openpt`/`grantpt`/`unlockpt`/raw
//! mode) and `lem/io/tty.c` (`TIOCGWINSZ`/`TIOCSWINSZ`).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, OpenptFlags};
use nix::sys::termios::{self, SetArg};

use crate::error::IoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub row: u16,
    pub col: u16,
    pub xpixel: u16,
    pub ypixel: u16,
}

pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocates a PTY pair, puts the slave side in raw mode, and marks both
/// ends non-blocking. Intended to run on a pool thread (`posix_openpt` and
/// the `open(ptsname(...))` that follows are blocking calls).
pub fn open_pair() -> Result<PtyPair, IoError> {
    let master = posix_openpt(OpenptFlags::O_RDWR | OpenptFlags::O_NOCTTY).map_err(IoError::from_errno)?;
    grantpt(&master).map_err(IoError::from_errno)?;
    unlockpt(&master).map_err(IoError::from_errno)?;

    let slave_name = ptsname_r(&master).map_err(IoError::from_errno)?;
    let slave_fd = nix::fcntl::open(
        slave_name.as_str(),
        nix::fcntl::OFlag::O_RDWR,
        nix::sys::stat::Mode::empty(),
    )
    .map_err(IoError::from_errno)?;
    let slave: OwnedFd = unsafe { std::os::fd::FromRawFd::from_raw_fd(slave_fd) };

    if let Ok(mut attrs) = termios::tcgetattr(&slave) {
        termios::cfmakeraw(&mut attrs);
        let _ = termios::tcsetattr(&slave, SetArg::TCSANOW, &attrs);
    }

    set_nonblocking(master.as_raw_fd())?;
    set_nonblocking(slave.as_raw_fd())?;

    Ok(PtyPair { master, slave })
}

fn set_nonblocking(fd: RawFd) -> Result<(), IoError> {
    let flags = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFL).map_err(IoError::from_errno)?;
    let mut flags = nix::fcntl::OFlag::from_bits_truncate(flags);
    flags.insert(nix::fcntl::OFlag::O_NONBLOCK);
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFL(flags)).map_err(IoError::from_errno)?;
    Ok(())
}

pub fn get_window_size(fd: RawFd) -> Result<WindowSize, IoError> {
    #[repr(C)]
    #[derive(Default)]
    struct RawWinsize {
        ws_row: u16,
        ws_col: u16,
        ws_xpixel: u16,
        ws_ypixel: u16,
    }
    nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, RawWinsize);

    let mut ws = RawWinsize::default();
    unsafe { tiocgwinsz(fd, &mut ws) }.map_err(IoError::from_errno)?;
    Ok(WindowSize {
        row: ws.ws_row,
        col: ws.ws_col,
        xpixel: ws.ws_xpixel,
        ypixel: ws.ws_ypixel,
    })
}

pub fn set_window_size(fd: RawFd, size: WindowSize) -> Result<(), IoError> {
    #[repr(C)]
    struct RawWinsize {
        ws_row: u16,
        ws_col: u16,
        ws_xpixel: u16,
        ws_ypixel: u16,
    }
    nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, RawWinsize);

    let ws = RawWinsize {
        ws_row: size.row,
        ws_col: size.col,
        ws_xpixel: size.xpixel,
        ws_ypixel: size.ypixel,
    };
    unsafe { tiocswinsz(fd, &ws) }.map_err(IoError::from_errno)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_a_usable_pty_pair() {
        let pair = open_pair().expect("posix_openpt should succeed in test sandboxes with /dev/ptmx");
        assert!(pair.master.as_raw_fd() >= 0);
        assert!(pair.slave.as_raw_fd() >= 0);
    }

    #[test]
    fn window_size_round_trips() {
        let pair = open_pair().expect("open pty pair");
        let size = WindowSize { row: 40, col: 100, xpixel: 0, ypixel: 0 };
        set_window_size(pair.master.as_raw_fd(), size).expect("set window size");
        let got = get_window_size(pair.master.as_raw_fd()).expect("get window size");
        assert_eq!(got, size);
    }
}
