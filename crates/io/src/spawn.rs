//! Process spawn and reap (spec §5). Grounded on
//! `original_source/lem/io/lem_spawnx.c` (the clone+pipe synchronous-errno
//! spawn) and `original_source/lem/os/core.c` (`waitpid` as a pool job,
//! `getpid`/`getppid`/`setpgrp`). The clone/vfork/pipe machinery there
//! exists to report the child's exec failure back to the parent
//! synchronously without the signal-handler races of a bare `fork`;
//! `std::process::Command` plus `CommandExt::pre_exec` gets the same
//! synchronous-errno guarantee (a failed `exec` surfaces as an `io::Error`
//! from `spawn()` itself) without hand-rolling the pipe protocol.

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::IoError;

bitflags::bitflags! {
    /// Mirrors `LEM_SPAWN_*` (lem_spawnx.c): which of the optional setup
    /// steps the child should perform before `exec`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpawnFlags: u32 {
        const SETPGROUP = 0b0000_0001;
        const SETSID    = 0b0000_0010;
        const SCTTY     = 0b0000_0100;
    }
}

/// Redirect an fd in the child before `exec` (the `fdop` list in
/// lem_spawnx.c, restricted to the subset the spec's §5 surface needs).
#[derive(Debug, Clone)]
pub enum FdAction {
    Close(RawFd),
    Dup2 { src: RawFd, dst: RawFd },
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub flags: SpawnFlags,
    pub pgroup: i32,
    pub env: Option<HashMap<OsString, OsString>>,
    pub cwd: Option<OsString>,
    pub fd_actions: Vec<FdAction>,
}

impl Default for SpawnFlags {
    fn default() -> Self {
        SpawnFlags::empty()
    }
}

pub struct SpawnOutcome {
    pub pid: i32,
    pub child: std::process::Child,
}

/// Spawns `path` with `argv`, performing the requested setup in the child
/// before `exec`. `argv[0]` is taken as the program's own view of its name
/// and is NOT auto-prefixed with `path`; callers that want PATH search
/// (`lem_spawnp`) pass a bare filename as `path`.
pub fn spawn(
    path: &str,
    argv: &[String],
    opts: &SpawnOptions,
) -> Result<SpawnOutcome, IoError> {
    let mut cmd = Command::new(path);
    if argv.len() > 1 {
        cmd.args(&argv[1..]);
    }
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = &opts.env {
        cmd.env_clear();
        cmd.envs(env);
    }
    cmd.stdin(Stdio::inherit());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    let flags = opts.flags;
    let pgroup = opts.pgroup;
    let fd_actions = opts.fd_actions.clone();

    unsafe {
        cmd.pre_exec(move || {
            // Reset every caught signal to SIG_DFL: a handler inherited
            // from the parent must never run in the child address space
            // post-exec hand-off (lem_spawnx.c's `child()` sigaction loop).
            reset_signal_dispositions();

            if flags.contains(SpawnFlags::SETPGROUP) {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(pgroup))
                    .map_err(std::io::Error::from)?;
            }

            for action in &fd_actions {
                match action {
                    FdAction::Close(fd) => {
                        nix::unistd::close(*fd).map_err(std::io::Error::from)?;
                    }
                    FdAction::Dup2 { src, dst } => {
                        nix::unistd::dup2(*src, *dst).map_err(std::io::Error::from)?;
                    }
                }
            }

            if flags.contains(SpawnFlags::SETSID) {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
            }

            if flags.contains(SpawnFlags::SCTTY) {
                set_controlling_tty()?;
            }

            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| IoError::from_io(&e))?;
    let pid = child.id() as i32;
    Ok(SpawnOutcome { pid, child })
}

/// `popen(cmd, mode)`'s `mode` table (spec's external-interfaces surface):
/// which of the child's standard streams get wired to a pipe/socket the
/// caller keeps, rather than the inherited terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopenMode {
    /// `"r"` — caller reads the child's stdout.
    ReadStdout,
    /// `"w"` — caller writes the child's stdin.
    WriteStdin,
    /// `"rw"` — both of the above, as two independent pipes.
    ReadWrite,
    /// `"3s"` — a single bidirectional socketpair duped onto the child's
    /// fd 3, for protocols that want one full-duplex channel rather than
    /// two half-duplex pipes.
    Bidirectional,
}

impl PopenMode {
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "r" => Some(Self::ReadStdout),
            "w" => Some(Self::WriteStdin),
            "rw" => Some(Self::ReadWrite),
            "3s" => Some(Self::Bidirectional),
            _ => None,
        }
    }
}

/// The caller-side fds `popen` hands back, alongside the spawned child.
/// Exactly the fields `mode` calls for are `Some`.
pub struct PopenOutcome {
    pub pid: i32,
    pub child: std::process::Child,
    pub stdin_fd: Option<RawFd>,
    pub stdout_fd: Option<RawFd>,
    pub socket_fd: Option<RawFd>,
}

/// Convenience over [`spawn`]: builds the pipes/socketpair `mode` calls
/// for, wires them into the child's standard fds via [`FdAction`], and
/// hands the caller's side back already separated from the child's copy.
pub fn popen(
    path: &str,
    argv: &[String],
    mode: PopenMode,
    opts: &SpawnOptions,
) -> Result<PopenOutcome, IoError> {
    let mut fd_actions = opts.fd_actions.clone();
    let mut stdin_fd = None;
    let mut stdout_fd = None;
    let mut socket_fd = None;
    let mut close_after_spawn = Vec::new();

    if matches!(mode, PopenMode::WriteStdin | PopenMode::ReadWrite) {
        let (read_end, write_end) = nix::unistd::pipe().map_err(IoError::from_errno)?;
        let read_raw = read_end.as_raw_fd();
        fd_actions.push(FdAction::Dup2 { src: read_raw, dst: 0 });
        fd_actions.push(FdAction::Close(write_end.as_raw_fd()));
        close_after_spawn.push(read_raw);
        stdin_fd = Some(write_end.into_raw_fd());
    }

    if matches!(mode, PopenMode::ReadStdout | PopenMode::ReadWrite) {
        let (read_end, write_end) = nix::unistd::pipe().map_err(IoError::from_errno)?;
        let write_raw = write_end.as_raw_fd();
        fd_actions.push(FdAction::Dup2 { src: write_raw, dst: 1 });
        fd_actions.push(FdAction::Close(read_end.as_raw_fd()));
        close_after_spawn.push(write_raw);
        stdout_fd = Some(read_end.into_raw_fd());
    }

    if matches!(mode, PopenMode::Bidirectional) {
        let (parent_end, child_end) = crate::net::socketpair()?;
        let child_raw = child_end.as_raw_fd();
        fd_actions.push(FdAction::Dup2 { src: child_raw, dst: 3 });
        close_after_spawn.push(child_raw);
        socket_fd = Some(parent_end.into_raw_fd());
        std::mem::forget(child_end);
    }

    let opts = SpawnOptions {
        fd_actions,
        ..opts.clone()
    };
    let outcome = spawn(path, argv, &opts)?;

    for fd in close_after_spawn {
        let _ = nix::unistd::close(fd);
    }

    Ok(PopenOutcome {
        pid: outcome.pid,
        child: outcome.child,
        stdin_fd,
        stdout_fd,
        socket_fd,
    })
}

fn reset_signal_dispositions() -> std::io::Result<()> {
    use nix::sys::signal::{sigaction, SigAction, SigHandler};
    for raw in 1..32 {
        let Ok(sig) = Signal::try_from(raw) else {
            continue;
        };
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        let default = SigAction::new(SigHandler::SigDfl, nix::sys::signal::SaFlags::empty(), SigSet::empty());
        unsafe {
            let _ = sigaction(sig, &default);
        }
    }
    Ok(())
}

fn set_controlling_tty() -> std::io::Result<()> {
    const TIOCSCTTY: libc::c_ulong = 0x540E;
    let ret = unsafe { libc::ioctl(0, TIOCSCTTY as _, 1) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// The decoded `waitpid(2)` result (spec §5, "Process reap"); mirrors the
/// `WIFEXITED`/`WIFSIGNALED`/`WIFSTOPPED`/`WIFCONTINUED` breakdown
/// `os_waitpid_reap` builds into a Lua table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitOutcome {
    pub exited: bool,
    pub exit_status: Option<i32>,
    pub signaled: bool,
    pub term_signal: Option<i32>,
    pub core_dumped: bool,
    pub stopped: bool,
    pub stop_signal: Option<i32>,
    pub continued: bool,
}

impl From<WaitStatus> for WaitOutcome {
    fn from(status: WaitStatus) -> Self {
        let mut out = WaitOutcome::default();
        match status {
            WaitStatus::Exited(_, code) => {
                out.exited = true;
                out.exit_status = Some(code);
            }
            WaitStatus::Signaled(_, sig, core) => {
                out.signaled = true;
                out.term_signal = Some(sig as i32);
                out.core_dumped = core;
            }
            WaitStatus::Stopped(_, sig) => {
                out.stopped = true;
                out.stop_signal = Some(sig as i32);
            }
            WaitStatus::Continued(_) => {
                out.continued = true;
            }
            _ => {}
        }
        out
    }
}

/// Runs a blocking `waitpid` for `pid` with `options`, retrying on `EINTR`
/// (`os_waitpid_work`'s `retry_waitpid` label). Intended to run inside a
/// pool job, never on the reactor thread.
pub fn wait_blocking(pid: i32, options: WaitPidFlag) -> Result<WaitOutcome, IoError> {
    loop {
        match waitpid(Pid::from_raw(pid), Some(options)) {
            Ok(status) => return Ok(WaitOutcome::from(status)),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(IoError::from_errno(e)),
        }
    }
}

pub fn getpid() -> i32 {
    nix::unistd::getpid().as_raw()
}

pub fn getppid() -> i32 {
    nix::unistd::getppid().as_raw()
}

pub fn setpgrp() -> i32 {
    let _ = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
    nix::unistd::getpgrp().as_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawns_true_and_reaps_success() {
        let opts = SpawnOptions::default();
        let outcome = spawn("/bin/true", &["true".to_string()], &opts).expect("spawn");
        let result = wait_blocking(outcome.pid, WaitPidFlag::empty()).expect("wait");
        assert!(result.exited);
        assert_eq!(result.exit_status, Some(0));
    }

    #[test]
    fn spawn_of_missing_binary_is_an_io_error() {
        let opts = SpawnOptions::default();
        let result = spawn("/nonexistent/definitely-not-here", &[], &opts);
        assert!(result.is_err());
    }

    #[test]
    fn wait_outcome_decodes_exit_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 7);
        let outcome = WaitOutcome::from(status);
        assert!(outcome.exited);
        assert_eq!(outcome.exit_status, Some(7));
        assert!(!outcome.signaled);
    }
}
