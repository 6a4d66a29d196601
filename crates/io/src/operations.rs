//! The script-facing endpoint operations spec §4.4 describes: `open`,
//! `read_parsed`, `write`, `close`, `accept`/`autospawn`, and the
//! datagram-listener receive loop. Each is a free function over `&mut
//! Core<R>` rather than an inherent method so this module can stay
//! ignorant of `CompletionSink` (only `Core::open_path`/`stream_file`
//! need it, for the pool-job completion path) — everything else here
//! only touches the endpoint table and the reactor registration `Core`'s
//! public API already exposes.

use dispatch_pool::Job;
use dispatch_task_host::ScriptRuntime;

use crate::buffer::StreamParser;
use crate::completion::RawCompletion;
use crate::core::{CompletionSink, Core};
use crate::endpoint::{Endpoint, OpenState, ServerKind, StreamState};
use crate::error::IoError;
use crate::net::is_transient_accept_error;

/// `open(path, mode, perm)`'s `mode` string (spec §6): the POSIX-familiar
/// `r`/`w`/`a`(`+`)(`b`)(`x`) table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub flags: nix::fcntl::OFlag,
}

impl OpenMode {
    /// Parses the mode strings spec §6 lists: `r`, `w`, `a`, `r+`, `w+`,
    /// `a+`, each optionally suffixed `b` (binary — a no-op on POSIX) and
    /// `x` (exclusive create, valid only with `w`/`a` variants).
    pub fn parse(mode: &str) -> Result<Self, IoError> {
        use nix::fcntl::OFlag;

        let stripped: String = mode.chars().filter(|c| *c != 'b').collect();
        let (base, exclusive) = match stripped.strip_suffix('x') {
            Some(base) => (base, true),
            None => (stripped.as_str(), false),
        };

        let flags = match base {
            "r" => OFlag::O_RDONLY,
            "w" => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            "a" => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
            "r+" => OFlag::O_RDWR,
            "w+" => OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_TRUNC,
            "a+" => OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_APPEND,
            _ => return Err(IoError::InvalidModeString),
        };

        if exclusive {
            if !flags.contains(OFlag::O_CREAT) {
                return Err(IoError::InvalidModeString);
            }
            return Ok(Self { flags: flags | OFlag::O_EXCL });
        }
        Ok(Self { flags })
    }
}

/// Caps path length the way `PATH_MAX` does on Linux (spec §7, "path too
/// long").
const PATH_MAX: usize = 4096;

/// Opens `path` as a one-shot pool job (spec §4.4 "Opening a path"):
/// `open(2)` with `O_CLOEXEC`, then `fstat` to classify as `File` or
/// `Stream`. The completion is delivered through the normal
/// `RawCompletion` → `Completion` pipeline once the job lands back on the
/// reactor thread.
pub fn open_path<R>(core: &mut Core<R>, task: R::TaskHandle, path: String, mode: OpenMode, perm: u32)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    if path.len() > PATH_MAX {
        deliver_now(core, task, |task| crate::completion::Completion::Open {
            task,
            result: Err(IoError::PathTooLong),
        });
        return;
    }
    core.submit_completion(move || {
        let result = open_blocking(&path, mode, perm);
        RawCompletion::Open { task, result }
    });
}

fn open_blocking(
    path: &str,
    mode: OpenMode,
    perm: u32,
) -> Result<crate::completion::RawOpenOutcome, IoError> {
    use nix::sys::stat::Mode;

    let mut flags = mode.flags;
    flags.insert(nix::fcntl::OFlag::O_CLOEXEC);
    let perm = Mode::from_bits_truncate(perm);

    let fd = match nix::fcntl::open(path, flags, perm) {
        Ok(fd) => fd,
        Err(e) => return Err(IoError::from_errno(e)),
    };
    match crate::classify::classify_opened(fd) {
        Ok(crate::endpoint::ClassifiedFd::File(fd)) => Ok(crate::completion::RawOpenOutcome::File(fd)),
        Ok(crate::endpoint::ClassifiedFd::Stream(fd)) => Ok(crate::completion::RawOpenOutcome::Stream(fd)),
        Ok(crate::endpoint::ClassifiedFd::Server(..)) => {
            let _ = nix::unistd::close(fd);
            Err(IoError::InvalidArgument)
        }
        Err(e) => {
            let _ = nix::unistd::close(fd);
            Err(e)
        }
    }
}

/// `stream_file(path)` (spec §4.4 "stream_file"): opens `path` and hands
/// back a readable stream fed by a background `sendfile(2)` pump, without
/// ever blocking the reactor on disk I/O. Both the open and the pump run
/// on the same worker-thread job — the pump only starts after the
/// `StreamFileOpened` completion has already been handed off, so the
/// reactor thread never waits on it.
pub fn stream_file<R>(core: &mut Core<R>, task: R::TaskHandle, path: String)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let tx = core.completion_sender();
    core.submit_job(Job::fire_and_forget(move || {
        use std::os::fd::IntoRawFd;
        match crate::sendfile::open(&path) {
            Ok((handle, pump)) => {
                let raw = handle.read_end.into_raw_fd();
                let _ = tx.send(RawCompletion::StreamFileOpened { task, result: Ok(raw) });
                pump();
            }
            Err(e) => {
                let _ = tx.send(RawCompletion::StreamFileOpened { task, result: Err(e) });
            }
        }
    }));
}

fn deliver_now<R, F>(core: &mut Core<R>, task: R::TaskHandle, build: F)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
    F: FnOnce(R::TaskHandle) -> crate::completion::Completion<R::TaskHandle>,
{
    let completion = build(task);
    let nargs = core.runtime_mut().deliver(task, completion);
    core.enqueue(task, nargs);
}

fn file_fd<R: ScriptRuntime + CompletionSink<R::TaskHandle>>(
    core: &Core<R>,
    key: usize,
) -> Result<std::os::fd::RawFd, IoError> {
    match core.endpoint(key) {
        Some(Endpoint::File(f)) if f.open => Ok(f.fd),
        Some(Endpoint::File(_)) => Err(IoError::Closed),
        Some(_) => Err(IoError::InvalidArgument),
        None => Err(IoError::Closed),
    }
}

/// `read_at(offset, len)` (spec §4.4 "File operations"): always a pool
/// job, since `read(2)` on a regular file cannot be made non-blocking.
pub fn file_read_at<R>(core: &mut Core<R>, task: R::TaskHandle, key: usize, offset: i64, len: usize)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    match file_fd(core, key) {
        Ok(fd) => core.submit_completion(move || {
            let mut buf = vec![0u8; len];
            let n = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, len, offset) };
            let result = if n < 0 {
                Err(IoError::from_errno(nix::errno::Errno::last()))
            } else {
                buf.truncate(n as usize);
                Ok(buf)
            };
            RawCompletion::FileRead { task, result }
        }),
        Err(e) => deliver_now(core, task, |task| crate::completion::Completion::FileRead { task, result: Err(e) }),
    }
}

/// `write_at(offset, bytes)`.
pub fn file_write_at<R>(core: &mut Core<R>, task: R::TaskHandle, key: usize, offset: i64, bytes: Vec<u8>)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    match file_fd(core, key) {
        Ok(fd) => core.submit_completion(move || {
            let n = unsafe { libc::pwrite(fd, bytes.as_ptr() as *const libc::c_void, bytes.len(), offset) };
            let result = if n < 0 {
                Err(IoError::from_errno(nix::errno::Errno::last()))
            } else {
                Ok(n as usize)
            };
            RawCompletion::FileWrite { task, result }
        }),
        Err(e) => deliver_now(core, task, |task| crate::completion::Completion::FileWrite { task, result: Err(e) }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start,
    Current,
    End,
}

/// `seek(whence, offset)`.
pub fn file_seek<R>(core: &mut Core<R>, task: R::TaskHandle, key: usize, whence: SeekFrom, offset: i64)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    match file_fd(core, key) {
        Ok(fd) => core.submit_completion(move || {
            let whence = match whence {
                SeekFrom::Start => libc::SEEK_SET,
                SeekFrom::Current => libc::SEEK_CUR,
                SeekFrom::End => libc::SEEK_END,
            };
            let pos = unsafe { libc::lseek(fd, offset, whence) };
            let result = if pos < 0 {
                Err(IoError::from_errno(nix::errno::Errno::last()))
            } else {
                Ok(pos as u64)
            };
            RawCompletion::FileSeek { task, result }
        }),
        Err(e) => deliver_now(core, task, |task| crate::completion::Completion::FileSeek { task, result: Err(e) }),
    }
}

/// `size()`: current length of the underlying file, via `fstat`.
pub fn file_size<R>(core: &mut Core<R>, task: R::TaskHandle, key: usize)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    match file_fd(core, key) {
        Ok(fd) => core.submit_completion(move || {
            let result = nix::sys::stat::fstat(fd).map(|st| st.st_size as u64).map_err(IoError::from_errno);
            RawCompletion::FileSize { task, result }
        }),
        Err(e) => deliver_now(core, task, |task| crate::completion::Completion::FileSize { task, result: Err(e) }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
    Unlock,
}

/// `lock(kind)`: a whole-file advisory `flock(2)`, run on a pool thread
/// since a conflicting lock held elsewhere blocks until released.
pub fn file_lock<R>(core: &mut Core<R>, task: R::TaskHandle, key: usize, kind: LockKind)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    match file_fd(core, key) {
        Ok(fd) => core.submit_completion(move || {
            let op = match kind {
                LockKind::Shared => libc::LOCK_SH,
                LockKind::Exclusive => libc::LOCK_EX,
                LockKind::Unlock => libc::LOCK_UN,
            };
            let ret = unsafe { libc::flock(fd, op) };
            let result = if ret != 0 {
                Err(IoError::from_errno(nix::errno::Errno::last()))
            } else {
                Ok(())
            };
            RawCompletion::FileLock { task, result }
        }),
        Err(e) => deliver_now(core, task, |task| crate::completion::Completion::FileLock { task, result: Err(e) }),
    }
}

/// `resolve(host, port)`: `getaddrinfo` as a pool job (spec §4.4,
/// "name resolution").
pub fn resolve<R>(core: &mut Core<R>, task: R::TaskHandle, host: String, port: u16)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    core.submit_completion(move || {
        let result = crate::net::resolve(&host, port);
        RawCompletion::Resolve { task, result }
    });
}

/// `spawn(argv, streams, env, attrs)`: `fork`+`exec` as a pool job — the
/// clone itself is fast, but DNS/cwd/exec lookups on the child's `PATH`
/// can stall briefly, so it never runs on the reactor thread.
pub fn spawn_process<R>(
    core: &mut Core<R>,
    task: R::TaskHandle,
    path: String,
    argv: Vec<String>,
    opts: crate::spawn::SpawnOptions,
) where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    core.submit_completion(move || {
        let result = crate::spawn::spawn(&path, &argv, &opts);
        RawCompletion::Spawn { task, result }
    });
}

/// `waitpid(pid, options)`: a blocking pool job (spec §5, "Process
/// reap").
pub fn waitpid<R>(core: &mut Core<R>, task: R::TaskHandle, pid: i32, options: nix::sys::wait::WaitPidFlag)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    core.submit_completion(move || {
        let result = crate::spawn::wait_blocking(pid, options);
        RawCompletion::Waitpid { task, result }
    });
}

/// Outcome of a suspendable stream/server operation that didn't resolve
/// synchronously.
#[derive(Debug)]
pub enum ReadOutcome<T> {
    Ready(T),
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Complete,
    Suspended,
}

#[derive(Debug)]
pub enum AcceptOutcome {
    Ready(usize),
    Suspended,
}

fn borrow_stream_mut<R: ScriptRuntime + CompletionSink<R::TaskHandle>>(
    core: &mut Core<R>,
    key: usize,
) -> Result<&mut StreamState<R::TaskHandle>, IoError> {
    match core.endpoint_mut(key) {
        Some(Endpoint::Stream(s)) => Ok(s),
        Some(_) => Err(IoError::InvalidArgument),
        None => Err(IoError::Closed),
    }
}

/// `readp(parser)` (spec §4.4 "Stream read contract"): tries to parse a
/// value out of what's already buffered; failing that, reads more
/// non-blockingly and retries, suspending on `EAGAIN` by parking `task` on
/// the stream's read slot. Call again with the same parser after the task
/// is resumed (the watcher callback just wakes the task; it doesn't know
/// how to parse).
pub fn read_parsed<R, P>(
    core: &mut Core<R>,
    key: usize,
    task: R::TaskHandle,
    parser: &mut P,
) -> Result<ReadOutcome<P::Output>, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
    P: StreamParser,
{
    loop {
        let stream = borrow_stream_mut(core, key)?;
        if stream.open == OpenState::Closed {
            return Err(IoError::Closed);
        }
        if stream.read.is_busy() {
            return Err(IoError::Busy);
        }

        if let Some(value) = parser.parse(&mut stream.input)? {
            return Ok(ReadOutcome::Ready(value));
        }

        if !stream.input.has_spare_capacity() {
            return Err(IoError::OutOfBufferSpace);
        }

        let fd = stream.fd;
        let buf = stream.input.spare_mut();
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n == 0 {
            close_stream_fd(core, key);
            return Err(IoError::Closed);
        } else if n > 0 {
            let stream = borrow_stream_mut(core, key)?;
            stream.input.note_appended(n as usize);
            continue;
        }
        match nix::errno::Errno::last() {
            nix::errno::Errno::EINTR => continue,
            nix::errno::Errno::EAGAIN => {
                let stream = borrow_stream_mut(core, key)?;
                stream.read.waiting = Some(task);
                return Ok(ReadOutcome::Suspended);
            }
            e => {
                close_stream_fd(core, key);
                return Err(IoError::from_errno(e));
            }
        }
    }
}

/// `write(bytes)` (spec §4.4 "Stream write contract"): attempts a
/// non-blocking write, advancing on partial progress and suspending on
/// `EAGAIN` with the unwritten tail parked on the stream for
/// [`write_continue`] to pick up when the write watcher next fires.
pub fn write<R>(
    core: &mut Core<R>,
    key: usize,
    task: R::TaskHandle,
    bytes: Vec<u8>,
) -> Result<WriteOutcome, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    {
        let stream = borrow_stream_mut(core, key)?;
        if stream.open == OpenState::Closed {
            return Err(IoError::Closed);
        }
        if stream.write.is_busy() {
            return Err(IoError::Busy);
        }
    }
    try_write(core, key, task, &bytes, 0)
}

/// Resumes a write suspended by [`write`], called once the write watcher
/// fires. `task` is needed again in case the write is still incomplete
/// and must re-arm.
pub fn write_continue<R>(core: &mut Core<R>, key: usize, task: R::TaskHandle) -> Result<WriteOutcome, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let pending = {
        let stream = borrow_stream_mut(core, key)?;
        stream.pending_write.take()
    };
    let Some((bytes, offset)) = pending else {
        return Ok(WriteOutcome::Complete);
    };
    try_write(core, key, task, &bytes, offset)
}

fn try_write<R>(
    core: &mut Core<R>,
    key: usize,
    task: R::TaskHandle,
    bytes: &[u8],
    mut offset: usize,
) -> Result<WriteOutcome, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    loop {
        if offset == bytes.len() {
            return Ok(WriteOutcome::Complete);
        }
        let fd = borrow_stream_mut(core, key)?.fd;
        let chunk = &bytes[offset..];
        let n = unsafe { libc::write(fd, chunk.as_ptr() as *const libc::c_void, chunk.len()) };
        if n >= 0 {
            offset += n as usize;
            continue;
        }
        match nix::errno::Errno::last() {
            nix::errno::Errno::EINTR => continue,
            nix::errno::Errno::EAGAIN => {
                let stream = borrow_stream_mut(core, key)?;
                stream.pending_write = Some((bytes[offset..].to_vec(), 0));
                stream.write.waiting = Some(task);
                return Ok(WriteOutcome::Suspended);
            }
            nix::errno::Errno::EPIPE | nix::errno::Errno::ECONNRESET => {
                close_stream_fd(core, key);
                return Err(IoError::Closed);
            }
            e => {
                close_stream_fd(core, key);
                return Err(IoError::from_errno(e));
            }
        }
    }
}

/// `close()` on a stream (spec §4.4 "Stream close"): resumes any task
/// still parked on either direction's watcher with `(nil, "closed")`,
/// closes the fd exactly once (skipped for borrowed stdio fds), and
/// deregisters the reactor registration.
pub fn stream_close<R>(core: &mut Core<R>, key: usize) -> Vec<R::TaskHandle>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let Some(Endpoint::Stream(mut stream)) = core.remove_endpoint(key) else {
        return Vec::new();
    };
    let mut waiters = Vec::new();
    if let Some(t) = stream.read.take() {
        waiters.push(t);
    }
    if let Some(t) = stream.write.take() {
        waiters.push(t);
    }
    if let Some(token) = stream.token.take() {
        let _ = core.deregister_io(token);
    }
    if stream.open == OpenState::Owned {
        let _ = nix::unistd::close(stream.fd);
    }
    stream.open = OpenState::Closed;
    waiters
}

fn close_stream_fd<R: ScriptRuntime + CompletionSink<R::TaskHandle>>(core: &mut Core<R>, key: usize) {
    let _ = stream_close(core, key);
}

/// `accept()` in accept-one mode (spec §4.4 "Two consumption modes"):
/// harvests at most one queued connection, suspending on the listener's
/// read slot if none is ready yet.
pub fn accept_one<R>(core: &mut Core<R>, key: usize, task: R::TaskHandle) -> Result<AcceptOutcome, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    {
        let server = match core.endpoint_mut(key) {
            Some(Endpoint::Server(s)) => s,
            Some(_) => return Err(IoError::InvalidArgument),
            None => return Err(IoError::Closed),
        };
        if server.autospawning {
            return Err(IoError::Busy);
        }
        if server.pending.is_busy() {
            return Err(IoError::Busy);
        }
    }

    let fd = match core.endpoint(key) {
        Some(Endpoint::Server(s)) => s.fd,
        _ => return Err(IoError::Closed),
    };

    match crate::net::accept_one(fd) {
        Ok(Some(owned)) => {
            let raw = crate::net::into_raw(owned);
            let stream_key = core.insert_stream(StreamState::new(raw, OpenState::Owned));
            let _ = core.register_stream_io(stream_key, mio::Interest::READABLE | mio::Interest::WRITABLE);
            Ok(AcceptOutcome::Ready(stream_key))
        }
        Ok(None) => {
            if let Some(Endpoint::Server(server)) = core.endpoint_mut(key) {
                server.pending.waiting = Some(task);
            }
            Ok(AcceptOutcome::Suspended)
        }
        Err(e) => {
            let _ = core.close_server(key);
            Err(e)
        }
    }
}

/// Cancels a pending `accept` (spec §5 "Cancellation & timeouts"): stops
/// the watcher and hands back the waiting task so the caller can resume
/// it with `(nil, "interrupted")`. The listener itself stays open.
pub fn server_interrupt<R>(core: &mut Core<R>, key: usize) -> Option<R::TaskHandle>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    match core.endpoint_mut(key) {
        Some(Endpoint::Server(server)) => server.pending.take(),
        _ => None,
    }
}

/// Closes a listener (spec §4.4 "Server accept loop"): resumes any
/// pending `accept` with `(nil, "closed")`.
pub fn server_close<R>(core: &mut Core<R>, key: usize) -> Option<R::TaskHandle>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    core.close_server(key)
}

/// `listen`/`listen4`/`listen6`'s `autospawn(fn)` mode (spec §4.4 "Two
/// consumption modes"): installs `make_task` as the factory invoked once
/// per accepted connection and immediately drains whatever is already
/// queued.
pub fn install_autospawn<R, F>(core: &mut Core<R>, key: usize, make_task: F)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
    F: FnMut(&mut Core<R>, usize) -> R::TaskHandle + 'static,
{
    core.install_autospawn(key, make_task);
}

/// Maximum datagram payload the listener harvests in one `recvfrom`
/// (spec §4.4 "Datagram listener"): 64 KiB, matching the largest UDP
/// payload a single packet can carry.
pub const DATAGRAM_BUFFER: usize = 64 * 1024;

/// One harvested UDP datagram, handed to the per-packet task factory the
/// way spec §4.4 describes: `(payload, source-ip-string, source-port)`.
pub struct Datagram {
    pub payload: Vec<u8>,
    pub source_ip: String,
    pub source_port: u16,
}

/// Harvests every currently queued datagram off a `DatagramListener`
/// server (spec §4.4 "Datagram listener"). Unlike the stream accept loop
/// this never creates a new endpoint — the caller's per-packet task gets
/// the raw payload and source address, not a `Stream`.
pub fn recv_datagrams<R>(core: &mut Core<R>, key: usize) -> Result<Vec<Datagram>, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let fd = match core.endpoint(key) {
        Some(Endpoint::Server(s)) if s.kind == ServerKind::DatagramListener => s.fd,
        Some(Endpoint::Server(_)) => return Err(IoError::InvalidArgument),
        _ => return Err(IoError::Closed),
    };

    let mut out = Vec::new();
    loop {
        let mut buf = vec![0u8; DATAGRAM_BUFFER];
        match nix::sys::socket::recvfrom::<nix::sys::socket::SockaddrStorage>(fd, &mut buf) {
            Ok((n, Some(addr))) => {
                buf.truncate(n);
                let (ip, port) = match addr.as_sockaddr_in() {
                    Some(v4) => (std::net::Ipv4Addr::from(v4.ip()).to_string(), v4.port()),
                    None => match addr.as_sockaddr_in6() {
                        Some(v6) => (v6.ip().to_string(), v6.port()),
                        None => ("unknown".to_string(), 0),
                    },
                };
                out.push(Datagram { payload: buf, source_ip: ip, source_port: port });
            }
            Ok((_, None)) => continue,
            Err(e) if is_transient_accept_error(e) => break,
            Err(e) => return Err(IoError::from_errno(e)),
        }
    }
    Ok(out)
}

/// `connect(host, port)` (spec §4.4/§5 "connect"): opens a non-blocking TCP
/// connection and inserts a stream endpoint immediately. The connect may
/// still be in `EINPROGRESS`; the caller learns of completion the normal
/// way, by suspending a `write` on the new stream until it's writable.
pub fn connect<R>(core: &mut Core<R>, addr: std::net::SocketAddr) -> Result<usize, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let fd = crate::net::connect_tcp(addr)?;
    let key = core.insert_stream(StreamState::new(crate::net::into_raw(fd), OpenState::Owned));
    core.register_stream_io(key, mio::Interest::READABLE | mio::Interest::WRITABLE)
        .map_err(|e| IoError::Errno(e.to_string()))?;
    Ok(key)
}

/// `connect_unix(path)`: the Unix-domain-socket counterpart of [`connect`].
pub fn connect_unix<R>(core: &mut Core<R>, path: &str) -> Result<usize, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let fd = crate::net::connect_unix(path)?;
    let key = core.insert_stream(StreamState::new(crate::net::into_raw(fd), OpenState::Owned));
    core.register_stream_io(key, mio::Interest::READABLE | mio::Interest::WRITABLE)
        .map_err(|e| IoError::Errno(e.to_string()))?;
    Ok(key)
}

/// `listen4`/`listen6` (spec §4.4 "Server accept loop"): binds and listens
/// on `addr`, inserting a `StreamListener` server endpoint. The caller then
/// drives it with either [`accept_one`] or [`install_autospawn`].
pub fn listen<R>(core: &mut Core<R>, addr: std::net::SocketAddr, backlog: i32) -> Result<usize, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let fd = crate::net::listen_tcp(addr, backlog)?;
    let key = core.insert_server(crate::endpoint::ServerState::new(
        crate::net::into_raw(fd),
        ServerKind::StreamListener,
    ));
    core.register_server_io(key, mio::Interest::READABLE)
        .map_err(|e| IoError::Errno(e.to_string()))?;
    Ok(key)
}

/// `listen_unix(path)`: the Unix-domain-socket counterpart of [`listen`].
pub fn listen_unix<R>(core: &mut Core<R>, path: &str, backlog: usize) -> Result<usize, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let fd = crate::net::listen_unix(path, backlog)?;
    let key = core.insert_server(crate::endpoint::ServerState::new(
        crate::net::into_raw(fd),
        ServerKind::StreamListener,
    ));
    core.register_server_io(key, mio::Interest::READABLE)
        .map_err(|e| IoError::Errno(e.to_string()))?;
    Ok(key)
}

/// `listen_udp(addr)`: binds a `DatagramListener` server endpoint, to be
/// driven by [`recv_datagrams`] or an autospawn handler.
pub fn listen_udp<R>(core: &mut Core<R>, addr: std::net::SocketAddr) -> Result<usize, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let fd = crate::net::listen_udp(addr)?;
    let key = core.insert_server(crate::endpoint::ServerState::new(
        crate::net::into_raw(fd),
        ServerKind::DatagramListener,
    ));
    core.register_server_io(key, mio::Interest::READABLE)
        .map_err(|e| IoError::Errno(e.to_string()))?;
    Ok(key)
}

/// `getpeer()` (spec's external-interfaces surface): the remote address of
/// a connected stream's socket, via `getpeername(2)`.
pub fn getpeer<R>(core: &Core<R>, key: usize) -> Result<std::net::SocketAddr, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let fd = match core.endpoint(key) {
        Some(Endpoint::Stream(s)) if s.open != OpenState::Closed => s.fd,
        Some(Endpoint::Stream(_)) => return Err(IoError::Closed),
        Some(_) => return Err(IoError::InvalidArgument),
        None => return Err(IoError::Closed),
    };
    let addr: nix::sys::socket::SockaddrStorage =
        nix::sys::socket::getpeername(fd).map_err(IoError::from_errno)?;
    if let Some(v4) = addr.as_sockaddr_in() {
        return Ok(std::net::SocketAddr::V4(std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::from(v4.ip()),
            v4.port(),
        )));
    }
    if let Some(v6) = addr.as_sockaddr_in6() {
        return Ok(std::net::SocketAddr::V6(std::net::SocketAddrV6::new(
            v6.ip(),
            v6.port(),
            0,
            0,
        )));
    }
    Err(IoError::InvalidArgument)
}

fn stream_fd<R: ScriptRuntime + CompletionSink<R::TaskHandle>>(core: &Core<R>, key: usize) -> Result<std::os::fd::RawFd, IoError> {
    match core.endpoint(key) {
        Some(Endpoint::Stream(s)) if s.open != OpenState::Closed => Ok(s.fd),
        Some(Endpoint::Stream(_)) => Err(IoError::Closed),
        Some(_) => Err(IoError::InvalidArgument),
        None => Err(IoError::Closed),
    }
}

/// `nodelay(on)` (spec's external-interfaces surface): toggles `TCP_NODELAY`
/// — Nagle's algorithm off when `on`.
pub fn nodelay<R>(core: &Core<R>, key: usize, on: bool) -> Result<(), IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let fd = stream_fd(core, key)?;
    nix::sys::socket::setsockopt(&unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, nix::sys::socket::sockopt::TcpNoDelay, &on)
        .map_err(IoError::from_errno)
}

/// `nagle(on)`: the inverse of [`nodelay`], matching the original's pairing
/// of both names for the same socket option.
pub fn nagle<R>(core: &Core<R>, key: usize, on: bool) -> Result<(), IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    nodelay(core, key, !on)
}

/// `cork()`/`uncork()` (spec's external-interfaces surface): toggles
/// `TCP_CORK`, batching small writes into full segments until uncorked.
pub fn cork<R>(core: &Core<R>, key: usize, on: bool) -> Result<(), IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let fd = stream_fd(core, key)?;
    let ret = unsafe { libc::setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_CORK, &(on as libc::c_int) as *const _ as *const libc::c_void, std::mem::size_of::<libc::c_int>() as u32) };
    if ret != 0 {
        return Err(IoError::from_errno(nix::errno::Errno::last()));
    }
    Ok(())
}

/// `sendfile(file_key, stream_key, count)` (spec's external-interfaces
/// surface, the per-connection variant distinct from [`stream_file`]):
/// pumps up to `count` bytes directly from an open file endpoint to an
/// already-connected stream, non-blockingly, suspending the caller on the
/// stream's write slot across `EAGAIN` the same way [`try_write`] does.
pub fn sendfile<R>(
    core: &mut Core<R>,
    file_key: usize,
    stream_key: usize,
    task: R::TaskHandle,
    count: usize,
) -> Result<WriteOutcome, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    let src_fd = file_fd(core, file_key)?;
    {
        let stream = borrow_stream_mut(core, stream_key)?;
        if stream.open == OpenState::Closed {
            return Err(IoError::Closed);
        }
        if stream.write.is_busy() {
            return Err(IoError::Busy);
        }
    }

    let mut remaining = count;
    loop {
        if remaining == 0 {
            return Ok(WriteOutcome::Complete);
        }
        let dst_fd = borrow_stream_mut(core, stream_key)?.fd;
        let n = unsafe { libc::sendfile(dst_fd, src_fd, std::ptr::null_mut(), remaining) };
        if n > 0 {
            remaining -= n as usize;
            continue;
        }
        if n == 0 {
            return Ok(WriteOutcome::Complete);
        }
        match nix::errno::Errno::last() {
            nix::errno::Errno::EINTR => continue,
            nix::errno::Errno::EAGAIN => {
                let stream = borrow_stream_mut(core, stream_key)?;
                stream.write.waiting = Some(task);
                return Ok(WriteOutcome::Suspended);
            }
            nix::errno::Errno::EPIPE | nix::errno::Errno::ECONNRESET => {
                close_stream_fd(core, stream_key);
                return Err(IoError::Closed);
            }
            e => {
                close_stream_fd(core, stream_key);
                return Err(IoError::from_errno(e));
            }
        }
    }
}

/// `popen(cmd, argv, mode, opts)` (spec's external-interfaces surface): runs
/// [`crate::spawn::popen`] as a pool job, since the `fork`+`exec` it wraps
/// can briefly block on `PATH` lookups the same as [`spawn_process`]. The
/// resulting caller-side fds become stream endpoints once the completion
/// lands back on the reactor thread.
pub fn popen<R>(
    core: &mut Core<R>,
    task: R::TaskHandle,
    path: String,
    argv: Vec<String>,
    mode: crate::spawn::PopenMode,
    opts: crate::spawn::SpawnOptions,
) where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    core.submit_completion(move || {
        let result = crate::spawn::popen(&path, &argv, mode, &opts).map(|outcome| {
            crate::completion::RawPopenOutcome {
                pid: outcome.pid,
                stdin_fd: outcome.stdin_fd,
                stdout_fd: outcome.stdout_fd,
                socket_fd: outcome.socket_fd,
            }
        });
        RawCompletion::Popen { task, result }
    });
}

/// `pty.openpair()` (spec §5): allocates a PTY pair as a pool job
/// (`posix_openpt` and the `open(ptsname(...))` that follows can block),
/// turning both ends into stream endpoints once resolved.
pub fn pty_open<R>(core: &mut Core<R>, task: R::TaskHandle)
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    use std::os::fd::IntoRawFd;
    core.submit_completion(move || {
        let result = crate::pty::open_pair().map(|pair| (pair.master.into_raw_fd(), pair.slave.into_raw_fd()));
        RawCompletion::PtyOpen { task, result }
    });
}

/// `pty.get_window_size(stream_key)`/`set_window_size` (spec §5): `ioctl`s
/// against an already-open PTY stream endpoint's fd. Synchronous — these
/// never block.
pub fn pty_get_window_size<R>(core: &Core<R>, key: usize) -> Result<crate::pty::WindowSize, IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    crate::pty::get_window_size(stream_fd(core, key)?)
}

pub fn pty_set_window_size<R>(core: &Core<R>, key: usize, size: crate::pty::WindowSize) -> Result<(), IoError>
where
    R: ScriptRuntime + CompletionSink<R::TaskHandle>,
{
    crate::pty::set_window_size(stream_fd(core, key)?, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_mode_parses_the_spec_table() {
        use nix::fcntl::OFlag;
        assert_eq!(OpenMode::parse("r").unwrap().flags, OFlag::O_RDONLY);
        assert_eq!(
            OpenMode::parse("w").unwrap().flags,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC
        );
        assert_eq!(
            OpenMode::parse("a+b").unwrap().flags,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_APPEND
        );
        assert_eq!(
            OpenMode::parse("wx").unwrap().flags,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_EXCL
        );
        assert!(OpenMode::parse("z").is_err());
        assert!(OpenMode::parse("rx").is_err());
    }
}
