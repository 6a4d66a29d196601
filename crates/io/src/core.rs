//! The dispatch core engine: owns the reactor, pool, run queue, task host
//! and endpoint table, and drives the single-threaded event loop described
//! in spec.md §2/§4. This is the Rust counterpart of `bin/lem.c`'s
//! `lem_queue`-driven main loop plus `lem/io/core.c`'s endpoint
//! bookkeeping, folded into one owner because Rust's borrow checker (unlike
//! the original's global-state C) needs a single place that holds `&mut`
//! access to all of it at once.

use std::time::Duration;

use rustc_hash::FxHashMap;
use slab::Slab;

use dispatch_pool::{Job, Pool, PoolConfig};
use dispatch_reactor::{AsyncWakeHandle, BreakMode, IdleId, IoToken, Reactor, ReactorError, ReactorEvent};
use dispatch_runqueue::{self as runqueue, RunQueue};
use dispatch_task_host::{ExitStatus, ScriptRuntime, TaskHandle, TaskHost};

use crate::completion::{
    Completion, CompletionReceiver, CompletionSender, FromFdOutcome, OpenOutcome, RawCompletion,
};
use crate::endpoint::{Endpoint, OpenState, ServerState, StreamState};

/// Delivers a pool completion's payload onto a task's resume arguments.
/// Split out from [`ScriptRuntime`] because marshaling an [`IoError`] or a
/// byte buffer into the embedding's value stack is embedding-specific,
/// where `resume`/`traceback` are not — the reap half of the original's
/// `work`/`reap` pair, generalized to a trait so `Core` stays generic.
///
/// [`IoError`]: crate::error::IoError
pub trait CompletionSink<H: TaskHandle> {
    /// Pushes `completion`'s result onto `task`'s pending arguments and
    /// returns how many were pushed.
    fn deliver(&mut self, task: H, completion: Completion<H>) -> u16;
}

#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    pub pool: PoolConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self { pool: PoolConfig::default() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("reactor initialization failed: {0}")]
    Reactor(#[from] ReactorError),
}

/// Factory invoked once per accepted connection/datagram by the autospawn
/// accept loop (spec §4.4 "Two consumption modes"): builds whatever
/// script-level task the embedding wants bound to the freshly inserted
/// stream endpoint at `usize`, pushing the stream as its argument the way
/// the embedding sees fit. Lives outside [`ServerState`] (which only
/// depends on the task handle type, not `Core` itself) to sidestep the
/// self-referential-closure problem of storing something that borrows
/// `Core<R>` inside a structure `Core<R>` owns.
pub type AutospawnHandler<R> = Box<dyn FnMut(&mut Core<R>, usize) -> <R as ScriptRuntime>::TaskHandle>;

/// Ties every dispatch-core component together for one runtime instance.
pub struct Core<R: ScriptRuntime> {
    runtime: R,
    task_host: TaskHost<R::TaskHandle>,
    run_queue: RunQueue<R::TaskHandle>,
    reactor: Reactor,
    pool: Pool,
    endpoints: Slab<Endpoint<R::TaskHandle>>,
    io_index: FxHashMap<IoToken, usize>,
    completion_tx: CompletionSender<R::TaskHandle>,
    completion_rx: CompletionReceiver<R::TaskHandle>,
    drain_idle: IdleId,
    async_wake: AsyncWakeHandle,
    fatal: bool,
    autospawn_handlers: FxHashMap<usize, AutospawnHandler<R>>,
}

impl<R> Core<R>
where
    R: ScriptRuntime + CompletionSink<<R as ScriptRuntime>::TaskHandle>,
{
    pub fn new(runtime: R, config: CoreConfig) -> Result<Self, CoreError> {
        let mut reactor = Reactor::new()?;
        let async_wake = reactor.start_async_wake()?;
        let pool = Pool::new(async_wake.clone(), config.pool);
        let drain_idle = reactor.create_idle();
        let (completion_tx, completion_rx) = crate::completion::channel();

        Ok(Self {
            runtime,
            task_host: TaskHost::new(),
            run_queue: RunQueue::new(),
            reactor,
            pool,
            endpoints: Slab::new(),
            io_index: FxHashMap::default(),
            completion_tx,
            completion_rx,
            drain_idle,
            async_wake,
            fatal: false,
            autospawn_handlers: FxHashMap::default(),
        })
    }

    pub fn task_host(&self) -> &TaskHost<R::TaskHandle> {
        &self.task_host
    }

    pub fn task_host_mut(&mut self) -> &mut TaskHost<R::TaskHandle> {
        &mut self.task_host
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    pub fn pool_mut(&mut self) -> &mut Pool {
        &mut self.pool
    }

    pub fn completion_sender(&self) -> CompletionSender<R::TaskHandle> {
        self.completion_tx.clone()
    }

    pub fn async_wake_handle(&self) -> AsyncWakeHandle {
        self.async_wake.clone()
    }

    /// Registers a brand-new, not-yet-spawned stream endpoint and arms its
    /// I/O registration, returning the slab key callers use to refer to it.
    pub fn insert_stream(&mut self, state: StreamState<R::TaskHandle>) -> usize {
        let token = state.token;
        let key = self.endpoints.insert(Endpoint::Stream(state));
        if let Some(token) = token {
            self.io_index.insert(token, key);
        }
        key
    }

    pub fn insert_server(&mut self, state: ServerState<R::TaskHandle>) -> usize {
        let token = state.token;
        let key = self.endpoints.insert(Endpoint::Server(state));
        if let Some(token) = token {
            self.io_index.insert(token, key);
        }
        key
    }

    pub fn endpoint(&self, key: usize) -> Option<&Endpoint<R::TaskHandle>> {
        self.endpoints.get(key)
    }

    pub fn endpoint_mut(&mut self, key: usize) -> Option<&mut Endpoint<R::TaskHandle>> {
        self.endpoints.get_mut(key)
    }

    pub fn remove_endpoint(&mut self, key: usize) -> Option<Endpoint<R::TaskHandle>> {
        if self.endpoints.contains(key) {
            Some(self.endpoints.remove(key))
        } else {
            None
        }
    }

    /// Submits blocking work to the pool, wiring its result to land back on
    /// `completion_tx` as a [`RawCompletion`] the main loop will resolve
    /// and deliver.
    pub fn submit_job(&mut self, job: Job) {
        self.pool.submit(job);
    }

    /// Convenience over [`Core::submit_job`] for the common case: a
    /// closure that computes a [`RawCompletion`] on a worker thread and
    /// sends it back over the completion channel (the `reap` half of the
    /// original's `work`/`reap` job, see `completion.rs`'s module doc).
    pub fn submit_completion<F>(&mut self, work: F)
    where
        F: FnOnce() -> RawCompletion<R::TaskHandle> + Send + 'static,
    {
        let tx = self.completion_tx.clone();
        self.pool.submit(Job::fire_and_forget(move || {
            let _ = tx.send(work());
        }));
    }

    /// Registers `fd` with the reactor for `interest` and records the
    /// resulting token against `key` in the endpoint index. The endpoint
    /// at `key` must already be a [`Endpoint::Stream`]; its `token` field
    /// is updated in place.
    pub fn register_stream_io(
        &mut self,
        key: usize,
        interest: mio::Interest,
    ) -> Result<IoToken, CoreError> {
        let fd = match self.endpoints.get(key) {
            Some(Endpoint::Stream(stream)) => stream.fd,
            _ => panic!("register_stream_io on a non-stream endpoint"),
        };
        let token = self.reactor.register_io(fd, interest)?;
        if let Some(Endpoint::Stream(stream)) = self.endpoints.get_mut(key) {
            stream.token = Some(token);
        }
        self.io_index.insert(token, key);
        Ok(token)
    }

    pub fn register_server_io(
        &mut self,
        key: usize,
        interest: mio::Interest,
    ) -> Result<IoToken, CoreError> {
        let fd = match self.endpoints.get(key) {
            Some(Endpoint::Server(server)) => server.fd,
            _ => panic!("register_server_io on a non-server endpoint"),
        };
        let token = self.reactor.register_io(fd, interest)?;
        if let Some(Endpoint::Server(server)) = self.endpoints.get_mut(key) {
            server.token = Some(token);
        }
        self.io_index.insert(token, key);
        Ok(token)
    }

    pub fn deregister_io(&mut self, token: IoToken) -> Result<(), CoreError> {
        self.io_index.remove(&token);
        self.reactor.deregister_io(token)?;
        Ok(())
    }

    /// Enqueues `task` for resumption with `nargs` already on its stack,
    /// arming the drain idle watcher if the queue was empty (spec §4.2).
    pub fn enqueue(&mut self, task: R::TaskHandle, nargs: u16) {
        if self.run_queue.enqueue(task, nargs) {
            self.reactor.start_idle(self.drain_idle);
        }
    }

    /// Runs the event loop until `break_loop` is requested or a fatal task
    /// error unwinds it. Returns the process-wide exit status.
    pub fn run(&mut self) -> ExitStatus {
        'dispatch: loop {
            if let Err(err) = self.reactor.poll(Some(Duration::from_secs(3600))) {
                tracing::error!(%err, "reactor poll failed");
                self.fatal = true;
                break;
            }

            for event in self.reactor.take_events() {
                match event {
                    ReactorEvent::Io { token, readiness } => self.handle_io(token, readiness),
                    ReactorEvent::AsyncWake => self.handle_async_wake(),
                    ReactorEvent::Idle { id } if id == self.drain_idle => {
                        if self.drain_run_queue() {
                            self.fatal = true;
                            break 'dispatch;
                        }
                    }
                    ReactorEvent::Idle { .. } | ReactorEvent::Timer { .. } => {}
                }
            }

            if let Some(BreakMode::All) | Some(BreakMode::One) = self.reactor.take_break() {
                break;
            }
        }

        let mut status = self.task_host.exit_status();
        if self.fatal {
            status.latch_failure();
        }
        status
    }

    /// Like [`Core::run`], but also returns as soon as the run queue is
    /// empty, no file descriptors are registered with the reactor, and no
    /// pool jobs are outstanding. `run` waits for an explicit
    /// `break_loop` the way the original always does (script calls
    /// `lem.exit()`); a caller with no watcher left to ever deliver that —
    /// e.g. a bootstrap binary with no embedded script runtime wired up —
    /// has no other way to know the run is finished.
    pub fn run_until_idle(&mut self) -> ExitStatus {
        if self.is_idle() {
            return self.task_host.exit_status();
        }

        'dispatch: loop {
            if let Err(err) = self.reactor.poll(Some(Duration::from_secs(3600))) {
                tracing::error!(%err, "reactor poll failed");
                self.fatal = true;
                break;
            }

            for event in self.reactor.take_events() {
                match event {
                    ReactorEvent::Io { token, readiness } => self.handle_io(token, readiness),
                    ReactorEvent::AsyncWake => self.handle_async_wake(),
                    ReactorEvent::Idle { id } if id == self.drain_idle => {
                        if self.drain_run_queue() {
                            self.fatal = true;
                            break 'dispatch;
                        }
                    }
                    ReactorEvent::Idle { .. } | ReactorEvent::Timer { .. } => {}
                }
            }

            if let Some(BreakMode::All) | Some(BreakMode::One) = self.reactor.take_break() {
                break;
            }
            if self.is_idle() {
                break;
            }
        }

        let mut status = self.task_host.exit_status();
        if self.fatal {
            status.latch_failure();
        }
        status
    }

    fn is_idle(&self) -> bool {
        self.run_queue.is_empty() && self.io_index.is_empty() && self.pool.jobs() == 0
    }

    /// Drains the run queue; returns `true` if a fatal error unwound the
    /// loop (caller should stop immediately).
    fn drain_run_queue(&mut self) -> bool {
        match runqueue::drain(&mut self.run_queue, &mut self.runtime, &mut self.task_host) {
            runqueue::DrainResult::Empty => {
                self.reactor.stop_idle(self.drain_idle);
                false
            }
            runqueue::DrainResult::Unwind { message } => {
                tracing::error!(%message, "fatal task error; shutting down");
                true
            }
        }
    }

    fn handle_async_wake(&mut self) {
        self.pool.reap_completed();
        while let Ok(raw) = self.completion_rx.try_recv() {
            let task = raw.task();
            let completion = self.resolve_completion(raw);
            let nargs = self.runtime.deliver(task, completion);
            self.enqueue(task, nargs);
        }
    }

    /// Turns a worker-produced [`RawCompletion`] into the resolved
    /// [`Completion`] a [`CompletionSink`] consumes, inserting (and, for
    /// streams, registering) the endpoint a fresh `open`/`from_fd`/
    /// `stream_file` job produced. This is reactor-thread-only: it is the
    /// one place a bare fd from a worker becomes a slab-owned endpoint.
    fn resolve_completion(&mut self, raw: RawCompletion<R::TaskHandle>) -> Completion<R::TaskHandle> {
        match raw {
            RawCompletion::Open { task, result } => Completion::Open {
                task,
                result: result.and_then(|outcome| self.adopt_opened(outcome)),
            },
            RawCompletion::FromFd { task, result } => Completion::FromFd {
                task,
                result: result.and_then(|classified| self.adopt_classified(classified)),
            },
            RawCompletion::FileRead { task, result } => Completion::FileRead { task, result },
            RawCompletion::FileWrite { task, result } => Completion::FileWrite { task, result },
            RawCompletion::FileSeek { task, result } => Completion::FileSeek { task, result },
            RawCompletion::FileSize { task, result } => Completion::FileSize { task, result },
            RawCompletion::FileLock { task, result } => Completion::FileLock { task, result },
            RawCompletion::Resolve { task, result } => Completion::Resolve { task, result },
            RawCompletion::Spawn { task, result } => Completion::Spawn { task, result },
            RawCompletion::Waitpid { task, result } => Completion::Waitpid { task, result },
            RawCompletion::StreamFileOpened { task, result } => Completion::StreamFileOpened {
                task,
                result: result.and_then(|fd| {
                    let key = self.insert_stream(StreamState::new(fd, OpenState::Owned));
                    self.register_stream_io(key, mio::Interest::READABLE)
                        .map_err(|e| crate::error::IoError::Errno(e.to_string()))?;
                    Ok(key)
                }),
            },
            RawCompletion::Popen { task, result } => Completion::Popen {
                task,
                result: result.and_then(|outcome| self.adopt_popen(outcome)),
            },
            RawCompletion::PtyOpen { task, result } => Completion::PtyOpen {
                task,
                result: result.and_then(|(master, slave)| {
                    let master_key = self.insert_stream(StreamState::new(master, OpenState::Owned));
                    self.register_stream_io(master_key, mio::Interest::READABLE | mio::Interest::WRITABLE)
                        .map_err(|e| crate::error::IoError::Errno(e.to_string()))?;
                    let slave_key = self.insert_stream(StreamState::new(slave, OpenState::Owned));
                    self.register_stream_io(slave_key, mio::Interest::READABLE | mio::Interest::WRITABLE)
                        .map_err(|e| crate::error::IoError::Errno(e.to_string()))?;
                    Ok(crate::completion::PtyKeys { master_key, slave_key })
                }),
            },
        }
    }

    /// Turns a worker-produced [`crate::completion::RawPopenOutcome`] into
    /// live stream endpoints for whichever caller-side fds `mode` asked for
    /// (spec's external-interfaces surface, `popen`). The child's stdin is
    /// write-only from the caller's side; its stdout and the bidirectional
    /// socket are both directions.
    fn adopt_popen(
        &mut self,
        outcome: crate::completion::RawPopenOutcome,
    ) -> Result<crate::completion::PopenResult, crate::error::IoError> {
        let stdin_key = outcome
            .stdin_fd
            .map(|fd| {
                let key = self.insert_stream(StreamState::new(fd, OpenState::Owned));
                self.register_stream_io(key, mio::Interest::WRITABLE)
                    .map_err(|e| crate::error::IoError::Errno(e.to_string()))?;
                Ok::<_, crate::error::IoError>(key)
            })
            .transpose()?;
        let stdout_key = outcome
            .stdout_fd
            .map(|fd| {
                let key = self.insert_stream(StreamState::new(fd, OpenState::Owned));
                self.register_stream_io(key, mio::Interest::READABLE)
                    .map_err(|e| crate::error::IoError::Errno(e.to_string()))?;
                Ok::<_, crate::error::IoError>(key)
            })
            .transpose()?;
        let socket_key = outcome
            .socket_fd
            .map(|fd| {
                let key = self.insert_stream(StreamState::new(fd, OpenState::Owned));
                self.register_stream_io(key, mio::Interest::READABLE | mio::Interest::WRITABLE)
                    .map_err(|e| crate::error::IoError::Errno(e.to_string()))?;
                Ok::<_, crate::error::IoError>(key)
            })
            .transpose()?;
        Ok(crate::completion::PopenResult { pid: outcome.pid, stdin_key, stdout_key, socket_key })
    }

    fn adopt_opened(
        &mut self,
        outcome: crate::completion::RawOpenOutcome,
    ) -> Result<OpenOutcome, crate::error::IoError> {
        use crate::completion::RawOpenOutcome;
        match outcome {
            RawOpenOutcome::File(fd) => {
                let key = self.endpoints.insert(Endpoint::File(crate::endpoint::FileState { fd, open: true }));
                Ok(OpenOutcome::File(key))
            }
            RawOpenOutcome::Stream(fd) => {
                let key = self.insert_stream(StreamState::new(fd, OpenState::Owned));
                self.register_stream_io(key, mio::Interest::READABLE | mio::Interest::WRITABLE)
                    .map_err(|e| crate::error::IoError::Errno(e.to_string()))?;
                Ok(OpenOutcome::Stream(key))
            }
        }
    }

    fn adopt_classified(
        &mut self,
        classified: crate::endpoint::ClassifiedFd,
    ) -> Result<FromFdOutcome, crate::error::IoError> {
        use crate::endpoint::ClassifiedFd;
        match classified {
            ClassifiedFd::File(fd) => {
                let key = self.endpoints.insert(Endpoint::File(crate::endpoint::FileState { fd, open: true }));
                Ok(FromFdOutcome::File(key))
            }
            ClassifiedFd::Stream(fd) => {
                let key = self.insert_stream(StreamState::new(fd, OpenState::Owned));
                self.register_stream_io(key, mio::Interest::READABLE | mio::Interest::WRITABLE)
                    .map_err(|e| crate::error::IoError::Errno(e.to_string()))?;
                Ok(FromFdOutcome::Stream(key))
            }
            ClassifiedFd::Server(fd, kind) => {
                let key = self.insert_server(ServerState::new(fd, kind));
                self.register_server_io(key, mio::Interest::READABLE)
                    .map_err(|e| crate::error::IoError::Errno(e.to_string()))?;
                Ok(FromFdOutcome::Server(key))
            }
        }
    }

    fn handle_io(&mut self, token: IoToken, readiness: dispatch_reactor::Readiness) {
        let Some(&key) = self.io_index.get(&token) else {
            return;
        };
        let autospawning = match self.endpoints.get_mut(key) {
            Some(Endpoint::Stream(stream)) => {
                if readiness.readable || readiness.error {
                    if let Some(task) = stream.read.take() {
                        self.enqueue(task, 1);
                    }
                }
                if readiness.writable || readiness.error {
                    if let Some(task) = stream.write.take() {
                        self.enqueue(task, 1);
                    }
                }
                return;
            }
            Some(Endpoint::Server(server)) => {
                if !(readiness.readable || readiness.error) {
                    return;
                }
                if server.autospawning {
                    true
                } else {
                    if let Some(task) = server.pending.take() {
                        self.enqueue(task, 1);
                    }
                    return;
                }
            }
            Some(Endpoint::File(_)) | None => return,
        };
        if autospawning {
            self.drain_autospawn(key);
        }
    }

    /// Installs an autospawn handler on server `key` (spec §4.4
    /// "autospawn"): from now on, every readiness event on the listener
    /// harvests every queued connection/datagram instead of resuming a
    /// single waiting task.
    pub fn install_autospawn<F>(&mut self, key: usize, make_task: F)
    where
        F: FnMut(&mut Core<R>, usize) -> R::TaskHandle + 'static,
    {
        if let Some(Endpoint::Server(server)) = self.endpoints.get_mut(key) {
            server.autospawning = true;
        }
        self.autospawn_handlers.insert(key, Box::new(make_task));
    }

    /// Harvests every currently queued connection on a `StreamListener`
    /// server, spawning one task per connection via its installed
    /// autospawn handler (spec §4.4 "Server accept loop" / "autospawn").
    /// Fatal accept errors close the listener and stop the loop; transient
    /// ones just stop this pass (the next readiness event retries).
    fn drain_autospawn(&mut self, key: usize) {
        let Some(mut handler) = self.autospawn_handlers.remove(&key) else {
            return;
        };
        loop {
            let fd = match self.endpoints.get(key) {
                Some(Endpoint::Server(server)) => server.fd,
                _ => break,
            };
            match crate::net::accept_one(fd) {
                Ok(Some(owned)) => {
                    let raw = crate::net::into_raw(owned);
                    let stream_key = self.insert_stream(StreamState::new(raw, OpenState::Owned));
                    if let Err(err) =
                        self.register_stream_io(stream_key, mio::Interest::READABLE | mio::Interest::WRITABLE)
                    {
                        tracing::warn!(%err, "failed to register autospawned stream");
                    }
                    let task = handler(self, stream_key);
                    self.task_host.register(task);
                    self.enqueue(task, 1);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(%err, "fatal accept error; closing listener");
                    self.close_server(key);
                    break;
                }
            }
        }
        self.autospawn_handlers.insert(key, handler);
    }

    /// Adopts an existing fd (spec §4.4 "Adopting a raw fd"): classifies
    /// it synchronously (an `fstat` plus, for sockets, a `SO_ACCEPTCONN`
    /// probe — cheap enough to never need a pool job) and inserts the
    /// resulting endpoint.
    pub fn from_fd(&mut self, fd: std::os::fd::RawFd) -> Result<FromFdOutcome, crate::error::IoError> {
        let classified = crate::classify::classify_adopted(fd)?;
        self.adopt_classified(classified)
    }

    /// Closes a server endpoint: deregisters it from the reactor, closes
    /// its fd, drops its autospawn handler, and resumes any task still
    /// parked on a pending `accept` with `(nil, "closed")` — the caller
    /// (typically `operations::server_close`) is responsible for actually
    /// delivering that pair to the returned task.
    pub fn close_server(&mut self, key: usize) -> Option<R::TaskHandle> {
        let Some(Endpoint::Server(mut server)) = self.remove_endpoint(key) else {
            return None;
        };
        if let Some(token) = server.token.take() {
            let _ = self.deregister_io(token);
        }
        if server.open {
            let _ = nix::unistd::close(server.fd);
            server.open = false;
        }
        self.autospawn_handlers.remove(&key);
        server.pending.take()
    }
}
