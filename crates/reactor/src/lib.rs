//! Single-threaded readiness multiplexer. Wraps an [`mio::Poll`] instance
//! with the watcher primitives the dispatch core is built from: fd
//! readiness, timers, idle (fires whenever the loop would otherwise
//! block), and a cross-thread async-wake signal that coalesces any number
//! of `wake()` calls into at most one event per poll pass.
//!
//! The reactor itself never touches user-task state; it only hands the
//! caller a batch of [`ReactorEvent`]s per [`Reactor::poll`] call. Callers
//! (`dispatch-io`, `dispatch-runtime`) own the token → endpoint mapping
//! and drive resumption from there.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token as MioToken, Waker};
use slab::Slab;

const ASYNC_WAKE_TOKEN: MioToken = MioToken(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("failed to initialize reactor: {0}")]
    Init(#[source] std::io::Error),
    #[error("io registration error: {0}")]
    Io(#[source] std::io::Error),
}

/// Opaque handle to an fd-readiness registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(usize);

/// Opaque handle to a one-shot or repeating timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Opaque handle to an idle watcher (active iff armed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdleId(u64);

/// What readiness fired on an fd watcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Hangup/error — surfaced so callers can treat it like an error-class
    /// readiness rather than silently re-arming.
    pub error: bool,
}

/// One fired watcher, handed back from [`Reactor::poll`].
#[derive(Debug, Clone, Copy)]
pub enum ReactorEvent {
    Io { token: IoToken, readiness: Readiness },
    Timer { id: TimerId },
    Idle { id: IdleId },
    AsyncWake,
}

/// `break_loop` granularity, mirroring libev's `EVBREAK_ONE`/`EVBREAK_ALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakMode {
    One,
    All,
}

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    repeat: Option<Duration>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline on top.
        other.deadline.cmp(&self.deadline)
    }
}

/// Thread-safe handle that signals the reactor's async-wake watcher. Any
/// number of `wake()` calls before the reactor next polls collapse into a
/// single [`ReactorEvent::AsyncWake`].
#[derive(Clone)]
pub struct AsyncWakeHandle {
    waker: Arc<Waker>,
    pending: Arc<AtomicBool>,
}

impl AsyncWakeHandle {
    pub fn wake(&self) {
        if !self.pending.swap(true, AtomicOrdering::AcqRel) {
            // Best-effort: if the underlying wake write fails (e.g. pipe
            // full) the reactor will still eventually notice via its own
            // retry paths; there is no safe recovery here.
            let _ = self.waker.wake();
        }
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    io_slots: Slab<RawFd>,
    timers: BinaryHeap<TimerEntry>,
    cancelled_timers: rustc_hash::FxHashSet<TimerId>,
    next_timer_id: u64,
    idle_armed: rustc_hash::FxHashSet<IdleId>,
    next_idle_id: u64,
    async_wake: Option<(Arc<Waker>, Arc<AtomicBool>)>,
    break_requested: Option<BreakMode>,
    pending: Vec<ReactorEvent>,
}

impl Reactor {
    pub fn new() -> Result<Self, ReactorError> {
        let poll = Poll::new().map_err(ReactorError::Init)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            io_slots: Slab::new(),
            timers: BinaryHeap::new(),
            cancelled_timers: rustc_hash::FxHashSet::default(),
            next_timer_id: 0,
            idle_armed: rustc_hash::FxHashSet::default(),
            next_idle_id: 0,
            async_wake: None,
            break_requested: None,
            pending: Vec::new(),
        })
    }

    /// Registers `fd` for the given interest. The caller owns the fd's
    /// lifetime; `deregister_io` must be called before closing it.
    pub fn register_io(&mut self, fd: RawFd, interest: Interest) -> Result<IoToken, ReactorError> {
        let slot = self.io_slots.insert(fd);
        let token = MioToken(slot);
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
            .map_err(ReactorError::Io)?;
        Ok(IoToken(slot))
    }

    pub fn reregister_io(&mut self, token: IoToken, interest: Interest) -> Result<(), ReactorError> {
        let fd = *self
            .io_slots
            .get(token.0)
            .expect("reregister_io on unknown token");
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), MioToken(token.0), interest)
            .map_err(ReactorError::Io)
    }

    pub fn deregister_io(&mut self, token: IoToken) -> Result<(), ReactorError> {
        let fd = self.io_slots.remove(token.0);
        self.poll
            .registry()
            .deregister(&mut SourceFd(&fd))
            .map_err(ReactorError::Io)
    }

    /// Arms a one-shot (`repeat = None`) or repeating timer.
    pub fn start_timer(&mut self, after: Duration, repeat: Option<Duration>) -> TimerId {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        self.timers.push(TimerEntry {
            deadline: Instant::now() + after,
            id,
            repeat,
        });
        id
    }

    pub fn stop_timer(&mut self, id: TimerId) {
        self.cancelled_timers.insert(id);
    }

    /// Creates a new idle watcher, initially stopped.
    pub fn create_idle(&mut self) -> IdleId {
        let id = IdleId(self.next_idle_id);
        self.next_idle_id += 1;
        id
    }

    pub fn start_idle(&mut self, id: IdleId) {
        self.idle_armed.insert(id);
    }

    pub fn stop_idle(&mut self, id: IdleId) {
        self.idle_armed.remove(&id);
    }

    pub fn idle_is_armed(&self, id: IdleId) -> bool {
        self.idle_armed.contains(&id)
    }

    /// Starts the (singleton) async-wake watcher, returning a cloneable,
    /// `Send + Sync` handle other threads use to signal the reactor.
    pub fn start_async_wake(&mut self) -> Result<AsyncWakeHandle, ReactorError> {
        if let Some((waker, pending)) = &self.async_wake {
            return Ok(AsyncWakeHandle {
                waker: waker.clone(),
                pending: pending.clone(),
            });
        }
        let waker = Arc::new(Waker::new(self.poll.registry(), ASYNC_WAKE_TOKEN).map_err(ReactorError::Io)?);
        let pending = Arc::new(AtomicBool::new(false));
        self.async_wake = Some((waker.clone(), pending.clone()));
        Ok(AsyncWakeHandle { waker, pending })
    }

    pub fn stop_async_wake(&mut self) {
        self.async_wake = None;
    }

    pub fn break_loop(&mut self, mode: BreakMode) {
        self.break_requested = Some(mode);
    }

    pub fn take_break(&mut self) -> Option<BreakMode> {
        self.break_requested.take()
    }

    /// Polls for events, blocking at most `max_wait` (or indefinitely if
    /// `None` and nothing bounds the wait). An armed idle watcher, a
    /// pending timer, or both force a non-blocking/short wait. Fired
    /// events are appended to the internal batch; drain them with
    /// [`Reactor::take_events`].
    pub fn poll(&mut self, max_wait: Option<Duration>) -> Result<(), ReactorError> {
        let timeout = self.compute_timeout(max_wait);
        self.poll.poll(&mut self.events, timeout).map_err(ReactorError::Io)?;

        for event in self.events.iter() {
            if event.token() == ASYNC_WAKE_TOKEN {
                if let Some((_, pending)) = &self.async_wake {
                    pending.store(false, AtomicOrdering::Release);
                }
                self.pending.push(ReactorEvent::AsyncWake);
                continue;
            }
            let readiness = Readiness {
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error() || event.is_read_closed() || event.is_write_closed(),
            };
            self.pending.push(ReactorEvent::Io {
                token: IoToken(event.token().0),
                readiness,
            });
        }

        self.drain_due_timers();

        if !self.idle_armed.is_empty() {
            let armed: Vec<IdleId> = self.idle_armed.iter().copied().collect();
            for id in armed {
                self.pending.push(ReactorEvent::Idle { id });
            }
        }

        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<ReactorEvent> {
        std::mem::take(&mut self.pending)
    }

    fn drain_due_timers(&mut self) {
        let now = Instant::now();
        let mut to_repeat = Vec::new();
        while let Some(top) = self.timers.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.timers.pop().expect("peeked entry must pop");
            if self.cancelled_timers.remove(&entry.id) {
                continue;
            }
            self.pending.push(ReactorEvent::Timer { id: entry.id });
            if let Some(repeat) = entry.repeat {
                to_repeat.push((entry.id, repeat));
            }
        }
        for (id, repeat) in to_repeat {
            self.timers.push(TimerEntry {
                deadline: now + repeat,
                id,
                repeat: Some(repeat),
            });
        }
    }

    fn compute_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        if !self.idle_armed.is_empty() {
            return Some(Duration::ZERO);
        }
        let nearest_timer = self.timers.peek().map(|t| {
            t.deadline.saturating_duration_since(Instant::now())
        });
        match (nearest_timer, max_wait) {
            (Some(t), Some(m)) => Some(t.min(m)),
            (Some(t), None) => Some(t),
            (None, Some(m)) => Some(m),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::thread;

    #[test]
    fn idle_watcher_fires_without_blocking() {
        let mut reactor = Reactor::new().unwrap();
        let idle = reactor.create_idle();
        reactor.start_idle(idle);

        reactor.poll(None).unwrap();
        let events = reactor.take_events();
        assert!(events.iter().any(|e| matches!(e, ReactorEvent::Idle { id } if *id == idle)));
    }

    #[test]
    fn timer_fires_after_deadline() {
        let mut reactor = Reactor::new().unwrap();
        let id = reactor.start_timer(Duration::from_millis(1), None);

        thread::sleep(Duration::from_millis(5));
        reactor.poll(Some(Duration::from_millis(50))).unwrap();
        let events = reactor.take_events();
        assert!(events.iter().any(|e| matches!(e, ReactorEvent::Timer { id: t } if *t == id)));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut reactor = Reactor::new().unwrap();
        let id = reactor.start_timer(Duration::from_millis(1), None);
        reactor.stop_timer(id);

        thread::sleep(Duration::from_millis(5));
        reactor.poll(Some(Duration::from_millis(50))).unwrap();
        let events = reactor.take_events();
        assert!(!events.iter().any(|e| matches!(e, ReactorEvent::Timer { .. })));
    }

    #[test]
    fn async_wake_coalesces_multiple_sends() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.start_async_wake().unwrap();

        let h2 = handle.clone();
        let worker = thread::spawn(move || {
            h2.wake();
            h2.wake();
            h2.wake();
        });
        worker.join().unwrap();

        reactor.poll(Some(Duration::from_millis(200))).unwrap();
        let events = reactor.take_events();
        let wakes = events.iter().filter(|e| matches!(e, ReactorEvent::AsyncWake)).count();
        assert_eq!(wakes, 1);
    }

    #[test]
    fn io_readiness_is_reported() {
        use std::io::Write;
        let mut reactor = Reactor::new().unwrap();
        let (mut tx, rx) = std::os::unix::net::UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let token = reactor
            .register_io(rx.as_raw_fd(), Interest::READABLE)
            .unwrap();

        tx.write_all(b"x").unwrap();
        reactor.poll(Some(Duration::from_millis(200))).unwrap();
        let events = reactor.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ReactorEvent::Io { token: t, readiness } if *t == token && readiness.readable)));

        reactor.deregister_io(token).unwrap();
    }

    #[test]
    fn break_loop_is_recorded_until_taken() {
        let mut reactor = Reactor::new().unwrap();
        assert!(reactor.take_break().is_none());
        reactor.break_loop(BreakMode::All);
        assert_eq!(reactor.take_break(), Some(BreakMode::All));
        assert!(reactor.take_break().is_none());
    }
}
