//! Dynamically-sized worker pool for blocking work (§4.3). Workers service
//! a FIFO job queue; completions land on a separately-locked done list and
//! wake the reactor through an [`AsyncWakeHandle`]. `jobs` (total
//! in-flight, reactor-side) is deliberately *not* behind the pool mutex —
//! only the reactor thread ever touches it, matching the invariant in the
//! spec that workers only ever touch the done list and the pool mutex.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dispatch_reactor::AsyncWakeHandle;
use parking_lot::{Condvar, Mutex};

/// Closure run back on the reactor thread after a job's `work` completes.
/// Responsible for freeing/using whatever `work` produced (e.g. resuming
/// the task that submitted the job).
pub type ReapFn = Box<dyn FnOnce() + Send>;

/// A unit of blocking work. `work` runs on a worker thread and returns the
/// `reap` closure to run back on the reactor thread — folding the
/// source's separate `work`/`reap` function pointers into one closure
/// that produces the other, since Rust closures can already capture their
/// own result.
pub struct Job {
    work: Box<dyn FnOnce() -> ReapFn + Send>,
}

impl Job {
    pub fn new<W>(work: W) -> Self
    where
        W: FnOnce() -> ReapFn + Send + 'static,
    {
        Self { work: Box::new(work) }
    }

    /// A job with no reap step — the spec's "`reap` is null" path (§4.3):
    /// the worker's result is simply discarded once `work` returns.
    pub fn fire_and_forget<W>(work: W) -> Self
    where
        W: FnOnce() + Send + 'static,
    {
        Self::new(move || {
            work();
            Box::new(|| {}) as ReapFn
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub idle_decay: Duration,
}

impl Default for PoolConfig {
    /// Matches `original_source/bin/pool.c`'s `pool_init`: `min=1, max=8,
    /// delay=3s`.
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: 8,
            idle_decay: Duration::from_secs(3),
        }
    }
}

struct State {
    queue: VecDeque<Job>,
    threads: usize,
    min: usize,
    max: usize,
    delay: Duration,
    halting: bool,
}

struct Shared {
    mutex: Mutex<State>,
    cond: Condvar,
    done: Mutex<VecDeque<ReapFn>>,
    async_wake: AsyncWakeHandle,
}

/// Reactor-thread-owned handle to the worker pool. Not `Sync`: `submit`,
/// `configure`, `begin_halt` and `reap_completed` must only ever be called
/// from the reactor thread, same as the `jobs` counter they share.
pub struct Pool {
    shared: Arc<Shared>,
    jobs: usize,
}

impl Pool {
    pub fn new(async_wake: AsyncWakeHandle, config: PoolConfig) -> Self {
        let shared = Arc::new(Shared {
            mutex: Mutex::new(State {
                queue: VecDeque::new(),
                threads: 0,
                min: config.min_threads,
                max: config.max_threads,
                delay: config.idle_decay,
                halting: false,
            }),
            cond: Condvar::new(),
            done: Mutex::new(VecDeque::new()),
            async_wake,
        });

        let mut pool = Self { shared, jobs: 0 };
        let spawn = config.min_threads;
        {
            let mut state = pool.shared.mutex.lock();
            state.threads = spawn;
        }
        for _ in 0..spawn {
            pool.spawn_worker();
        }
        pool
    }

    /// In-flight job count. Reactor-thread-only, matching the spec.
    pub fn jobs(&self) -> usize {
        self.jobs
    }

    pub fn threads_alive(&self) -> usize {
        self.shared.mutex.lock().threads
    }

    /// Submits a job (§4.3 `run(job)`): appends to the queue and spawns a
    /// worker if demand exceeds supply and we're under `max`.
    pub fn submit(&mut self, job: Job) {
        self.jobs += 1;

        let spawn_needed = {
            let mut state = self.shared.mutex.lock();
            state.queue.push_back(job);
            if !state.halting && self.jobs > state.threads && state.threads < state.max {
                state.threads += 1;
                true
            } else {
                false
            }
        };
        self.shared.cond.notify_one();

        if spawn_needed {
            self.spawn_worker();
        }
    }

    /// Drains the done list and invokes every job's `reap` closure,
    /// decrementing `jobs` for each. Call this from the reactor's
    /// async-wake callback.
    pub fn reap_completed(&mut self) {
        let done: VecDeque<ReapFn> = {
            let mut done_list = self.shared.done.lock();
            std::mem::take(&mut *done_list)
        };
        for reap in done {
            self.jobs -= 1;
            reap();
        }
    }

    /// `async_config(delay, min, max)` (§4.3, §6): adjusts pool knobs and
    /// synchronously spawns threads if `min` now exceeds the live count.
    pub fn configure(&mut self, delay: Duration, min: usize, max: usize) {
        let spawn = {
            let mut state = self.shared.mutex.lock();
            state.delay = delay;
            state.min = min;
            state.max = max;
            let spawn = min.saturating_sub(state.threads);
            if spawn > 0 {
                state.threads = min;
            }
            spawn
        };
        for _ in 0..spawn {
            self.spawn_worker();
        }
    }

    /// Begins the graceful-drain protocol (§4.3 `halt`, §5 `config(delay=0,
    /// min=0, max=current)`): pins `max` at the current thread count, drops
    /// `min` to 0 so every worker is eligible to idle-decay rather than
    /// parking forever on the `threads <= min` wait, raises `halting`, and
    /// wakes every worker so natural idle-decay can run them down. The
    /// caller drives the rest (idle watcher polling `threads_alive`,
    /// timeout timer) — see `dispatch-runtime`'s shutdown sequencing.
    pub fn begin_halt(&mut self) {
        {
            let mut state = self.shared.mutex.lock();
            state.max = state.threads;
            state.min = 0;
            state.halting = true;
        }
        self.shared.cond.notify_all();
    }

    /// Nudges any workers parked on the condvar; used by the shutdown idle
    /// watcher each tick to make sure exits aren't stalled behind a wait.
    pub fn nudge(&self) {
        self.shared.cond.notify_all();
    }

    fn spawn_worker(&self) {
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name("dispatch-pool-worker".into())
            .spawn(move || worker_main(shared));
        if spawned.is_err() {
            tracing::error!("failed to spawn a mandatory pool worker thread; aborting");
            std::process::abort();
        }
    }
}

fn worker_main(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.mutex.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break Some(job);
                }
                if state.halting {
                    state.threads -= 1;
                    break None;
                }
                if state.threads <= state.min {
                    shared.cond.wait(&mut state);
                    continue;
                }
                let result = shared.cond.wait_for(&mut state, state.delay);
                if result.timed_out() {
                    if state.threads > state.min {
                        state.threads -= 1;
                        break None;
                    }
                    continue;
                }
                // Spurious wakeup or new work; loop back and recheck.
            }
        };

        let Some(job) = job else { return };

        tracing::trace!("running pool job");
        let reap = (job.work)();
        tracing::trace!("pool job finished");

        shared.done.lock().push_back(reap);
        shared.async_wake.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_reactor::Reactor;
    use parking_lot::Mutex as PMutex;
    use std::sync::Arc as StdArc;

    fn pool_with_reactor(config: PoolConfig) -> (Reactor, Pool) {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.start_async_wake().unwrap();
        let pool = Pool::new(handle, config);
        (reactor, pool)
    }

    #[test]
    fn round_trip_observes_every_value_exactly_once() {
        let (mut reactor, mut pool) = pool_with_reactor(PoolConfig {
            min_threads: 2,
            max_threads: 4,
            idle_decay: Duration::from_millis(50),
        });

        let seen = StdArc::new(PMutex::new(Vec::new()));
        const K: usize = 64;
        for i in 0..K {
            let seen = seen.clone();
            pool.submit(Job::new(move || {
                Box::new(move || seen.lock().push(i)) as ReapFn
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().len() < K && std::time::Instant::now() < deadline {
            reactor.poll(Some(Duration::from_millis(50))).unwrap();
            for event in reactor.take_events() {
                if matches!(event, dispatch_reactor::ReactorEvent::AsyncWake) {
                    pool.reap_completed();
                }
            }
        }

        let mut got = seen.lock().clone();
        got.sort_unstable();
        assert_eq!(got, (0..K).collect::<Vec<_>>());
        assert_eq!(pool.jobs(), 0);
    }

    #[test]
    fn decays_to_zero_threads_when_min_is_zero() {
        let (_reactor, pool) = pool_with_reactor(PoolConfig {
            min_threads: 0,
            max_threads: 4,
            idle_decay: Duration::from_millis(20),
        });

        // min=0 and no jobs submitted: no workers should ever have spawned.
        assert_eq!(pool.threads_alive(), 0);
    }

    #[test]
    fn decay_runs_idle_workers_down_to_min() {
        let (mut reactor, mut pool) = pool_with_reactor(PoolConfig {
            min_threads: 0,
            max_threads: 4,
            idle_decay: Duration::from_millis(20),
        });

        let seen = StdArc::new(PMutex::new(0));
        {
            let seen = seen.clone();
            pool.submit(Job::new(move || {
                Box::new(move || *seen.lock() += 1) as ReapFn
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while *seen.lock() == 0 && std::time::Instant::now() < deadline {
            reactor.poll(Some(Duration::from_millis(20))).unwrap();
            for event in reactor.take_events() {
                if matches!(event, dispatch_reactor::ReactorEvent::AsyncWake) {
                    pool.reap_completed();
                }
            }
        }
        assert_eq!(*seen.lock(), 1);

        // 5*delay of real idle time, per the spec's decay property.
        std::thread::sleep(Duration::from_millis(20 * 5));
        assert_eq!(pool.threads_alive(), 0);
    }

    #[test]
    fn begin_halt_lets_workers_drain() {
        let (_reactor, mut pool) = pool_with_reactor(PoolConfig {
            min_threads: 2,
            max_threads: 4,
            idle_decay: Duration::from_secs(30),
        });
        assert_eq!(pool.threads_alive(), 2);

        pool.begin_halt();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.threads_alive() > 0 && std::time::Instant::now() < deadline {
            pool.nudge();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.threads_alive(), 0);
    }
}
