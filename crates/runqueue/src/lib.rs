//! The run queue: a power-of-two ring buffer of pending task-resume
//! records, plus the idle-watcher drain loop that consumes it.

use dispatch_task_host::{Disposition, ResumeOutcome, ScriptRuntime, TaskHandle, TaskHost};

const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// `{task, nargs}`, owned by the run queue between enqueue and resume.
#[derive(Debug, Clone, Copy)]
pub struct ResumeRecord<H: TaskHandle> {
    pub task: H,
    pub nargs: u16,
}

/// FIFO of pending resume records. `first == last` iff empty; capacity is
/// always a power of two; pushing into a full buffer doubles it, copying
/// elements back into FIFO order starting at index 0. `len` is tracked
/// explicitly rather than derived from `first`/`last` alone — with only
/// two cursors, `first == last` is ambiguous between "empty" and "exactly
/// `capacity` elements queued", which would force a doubling one push
/// earlier than necessary and waste half the freshly doubled buffer.
pub struct RunQueue<H: TaskHandle> {
    buf: Vec<Option<ResumeRecord<H>>>,
    first: usize,
    last: usize,
    len: usize,
}

impl<H: TaskHandle> RunQueue<H> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INITIAL_CAPACITY)
    }

    /// `capacity` is rounded up to the next power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            buf: (0..capacity).map(|_| None).collect(),
            first: 0,
            last: 0,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Appends a resume record. Returns `true` if the queue was empty
    /// before this call — the caller (the reactor) should arm the drain
    /// idle watcher in that case.
    pub fn enqueue(&mut self, task: H, nargs: u16) -> bool {
        let was_empty = self.is_empty();

        if self.len == self.capacity() {
            self.grow();
        }

        let cap = self.capacity();
        self.buf[self.last] = Some(ResumeRecord { task, nargs });
        self.last = (self.last + 1) & (cap - 1);
        self.len += 1;

        was_empty
    }

    fn grow(&mut self) {
        let old_cap = self.capacity();
        let new_cap = old_cap * 2;
        let mut new_buf: Vec<Option<ResumeRecord<H>>> = (0..new_cap).map(|_| None).collect();

        for (i, slot) in new_buf.iter_mut().enumerate().take(self.len) {
            let idx = (self.first + i) & (old_cap - 1);
            *slot = self.buf[idx].take();
        }

        self.buf = new_buf;
        self.first = 0;
        self.last = self.len;
        tracing::trace!(old_cap, new_cap, "run queue doubled");
    }

    pub fn pop(&mut self) -> Option<ResumeRecord<H>> {
        if self.is_empty() {
            return None;
        }
        let cap = self.capacity();
        let record = self.buf[self.first].take();
        self.first = (self.first + 1) & (cap - 1);
        self.len -= 1;
        record
    }
}

impl<H: TaskHandle> Default for RunQueue<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a full drain pass.
#[derive(Debug)]
pub enum DrainResult {
    /// The queue ran empty; the idle watcher should stop.
    Empty,
    /// A task errored fatally; the reactor must latch failure and unwind.
    Unwind { message: String },
}

/// Drains the run queue, resuming tasks one at a time in FIFO order. This
/// is the idle-watcher callback body (spec §4.2).
pub fn drain<H, R>(queue: &mut RunQueue<H>, runtime: &mut R, host: &mut TaskHost<H>) -> DrainResult
where
    H: TaskHandle,
    R: ScriptRuntime<TaskHandle = H>,
{
    while let Some(record) = queue.pop() {
        let outcome = runtime.resume(record.task, record.nargs);
        match host.handle_outcome(runtime, record.task, outcome) {
            Disposition::Completed | Disposition::Yielded => {}
            Disposition::Fatal { message } => return DrainResult::Unwind { message },
        }
    }
    DrainResult::Empty
}

/// Converts any resume outcome the host doesn't already special-case
/// (notably "unknown error" results from `R::resume`'s own catch-all) the
/// way spec §4.2 describes. Exists so callers needn't special-case
/// `Option<ResumeOutcome>` themselves.
pub fn outcome_or_unknown(outcome: Option<ResumeOutcome>) -> ResumeOutcome {
    outcome.unwrap_or_else(|| ResumeOutcome::InternalError("unknown error".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_task_host::test_support::MockRuntime;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn fifo_ordering_is_preserved() {
        let mut rt = MockRuntime::new();
        let mut host = TaskHost::new();
        let mut queue = RunQueue::new();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();
        for i in 0..10u16 {
            let order = order.clone();
            let id = rt.spawn(move |_| {
                order.lock().push(i);
                ResumeOutcome::Completed
            });
            host.register(id);
            ids.push(id);
        }
        for id in &ids {
            queue.enqueue(*id, 0);
        }

        assert!(matches!(drain(&mut queue, &mut rt, &mut host), DrainResult::Empty));
        assert_eq!(*order.lock(), (0..10u16).collect::<Vec<_>>());
    }

    #[test]
    fn growth_preserves_order_and_is_power_of_two() {
        let mut rt = MockRuntime::new();
        let mut host = TaskHost::new();
        let mut queue: RunQueue<_> = RunQueue::with_capacity(4);
        let initial_cap = queue.capacity();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();
        for i in 0..(2 * initial_cap) {
            let seen = seen.clone();
            let id = rt.spawn(move |_| {
                seen.lock().push(i);
                ResumeOutcome::Completed
            });
            host.register(id);
            ids.push(id);
            queue.enqueue(id, 0);
        }

        assert!(queue.capacity() <= 2 * initial_cap);
        drain(&mut queue, &mut rt, &mut host);
        assert_eq!(*seen.lock(), (0..2 * initial_cap).collect::<Vec<_>>());
    }

    #[test]
    fn fatal_error_stops_drain_and_reports_unwind() {
        let mut rt = MockRuntime::new();
        let mut host = TaskHost::new();
        let mut queue = RunQueue::new();

        let bad = rt.spawn(|_| ResumeOutcome::RuntimeError("boom".into()));
        host.register(bad);
        queue.enqueue(bad, 0);

        match drain(&mut queue, &mut rt, &mut host) {
            DrainResult::Unwind { message } => assert!(message.contains("boom")),
            DrainResult::Empty => panic!("expected unwind"),
        }
        assert!(host.exit_status().is_failure());
    }
}
