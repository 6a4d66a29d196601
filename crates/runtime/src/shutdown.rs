//! Graceful-drain shutdown sequence (spec.md §6, `MAX_CLEANUP_DELAY`).
//! Grounded on `original_source/bin/pool.c`'s
//! `lem_wait_pool_to_be_empty_upto_delay`: pin the pool's `max` at its
//! current thread count and let idle decay run every worker down, bounded
//! by a deadline — `delay == 0` means don't wait at all.

use std::time::{Duration, Instant};

use dispatch_pool::Pool;

/// Begins the pool's halt protocol and blocks until every worker has
/// exited or `delay` elapses, whichever comes first.
pub fn graceful_shutdown(pool: &mut Pool, delay: Duration) {
    pool.begin_halt();

    if delay.is_zero() {
        tracing::debug!("MAX_CLEANUP_DELAY=0; not waiting for pool workers to drain");
        return;
    }

    let deadline = Instant::now() + delay;
    while pool.threads_alive() > 0 && Instant::now() < deadline {
        pool.nudge();
        std::thread::sleep(Duration::from_millis(10));
    }

    if pool.threads_alive() > 0 {
        tracing::warn!(
            remaining = pool.threads_alive(),
            "pool workers still running after cleanup delay; exiting anyway"
        );
    } else {
        tracing::debug!("pool drained cleanly");
    }
}
