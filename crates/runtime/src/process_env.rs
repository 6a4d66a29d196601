//! Captures the process's original argv/environ at start of day, the way
//! `original_source/bin/lem.c` stashes `__lem_main_argc`/`__lem_main_argv`/
//! `__lem_main_environ` in globals before anything can mutate them (the
//! original's `os.setproctitle` overwrites `argv[0]`'s backing storage in
//! place, which only the first captured copy makes safe to undo later).

use std::ffi::OsString;

/// Immutable snapshot of `argv`/`environ` taken at the top of `main`.
#[derive(Debug, Clone)]
pub struct ProcessEnv {
    pub argv: Vec<OsString>,
    pub environ: Vec<(OsString, OsString)>,
}

impl ProcessEnv {
    pub fn capture() -> Self {
        Self {
            argv: std::env::args_os().collect(),
            environ: std::env::vars_os().collect(),
        }
    }

    /// `MAX_CLEANUP_DELAY` (seconds, float, default `0`) — bounds how long
    /// the graceful-drain shutdown sequence waits for pool workers to
    /// finish naturally before giving up (spec.md §6, `lem.c`'s
    /// `max_cleanup_delay`).
    pub fn max_cleanup_delay(&self) -> std::time::Duration {
        let seconds = self
            .environ
            .iter()
            .find(|(k, _)| k == "MAX_CLEANUP_DELAY")
            .and_then(|(_, v)| v.to_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0)
            .max(0.0);
        std::time::Duration::from_secs_f64(seconds)
    }
}
