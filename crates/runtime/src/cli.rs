//! CLI surface, `clap::Parser`-derived in the teacher's style (see
//! `xeno-term`'s `cli.rs`): one struct, documented fields, defaults that
//! match `dispatch-pool`'s own (`min=1, max=8, delay=3s`).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "dispatch-core", about = "Single-process cooperative event-loop runtime")]
pub struct Cli {
    /// Entry-point script to load and run (not interpreted by this crate —
    /// handed to the embedding's `ScriptRuntime` as an opaque path).
    pub script: Option<PathBuf>,

    /// Arguments forwarded to the script as its own `arg` table/argv.
    #[arg(trailing_var_arg = true)]
    pub script_args: Vec<String>,

    /// Minimum live worker-pool threads.
    #[arg(long, default_value_t = 1)]
    pub pool_min: usize,

    /// Maximum live worker-pool threads.
    #[arg(long, default_value_t = 8)]
    pub pool_max: usize,

    /// Seconds an idle worker thread waits before decaying below `pool_max`.
    #[arg(long, default_value_t = 3.0)]
    pub pool_idle_decay_secs: f64,

    /// Log filter directive forwarded to `tracing_subscriber::EnvFilter`
    /// (overrides `RUST_LOG` if set).
    #[arg(long)]
    pub log_filter: Option<String>,
}

impl Cli {
    pub fn pool_idle_decay(&self) -> Duration {
        Duration::from_secs_f64(self.pool_idle_decay_secs.max(0.0))
    }
}
