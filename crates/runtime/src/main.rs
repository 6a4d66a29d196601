//! Composition root: process-wide signal policy, argv/env capture, the
//! worker pool and reactor, and the graceful-drain shutdown sequence
//! (spec.md §6) wired around a [`dispatch_io::Core`].
//!
//! The embedded scripting interpreter is out of scope (see the workspace's
//! crate-level docs): this binary drives `dispatch_io::test_support`'s
//! `MockRuntime` as its [`ScriptRuntime`](dispatch_task_host::ScriptRuntime),
//! the same stand-in every crate's test suite builds against. A real
//! embedding replaces it without touching anything else in this file.

mod cli;
mod process_env;
mod shutdown;
mod signals;

use std::process::ExitCode;

use clap::Parser;
use dispatch_io::test_support::MockRuntime;
use dispatch_io::{Core, CoreConfig};
use dispatch_pool::PoolConfig;

use cli::Cli;
use process_env::ProcessEnv;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let process_env = ProcessEnv::capture();
    init_tracing(cli.log_filter.as_deref());

    if let Err(err) = signals::install_default_policy() {
        tracing::error!(%err, "failed to install default signal policy");
        return ExitCode::FAILURE;
    }

    if let Some(script) = &cli.script {
        match std::fs::metadata(script) {
            Ok(meta) => tracing::info!(
                path = %script.display(),
                bytes = meta.len(),
                args = ?cli.script_args,
                "script given (no embedded ScriptRuntime configured to run it)",
            ),
            Err(err) => {
                tracing::error!(path = %script.display(), %err, "cannot read script");
                return ExitCode::FAILURE;
            }
        }
    } else {
        tracing::warn!("no script given; running an idle dispatch core");
    }

    let config = CoreConfig {
        pool: PoolConfig {
            min_threads: cli.pool_min,
            max_threads: cli.pool_max,
            idle_decay: cli.pool_idle_decay(),
        },
    };

    let mut core = match Core::new(MockRuntime::new(), config) {
        Ok(core) => core,
        Err(err) => {
            tracing::error!(%err, "failed to initialize dispatch core");
            return ExitCode::FAILURE;
        }
    };

    let status = core.run_until_idle();

    shutdown::graceful_shutdown(core.pool_mut(), process_env.max_cleanup_delay());

    if status.is_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn init_tracing(log_filter: Option<&str>) {
    let filter = log_filter
        .map(str::to_owned)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}
