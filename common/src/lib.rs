//! Engine library for the `dcp` durable copy tool.
//!
//! The core is a bounded-concurrency traversal scheduler: discovered entries
//! wait on a LIFO stack, classify-and-copy operations overlap up to a fixed
//! ceiling, and the run only terminates once both the stack and the set of
//! outstanding operations are empty.

use anyhow::Context;

pub mod config;
pub mod copy;
pub mod path;
pub mod progress;
pub mod testutils;

pub use config::{OutputConfig, RuntimeConfig};
pub use copy::{MAX_IN_FLIGHT, Summary as CopySummary, copy};

fn init_logging(output: &config::OutputConfig) -> anyhow::Result<()> {
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed initializing tracing subscriber: {}", err))?;
    Ok(())
}

/// Sets up logging and the tokio runtime, then blocks on the tool's async
/// entry point. Binaries hand in their parsed configuration and a closure
/// producing the future to run.
pub fn run<Fut, OutputT>(
    output: &config::OutputConfig,
    runtime: &config::RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> anyhow::Result<OutputT>
where
    Fut: std::future::Future<Output = anyhow::Result<OutputT>>,
{
    init_logging(output)?;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = builder
        .build()
        .context("failed building the tokio runtime")?;
    runtime.block_on(func())
}
