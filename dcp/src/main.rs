use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dcp",
    version,
    about = "Copy a directory tree durably - skips existing entries and fsyncs every copied file",
    long_about = "`dcp` recursively copies a source tree to a destination while keeping up to 8 filesystem operations in flight.

Entries that already exist at the destination are skipped, never overwritten, so a destination populated by an earlier run can simply be copied onto again. Every copied file is flushed to stable storage before it counts as done.

Symbolic links, device nodes, FIFOs and sockets are skipped with a warning; they are neither followed nor recreated.

EXAMPLES:
    # Basic copy with a final summary
    dcp /source /dest --summary

    # Copy with periodic progress updates on stderr
    dcp /source /dest --progress

    # Top up a destination from an earlier run; existing entries are skipped
    dcp /source /dest"
)]
struct Args {
    // Progress & output
    /// Show periodic progress updates
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set delay between progress updates
    ///
    /// If specified, --progress flag is implied. Accepts human-readable durations like "200ms", "10s", "5min".
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: WARN)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report warnings or errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source file or directory
    #[arg()]
    src: std::path::PathBuf,

    /// Destination path
    #[arg()]
    dst: std::path::PathBuf,
}

lazy_static::lazy_static! {
    static ref PROGRESS: common::progress::Progress = common::progress::Progress::new();
}

async fn async_main(args: Args) -> anyhow::Result<common::CopySummary> {
    let progress_printer = if args.progress || args.progress_delay.is_some() {
        let delay = match &args.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .with_context(|| format!("failed parsing progress delay {delay:?}"))?,
            None => std::time::Duration::from_secs(10),
        };
        Some(tokio::spawn(async move {
            let mut printer = common::progress::ProgressPrinter::new(&PROGRESS);
            loop {
                tokio::time::sleep(delay).await;
                eprintln!("{}", printer.print());
            }
        }))
    } else {
        None
    };
    let result = common::copy(&PROGRESS, &args.src, &args.dst).await;
    if let Some(handle) = progress_printer {
        handle.abort();
    }
    // a fatal failure reports only its cause, not partial progress
    result.map_err(|error| error.source)
}

fn main() {
    let args = Args::parse();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    match common::run(&output, &runtime, func) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("dcp: {error:#}");
            }
            std::process::exit(1);
        }
    }
}
