//! Command line entry point for test harness binaries
//!
//! A harness is a small binary (or a `harness = false` test target) that
//! supplies a [`FileLoader`] and hands control to [`main`]:
//!
//! ```no_run
//! use std::path::Path;
//! use otter_test::{LoadError, Registrar};
//!
//! fn load(path: &Path, tests: &mut Registrar) -> Result<(), LoadError> {
//!     let source = otter_test::read_source(path)?;
//!     tests.test_sync(path.display().to_string(), move |t| t.ok(!source.is_empty()));
//!     Ok(())
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     otter_test::cli::main(load)
//! }
//! ```

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::loader::FileLoader;
use crate::report::{ConsoleReporter, JsonReporter, PersistedReport, Reporter};
use crate::runner::Runner;

/// Exit code for errors outside of test execution.
const RUNNER_ERROR_EXIT: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "otter-test")]
#[command(about = "Run test files sequentially and report the results")]
pub struct Args {
    /// Specific test files to run (skips discovery)
    #[arg(value_name = "FILES")]
    pub files: Vec<PathBuf>,

    /// Directory to discover test files in
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Only run files whose path contains this string
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Output events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Default per-test timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout: Option<u64>,

    /// Config file (default: otter-test.toml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Only list test files without running them
    #[arg(long)]
    pub list_only: bool,

    /// Save the full report as JSON to this path
    #[arg(long, value_name = "PATH")]
    pub save: Option<PathBuf>,

    /// Show more output (-v: timings and info logs, -vv: debug logs)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parse the process arguments and run.
pub fn main<L: FileLoader>(loader: L) -> ExitCode {
    run(&loader, std::env::args_os())
}

/// Run with explicit arguments (the first one is the program name).
pub fn run<I, T>(loader: &dyn FileLoader, args: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    ExitCode::from(exit_status(loader, args))
}

fn exit_status<I, T>(loader: &dyn FileLoader, args: I) -> u8
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = match Args::try_parse_from(args) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { RUNNER_ERROR_EXIT } else { 0 };
        }
    };

    init_tracing(args.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} failed to start runtime: {e}", "error:".red().bold());
            return RUNNER_ERROR_EXIT;
        }
    };

    match runtime.block_on(execute(args, loader)) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            RUNNER_ERROR_EXIT
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    // A harness may already have installed a subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn execute(args: Args, loader: &dyn FileLoader) -> Result<u8, RunnerError> {
    let mut config = match &args.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::load_or_default(None),
    };
    if let Some(root) = args.root {
        config.root = root;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_ms = timeout;
    }

    let runner = Runner::new(config).keep_results(args.save.is_some());
    let files: Box<dyn Iterator<Item = PathBuf>> = if args.files.is_empty() {
        Box::new(runner.discovery(args.filter)?.files())
    } else {
        let filter = args.filter;
        Box::new(args.files.into_iter().filter(move |path| match &filter {
            Some(filter) => path.to_string_lossy().contains(filter.as_str()),
            None => true,
        }))
    };

    if args.list_only {
        let mut count = 0;
        for path in files {
            println!("{}", path.display());
            count += 1;
        }
        if !args.json {
            println!("\nTotal: {count} files");
        }
        return Ok(0);
    }

    let reporter: Box<dyn Reporter> = if args.json {
        Box::new(JsonReporter::stdout())
    } else {
        Box::new(ConsoleReporter::stdout(args.verbose > 0))
    };
    let summary = runner.run(files, loader, reporter).await?;

    if let Some(path) = &args.save {
        PersistedReport::new(summary.clone()).save(path)?;
        if !args.json {
            println!("Results saved to {}", path.display());
        }
    }

    Ok(summary.exit_status())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = Args::try_parse_from([
            "otter-test",
            "a.test.json",
            "b.test.json",
            "--timeout",
            "250",
            "--filter",
            "math",
            "-vv",
            "--json",
        ])
        .unwrap();

        assert_eq!(
            args.files,
            [PathBuf::from("a.test.json"), PathBuf::from("b.test.json")]
        );
        assert_eq!(args.timeout, Some(250));
        assert_eq!(args.filter.as_deref(), Some("math"));
        assert_eq!(args.verbose, 2);
        assert!(args.json);
        assert!(!args.list_only);
        assert_eq!(args.save, None);
    }

    #[test]
    fn test_missing_config_is_runner_error() {
        let loader = |_: &std::path::Path,
                      _: &mut crate::queue::Registrar|
         -> Result<(), crate::error::LoadError> { Ok(()) };
        let status = exit_status(
            &loader,
            ["otter-test", "--config", "/nonexistent/otter-test.toml"],
        );
        assert_eq!(status, RUNNER_ERROR_EXIT);
    }
}
