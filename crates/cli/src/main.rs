mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::output::print_error;

/// bramble - reproducible builds from Lua configuration
#[derive(Parser)]
#[command(name = "bramble")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// More logging: -v for info, -vv for debug, -vvv for trace. RUST_LOG wins when set.
  #[arg(short, long, action = ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Evaluate a function and build the derivations it returns
  Run {
    /// Builders to run at once (default: number of CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Function to run, as `[path]:function`
    target: String,

    /// Arguments passed to the function
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
  },

  /// Run the test_ functions of test_*.bramble and *_test.bramble files
  Test {
    /// Stop after the first failing test
    #[arg(long)]
    fail_fast: bool,

    /// Test files evaluated at once (default: number of CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// File or directory to search for tests
    #[arg(default_value = ".")]
    path: PathBuf,
  },

  /// Remove store entries that no configuration refers to
  Gc {
    /// Show what would be removed without removing it
    #[arg(long)]
    dry_run: bool,
  },
}

fn init_tracing(verbose: u8) {
  let default = match verbose {
    0 => "warn",
    1 => "info",
    2 => "debug",
    _ => "trace",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let result = match cli.command {
    Commands::Run { jobs, target, args } => cmd::cmd_run(&target, args, jobs),
    Commands::Test { fail_fast, jobs, path } => cmd::cmd_test(&path, fail_fast, jobs),
    Commands::Gc { dry_run } => cmd::cmd_gc(dry_run),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      print_error(&format!("{e:#}"));
      ExitCode::FAILURE
    }
  }
}
