mod commands;
mod helpers;
mod uhpc;

use amidr_core::domain::AmidrError;
use clap::Parser;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

pub fn run_from_env() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let analysis_error = error.as_amidr_error();
            eprintln!("{}", analysis_error.diagnostic_line());
            eprintln!("{}", analysis_error.fatal_exit_line());
            analysis_error.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once("amidr".to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();
    parse_and_dispatch(full_args)
}

fn parse_and_dispatch(args: Vec<String>) -> Result<i32, CliError> {
    match Cli::try_parse_from(&args) {
        Ok(cli) => {
            init_logging(cli.log_level.as_deref())?;
            dispatch_parsed(cli.command)
        }
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{}", err);
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

/// `--log-level` wins over `RUST_LOG`; both fall back to `info`.
fn init_logging(level: Option<&str>) -> Result<(), CliError> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .map_err(|error| CliError::Usage(format!("invalid log level '{level}': {error}")))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "amidr",
    version,
    about = "Solid-state diffusivity from galvanostatic pulse measurements"
)]
struct Cli {
    /// Tracing filter directive, e.g. `debug` or `amidr_core=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Segment, normalize and fit UHPC cycler files
    Fit(commands::FitArgs),
    /// Screen and bin the fits of one material's cells
    Bin(commands::BinArgs),
    /// Align the bin tables of up to four materials
    Compare(commands::CompareArgs),
}

fn dispatch_parsed(command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Fit(args) => commands::run_fit_command(args),
        CliCommand::Bin(args) => commands::run_bin_command(args),
        CliCommand::Compare(args) => commands::run_compare_command(args),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Analysis(AmidrError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    fn as_amidr_error(&self) -> AmidrError {
        match self {
            Self::Usage(message) => AmidrError::configuration("CONFIG.CLI_USAGE", message.clone()),
            Self::Analysis(error) => error.clone(),
            Self::Internal(error) => AmidrError::io_system("IO.CLI", format!("{error:#}")),
        }
    }
}
