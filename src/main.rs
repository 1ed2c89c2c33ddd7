//! Binary entry point for the kiln CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kiln::{
    AnyBackend, Base, BaseError, ConfigError, ExecutionRequest, InstanceManager, InstanceName,
    ManagerSettings, ProviderConfig, ProviderError,
};

const LOG_ENV: &str = "KILN_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    about = "Run commands in ephemeral LXD containers and Multipass VMs",
    arg_required_else_help = true
)]
enum Cli {
    #[command(
        name = "run",
        about = "Launch an instance, run one command in it, then delete it"
    )]
    Run(RunCommand),
}

#[derive(Debug, Parser)]
struct RunCommand {
    /// Base image as <family>:<revision>, for example ubuntu:22.04.
    #[arg(long, default_value = "ubuntu:22.04")]
    base: String,
    /// Instance name. A unique name is generated when omitted.
    #[arg(long)]
    name: Option<String>,
    /// Leave the instance running after the command finishes.
    #[arg(long)]
    keep: bool,
    /// Command to execute in the instance (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Base(#[from] BaseError),
    #[error("invalid instance name: {0}")]
    Name(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            write_error(io::stderr(), &err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let config = ProviderConfig::load_without_cli_args()?;
    let settings = ManagerSettings::from_config(&config)?;
    let backend = AnyBackend::from_config(&config)?;
    let base: Base = args.base.parse()?;
    let name = instance_name(args.name.as_deref())?;

    let mut manager = InstanceManager::new(backend, name, base, settings);
    let outcome = match manager.launch().await {
        Ok(_) => manager
            .execute(&ExecutionRequest::new(args.command.iter().cloned()))
            .await
            .map_err(CliError::from),
        Err(err) => Err(err.into()),
    };

    if args.keep {
        warn!(instance = %manager.instance().name, "keeping instance as requested");
    } else if let Err(err) = manager.delete().await {
        write_error(io::stderr(), &CliError::from(err));
    }

    let result = outcome?;
    write_stream(io::stdout(), &result.stdout);
    write_stream(io::stderr(), &result.stderr);
    Ok(result.exit_code)
}

fn instance_name(requested: Option<&str>) -> Result<InstanceName, CliError> {
    requested
        .map_or_else(|| InstanceName::generate("kiln"), InstanceName::parse)
        .map_err(|err| CliError::Name(err.to_string()))
}

fn write_stream(mut target: impl Write, text: &str) {
    target.write_all(text.as_bytes()).ok();
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
