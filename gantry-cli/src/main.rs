mod commands;
mod logging;
mod output;
mod signal;

use clap::{Parser, Subcommand};
use color_eyre::Result;

/// Run a repository's CI job graph locally
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about)]
struct Cli {
    /// Enable debug diagnostics on stderr (overridden by RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run jobs, respecting dependencies, matrices and sidecars
    Run(commands::run::RunArgs),
    /// Check a config file and print its execution plan
    Validate(commands::validate::ValidateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match cli.command {
        Command::Run(args) => commands::run::execute(args).await?,
        Command::Validate(args) => commands::validate::execute(args)?,
    };

    std::process::exit(code);
}
