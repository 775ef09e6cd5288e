//! Sectioneer CLI - drive serial-sectioning acquisition runs from the
//! command line.

mod commands;
mod error;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;

#[derive(Parser)]
#[command(
    name = "sectioneer",
    version = sectioneer::VERSION,
    about = "Automated serial-sectioning acquisition control"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an acquisition run
    Run(commands::run::RunArgs),

    /// Load a settings file and report validation problems
    Validate(commands::validate::ValidateArgs),

    /// Score a stored image with a configured criterion
    Score(commands::score::ScoreArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Validate(args) => commands::validate::run(args),
        Commands::Score(args) => commands::score::run(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}
