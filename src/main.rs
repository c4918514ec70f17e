use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use farmer::{
    app::{cli::Cli, console::Console, logging},
    Orchestrator,
};

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("[ERROR]: Failed to initialize logging: {}", e);
    }

    let options = cli.options();
    let tasklist = options.tasklist.display().to_string();
    let orchestrator = Orchestrator::new(options, Console::new());

    match orchestrator.run().with_context(|| format!("farming '{}'", tasklist)) {
        Ok(outcome) => ExitCode::from(outcome.exit_code().clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("[ERROR]: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
