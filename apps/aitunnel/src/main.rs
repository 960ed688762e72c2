use std::process::ExitCode;

use clap::Parser;

mod cli;
mod daemon;
mod run;

use cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Init { config } => daemon::init(config).map(|_| ExitCode::SUCCESS),
        Command::Start { foreground, config } => {
            if foreground {
                run::run(config).map(|_| ExitCode::SUCCESS)
            } else {
                daemon::start(config).map(|_| ExitCode::SUCCESS)
            }
        }
        Command::Stop => daemon::stop().map(exit_for),
        Command::Restart { config } => daemon::stop()
            .and_then(|_| daemon::start(config))
            .map(|_| ExitCode::SUCCESS),
        Command::Status => Ok(exit_for(daemon::status())),
        Command::Logs { follow } => daemon::logs(follow).map(|_| ExitCode::SUCCESS),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn exit_for(running: bool) -> ExitCode {
    if running {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
