pub mod adapters;
pub mod core;
pub mod runtime;

use std::process::ExitCode;

use clap::Parser;

pub fn run() -> ExitCode {
    env_logger::init();
    let cli = runtime::cli::Cli::parse();

    let tokio_runtime = match tokio::runtime::Runtime::new() {
        Ok(value) => value,
        Err(error) => {
            log::error!("Failed to start async runtime: {}", error);
            return ExitCode::FAILURE;
        }
    };

    match tokio_runtime.block_on(runtime::cli::execute(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("{}", error);
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
