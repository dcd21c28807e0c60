use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

/// Exit code for failed verification tasks
const EXIT_TASKS_FAILED: i32 = 1;
/// Exit code for invalid configuration
const EXIT_CONFIGURATION: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let parsed = cli::Cli::parse();

    // Dispatch to CLI handler and handle special exit codes
    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(failed) = err.downcast_ref::<commands::run::TasksFailed>() {
                eprintln!("Error: {}", failed);
                std::process::exit(EXIT_TASKS_FAILED);
            }

            if let Some(rax_error) = err.downcast_ref::<rax_core::errors::RaxError>() {
                if rax_error.is_configuration() {
                    eprintln!("Error: {}", rax_error);
                    std::process::exit(EXIT_CONFIGURATION);
                }
            }

            // For all other errors, return them normally
            Err(err)
        }
    }
}
