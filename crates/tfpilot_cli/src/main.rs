//! tfpilot CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Workflow failure
//! - 4: Terraform binary not found
//! - 5: Plan declined

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, CliFailure, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const WORKFLOW_FAILURE: u8 = 3;
    pub const BINARY_NOT_FOUND: u8 = 4;
    pub const DECLINED: u8 = 5;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_filter = if cli.verbose {
        "tfpilot=debug,warn"
    } else {
        "tfpilot=info,warn"
    };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .try_init();

    let global = cli.global();
    let result = match cli.command {
        Commands::Deploy(args) => commands::deploy::execute(args, global).await,
        Commands::Destroy(args) => commands::destroy::execute(args, global).await,
        Commands::Variables(args) => commands::variables::execute(args, global).await,
        Commands::Cleanup(args) => commands::cleanup::execute(args, global).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Map an error to its exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<CliFailure>() {
        Some(CliFailure::InvalidArgs(_)) => ExitCodes::INVALID_ARGS,
        Some(CliFailure::Workflow { .. }) | Some(CliFailure::Interrupted) => {
            ExitCodes::WORKFLOW_FAILURE
        }
        Some(CliFailure::BinaryNotFound(_)) => ExitCodes::BINARY_NOT_FOUND,
        Some(CliFailure::Declined) => ExitCodes::DECLINED,
        Some(CliFailure::Rejected(_)) | None => ExitCodes::GENERAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_error() {
        let cases = [
            (CliFailure::InvalidArgs("x".into()), ExitCodes::INVALID_ARGS),
            (CliFailure::BinaryNotFound("terraform".into()), ExitCodes::BINARY_NOT_FOUND),
            (CliFailure::Declined, ExitCodes::DECLINED),
            (CliFailure::Interrupted, ExitCodes::WORKFLOW_FAILURE),
            (CliFailure::Rejected("busy".into()), ExitCodes::GENERAL_ERROR),
        ];
        for (failure, code) in cases {
            assert_eq!(categorize_error(&anyhow::Error::new(failure)), code);
        }

        let wrapped = anyhow::Error::new(CliFailure::Declined).context("deploy");
        assert_eq!(categorize_error(&wrapped), ExitCodes::DECLINED);

        assert_eq!(
            categorize_error(&anyhow::anyhow!("disk full")),
            ExitCodes::GENERAL_ERROR
        );
    }
}
