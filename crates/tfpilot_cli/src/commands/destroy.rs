//! Destroy command - init, then destroy.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tracing::info;

use tfpilot_core::{EngineCommand, WorkflowState};
use tfpilot_iac::RunResult;

use super::session::{Approval, EngineSession};
use super::{parse_var, CliFailure, CredentialArgs, GlobalOpts};

#[derive(Args)]
pub struct DestroyArgs {
    /// Archive with the Terraform definitions the infrastructure was deployed from
    pub archive: PathBuf,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Variable value as NAME=VALUE (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Use terraform.tfvars.example from the archive as the values file
    #[arg(long, conflicts_with = "vars")]
    pub example_values: bool,

    /// Required: destroy has no plan gate
    #[arg(long)]
    pub force: bool,

    /// Print the commands instead of running them
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the caller identity check
    #[arg(long)]
    pub no_probe: bool,

    /// Write the run log here (.json for JSON, text otherwise)
    #[arg(long, value_name = "FILE")]
    pub export_logs: Option<PathBuf>,
}

pub async fn execute(args: DestroyArgs, global: GlobalOpts) -> Result<()> {
    if !args.force && !args.dry_run {
        return Err(CliFailure::InvalidArgs(
            "destroy removes every managed resource; pass --force to continue".to_string(),
        )
        .into());
    }

    info!("Destroying infrastructure from {:?}", args.archive);

    let mut config = global.engine_config()?;
    config.dry_run |= args.dry_run;
    config.probe_identity &= !args.no_probe;
    let stale_hours = config.stale_session_hours;

    let mut session = EngineSession::start(config, global.quiet, true).await?;
    let result = drive(&mut session, &args, stale_hours).await;
    session.close().await?;
    let (_, results) = result?;

    let destroyed = results
        .iter()
        .find_map(|r| r.summary.destroy())
        .map(|s| s.destroyed)
        .unwrap_or(0);
    println!();
    println!("✅ Destroy complete: {} destroyed", destroyed);
    Ok(())
}

async fn drive(
    session: &mut EngineSession,
    args: &DestroyArgs,
    stale_hours: u64,
) -> Result<(WorkflowState, Vec<RunResult>)> {
    session.sweep(stale_hours).await?;
    session.extract(&args.archive).await?;
    session.configure_credentials(args.credentials.to_set()).await?;
    let declared = session.discover_variables().await?;
    if args.example_values {
        session.use_example_values().await?;
    } else {
        session.stage_variables(&declared, &args.vars).await?;
    }

    // Destroy never pauses for confirmation
    let finish = session
        .run_workflow(EngineCommand::StartDestroy, Approval::Prompt)
        .await?;

    if let Some(path) = &args.export_logs {
        session.export_logs(path).await?;
    }
    finish.into_result()
}
