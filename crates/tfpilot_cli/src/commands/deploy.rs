//! Deploy command - init, plan, confirm, apply.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tracing::info;

use tfpilot_core::{EngineCommand, WorkflowState};
use tfpilot_iac::RunResult;

use super::session::{Approval, EngineSession};
use super::{parse_var, CredentialArgs, GlobalOpts};

#[derive(Args)]
pub struct DeployArgs {
    /// Archive with the Terraform definitions (.zip, .tar.gz, .tgz or .tar)
    pub archive: PathBuf,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Variable value as NAME=VALUE (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Use terraform.tfvars.example from the archive as the values file
    #[arg(long, conflicts_with = "vars")]
    pub example_values: bool,

    /// Apply without asking for confirmation
    #[arg(short, long)]
    pub yes: bool,

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

pub async fn execute(args: DeployArgs, global: GlobalOpts) -> Result<()> {
    info!("Deploying {:?}", args.archive);

    let mut config = global.engine_config()?;
    config.dry_run |= args.dry_run;
    config.probe_identity &= !args.no_probe;
    let stale_hours = config.stale_session_hours;

    let mut session = EngineSession::start(config, global.quiet, true).await?;
    let result = drive(&mut session, &args, stale_hours).await;
    session.close().await?;
    let (state, results) = result?;

    println!();
    match state {
        WorkflowState::NoChangesComplete => {
            println!("✅ No changes. Infrastructure is up to date.");
        }
        _ => print_apply(&results),
    }
    Ok(())
}

async fn drive(
    session: &mut EngineSession,
    args: &DeployArgs,
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

    let approval = if args.yes {
        Approval::Auto
    } else {
        Approval::Prompt
    };
    let finish = session
        .run_workflow(EngineCommand::StartDeploy, approval)
        .await?;

    if let Some(path) = &args.export_logs {
        session.export_logs(path).await?;
    }
    finish.into_result()
}

fn print_apply(results: &[RunResult]) {
    let Some(summary) = results.iter().rev().find_map(|r| r.summary.apply()) else {
        println!("✅ Deployment complete");
        return;
    };

    println!(
        "✅ Apply complete: {} added, {} changed, {} destroyed",
        summary.added, summary.changed, summary.destroyed
    );
    if !summary.outputs.is_empty() {
        println!();
        println!("Outputs:");
        for (name, value) in &summary.outputs {
            println!("  {} = {}", name, value);
        }
    }
}
