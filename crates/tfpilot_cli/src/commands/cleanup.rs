//! Cleanup command - remove stale session workspaces.

use anyhow::Result;
use clap::Args;

use super::session::EngineSession;
use super::GlobalOpts;

#[derive(Args)]
pub struct CleanupArgs {
    /// Remove sessions older than this many hours (defaults to the configured retention)
    #[arg(long)]
    pub max_age_hours: Option<u64>,
}

pub async fn execute(args: CleanupArgs, global: GlobalOpts) -> Result<()> {
    let config = global.engine_config()?;
    let max_age_hours = args.max_age_hours.unwrap_or(config.stale_session_hours);
    println!(
        "🧹 Sweeping sessions older than {}h in {}",
        max_age_hours,
        config.base_dir.display()
    );

    let mut session = EngineSession::start(config, global.quiet, false).await?;
    let result = session.sweep(max_age_hours).await;
    session.close().await?;
    let report = result?;

    if report.removed.is_empty() && report.failed.is_empty() {
        println!("   Nothing to remove");
    }
    if !report.failed.is_empty() {
        println!("⚠️  {} session(s) could not be removed", report.failed.len());
    }
    Ok(())
}
