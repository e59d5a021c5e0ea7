//! Variables command - list the variables an archive declares.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use tfpilot_iac::{mask, VariableSpec};

use super::session::EngineSession;
use super::GlobalOpts;

#[derive(Args)]
pub struct VariablesArgs {
    /// Archive with the Terraform definitions
    pub archive: PathBuf,
}

pub async fn execute(args: VariablesArgs, global: GlobalOpts) -> Result<()> {
    let config = global.engine_config()?;

    let mut session = EngineSession::start(config, global.quiet, false).await?;
    let result = async {
        session.extract(&args.archive).await?;
        session.discover_variables().await
    }
    .await;
    session.close().await?;
    let vars = result?;

    if vars.is_empty() {
        println!("No variables declared");
        return Ok(());
    }

    println!();
    for var in &vars {
        println!("{}", describe(var));
        if !var.description.is_empty() {
            println!("    {}", var.description);
        }
    }
    Ok(())
}

fn describe(var: &VariableSpec) -> String {
    let default = if var.is_required() {
        "required".to_string()
    } else if var.sensitive {
        format!("default {}", mask(&var.default))
    } else {
        format!("default {:?}", var.default)
    };
    let marker = if var.sensitive { " (sensitive)" } else { "" };
    format!("  {}{}: {}", var.name, marker, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&VariableSpec::new("bucket_name")),
            "  bucket_name: required"
        );
        assert_eq!(
            describe(&VariableSpec::new("region").with_default("us-east-1")),
            "  region: default \"us-east-1\""
        );
        // `default = ""` and `default = null` are still optional
        assert_eq!(
            describe(&VariableSpec::new("suffix").with_default("")),
            "  suffix: default \"\""
        );
    }
}
