//! Classification of Terraform's human-readable output.
//!
//! Terraform's text output is not a stable contract. Every pattern here is
//! best effort: a missing summary line yields zero counts and a warning,
//! never an error. Success and failure always come from the exit code.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::terraform::TerraformCommand;

/// Counts from a `plan` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub to_add: u32,
    pub to_change: u32,
    pub to_destroy: u32,
    pub has_changes: bool,
}

impl PlanSummary {
    pub fn new(to_add: u32, to_change: u32, to_destroy: u32) -> Self {
        Self {
            to_add,
            to_change,
            to_destroy,
            has_changes: to_add + to_change + to_destroy > 0,
        }
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy",
            self.to_add, self.to_change, self.to_destroy
        )
    }
}

/// Counts and outputs from an `apply` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub added: u32,
    pub changed: u32,
    pub destroyed: u32,
    /// Root module outputs in printed order
    pub outputs: Vec<(String, String)>,
}

impl ApplySummary {
    pub fn output(&self, name: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroySummary {
    pub destroyed: u32,
}

/// Command-specific classified result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Summary {
    Init { success: bool },
    Plan(PlanSummary),
    Apply(ApplySummary),
    Destroy(DestroySummary),
}

impl Summary {
    pub fn plan(&self) -> Option<&PlanSummary> {
        match self {
            Self::Plan(plan) => Some(plan),
            _ => None,
        }
    }

    pub fn apply(&self) -> Option<&ApplySummary> {
        match self {
            Self::Apply(apply) => Some(apply),
            _ => None,
        }
    }

    pub fn destroy(&self) -> Option<&DestroySummary> {
        match self {
            Self::Destroy(destroy) => Some(destroy),
            _ => None,
        }
    }
}

/// Turns tool output into summaries and progress estimates.
pub trait OutputClassifier: Send + Sync {
    /// Classify the complete stdout of a successful run.
    fn classify(&self, command: TerraformCommand, stdout: &str) -> Summary;

    /// Advisory progress percentage for one streamed line.
    fn progress_hint(&self, command: TerraformCommand, line: &str) -> Option<u8>;
}

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("valid classifier regex"))
        }
    };
}

static_regex!(
    ansi_regex,
    r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]"
);
static_regex!(
    plan_regex,
    r"Plan:(?: \d+ to import,)? (\d+) to add, (\d+) to change, (\d+) to destroy"
);
static_regex!(
    apply_regex,
    r"Apply complete! Resources:(?: \d+ imported,)? (\d+) added, (\d+) changed, (\d+) destroyed"
);
static_regex!(destroy_regex, r"Destroy complete! Resources: (\d+) destroyed");
static_regex!(output_line_regex, r"^\s*([A-Za-z_][A-Za-z0-9_-]*)\s*=\s*(.*?)\s*$");

/// Remove ANSI escape sequences.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ansi_regex().replace_all(text, "")
}

fn count(caps: &regex::Captures<'_>, index: usize) -> u32 {
    caps.get(index)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Parse the plan summary. No summary line means nothing to do.
pub fn classify_plan(stdout: &str) -> PlanSummary {
    let text = strip_ansi(stdout);
    match plan_regex().captures_iter(&text).last() {
        Some(caps) => PlanSummary::new(count(&caps, 1), count(&caps, 2), count(&caps, 3)),
        None => {
            if text.contains("No changes.") {
                debug!("Plan reported no changes");
            } else {
                warn!("Plan summary not found in output, assuming no changes");
            }
            PlanSummary::default()
        }
    }
}

/// Parse the apply summary and the trailing `Outputs:` block.
pub fn classify_apply(stdout: &str) -> ApplySummary {
    let text = strip_ansi(stdout);
    let mut summary = match apply_regex().captures_iter(&text).last() {
        Some(caps) => ApplySummary {
            added: count(&caps, 1),
            changed: count(&caps, 2),
            destroyed: count(&caps, 3),
            outputs: Vec::new(),
        },
        None => {
            warn!("Apply summary not found in output, assuming zero counts");
            ApplySummary::default()
        }
    };
    summary.outputs = parse_outputs(&text);
    summary
}

/// Parse the destroy summary.
pub fn classify_destroy(stdout: &str) -> DestroySummary {
    let text = strip_ansi(stdout);
    match destroy_regex().captures_iter(&text).last() {
        Some(caps) => DestroySummary {
            destroyed: count(&caps, 1),
        },
        None => {
            warn!("Destroy summary not found in output, assuming zero");
            DestroySummary::default()
        }
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// `key = value` lines after the last `Outputs:` header, in order.
pub fn parse_outputs(text: &str) -> Vec<(String, String)> {
    let mut lines = text.lines();
    let mut block = Vec::new();

    // Restart on every header so only the last block counts.
    let mut in_block = false;
    for line in lines.by_ref() {
        if line.trim() == "Outputs:" {
            in_block = true;
            block.clear();
            continue;
        }
        if in_block {
            block.push(line);
        }
    }

    block
        .into_iter()
        .filter_map(|line| {
            let caps = output_line_regex().captures(line)?;
            let key = caps.get(1)?.as_str().to_string();
            let value = unquote(caps.get(2)?.as_str()).to_string();
            Some((key, value))
        })
        .collect()
}

/// Default classifier for Terraform CLI output.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerraformClassifier;

impl OutputClassifier for TerraformClassifier {
    fn classify(&self, command: TerraformCommand, stdout: &str) -> Summary {
        match command {
            TerraformCommand::Init => Summary::Init { success: true },
            TerraformCommand::Plan => Summary::Plan(classify_plan(stdout)),
            TerraformCommand::Apply => Summary::Apply(classify_apply(stdout)),
            TerraformCommand::Destroy => Summary::Destroy(classify_destroy(stdout)),
        }
    }

    fn progress_hint(&self, command: TerraformCommand, line: &str) -> Option<u8> {
        let line = strip_ansi(line);
        let line = line.as_ref();
        let has = |needle: &str| line.contains(needle);

        match command {
            TerraformCommand::Init => {
                if has("has been successfully initialized") {
                    Some(100)
                } else if has("Downloading") || has("Installing") {
                    Some(40)
                } else if has("Initializing provider plugins") {
                    Some(30)
                } else if has("Initializing") {
                    Some(10)
                } else {
                    None
                }
            }
            TerraformCommand::Plan => {
                if has("Plan:") || has("No changes.") {
                    Some(100)
                } else if has("will be created")
                    || has("will be updated")
                    || has("will be destroyed")
                    || has("must be replaced")
                {
                    Some(60)
                } else if has("Refreshing state") || has("Reading...") {
                    Some(30)
                } else {
                    None
                }
            }
            TerraformCommand::Apply => {
                if has("Apply complete!") {
                    Some(100)
                } else if has("Creation complete")
                    || has("Modifications complete")
                    || has("Destruction complete")
                {
                    Some(70)
                } else if has("Creating...") || has("Modifying...") || has("Destroying...") {
                    Some(40)
                } else if has("Plan:") {
                    Some(20)
                } else {
                    None
                }
            }
            TerraformCommand::Destroy => {
                if has("Destroy complete!") {
                    Some(100)
                } else if has("Destruction complete") {
                    Some(70)
                } else if has("Destroying...") {
                    Some(40)
                } else if has("Plan:") {
                    Some(20)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        let colored = "\x1b[1m\x1b[32mApply complete!\x1b[0m Resources: \x1b[1m1\x1b[0m added";
        assert_eq!(strip_ansi(colored), "Apply complete! Resources: 1 added");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_plan_with_changes() {
        let summary = classify_plan("Plan: 3 to add, 1 to change, 0 to destroy.");
        assert_eq!(
            summary,
            PlanSummary {
                to_add: 3,
                to_change: 1,
                to_destroy: 0,
                has_changes: true
            }
        );
    }

    #[test]
    fn test_plan_without_summary_is_zero() {
        let summary = classify_plan("No changes. Your infrastructure matches the configuration.");
        assert_eq!(summary, PlanSummary::new(0, 0, 0));
        assert!(!summary.has_changes);

        assert_eq!(classify_plan(""), PlanSummary::default());
    }

    #[test]
    fn test_plan_with_colors_and_imports() {
        let stdout = "\x1b[1mPlan:\x1b[0m 1 to import, 2 to add, 0 to change, 4 to destroy.\n";
        assert_eq!(classify_plan(stdout), PlanSummary::new(2, 0, 4));
    }

    #[test]
    fn test_apply_with_outputs() {
        let stdout =
            "Apply complete! Resources: 2 added, 0 changed, 0 destroyed.\n\nOutputs:\n\nurl = \"http://x\"\n";
        let summary = classify_apply(stdout);

        assert_eq!(summary.added, 2);
        assert_eq!(summary.changed, 0);
        assert_eq!(summary.destroyed, 0);
        assert_eq!(summary.outputs, vec![("url".to_string(), "http://x".to_string())]);
    }

    #[test]
    fn test_apply_outputs_keep_order_and_skip_noise() {
        let stdout = "\
Apply complete! Resources: 0 added, 1 changed, 0 destroyed.

Outputs:

zone = \"eu-west-1a\"
instance_ids = tolist([
  \"i-123\",
])
db_password = <sensitive>
alpha = 42
";
        let summary = classify_apply(stdout);
        let keys: Vec<_> = summary.outputs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["zone", "instance_ids", "db_password", "alpha"]);
        assert_eq!(summary.output("zone"), Some("eu-west-1a"));
        assert_eq!(summary.output("db_password"), Some("<sensitive>"));
        assert_eq!(summary.output("alpha"), Some("42"));
    }

    #[test]
    fn test_apply_without_summary() {
        let summary = classify_apply("something unexpected");
        assert_eq!(summary, ApplySummary::default());
    }

    #[test]
    fn test_destroy() {
        let summary = classify_destroy("\x1b[0mDestroy complete! Resources: 5 destroyed.\n");
        assert_eq!(summary.destroyed, 5);
        assert_eq!(classify_destroy("").destroyed, 0);
    }

    #[test]
    fn test_classify_dispatch() {
        let classifier = TerraformClassifier;
        assert_eq!(
            classifier.classify(TerraformCommand::Init, "anything"),
            Summary::Init { success: true }
        );
        let plan = classifier.classify(TerraformCommand::Plan, "Plan: 1 to add, 0 to change, 0 to destroy.");
        assert!(plan.plan().unwrap().has_changes);
    }

    #[test]
    fn test_progress_hints() {
        let c = TerraformClassifier;
        assert_eq!(c.progress_hint(TerraformCommand::Init, "Initializing the backend..."), Some(10));
        assert_eq!(
            c.progress_hint(TerraformCommand::Init, "- Downloading plugin for provider \"aws\""),
            Some(40)
        );
        assert_eq!(
            c.progress_hint(TerraformCommand::Init, "Terraform has been successfully initialized!"),
            Some(100)
        );
        assert_eq!(
            c.progress_hint(TerraformCommand::Plan, "  # aws_s3_bucket.b will be created"),
            Some(60)
        );
        assert_eq!(
            c.progress_hint(TerraformCommand::Apply, "aws_s3_bucket.b: Creation complete after 2s"),
            Some(70)
        );
        assert_eq!(
            c.progress_hint(TerraformCommand::Destroy, "aws_s3_bucket.b: Destroying... [id=b]"),
            Some(40)
        );
        assert_eq!(c.progress_hint(TerraformCommand::Plan, "random text"), None);
    }
}
