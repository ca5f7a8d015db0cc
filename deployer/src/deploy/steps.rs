//! Step table: the ordered installer scripts of the deploying phase

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::shell_quote;

/// The worker-side `timeout` fires this much before the controller deadline
/// so a stalled installer surfaces as exit code 124.
const WORKER_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Shell variable holding the resolved `timeout` binary
const TIMEOUT_VAR: &str = "step_timeout";

/// Local domains the stack is served on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domains {
    pub application: String,
    pub auth: String,
}

impl Default for Domains {
    fn default() -> Self {
        Self {
            application: "www.eulercopilot.local".to_string(),
            auth: "authhub.eulercopilot.local".to_string(),
        }
    }
}

impl Domains {
    pub fn all(&self) -> [&str; 2] {
        [&self.application, &self.auth]
    }
}

/// Value of an environment variable or input answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepValue {
    ApplicationDomain,
    AuthDomain,
    Literal(&'static str),
}

impl StepValue {
    pub fn resolve(&self, domains: &Domains) -> String {
        match self {
            StepValue::ApplicationDomain => domains.application.clone(),
            StepValue::AuthDomain => domains.auth.clone(),
            StepValue::Literal(value) => value.to_string(),
        }
    }
}

/// One installer stage
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub id: &'static str,
    /// Relative to the installer scripts directory
    pub script_path: &'static str,
    pub display_name: &'static str,
    pub env_vars: &'static [(&'static str, StepValue)],
    /// Answer fed to the script's interactive prompt
    pub input_answer: Option<StepValue>,
    /// Typical duration, used for the remaining-time estimate
    pub estimate: Duration,
}

/// Installs the cluster runtime and tooling. Only run when tools are missing.
pub const TOOLS_STEP: Step = Step {
    id: "2-install-tools",
    script_path: "2-install-tools/install_tools.sh",
    display_name: "Install cluster tools",
    env_vars: &[],
    input_answer: None,
    estimate: Duration::from_secs(240),
};

/// The deploying phase, in execution order
pub const STEP_TABLE: &[Step] = &[
    Step {
        id: "6-install-databases",
        script_path: "6-install-databases/install_databases.sh",
        display_name: "Install databases",
        env_vars: &[],
        input_answer: None,
        estimate: Duration::from_secs(180),
    },
    Step {
        id: "7-install-authhub",
        script_path: "7-install-authhub/install_authhub.sh",
        display_name: "Install AuthHub",
        env_vars: &[],
        input_answer: Some(StepValue::AuthDomain),
        estimate: Duration::from_secs(120),
    },
    Step {
        id: "8-install-EulerCopilot",
        script_path: "8-install-EulerCopilot/install_eulercopilot.sh",
        display_name: "Install EulerCopilot",
        env_vars: &[
            ("EULERCOPILOT_DOMAIN", StepValue::ApplicationDomain),
            ("AUTHHUB_DOMAIN", StepValue::AuthDomain),
            ("NON_INTERACTIVE", StepValue::Literal("1")),
            ("SKIP_CONFIRM", StepValue::Literal("1")),
        ],
        input_answer: None,
        estimate: Duration::from_secs(300),
    },
];

impl Step {
    pub fn script(&self, scripts_dir: &Path) -> PathBuf {
        scripts_dir.join(self.script_path)
    }

    pub fn env(&self, domains: &Domains) -> BTreeMap<String, String> {
        self.env_vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.resolve(domains)))
            .collect()
    }

    /// Shell line running the script from the scripts directory. The script is
    /// bounded by `timeout` (`gtimeout` on hosts with prefixed coreutils) and
    /// runs unbounded when neither is installed.
    pub fn command(&self, scripts_dir: &Path, domains: &Domains, timeout: Duration) -> String {
        let dir = shell_quote(&scripts_dir.to_string_lossy());
        let script = shell_quote(self.script_path);
        let worker_timeout = timeout
            .saturating_sub(WORKER_TIMEOUT_MARGIN)
            .max(Duration::from_secs(1));

        let mut line = format!(
            "cd {dir} && chmod +x {script} \
             && {var}=$(command -v timeout || command -v gtimeout || true) \
             && ${{{var}:+\"${var}\" {secs}}} bash {script}",
            var = TIMEOUT_VAR,
            secs = worker_timeout.as_secs(),
        );
        if let Some(answer) = &self.input_answer {
            line.push_str(&format!(" <<< {}", shell_quote(&answer.resolve(domains))));
        }
        line
    }
}

/// Remaining-time estimate from step `index` (inclusive) to the end of the table
pub fn remaining_estimate(index: usize) -> Duration {
    STEP_TABLE.iter().skip(index).map(|step| step.estimate).sum()
}
