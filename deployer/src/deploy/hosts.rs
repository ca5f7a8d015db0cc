//! Loopback entries for the stack's local domains

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::privilege::session::SessionManager;
use crate::utils::shell_quote;

/// Comment line placed above the entries
pub const HOSTS_MARKER: &str = "# stackdeploy local domains";

const LOOPBACK: &str = "127.0.0.1";
const APPEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether `content` maps `domain` to loopback. Comments are ignored and any
/// run of spaces or tabs separates fields.
pub fn has_entry(content: &str, domain: &str) -> bool {
    content.lines().any(|line| {
        let active = line.split('#').next().unwrap_or_default();
        let mut fields = active.split_whitespace();
        fields.next() == Some(LOOPBACK) && fields.any(|host| host.eq_ignore_ascii_case(domain))
    })
}

/// Domains without an entry yet, in the given order
pub fn missing_entries<'a>(content: &str, domains: &[&'a str]) -> Vec<&'a str> {
    domains
        .iter()
        .copied()
        .filter(|domain| !has_entry(content, domain))
        .collect()
}

/// Shell line appending the entries (and the marker, when absent)
pub fn append_command(content: &str, hosts_file: &Path, missing: &[&str]) -> String {
    let mut lines = Vec::new();
    if !content.lines().any(|line| line.trim() == HOSTS_MARKER) {
        if !content.is_empty() && !content.ends_with('\n') {
            lines.push(String::new());
        }
        lines.push(HOSTS_MARKER.to_string());
    }
    lines.extend(missing.iter().map(|domain| format!("{} {}", LOOPBACK, domain)));

    let quoted: Vec<String> = lines.iter().map(|line| shell_quote(line)).collect();
    format!(
        "printf '%s\\n' {} >> {}",
        quoted.join(" "),
        shell_quote(&hosts_file.to_string_lossy())
    )
}

/// Append missing entries through the privileged session. Returns what was added.
pub async fn ensure_entries(
    session: &SessionManager,
    hosts_file: &Path,
    domains: &[&str],
    cancel: &CancellationToken,
) -> Result<Vec<String>, DeployError> {
    let file = File::new(hosts_file);
    let content = if file.exists().await {
        file.read_string().await?
    } else {
        String::new()
    };

    let missing = missing_entries(&content, domains);
    if missing.is_empty() {
        debug!("Hosts entries already present in {}", hosts_file.display());
        return Ok(Vec::new());
    }

    let command = append_command(&content, hosts_file, &missing);
    session
        .execute(&command, Some(APPEND_TIMEOUT), &BTreeMap::new(), cancel)
        .await?;

    info!("Added hosts entries for {}", missing.join(", "));
    Ok(missing.into_iter().map(str::to_string).collect())
}
