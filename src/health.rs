//! Preflight checks for github-export
//!
//! Verifies that git is installed, that GitHub accepts the credentials, and
//! that the backup directory and index are usable before an export starts.

use crate::config::{CloneProtocol, Config};
use crate::github::{auth, GitHubClient};
use crate::store::MirrorStore;
use std::path::Path;

/// Result of all preflight checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub git: CheckResult,
    pub github_auth: CheckResult,
    pub base_dir: CheckResult,
    pub index: CheckResult,
    /// Only required when cloning over SSH
    pub ssh: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::ok(message)
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config) -> Self {
        Self {
            git: Self::check_git(),
            github_auth: Self::check_github_auth(config).await,
            base_dir: Self::check_base_dir(config),
            index: Self::check_index(config),
            ssh: Self::check_ssh(config),
        }
    }

    /// Whether every required check passed (warnings do not count as failures)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, r)| r.passed)
    }

    /// Failed checks, excluding warnings
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.is_warning)
            .collect()
    }

    fn check_git() -> CheckResult {
        match std::process::Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(output) => CheckResult::error_with_details(
                "Git command failed",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    /// Resolve a token and ask GitHub who it belongs to
    async fn check_github_auth(config: &Config) -> CheckResult {
        let (strategy, token) = match auth::resolve_token(config) {
            Ok(resolved) => resolved,
            Err(e) => {
                return CheckResult::error_with_details(
                    "No GitHub credentials found",
                    format!("{:#}", e),
                )
            }
        };

        let client = match GitHubClient::new(config, token) {
            Ok(client) => client,
            Err(e) => return CheckResult::error_with_details("GitHub client setup failed", e.to_string()),
        };

        match client.whoami().await {
            Ok(login) => CheckResult::ok_with_details(
                "GitHub authentication successful",
                format!("Logged in as {} (via {:?})", login, strategy),
            ),
            Err(e) => CheckResult::error_with_details(
                "GitHub authentication failed",
                format!("{}\nRun: gh auth login", e),
            ),
        }
    }

    /// The base directory must be writable, or creatable on first export
    fn check_base_dir(config: &Config) -> CheckResult {
        let path = config.base_path();

        if !path.exists() {
            return match nearest_existing_ancestor(&path) {
                Some(ancestor) if is_writable(ancestor) => CheckResult::warning_with_details(
                    "Base directory does not exist yet",
                    format!("{} will be created on first export", path.display()),
                ),
                _ => CheckResult::error_with_details(
                    "Base directory cannot be created",
                    format!("Run: mkdir -p {}", path.display()),
                ),
            };
        }

        if !path.is_dir() {
            return CheckResult::error_with_details(
                "Base directory is not a directory",
                path.display().to_string(),
            );
        }

        if is_writable(&path) {
            CheckResult::ok_with_details("Base directory writable", path.display().to_string())
        } else {
            CheckResult::error_with_details(
                "Base directory is not writable",
                path.display().to_string(),
            )
        }
    }

    /// Open the index read-through and report what it holds
    fn check_index(config: &Config) -> CheckResult {
        let index = config.index_file();
        if !index.exists() {
            return CheckResult::warning_with_details(
                "No mirror index yet",
                format!("{} will be created on first export", index.display()),
            );
        }

        let store = match MirrorStore::open(&index, config.base_path(), config.sync.mode) {
            Ok(store) => store,
            Err(e) => return CheckResult::error_with_details("Mirror index unreadable", e.to_string()),
        };

        match (store.records(), store.failed_records()) {
            (Ok(records), Ok(failed)) if failed.is_empty() => CheckResult::ok_with_details(
                "Mirror index readable",
                format!("{} mirrors recorded", records.len()),
            ),
            (Ok(records), Ok(failed)) => CheckResult::warning_with_details(
                "Mirror index has failed repositories",
                format!(
                    "{} mirrors recorded, {} failed on the last attempt. Run: github-export status --failed",
                    records.len(),
                    failed.len()
                ),
            ),
            (Err(e), _) | (_, Err(e)) => {
                CheckResult::error_with_details("Mirror index unreadable", e.to_string())
            }
        }
    }

    fn check_ssh(config: &Config) -> CheckResult {
        if config.sync.protocol != CloneProtocol::Ssh {
            return CheckResult::ok("SSH not used (cloning over HTTPS)");
        }

        let ssh_dir = dirs::home_dir().unwrap_or_default().join(".ssh");
        let found_keys: Vec<_> = ["id_rsa", "id_ed25519", "id_ecdsa"]
            .into_iter()
            .filter(|key| ssh_dir.join(key).exists())
            .collect();

        if found_keys.is_empty() {
            CheckResult::warning_with_details(
                "No SSH keys found",
                "SSH cloning may not work. Run: ssh-keygen -t ed25519",
            )
        } else {
            CheckResult::ok_with_details("SSH keys found", found_keys.join(", "))
        }
    }

    /// All checks with their display names
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 5] {
        [
            ("Git Installation", &self.git),
            ("GitHub Authentication", &self.github_auth),
            ("Base Directory", &self.base_dir),
            ("Mirror Index", &self.index),
            ("SSH Configuration", &self.ssh),
        ]
    }
}

fn nearest_existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

fn is_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".github-export-probe-{}", std::process::id()));
    match std::fs::File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
