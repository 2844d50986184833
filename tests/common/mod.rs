//! Common test utilities and helpers for github-export tests
#![allow(dead_code)]

use async_trait::async_trait;
use github_export::config::RetryConfig;
use github_export::{Config, GitTransport, Remote, TransportError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_TOKEN: &str = "ghp_testtoken";

/// Listing entry as the GitHub API returns it
pub fn repo_json(id: i64, name: &str, updated_at: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "full_name": format!("octocat/{}", name),
        "clone_url": format!("https://github.com/octocat/{}.git", name),
        "ssh_url": format!("git@github.com:octocat/{}.git", name),
        "default_branch": "main",
        "updated_at": updated_at,
        "pushed_at": updated_at,
        "private": false,
        "fork": false,
        "archived": false
    })
}

/// Serve `pages` as consecutive listing pages starting at page 1
pub async fn mount_pages(server: &MockServer, pages: &[Vec<serde_json::Value>]) {
    for (i, page) in pages.iter().enumerate() {
        Mock::given(method("GET"))
            .and(path("/user/repos"))
            .and(query_param("page", (i + 1).to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::Value::Array(page.clone())))
            .mount(server)
            .await;
    }
}

/// Configuration pointed at a mock server, with millisecond retry delays
pub fn test_config(api_url: &str, base_dir: &Path) -> Config {
    let mut config = Config {
        base_directory: base_dir.display().to_string(),
        ..Config::default()
    };
    config.github.api_url = api_url.to_string();
    config.github.page_size = 2;
    config.retry = RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
    };
    config
}

/// One call made against a [`ScriptedTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransportCall {
    pub operation: &'static str,
    pub url: String,
    pub fetch_url: String,
    pub dest: PathBuf,
}

/// In-process transport that lays out a fake bare repository on clone and
/// fails for repositories whose URL contains a configured fragment
#[derive(Default)]
pub struct ScriptedTransport {
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<TransportCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, url_fragment: &str) {
        self.failing.lock().unwrap().insert(url_fragment.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, operation: &'static str, remote: &Remote, dest: &Path) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(TransportCall {
            operation,
            url: remote.url.clone(),
            fetch_url: remote.fetch_url.clone(),
            dest: dest.to_path_buf(),
        });

        let failing = self.failing.lock().unwrap();
        if failing.iter().any(|fragment| remote.url.contains(fragment.as_str())) {
            return Err(TransportError::Git {
                operation,
                detail: "simulated network failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GitTransport for ScriptedTransport {
    async fn clone_repository(&self, remote: &Remote, dest: &Path) -> Result<(), TransportError> {
        self.record("clone", remote, dest)?;
        std::fs::create_dir_all(dest.join("objects")).map_err(|e| TransportError::disk(dest, e))?;
        std::fs::write(dest.join("HEAD"), "ref: refs/heads/main\n").map_err(|e| TransportError::disk(dest, e))?;
        Ok(())
    }

    async fn update_repository(&self, remote: &Remote, dest: &Path) -> Result<(), TransportError> {
        self.record("update", remote, dest)
    }

    fn is_repository(&self, path: &Path) -> bool {
        path.join("HEAD").is_file()
    }
}

/// Whether a usable `git` binary is on PATH
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run git in `dir`, panicking with stderr on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create a bare "remote" with one commit on `main`, returning its path
pub fn create_remote(root: &Path, name: &str) -> PathBuf {
    let work = root.join(format!("{}-work", name));
    std::fs::create_dir_all(&work).unwrap();
    git(&work, &["init", "-b", "main"]);
    std::fs::write(work.join("README.md"), "hello\n").unwrap();
    git(&work, &["add", "README.md"]);
    git(&work, &["commit", "-m", "initial"]);

    let bare = root.join(format!("{}.remote.git", name));
    git(root, &["clone", "--bare", work.to_str().unwrap(), bare.to_str().unwrap()]);
    git(&work, &["remote", "add", "origin", bare.to_str().unwrap()]);
    bare
}

/// Add a commit in the work tree next to `create_remote`'s bare repository and push it
pub fn push_commit(root: &Path, name: &str, file: &str) -> String {
    let work = root.join(format!("{}-work", name));
    std::fs::write(work.join(file), file).unwrap();
    git(&work, &["add", file]);
    git(&work, &["commit", "-m", file]);
    git(&work, &["push", "origin", "main"]);
    git(&work, &["rev-parse", "HEAD"])
}

/// Assertion helper for CLI output
pub fn assert_contains_any(text: &str, expected: &[&str]) {
    let found = expected.iter().any(|item| text.contains(item));
    assert!(
        found,
        "Expected text to contain at least one of {:?}, but it didn't. Text: {}",
        expected, text
    );
}
