use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use regex::Regex;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::env;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Config, RetryConfig};
use crate::error::ExportError;
use crate::retry::{with_backoff, Attempt};

const USER_AGENT: &str = concat!("github-export/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";

/// One remote repository, as returned by the listing endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    #[serde(default)]
    pub ssh_url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
    #[serde(rename = "private", default)]
    pub is_private: bool,
    #[serde(rename = "fork", default)]
    pub is_fork: bool,
    #[serde(rename = "archived", default)]
    pub is_archived: bool,
}

impl RepositoryDescriptor {
    /// Latest remote change GitHub reports for this repository.
    ///
    /// `updated_at` tracks metadata edits and `pushed_at` tracks pushes; a
    /// mirror is current only if neither moved since the last sync.
    pub fn last_activity(&self) -> DateTime<Utc> {
        match self.pushed_at {
            Some(pushed_at) if pushed_at > self.updated_at => pushed_at,
            _ => self.updated_at,
        }
    }
}

/// Source of repository descriptors for an export run
#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Every repository visible to the account, deduplicated by id, in API order
    async fn list_all(&self) -> Result<Vec<RepositoryDescriptor>, ExportError>;

    /// Provider name for display/logging
    fn provider_name(&self) -> &'static str;
}

/// GitHub authentication strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Use GitHub CLI authentication
    GitHubCLI,
    /// Use environment variable token
    EnvironmentToken,
    /// Use the token stored in the configuration file
    ConfigToken,
}

/// Authenticated client for the GitHub REST API
#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    api_url: Url,
    token: String,
    page_size: u32,
    affiliation: String,
    visibility: String,
    retry: RetryConfig,
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_url", &self.api_url.as_str())
            .field("token", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("affiliation", &self.affiliation)
            .field("visibility", &self.visibility)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct AuthenticatedUser {
    login: String,
}

impl GitHubClient {
    /// Create a client from validated configuration and a resolved token
    pub fn new(config: &Config, token: impl Into<String>) -> Result<Self, ExportError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ExportError::Config(format!("Failed to create HTTP client: {}", e)))?;

        // A trailing slash makes `Url::join` append instead of replacing the last segment
        let mut api_url = config.github.api_url.clone();
        if !api_url.ends_with('/') {
            api_url.push('/');
        }
        let api_url = Url::parse(&api_url)
            .map_err(|e| ExportError::Config(format!("Invalid API URL {}: {}", api_url, e)))?;

        Ok(Self {
            http,
            api_url,
            token: token.into(),
            page_size: config.github.page_size,
            affiliation: config.github.affiliation.clone(),
            visibility: config.github.visibility.clone(),
            retry: config.retry.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ExportError> {
        self.api_url
            .join(path)
            .map_err(|e| ExportError::Config(format!("Invalid API path {}: {}", path, e)))
    }

    fn build_request(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    /// Login of the account the token belongs to
    pub async fn whoami(&self) -> Result<String, ExportError> {
        let url = self.endpoint("user")?;

        with_backoff(&self.retry, |_| {
            let url = url.clone();
            async move {
                let response = self.send(self.http.get(url)).await?;
                let user: AuthenticatedUser = response.json().await.map_err(|e| {
                    Attempt::Fatal(ExportError::ListingFailed(format!(
                        "Malformed user response: {}",
                        e
                    )))
                })?;
                Ok(user.login)
            }
        })
        .await
    }

    /// Fetch one listing page, retrying throttled and transient failures
    pub async fn fetch_page(&self, page: u32) -> Result<Vec<RepositoryDescriptor>, ExportError> {
        let url = self.endpoint("user/repos")?;
        let per_page = self.page_size.to_string();
        let page_number = page.to_string();

        with_backoff(&self.retry, |attempt| {
            let request = self.http.get(url.clone()).query(&[
                ("per_page", per_page.as_str()),
                ("page", page_number.as_str()),
                ("affiliation", self.affiliation.as_str()),
                ("visibility", self.visibility.as_str()),
                ("sort", "full_name"),
                ("direction", "asc"),
            ]);
            async move {
                debug!("Fetching repositories page {} (attempt {})", page, attempt);
                let response = self.send(request).await?;
                response.json::<Vec<RepositoryDescriptor>>().await.map_err(|e| {
                    Attempt::Fatal(ExportError::ListingFailed(format!(
                        "Malformed repository page {}: {}",
                        page, e
                    )))
                })
            }
        })
        .await
    }

    /// Send an authenticated request and classify any failure for the retry loop
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, Attempt> {
        let response = match self.build_request(request).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Err(Attempt::Retry {
                    error: ExportError::ListingFailed(format!("Request failed: {}", e)),
                    wait_hint: None,
                });
            }
            Err(e) => {
                return Err(Attempt::Fatal(ExportError::ListingFailed(format!(
                    "Request failed: {}",
                    e
                ))));
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let rate_limited = is_rate_limited(status, response.headers());
        let wait_hint = rate_limit_wait(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(self.classify_failure(status, rate_limited, wait_hint, body))
    }

    fn classify_failure(
        &self,
        status: StatusCode,
        rate_limited: bool,
        wait_hint: Option<Duration>,
        body: String,
    ) -> Attempt {
        if rate_limited {
            return Attempt::Retry {
                error: ExportError::RateLimited {
                    attempts: self.retry.max_attempts,
                },
                wait_hint,
            };
        }

        let message = api_message(&body).unwrap_or_else(|| status.to_string());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Attempt::Fatal(ExportError::Auth(message))
            }
            s if s.is_server_error() => Attempt::Retry {
                error: ExportError::ListingFailed(format!("GitHub API error ({}): {}", s, message)),
                wait_hint: None,
            },
            s => Attempt::Fatal(ExportError::ListingFailed(format!(
                "GitHub API error ({}): {}",
                s, message
            ))),
        }
    }

    /// Lazily page through every repository of the account.
    ///
    /// Stops after the first page shorter than the page size. Descriptors keep
    /// API order; an id already yielded is dropped. The stream ends after the
    /// first error, and a new call starts again from page 1.
    pub fn list_repositories(
        &self,
    ) -> impl Stream<Item = Result<RepositoryDescriptor, ExportError>> + '_ {
        let state = ListingState::new(self.page_size as usize);

        stream::unfold(Some(state), move |state| async move {
            let mut state = state?;
            loop {
                if let Some(repo) = state.buffered.pop_front() {
                    return Some((Ok(repo), Some(state)));
                }
                if state.exhausted {
                    return None;
                }

                let items = match self.fetch_page(state.next_page).await {
                    Ok(items) => items,
                    Err(e) => return Some((Err(e), None)),
                };
                state.absorb(items);
            }
        })
    }
}

/// Full pages in a row that add no new repository before pagination gives up
const MAX_DUPLICATE_PAGES: u32 = 25;

/// Page-merge state of one listing: dedup by id and the end-of-listing rule
#[derive(Debug)]
struct ListingState {
    page_size: usize,
    next_page: u32,
    exhausted: bool,
    duplicate_pages: u32,
    buffered: VecDeque<RepositoryDescriptor>,
    seen: HashSet<i64>,
}

impl ListingState {
    fn new(page_size: usize) -> Self {
        Self {
            page_size,
            next_page: 1,
            exhausted: false,
            duplicate_pages: 0,
            buffered: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Merge one fetched page, buffering the ids not seen before
    fn absorb(&mut self, items: Vec<RepositoryDescriptor>) {
        let page = self.next_page;
        let fetched = items.len();
        let mut fresh = 0;

        for repo in items {
            if self.seen.insert(repo.id) {
                self.buffered.push_back(repo);
                fresh += 1;
            } else {
                debug!("Dropping duplicate repository {} from page {}", repo.full_name, page);
            }
        }

        if fetched < self.page_size {
            self.exhausted = true;
        } else if fresh == 0 {
            self.duplicate_pages += 1;
            if self.duplicate_pages >= MAX_DUPLICATE_PAGES {
                warn!(
                    "{} consecutive pages repeated only known repositories, stopping at page {}",
                    self.duplicate_pages, page
                );
                self.exhausted = true;
            }
        } else {
            self.duplicate_pages = 0;
        }
        self.next_page += 1;
    }
}

#[async_trait]
impl RepositorySource for GitHubClient {
    async fn list_all(&self) -> Result<Vec<RepositoryDescriptor>, ExportError> {
        let repositories: Vec<_> = self.list_repositories().try_collect().await?;
        info!("Found {} repositories", repositories.len());
        Ok(repositories)
    }

    fn provider_name(&self) -> &'static str {
        "GitHub"
    }
}

/// GitHub signals throttling with 429, or with 403 plus an exhausted quota or a retry-after
fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    if status != StatusCode::FORBIDDEN {
        return false;
    }

    let quota_exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);

    quota_exhausted || headers.contains_key(header::RETRY_AFTER)
}

/// Server-requested wait from `retry-after` or `x-ratelimit-reset`
fn rate_limit_wait(headers: &HeaderMap) -> Option<Duration> {
    let header_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    if let Some(seconds) = header_u64(header::RETRY_AFTER.as_str()) {
        return Some(Duration::from_secs(seconds));
    }

    let reset_at = header_u64("x-ratelimit-reset")?;
    let now = Utc::now().timestamp().max(0) as u64;
    Some(Duration::from_secs(reset_at.saturating_sub(now)))
}

fn api_message(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

/// Translate a `*` glob into an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped))
}

/// Post-listing selection of the repositories to export
#[derive(Debug, Clone)]
pub struct RepositoryFilter {
    include_forks: bool,
    include_archived: bool,
    exclude: Vec<Regex>,
}

impl RepositoryFilter {
    pub fn new(include_forks: bool, include_archived: bool, patterns: &[String]) -> Result<Self, regex::Error> {
        let exclude = patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            include_forks,
            include_archived,
            exclude,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ExportError> {
        Self::new(
            config.github.include_forks,
            config.github.include_archived,
            &config.github.exclude_patterns,
        )
        .map_err(|e| ExportError::Config(format!("Invalid exclude pattern: {}", e)))
    }

    /// Filter that keeps every repository
    pub fn accept_all() -> Self {
        Self {
            include_forks: true,
            include_archived: true,
            exclude: Vec::new(),
        }
    }

    pub fn accepts(&self, repo: &RepositoryDescriptor) -> bool {
        if repo.is_fork && !self.include_forks {
            debug!("Excluding fork repository: {}", repo.full_name);
            return false;
        }
        if repo.is_archived && !self.include_archived {
            debug!("Excluding archived repository: {}", repo.full_name);
            return false;
        }
        if self.exclude.iter().any(|re| re.is_match(&repo.name)) {
            debug!("Excluding repository due to pattern match: {}", repo.full_name);
            return false;
        }
        true
    }

    pub fn apply(&self, repositories: Vec<RepositoryDescriptor>) -> Vec<RepositoryDescriptor> {
        repositories.into_iter().filter(|r| self.accepts(r)).collect()
    }
}

/// Token discovery, in the order configured by `github.auth_method`
pub mod auth {
    use super::*;

    /// Detect and obtain GitHub authentication
    pub fn resolve_token(config: &Config) -> anyhow::Result<(AuthStrategy, String)> {
        match config.github.auth_method.as_str() {
            "auto" => {
                if let Ok(token) = try_github_cli() {
                    Ok((AuthStrategy::GitHubCLI, token))
                } else if let Ok(token) = try_environment_token() {
                    Ok((AuthStrategy::EnvironmentToken, token))
                } else if let Some(token) = config_token(config) {
                    Ok((AuthStrategy::ConfigToken, token))
                } else {
                    Err(anyhow!(
                        "No GitHub authentication found. Please either:\n\
                         1. Install and authenticate GitHub CLI: gh auth login\n\
                         2. Set GITHUB_TOKEN environment variable\n\
                         3. Set github.token in the configuration file"
                    ))
                }
            }
            "gh_cli" => {
                let token = try_github_cli()
                    .context("GitHub CLI authentication failed. Run: gh auth login")?;
                Ok((AuthStrategy::GitHubCLI, token))
            }
            "token" => {
                let token = try_environment_token()
                    .context("GITHUB_TOKEN environment variable not found or invalid")?;
                Ok((AuthStrategy::EnvironmentToken, token))
            }
            "config" => {
                let token = config_token(config).context("github.token is not set")?;
                Ok((AuthStrategy::ConfigToken, token))
            }
            other => Err(anyhow!("Unknown auth method: {}", other)),
        }
    }

    fn config_token(config: &Config) -> Option<String> {
        config
            .github
            .token
            .as_ref()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Try to get token from GitHub CLI
    fn try_github_cli() -> anyhow::Result<String> {
        debug!("Attempting GitHub CLI authentication");

        if !is_command_available("gh") {
            return Err(anyhow!("GitHub CLI (gh) is not installed"));
        }

        let token_output = Command::new("gh")
            .args(["auth", "token"])
            .output()
            .context("Failed to get GitHub CLI token")?;

        if !token_output.status.success() {
            return Err(anyhow!(
                "Failed to retrieve token from GitHub CLI: {}",
                String::from_utf8_lossy(&token_output.stderr)
            ));
        }

        let token = String::from_utf8(token_output.stdout)
            .context("GitHub CLI token is not valid UTF-8")?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(anyhow!("GitHub CLI returned empty token"));
        }

        debug!("Successfully obtained token from GitHub CLI");
        Ok(token)
    }

    /// Try to get token from environment variable
    fn try_environment_token() -> anyhow::Result<String> {
        debug!("Attempting environment variable authentication");

        let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;
        let token = token.trim().to_string();

        if token.is_empty() {
            return Err(anyhow!("GITHUB_TOKEN is empty"));
        }

        if !["ghp_", "gho_", "ghs_", "github_pat_"]
            .iter()
            .any(|prefix| token.starts_with(prefix))
        {
            warn!("GITHUB_TOKEN doesn't look like a GitHub token (expected ghp_, gho_, ghs_ or github_pat_ prefix)");
        }

        Ok(token)
    }

    /// Check if a command is available in PATH
    pub fn is_command_available(command: &str) -> bool {
        Command::new(command)
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}
