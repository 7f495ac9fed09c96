use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use octocrab::Octocrab;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::GitHubConfig;
use crate::error::{Result, SyncError};

const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";
const USER_AGENT: &str = concat!("settings-sync/", env!("CARGO_PKG_VERSION"));

/// Fallback wait for a 429 that carries no reset hint
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Owner and name of the settings repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    /// `<owner>-<product>-Settings-Sync`
    pub fn for_owner(owner: &str, product: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: format!("{}-{}-Settings-Sync", owner, product),
        }
    }

    fn contents_route(&self, path: &str) -> String {
        format!("/repos/{}/{}/contents/{}", self.owner, self.name, path)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Outcome of an idempotent repository creation
#[derive(Debug)]
pub enum Provisioning {
    /// The repository was created by this call
    Created,
    /// GitHub answered 422: the repository already exists
    AlreadyExists,
    /// Still rate limited after the configured number of retries
    RateLimited { attempts: u32 },
    Failed(SyncError),
}

/// A remote file together with its revision marker
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub content: Vec<u8>,
    pub sha: String,
}

#[derive(Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Deserialize)]
struct ContentResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    sha: String,
}

#[derive(Deserialize)]
struct WriteResponse {
    content: WrittenContent,
}

#[derive(Deserialize)]
struct WrittenContent {
    sha: String,
}

#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

/// Thin client over the GitHub REST endpoints the sync needs
///
/// The token is resolved by the caller and handed in once; the client never
/// consults the credential store itself.
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    product: String,
    homepage: String,
    max_rate_limit_retries: u32,
    max_backoff: Duration,
    transport_retries: u32,
    retry_delay: Duration,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout))
            .build()?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: token.into(),
            product: config.product.clone(),
            homepage: config.homepage.clone(),
            max_rate_limit_retries: config.max_rate_limit_retries,
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            transport_retries: config.transport_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    /// Resolve the login of the token's owner
    pub async fn current_user_login(&self) -> Result<String> {
        let response = self.send(Method::GET, "/user", None).await?;
        let status = response.status();

        if status.is_success() {
            let user: UserResponse = response
                .json()
                .await
                .map_err(|e| SyncError::Decode(format!("user response: {}", e)))?;
            debug!("Token belongs to GitHub user: {}", user.login);
            Ok(user.login)
        } else {
            Err(error_from_response(response).await)
        }
    }

    /// Create the private settings repository, treating "already exists" as success
    pub async fn create_repository(&self, repo: &RepoId) -> Provisioning {
        let body = json!({
            "name": repo.name,
            "description": format!("A repository for storing your {} settings", self.product),
            "homepage": self.homepage,
            "private": true,
            "auto_init": true,
            "license_template": "mit",
        });

        let response = match self.send(Method::POST, "/user/repos", Some(&body)).await {
            Ok(response) => response,
            Err(SyncError::RateLimited { attempts }) => {
                return Provisioning::RateLimited { attempts }
            }
            Err(e) => return Provisioning::Failed(e),
        };

        match response.status() {
            status if status.is_success() => {
                info!("Created repository {}", repo);
                Provisioning::Created
            }
            StatusCode::UNPROCESSABLE_ENTITY => {
                info!("Repository {} already exists", repo);
                Provisioning::AlreadyExists
            }
            _ => Provisioning::Failed(error_from_response(response).await),
        }
    }

    /// Fetch a file and its revision marker
    pub async fn read_file(&self, repo: &RepoId, path: &str) -> Result<RemoteFile> {
        let response = self
            .send(Method::GET, &repo.contents_route(path), None)
            .await?;

        match response.status() {
            status if status.is_success() => {
                let body: ContentResponse = response
                    .json()
                    .await
                    .map_err(|e| SyncError::Decode(format!("{}: {}", path, e)))?;
                let content = decode_content(path, &body)?;
                debug!("Read {} ({} bytes, sha {})", path, content.len(), body.sha);
                Ok(RemoteFile {
                    content,
                    sha: body.sha,
                })
            }
            StatusCode::NOT_FOUND => Err(SyncError::NotFound {
                path: path.to_string(),
            }),
            _ => Err(error_from_response(response).await),
        }
    }

    /// Create (`marker == None`) or update a file, returning the new revision marker
    ///
    /// A marker that no longer matches the remote head yields `SyncError::Conflict`.
    pub async fn write_file(
        &self,
        repo: &RepoId,
        path: &str,
        content: &[u8],
        marker: Option<&str>,
    ) -> Result<String> {
        let mut body = json!({
            "message": commit_message(&self.product, chrono::Local::now()),
            "content": BASE64.encode(content),
        });
        if let Some(sha) = marker {
            body["sha"] = Value::String(sha.to_string());
        }

        let response = self
            .send(Method::PUT, &repo.contents_route(path), Some(&body))
            .await?;

        match response.status() {
            status if status.is_success() => {
                let written: WriteResponse = response
                    .json()
                    .await
                    .map_err(|e| SyncError::Decode(format!("{}: {}", path, e)))?;
                Ok(written.content.sha)
            }
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                warn!("Revision marker for {} is stale", path);
                Err(SyncError::Conflict {
                    path: path.to_string(),
                })
            }
            _ => Err(error_from_response(response).await),
        }
    }

    /// Send a request, waiting out rate limits and retrying transport errors on GETs
    async fn send(&self, method: Method, route: &str, body: Option<&Value>) -> Result<Response> {
        let url = format!("{}{}", self.api_url, route);
        let idempotent = method == Method::GET;
        let mut rate_limited = 0u32;
        let mut transport_failures = 0u32;

        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token)
                .header(ACCEPT, GITHUB_ACCEPT);
            if let Some(body) = body {
                request = request.json(body);
            }

            debug!("{} {}", method, route);
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if idempotent && transport_failures < self.transport_retries => {
                    transport_failures += 1;
                    warn!(
                        "{} {} failed ({}), retrying ({}/{})",
                        method, route, e, transport_failures, self.transport_retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let now = chrono::Utc::now().timestamp();
            match rate_limit_wait(response.status(), response.headers(), now, self.max_backoff) {
                Some(_) if rate_limited >= self.max_rate_limit_retries => {
                    return Err(SyncError::RateLimited {
                        attempts: rate_limited + 1,
                    });
                }
                Some(wait) => {
                    rate_limited += 1;
                    warn!(
                        "Rate limit exceeded on {} {}. Retrying in {}s ({}/{})",
                        method,
                        route,
                        wait.as_secs(),
                        rate_limited,
                        self.max_rate_limit_retries
                    );
                    tokio::time::sleep(wait).await;
                }
                None => return Ok(response),
            }
        }
    }
}

/// How long to wait before retrying a rate-limited response, or `None` if it is not one
fn rate_limit_wait(
    status: StatusCode,
    headers: &HeaderMap,
    now: i64,
    cap: Duration,
) -> Option<Duration> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    };

    if let Some(secs) = header("retry-after").and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs).min(cap));
    }

    if header("x-ratelimit-remaining") == Some("0") {
        let reset = header("x-ratelimit-reset")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(now);
        let secs = (reset - now).max(0) as u64;
        return Some(Duration::from_secs(secs).min(cap));
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(DEFAULT_RATE_LIMIT_WAIT.min(cap));
    }

    None
}

fn decode_content(path: &str, body: &ContentResponse) -> Result<Vec<u8>> {
    match body.encoding.as_deref() {
        None | Some("base64") => {}
        Some(other) => {
            return Err(SyncError::Decode(format!(
                "{} uses unsupported encoding '{}'",
                path, other
            )))
        }
    }

    let encoded: String = body
        .content
        .as_deref()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    BASE64
        .decode(encoded)
        .map_err(|e| SyncError::Decode(format!("{}: {}", path, e)))
}

fn commit_message<Tz: chrono::TimeZone>(product: &str, at: chrono::DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    format!(
        "Syncing {} settings ({})",
        product,
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

/// Turn a non-success response into a `SyncError`, keeping GitHub's message
async fn error_from_response(response: Response) -> SyncError {
    let status = response.status();
    let message = response
        .json::<ApiMessage>()
        .await
        .map(|m| m.message)
        .unwrap_or_else(|_| "Unknown error".to_string());

    if status == StatusCode::UNAUTHORIZED {
        SyncError::Auth(message)
    } else {
        SyncError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

/// Confirms that GitHub accepts a token
pub struct TokenValidator {
    api_url: String,
    timeout: Duration,
}

impl TokenValidator {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            timeout: DEFAULT_VALIDATION_TIMEOUT,
        }
    }

    /// Upper bound for one validation, connection included
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One `GET /user` probe. Any failure, or no answer in time, degrades to `false`.
    pub async fn validate(&self, token: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.probe(token)).await {
            Ok(Ok(login)) => {
                debug!("Token accepted for GitHub user: {}", login);
                true
            }
            Ok(Err(e)) => {
                warn!("Error validating GitHub token: {:#}", e);
                false
            }
            Err(_) => {
                warn!(
                    "GitHub did not answer the token check within {}s",
                    self.timeout.as_secs()
                );
                false
            }
        }
    }

    async fn probe(&self, token: &str) -> anyhow::Result<String> {
        use anyhow::Context;

        let client = Octocrab::builder()
            .base_uri(self.api_url.as_str())?
            .personal_token(token.to_string())
            .set_connect_timeout(Some(self.timeout))
            .set_read_timeout(Some(self.timeout))
            .build()
            .context("Failed to create GitHub client")?;

        let user: Value = client
            .get("/user", None::<&()>)
            .await
            .context("GitHub rejected the identity probe")?;

        user.get("login")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Identity response has no login")
    }
}

/// Interactive login, logout and status helpers
pub mod auth_setup {
    use super::*;
    use crate::credentials::CredentialStore;
    use crate::Config;
    use anyhow::Context;

    pub const MAX_LOGIN_ATTEMPTS: u32 = 5;

    /// Result of offering one token to the store
    #[derive(Debug, PartialEq, Eq)]
    pub enum LoginAttempt {
        Empty,
        Rejected,
        Stored,
    }

    /// Show the first and last five characters only
    pub fn mask_token(token: &str) -> String {
        let chars: Vec<char> = token.chars().collect();
        if chars.len() <= 10 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..5].iter().collect();
        let tail: String = chars[chars.len() - 5..].iter().collect();
        format!("{}{}{}", head, "*".repeat(chars.len() - 10), tail)
    }

    /// Validate `token` and persist it under `key` when GitHub accepts it
    pub async fn try_login(
        validator: &TokenValidator,
        store: &CredentialStore,
        key: &str,
        token: &str,
    ) -> Result<LoginAttempt> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(LoginAttempt::Empty);
        }

        if !["ghp_", "gho_", "ghs_", "github_pat_"]
            .iter()
            .any(|prefix| token.starts_with(prefix))
        {
            warn!("Token doesn't look like a GitHub token (expected ghp_, gho_, ghs_ or github_pat_)");
        }

        if !validator.validate(token).await {
            return Ok(LoginAttempt::Rejected);
        }

        store.put(key, token)?;
        Ok(LoginAttempt::Stored)
    }

    /// Prompt for a token (or use the given one), validate and store it
    pub async fn login(config: &Config, token: Option<String>) -> anyhow::Result<()> {
        let validator = TokenValidator::new(&config.github.api_url)
            .with_timeout(Duration::from_secs(config.github.request_timeout));
        let store = CredentialStore::new(config.credentials_path()?);
        let key = config.credentials.key.as_str();

        println!("Welcome to settings-sync!");

        let interactive = token.is_none();
        let attempts = if interactive { MAX_LOGIN_ATTEMPTS } else { 1 };
        let mut provided = token;

        for _ in 0..attempts {
            let candidate = match provided.take() {
                Some(token) => token,
                None => inquire::Password::new("Enter your GitHub access token:")
                    .with_display_mode(inquire::PasswordDisplayMode::Masked)
                    .without_confirmation()
                    .prompt()
                    .context("Failed to read token")?,
            };

            match try_login(&validator, &store, key, &candidate).await? {
                LoginAttempt::Empty => println!("No GitHub token entered, please try again."),
                LoginAttempt::Rejected => {
                    println!("❌ GitHub rejected the token. Please check it and try again.")
                }
                LoginAttempt::Stored => {
                    println!("GitHub token entered: {}", mask_token(candidate.trim()));
                    println!("✅ Token is valid and was saved to {:?}", store.path());
                    return Ok(());
                }
            }
        }

        anyhow::bail!("No valid token after {} attempt(s)", attempts)
    }

    /// Forget the stored token
    pub fn logout(config: &Config) -> anyhow::Result<()> {
        let store = CredentialStore::new(config.credentials_path()?);
        if store.remove(&config.credentials.key)? {
            println!("✅ Removed {} from {:?}", config.credentials.key, store.path());
        } else {
            println!("No stored token found in {:?}", store.path());
        }
        Ok(())
    }

    /// Report whether a token is stored and still accepted
    pub async fn status(config: &Config) -> anyhow::Result<()> {
        let store = CredentialStore::new(config.credentials_path()?);

        let Some(token) = store.get(&config.credentials.key)? else {
            println!("❌ Not logged in. Run: settings-sync login");
            return Ok(());
        };

        println!("🔍 Testing GitHub authentication...");
        println!("   Token: {}", mask_token(&token));

        let client = GitHubClient::new(&config.github, token)?;
        match client.current_user_login().await {
            Ok(login) => {
                let repo = RepoId::for_owner(&login, &config.github.product);
                println!("✅ Authentication successful");
                println!("   Username: {}", login);
                println!("   Settings repository: {}", repo);
            }
            Err(e) => println!("❌ Authentication failed: {}", e),
        }

        Ok(())
    }
}
