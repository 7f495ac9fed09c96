use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure for settings-sync
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// GitHub API and repository settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Local credential store location
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Editor file locations
    #[serde(default)]
    pub editor: EditorConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// REST API root
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Product name embedded in the repository name and commit messages
    #[serde(default = "default_product")]
    pub product: String,

    /// Homepage recorded on the settings repository
    #[serde(default = "default_homepage")]
    pub homepage: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// How many times a rate-limited request is retried after waiting for the reset
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,

    /// Upper bound for a single rate-limit wait, in seconds
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Retries for transient transport failures on read-only requests
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,

    /// Delay between transport retries in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Credential store configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CredentialsConfig {
    /// KEY=VALUE file holding the access token
    #[serde(default = "default_credentials_path")]
    pub path: String,

    /// Key under which the token is stored
    #[serde(default = "default_credentials_key")]
    pub key: String,
}

/// Editor configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EditorConfig {
    /// User settings directory per operating system ("linux", "macos", "windows")
    #[serde(default = "default_user_dirs")]
    pub user_dirs: BTreeMap<String, String>,

    /// Installed extensions directory
    #[serde(default = "default_extensions_dir")]
    pub extensions_dir: String,

    /// Editor command line used to install extensions
    #[serde(default = "default_cli_command")]
    pub cli_command: String,

    /// Where a pulled extension manifest is written
    #[serde(default = "default_manifest_destination")]
    pub manifest_destination: String,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Timeout for a whole push or pull in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Directory for the scratch copies uploaded during push
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    /// Re-read-and-retry rounds after a stale revision marker
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"
}

// Default value functions
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_product() -> String {
    "VSCode".to_string()
}
fn default_homepage() -> String {
    "https://github.com/RyanBaig/VSCode-GitHub-SettingsSync".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_rate_limit_retries() -> u32 {
    3
}
fn default_max_backoff_secs() -> u64 {
    3600
}
fn default_transport_retries() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_credentials_path() -> String {
    ".env".to_string()
}
fn default_credentials_key() -> String {
    "GH_TOKEN".to_string()
}
fn default_user_dirs() -> BTreeMap<String, String> {
    let mut dirs = BTreeMap::new();
    dirs.insert("linux".to_string(), "~/.config/Code/User".to_string());
    dirs.insert(
        "macos".to_string(),
        "~/Library/Application Support/Code/User".to_string(),
    );
    dirs.insert("windows".to_string(), "${APPDATA}/Code/User".to_string());
    dirs
}
fn default_extensions_dir() -> String {
    "~/.vscode/extensions".to_string()
}
fn default_cli_command() -> String {
    if cfg!(windows) {
        "code.cmd".to_string()
    } else {
        "code".to_string()
    }
}

fn default_manifest_destination() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/settings-sync/extensions-list.json", data_home)
    } else {
        "~/.local/share/settings-sync/extensions-list.json".to_string()
    }
}
fn default_timeout() -> u64 {
    600
}
fn default_staging_dir() -> String {
    match dirs::cache_dir() {
        Some(cache) => cache
            .join("settings-sync")
            .join("staging")
            .to_string_lossy()
            .into_owned(),
        None => "~/.cache/settings-sync/staging".to_string(),
    }
}
fn default_conflict_retries() -> u32 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            product: default_product(),
            homepage: default_homepage(),
            request_timeout: default_request_timeout(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            max_backoff_secs: default_max_backoff_secs(),
            transport_retries: default_transport_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: default_credentials_path(),
            key: default_credentials_key(),
        }
    }
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            user_dirs: default_user_dirs(),
            extensions_dir: default_extensions_dir(),
            cli_command: default_cli_command(),
            manifest_destination: default_manifest_destination(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            staging_dir: default_staging_dir(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("settings-sync").join("config.yml"))
    }

    /// Operating-system tag used to index `editor.user_dirs`
    pub fn current_os() -> &'static str {
        match std::env::consts::OS {
            "macos" => "macos",
            "windows" => "windows",
            _ => "linux",
        }
    }

    /// Editor user directory for the given OS tag, with `~` and variables expanded
    pub fn user_dir_for(&self, os: &str) -> Result<Option<PathBuf>> {
        self.editor
            .user_dirs
            .get(os)
            .map(|template| expand_path(template))
            .transpose()
    }

    pub fn extensions_dir(&self) -> Result<PathBuf> {
        expand_path(&self.editor.extensions_dir)
    }

    pub fn manifest_destination(&self) -> Result<PathBuf> {
        expand_path(&self.editor.manifest_destination)
    }

    pub fn credentials_path(&self) -> Result<PathBuf> {
        expand_path(&self.credentials.path)
    }

    pub fn staging_dir(&self) -> Result<PathBuf> {
        expand_path(&self.sync.staging_dir)
    }
}

/// Expand `~` and environment variables in a configured path
pub fn expand_path(template: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(template)
        .with_context(|| format!("Failed to expand path: {}", template))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
