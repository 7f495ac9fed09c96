//! Editor-side collaborators
//!
//! Everything the sync engine needs from the local editor installation: which
//! files are synced, where they live on this platform, the scanned extension
//! manifest, and a way to install extensions after a pull.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, SyncError};

/// Placeholder for metadata a package manifest does not provide
pub const NOT_AVAILABLE: &str = "N/A";

const MARKETPLACE_URL: &str = "https://marketplace.visualstudio.com/items?itemName=";

/// The closed set of artifacts kept in the settings repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncedFile {
    Settings,
    Keybindings,
    ExtensionManifest,
}

impl SyncedFile {
    pub const ALL: [SyncedFile; 3] = [
        SyncedFile::Settings,
        SyncedFile::Keybindings,
        SyncedFile::ExtensionManifest,
    ];

    /// Path inside the settings repository (also the staging file name)
    pub fn remote_path(self) -> &'static str {
        match self {
            SyncedFile::Settings => "settings.json",
            SyncedFile::Keybindings => "keybindings.json",
            SyncedFile::ExtensionManifest => "extensions-list.json",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SyncedFile::Settings => "settings",
            SyncedFile::Keybindings => "keybindings",
            SyncedFile::ExtensionManifest => "extension list",
        }
    }
}

impl fmt::Display for SyncedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn not_available() -> String {
    NOT_AVAILABLE.to_string()
}

/// Metadata recorded for one installed extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    #[serde(default = "not_available")]
    pub url: String,
    #[serde(default = "not_available")]
    pub version: String,
    #[serde(default = "not_available")]
    pub publisher: String,
    #[serde(default = "not_available")]
    pub description: String,
    #[serde(default = "not_available")]
    pub repository: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl Default for ExtensionInfo {
    fn default() -> Self {
        Self {
            url: not_available(),
            version: not_available(),
            publisher: not_available(),
            description: not_available(),
            repository: not_available(),
            categories: Vec::new(),
        }
    }
}

/// Extension folder name -> metadata
pub type ExtensionManifest = BTreeMap<String, ExtensionInfo>;

/// Read `package.json` inside an extension folder. Never fails; gaps become "N/A".
pub fn read_extension_info(extension_dir: &Path) -> ExtensionInfo {
    let manifest_path = extension_dir.join("package.json");

    let bytes = match std::fs::read(&manifest_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("No readable package.json in {:?}: {}", extension_dir, e);
            return ExtensionInfo::default();
        }
    };

    let fields: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!("Error decoding JSON in {:?}: {}", manifest_path, e);
            return ExtensionInfo::default();
        }
    };

    let text = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(not_available)
    };

    // "repository" is either a URL string or an object with a "url" field
    let repository = match fields.get("repository") {
        Some(Value::String(url)) => url.clone(),
        Some(Value::Object(repo)) => repo
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(not_available),
        _ => not_available(),
    };

    let categories = fields
        .get("categories")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let publisher = text("publisher");
    let id = format!("{}.{}", publisher, text("name"));

    ExtensionInfo {
        url: format!("{}{}", MARKETPLACE_URL, id),
        version: text("version"),
        publisher,
        description: text("description"),
        repository,
        categories,
    }
}

/// Scan an extensions directory. `None` when the directory does not exist.
pub fn scan_extensions(extensions_dir: &Path) -> Result<Option<ExtensionManifest>> {
    let entries = match std::fs::read_dir(extensions_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SyncError::io(extensions_dir, e)),
    };

    let mut manifest = ExtensionManifest::new();
    for entry in entries {
        let entry = entry.map_err(|e| SyncError::io(extensions_dir, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let folder = entry.file_name().to_string_lossy().into_owned();
        manifest.insert(folder, read_extension_info(&path));
    }

    info!(
        "Gathered information for {} extensions from {:?}",
        manifest.len(),
        extensions_dir
    );
    Ok(Some(manifest))
}

fn item_name_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"[?&]itemName=([^&#]+)").expect("valid regex"))
}

fn versioned_folder_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^([^.\s]+\.[^\s]+?)-\d+\.\d+\.\d+").expect("valid regex")
    })
}

fn is_extension_id(candidate: &str) -> bool {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][\w-]*\.[\w.-]+$").expect("valid regex"))
        .is_match(candidate)
}

/// Installable `publisher.name` for a manifest entry
///
/// Taken from the marketplace URL's `itemName` query, falling back to the
/// folder name with its `-<version>` suffix removed.
pub fn extension_id(folder: &str, info: &ExtensionInfo) -> Option<String> {
    let from_url = item_name_regex()
        .captures(&info.url)
        .map(|caps| caps[1].to_string());

    let from_folder = || {
        versioned_folder_regex()
            .captures(folder)
            .map(|caps| caps[1].to_string())
    };

    from_url
        .filter(|id| is_extension_id(id))
        .or_else(|| from_folder().filter(|id| is_extension_id(id)))
}

/// Local editor files seen by the sync engine
pub trait EditorFiles: Send + Sync {
    /// Current content of `file`, or `None` when the editor has none
    fn collect(&self, file: SyncedFile) -> Result<Option<Vec<u8>>>;

    /// Where pulled content for `file` is written
    fn destination(&self, file: SyncedFile) -> Result<PathBuf>;
}

/// Files of an editor installed on this machine, located through the config path table
#[derive(Debug, Clone)]
pub struct LocalEditor {
    user_dir: Option<PathBuf>,
    extensions_dir: PathBuf,
    manifest_destination: PathBuf,
}

impl LocalEditor {
    pub fn new(
        user_dir: Option<PathBuf>,
        extensions_dir: PathBuf,
        manifest_destination: PathBuf,
    ) -> Self {
        Self {
            user_dir,
            extensions_dir,
            manifest_destination,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let os = Config::current_os();
        let user_dir = config.user_dir_for(os)?;
        if user_dir.is_none() {
            warn!("No editor user directory configured for {}", os);
        }

        Ok(Self::new(
            user_dir,
            config.extensions_dir()?,
            config.manifest_destination()?,
        ))
    }

    fn user_file(&self, name: &str) -> Result<PathBuf> {
        self.user_dir
            .as_ref()
            .map(|dir| dir.join(name))
            .ok_or_else(|| {
                SyncError::Editor(format!(
                    "no user directory configured for {}",
                    Config::current_os()
                ))
            })
    }
}

impl EditorFiles for LocalEditor {
    fn collect(&self, file: SyncedFile) -> Result<Option<Vec<u8>>> {
        match file {
            SyncedFile::Settings | SyncedFile::Keybindings => {
                let Some(dir) = &self.user_dir else {
                    return Ok(None);
                };
                let path = dir.join(file.remote_path());
                match std::fs::read(&path) {
                    Ok(content) => Ok(Some(content)),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(SyncError::io(path, e)),
                }
            }
            SyncedFile::ExtensionManifest => match scan_extensions(&self.extensions_dir)? {
                Some(manifest) => serde_json::to_vec_pretty(&manifest)
                    .map(Some)
                    .map_err(|e| SyncError::Decode(format!("extension manifest: {}", e))),
                None => Ok(None),
            },
        }
    }

    fn destination(&self, file: SyncedFile) -> Result<PathBuf> {
        match file {
            SyncedFile::Settings | SyncedFile::Keybindings => self.user_file(file.remote_path()),
            SyncedFile::ExtensionManifest => Ok(self.manifest_destination.clone()),
        }
    }
}

/// Installs an extension into the local editor
#[async_trait]
pub trait ExtensionInstaller: Send + Sync {
    async fn install(&self, extension_id: &str) -> Result<()>;
}

/// Installs through the editor's command line (`code --install-extension <id>`)
#[derive(Debug, Clone)]
pub struct EditorCli {
    command: String,
}

impl EditorCli {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ExtensionInstaller for EditorCli {
    async fn install(&self, extension_id: &str) -> Result<()> {
        debug!("{} --install-extension {}", self.command, extension_id);

        let output = AsyncCommand::new(&self.command)
            .args(["--install-extension", extension_id])
            .output()
            .await
            .map_err(|e| SyncError::Install {
                extension: extension_id.to_string(),
                message: format!("failed to run {}: {}", self.command, e),
            })?;

        if !output.status.success() {
            return Err(SyncError::Install {
                extension: extension_id.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}
