//! Local credential store
//!
//! Tokens live in a flat `KEY=VALUE` text file (one entry per line). Keys are
//! case-insensitive and stored upper-cased; every write is an upsert that leaves
//! the other entries untouched.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SyncError};

/// File-backed store for access tokens
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a key. A missing file or key is `None`, never an error.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let prefix = format!("{}=", normalize_key(key));

        let content = match self.read() {
            Ok(Some(content)) => content,
            Ok(None) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(content
            .lines()
            .find_map(|line| line.strip_prefix(&prefix))
            .map(|value| value.trim().to_string()))
    }

    /// Insert or replace `key`, keeping every other entry
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        validate_entry(key, value)?;

        let key = normalize_key(key);
        let prefix = format!("{}=", key);
        let entry = format!("{}={}", key, value);

        let mut lines: Vec<String> = self
            .read()?
            .unwrap_or_default()
            .lines()
            .filter(|line| !line.starts_with(&prefix))
            .map(str::to_string)
            .collect();
        lines.push(entry);

        self.write(&lines)?;
        debug!("Stored credential {} in {:?}", key, self.path);
        Ok(())
    }

    /// Remove `key` if present
    pub fn remove(&self, key: &str) -> Result<bool> {
        let prefix = format!("{}=", normalize_key(key));

        let Some(content) = self.read()? else {
            return Ok(false);
        };

        let lines: Vec<String> = content
            .lines()
            .filter(|line| !line.starts_with(&prefix))
            .map(str::to_string)
            .collect();

        if lines.len() == content.lines().count() {
            return Ok(false);
        }

        self.write(&lines)?;
        Ok(true)
    }

    fn read(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(self.storage_error(source)),
        }
    }

    fn write(&self, lines: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.storage_error(e))?;
        }

        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }

        let mut file = open_private(&self.path).map_err(|e| self.storage_error(e))?;
        file.write_all(body.as_bytes())
            .map_err(|e| self.storage_error(e))?;
        Ok(())
    }

    fn storage_error(&self, source: std::io::Error) -> SyncError {
        SyncError::Storage {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

fn normalize_key(key: &str) -> String {
    key.trim().to_uppercase()
}

fn validate_entry(key: &str, value: &str) -> Result<()> {
    let key = key.trim();
    if key.is_empty() {
        return Err(SyncError::InvalidCredential("key is empty".to_string()));
    }
    if key.contains('=') || key.chars().any(char::is_whitespace) {
        return Err(SyncError::InvalidCredential(format!(
            "key '{}' may not contain '=' or whitespace",
            key
        )));
    }
    if value.contains('\n') || value.contains('\r') {
        return Err(SyncError::InvalidCredential(format!(
            "value for '{}' may not contain line breaks",
            key
        )));
    }
    Ok(())
}
