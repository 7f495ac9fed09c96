//! Sync Engine - Orchestrates pushing and pulling editor settings
//!
//! A push regenerates the local artifacts, provisions the settings repository
//! and uploads each file against its current revision marker. A pull downloads
//! the same files into the editor's locations and reinstalls the listed
//! extensions. Transfers run one after another; a failed file is recorded in
//! the report and never aborts its siblings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::editor::{
    extension_id, EditorCli, EditorFiles, ExtensionInstaller, ExtensionManifest, LocalEditor,
    SyncedFile,
};
use crate::error::{Result, SyncError};
use crate::github::{GitHubClient, Provisioning, RepoId};

/// Direction of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

/// Where a sync run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Authenticating,
    RepositoryReady,
    TransferringFiles,
    PostProcessing,
    Done,
}

/// Result of transferring one synced file
#[derive(Debug)]
pub enum FileOutcome {
    /// Uploaded; `updated` is true when an existing remote file was replaced
    Uploaded { file: SyncedFile, updated: bool },
    /// Written to the local destination; `lossy` when invalid UTF-8 was replaced
    Downloaded {
        file: SyncedFile,
        path: PathBuf,
        lossy: bool,
    },
    Skipped { file: SyncedFile, reason: String },
    Failed { file: SyncedFile, error: SyncError },
}

impl FileOutcome {
    pub fn file(&self) -> SyncedFile {
        match self {
            FileOutcome::Uploaded { file, .. }
            | FileOutcome::Downloaded { file, .. }
            | FileOutcome::Skipped { file, .. }
            | FileOutcome::Failed { file, .. } => *file,
        }
    }
}

/// Result of reinstalling one extension after a pull
#[derive(Debug)]
pub enum InstallOutcome {
    Installed { extension: String },
    Skipped { folder: String, reason: String },
    Failed { extension: String, error: SyncError },
}

/// Results from a complete push or pull
#[derive(Debug)]
pub struct SyncReport {
    pub direction: Direction,
    pub repository: RepoId,
    pub provisioning: Provisioning,
    pub phase: SyncPhase,
    pub files: Vec<FileOutcome>,
    pub installs: Vec<InstallOutcome>,
    pub duration: Duration,
}

impl SyncReport {
    pub fn successful_files(&self) -> usize {
        self.files
            .iter()
            .filter(|o| matches!(o, FileOutcome::Uploaded { .. } | FileOutcome::Downloaded { .. }))
            .count()
    }

    pub fn skipped_files(&self) -> usize {
        self.files
            .iter()
            .filter(|o| matches!(o, FileOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed_files(&self) -> usize {
        self.files
            .iter()
            .filter(|o| matches!(o, FileOutcome::Failed { .. }))
            .count()
    }

    pub fn outcome(&self, file: SyncedFile) -> Option<&FileOutcome> {
        self.files.iter().find(|o| o.file() == file)
    }

    pub fn installed_extensions(&self) -> Vec<&str> {
        self.installs
            .iter()
            .filter_map(|o| match o {
                InstallOutcome::Installed { extension } => Some(extension.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn failed_installs(&self) -> usize {
        self.installs
            .iter()
            .filter(|o| matches!(o, InstallOutcome::Failed { .. }))
            .count()
    }
}

/// Authenticated session against the settings repository
struct Session {
    client: GitHubClient,
    repository: RepoId,
    provisioning: Provisioning,
}

/// The main sync engine that orchestrates settings synchronization
pub struct SyncEngine {
    config: Arc<Config>,
    credentials: CredentialStore,
    editor: Box<dyn EditorFiles>,
    installer: Box<dyn ExtensionInstaller>,
}

impl SyncEngine {
    /// Create a sync engine for the editor installed on this machine
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let editor = LocalEditor::from_config(&config)?;
        let installer = EditorCli::new(config.editor.cli_command.clone());
        Self::with_collaborators(config, Box::new(editor), Box::new(installer))
    }

    /// Create a sync engine with explicit editor collaborators
    pub fn with_collaborators(
        config: Config,
        editor: Box<dyn EditorFiles>,
        installer: Box<dyn ExtensionInstaller>,
    ) -> anyhow::Result<Self> {
        let credentials = CredentialStore::new(config.credentials_path()?);
        Ok(Self {
            config: Arc::new(config),
            credentials,
            editor,
            installer,
        })
    }

    /// Upload local settings, keybindings and the extension list
    pub async fn push(&self) -> Result<SyncReport> {
        self.with_deadline(self.run_push()).await
    }

    /// Download remote settings into the editor and reinstall extensions
    pub async fn pull(&self) -> Result<SyncReport> {
        self.with_deadline(self.run_pull()).await
    }

    async fn with_deadline(
        &self,
        operation: impl std::future::Future<Output = Result<SyncReport>>,
    ) -> Result<SyncReport> {
        let limit = self.config.sync.timeout;
        match timeout(Duration::from_secs(limit), operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Sync operation timed out after {}s", limit);
                Err(SyncError::Timeout(limit))
            }
        }
    }

    async fn run_push(&self) -> Result<SyncReport> {
        let start_time = Instant::now();
        info!("Starting settings push");

        let session = self.open_session().await?;
        let staging_dir = self
            .config
            .staging_dir()
            .map_err(|e| SyncError::Editor(format!("{:#}", e)))?;
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| SyncError::io(&staging_dir, e))?;

        enter(SyncPhase::TransferringFiles);
        let mut files = Vec::with_capacity(SyncedFile::ALL.len());
        for file in SyncedFile::ALL {
            let outcome = self.push_file(&session, &staging_dir, file).await;
            log_outcome(&outcome);
            files.push(outcome);
        }

        enter(SyncPhase::Done);
        let report = SyncReport {
            direction: Direction::Push,
            repository: session.repository,
            provisioning: session.provisioning,
            phase: SyncPhase::Done,
            files,
            installs: Vec::new(),
            duration: start_time.elapsed(),
        };
        log_summary(&report);
        Ok(report)
    }

    async fn run_pull(&self) -> Result<SyncReport> {
        let start_time = Instant::now();
        info!("Starting settings pull");

        let session = self.open_session().await?;

        enter(SyncPhase::TransferringFiles);
        let mut files = Vec::with_capacity(SyncedFile::ALL.len());
        for file in SyncedFile::ALL {
            let outcome = self.pull_file(&session, file).await;
            log_outcome(&outcome);
            files.push(outcome);
        }

        enter(SyncPhase::PostProcessing);
        let manifest_path = files.iter().find_map(|o| match o {
            FileOutcome::Downloaded {
                file: SyncedFile::ExtensionManifest,
                path,
                ..
            } => Some(path.clone()),
            _ => None,
        });
        let installs = match manifest_path {
            Some(path) => self.install_extensions(&path).await,
            None => {
                info!("No extension list downloaded; skipping extension installs");
                Vec::new()
            }
        };

        enter(SyncPhase::Done);
        let report = SyncReport {
            direction: Direction::Pull,
            repository: session.repository,
            provisioning: session.provisioning,
            phase: SyncPhase::Done,
            files,
            installs,
            duration: start_time.elapsed(),
        };
        log_summary(&report);
        Ok(report)
    }

    /// Resolve the credential, the owner and an existing settings repository
    async fn open_session(&self) -> Result<Session> {
        enter(SyncPhase::Authenticating);

        let token = self
            .credentials
            .get(&self.config.credentials.key)?
            .filter(|token| !token.is_empty())
            .ok_or(SyncError::NotAuthenticated)?;

        let client = GitHubClient::new(&self.config.github, token)?;
        let owner = client.current_user_login().await?;
        let repository = RepoId::for_owner(&owner, &self.config.github.product);

        let provisioning = client.create_repository(&repository).await;
        match provisioning {
            Provisioning::Created | Provisioning::AlreadyExists => {}
            Provisioning::RateLimited { attempts } => {
                return Err(SyncError::RateLimited { attempts })
            }
            Provisioning::Failed(e) => return Err(e),
        }

        enter(SyncPhase::RepositoryReady);
        Ok(Session {
            client,
            repository,
            provisioning,
        })
    }

    async fn push_file(
        &self,
        session: &Session,
        staging_dir: &Path,
        file: SyncedFile,
    ) -> FileOutcome {
        let content = match self.editor.collect(file) {
            Ok(Some(content)) => content,
            Ok(None) => {
                return FileOutcome::Skipped {
                    file,
                    reason: format!("no local {} found", file),
                }
            }
            Err(error) => return FileOutcome::Failed { file, error },
        };

        // Scratch copy of the regenerated artifact; removed once uploaded.
        // A staging path that lands on the editor's own file is left alone.
        let staged = staging_dir.join(file.remote_path());
        let live = self
            .editor
            .destination(file)
            .map(|path| same_location(&path, &staged))
            .unwrap_or(false);
        if live {
            warn!(
                "Staging path {:?} is the editor's own {}; uploading without a staging copy",
                staged, file
            );
        } else if let Err(e) = tokio::fs::write(&staged, &content).await {
            return FileOutcome::Failed {
                file,
                error: SyncError::io(staged, e),
            };
        }

        match self.upload(session, file, &content).await {
            Ok(updated) => {
                if !live {
                    if let Err(e) = tokio::fs::remove_file(&staged).await {
                        warn!("Failed to remove staging copy {:?}: {}", staged, e);
                    }
                }
                FileOutcome::Uploaded { file, updated }
            }
            Err(error) => FileOutcome::Failed { file, error },
        }
    }

    /// Upload against the current revision marker, re-reading it after a conflict
    async fn upload(&self, session: &Session, file: SyncedFile, content: &[u8]) -> Result<bool> {
        let path = file.remote_path();
        let mut conflicts = 0u32;

        loop {
            let marker = match session.client.read_file(&session.repository, path).await {
                Ok(existing) => Some(existing.sha),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };

            match session
                .client
                .write_file(&session.repository, path, content, marker.as_deref())
                .await
            {
                Ok(sha) => {
                    debug!("Uploaded {} as {}", path, sha);
                    return Ok(marker.is_some());
                }
                Err(e) if e.is_conflict() && conflicts < self.config.sync.conflict_retries => {
                    conflicts += 1;
                    warn!(
                        "{} changed remotely while uploading; re-reading revision ({}/{})",
                        path, conflicts, self.config.sync.conflict_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn pull_file(&self, session: &Session, file: SyncedFile) -> FileOutcome {
        let remote = match session
            .client
            .read_file(&session.repository, file.remote_path())
            .await
        {
            Ok(remote) => remote,
            Err(e) if e.is_not_found() => {
                return FileOutcome::Skipped {
                    file,
                    reason: format!("{} not present in {}", file.remote_path(), session.repository),
                }
            }
            Err(error) => return FileOutcome::Failed { file, error },
        };

        let (text, lossy) = match String::from_utf8(remote.content) {
            Ok(text) => (text, false),
            Err(e) => {
                let error = SyncError::Decode(format!("{}: {}", file.remote_path(), e));
                warn!("{}; falling back to lossy decoding", error);
                (String::from_utf8_lossy(e.as_bytes()).into_owned(), true)
            }
        };

        let path = match self.editor.destination(file) {
            Ok(path) => path,
            Err(error) => return FileOutcome::Failed { file, error },
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return FileOutcome::Failed {
                    file,
                    error: SyncError::io(parent, e),
                };
            }
        }

        match tokio::fs::write(&path, text).await {
            Ok(()) => FileOutcome::Downloaded { file, path, lossy },
            Err(e) => FileOutcome::Failed {
                file,
                error: SyncError::io(path, e),
            },
        }
    }

    /// Install every extension listed in a downloaded manifest
    async fn install_extensions(&self, manifest_path: &Path) -> Vec<InstallOutcome> {
        let manifest: ExtensionManifest = match tokio::fs::read(manifest_path)
            .await
            .map_err(|e| SyncError::io(manifest_path, e))
            .and_then(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::Decode(format!("extension list: {}", e)))
            }) {
            Ok(manifest) => manifest,
            Err(e) => {
                error!("Cannot read downloaded extension list: {}", e);
                return Vec::new();
            }
        };

        info!("Installing {} extensions", manifest.len());

        let mut outcomes = Vec::with_capacity(manifest.len());
        for (folder, info) in &manifest {
            let Some(extension) = extension_id(folder, info) else {
                warn!("Cannot derive an extension identifier for {}", folder);
                outcomes.push(InstallOutcome::Skipped {
                    folder: folder.clone(),
                    reason: "no marketplace identifier".to_string(),
                });
                continue;
            };

            match self.installer.install(&extension).await {
                Ok(()) => {
                    info!("Installed extension {}", extension);
                    outcomes.push(InstallOutcome::Installed { extension });
                }
                Err(error) => {
                    error!("{}", error);
                    outcomes.push(InstallOutcome::Failed { extension, error });
                }
            }
        }

        outcomes
    }
}

/// Whether two paths name the same file once symlinks and `..` are resolved.
/// A missing file is resolved through its parent directory.
fn same_location(a: &Path, b: &Path) -> bool {
    fn resolve(path: &Path) -> PathBuf {
        if let Ok(resolved) = std::fs::canonicalize(path) {
            return resolved;
        }
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => std::fs::canonicalize(parent)
                .map(|dir| dir.join(name))
                .unwrap_or_else(|_| path.to_path_buf()),
            _ => path.to_path_buf(),
        }
    }

    resolve(a) == resolve(b)
}

fn enter(phase: SyncPhase) {
    debug!("Sync phase: {:?}", phase);
}

fn log_outcome(outcome: &FileOutcome) {
    match outcome {
        FileOutcome::Uploaded { file, updated } => {
            info!(
                "Uploaded {} ({})",
                file.remote_path(),
                if *updated { "updated" } else { "created" }
            )
        }
        FileOutcome::Downloaded { file, path, .. } => {
            info!("Downloaded {} to {:?}", file.remote_path(), path)
        }
        FileOutcome::Skipped { file, reason } => {
            warn!("Skipped {}: {}", file.remote_path(), reason)
        }
        FileOutcome::Failed { file, error } => {
            error!("Failed to sync {}: {}", file.remote_path(), error)
        }
    }
}

fn log_summary(report: &SyncReport) {
    info!(
        "{:?} to {} completed in {:.2}s: {} transferred, {} skipped, {} failed",
        report.direction,
        report.repository,
        report.duration.as_secs_f64(),
        report.successful_files(),
        report.skipped_files(),
        report.failed_files()
    );
}
