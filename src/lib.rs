//! settings-sync - Editor Settings Backup Through GitHub
//!
//! settings-sync keeps an editor's settings, keybindings and installed extension
//! list in a private GitHub repository, and restores them on another machine.
//!
//! ## Core Features
//!
//! - **Idempotent Provisioning**: The `<owner>-<product>-Settings-Sync` repository is
//!   created on first use and reused afterwards
//! - **Safe Uploads**: Every write carries the file's current revision marker
//! - **Rate-Limit Aware**: Bounded waits for GitHub's rate-limit reset
//! - **Extension Restore**: Pulled extension lists are reinstalled through the editor CLI
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`credentials`]: Local `KEY=VALUE` token store
//! - [`github`]: GitHub API client, token validation and login helpers
//! - [`editor`]: Synced files, platform paths and extension handling
//! - [`sync`]: Push and pull orchestration

pub mod config;
pub mod credentials;
pub mod editor;
pub mod error;
pub mod github;
pub mod sync;

pub use config::Config;
pub use credentials::CredentialStore;
pub use editor::{EditorFiles, ExtensionInstaller, SyncedFile};
pub use error::SyncError;
pub use github::{GitHubClient, Provisioning, RepoId, TokenValidator};
pub use sync::{FileOutcome, InstallOutcome, SyncEngine, SyncReport};
