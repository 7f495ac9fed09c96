use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use settings_sync::github::auth_setup;
use settings_sync::sync::Direction;
use settings_sync::{Config, FileOutcome, InstallOutcome, SyncEngine, SyncError, SyncReport};

#[derive(Parser)]
#[command(name = "settings-sync")]
#[command(about = "Back up and restore editor settings through a private GitHub repository")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a GitHub access token and store it
    Login {
        /// Token to store instead of prompting for one
        #[arg(long)]
        token: Option<String>,
    },

    /// Remove the stored token
    Logout,

    /// Show whether a token is stored and accepted by GitHub
    Status,

    /// Upload settings, keybindings and the extension list
    #[command(alias = "sync-send")]
    Push,

    /// Download settings and keybindings, then reinstall extensions
    #[command(alias = "sync-get")]
    Pull,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config)?;
    init_logging(cli.verbose, &config)?;
    info!("Starting settings-sync v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Login { token } => auth_setup::login(&config, token).await,
        Commands::Logout => auth_setup::logout(&config),
        Commands::Status => auth_setup::status(&config).await,
        Commands::Push => cmd_sync(Direction::Push, config).await,
        Commands::Pull => cmd_sync(Direction::Pull, config).await,
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool, config: &Config) -> Result<()> {
    let default_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<std::path::PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Run a push or pull and print its report
async fn cmd_sync(direction: Direction, config: Config) -> Result<()> {
    let engine = SyncEngine::new(config)?;

    let result = match direction {
        Direction::Push => {
            println!("⬆️  Pushing settings to GitHub...");
            engine.push().await
        }
        Direction::Pull => {
            println!("⬇️  Pulling settings from GitHub...");
            engine.pull().await
        }
    };

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            println!("❌ {}", e);
            if e.requires_login() {
                println!("   Run: settings-sync login");
            }
            return Err(e.into());
        }
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!("📦 Repository: {}", report.repository);

    for outcome in &report.files {
        match outcome {
            FileOutcome::Uploaded { file, updated } => println!(
                "   ✅ {} uploaded ({})",
                file.remote_path(),
                if *updated { "updated" } else { "created" }
            ),
            FileOutcome::Downloaded { file, path, lossy } => {
                println!("   ✅ {} saved to {}", file.remote_path(), path.display());
                if *lossy {
                    println!("      ⚠️  invalid UTF-8 was replaced while decoding");
                }
            }
            FileOutcome::Skipped { file, reason } => {
                println!("   ⏭️  {} skipped: {}", file.remote_path(), reason)
            }
            FileOutcome::Failed { file, error } => {
                println!("   ❌ {} failed: {}", file.remote_path(), error);
                if matches!(error, SyncError::Conflict { .. }) {
                    println!("      The remote copy changed meanwhile; run the command again");
                }
            }
        }
    }

    for install in &report.installs {
        match install {
            InstallOutcome::Installed { extension } => println!("   🧩 installed {}", extension),
            InstallOutcome::Skipped { folder, reason } => {
                println!("   ⏭️  {} skipped: {}", folder, reason)
            }
            InstallOutcome::Failed { extension, error } => {
                println!("   ❌ {} not installed: {}", extension, error)
            }
        }
    }

    println!("\n📈 Summary:");
    println!("   Transferred: {}", report.successful_files());
    println!("   Skipped: {}", report.skipped_files());
    println!("   Failed: {}", report.failed_files());
    if !report.installs.is_empty() {
        println!(
            "   Extensions installed: {}/{}",
            report.installed_extensions().len(),
            report.installs.len()
        );
    }
    println!("   Duration: {:.2}s", report.duration.as_secs_f64());
}
