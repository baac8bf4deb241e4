// src/main.rs
//! apexd CLI entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use apexd::hooks::{HookRunner, NullHookRunner, ScriptHookRunner};
use apexd::lock::ApexdLock;
use apexd::verity::AvbSignatureReader;
use apexd::{Apexd, ApexdConfig};

#[derive(Parser)]
#[command(name = "apexd")]
#[command(version)]
#[command(about = "Activates signed filesystem-image packages", long_about = None)]
struct Cli {
    /// Mount root directory
    #[arg(long, default_value = "/apex")]
    root: PathBuf,

    /// System partition package directory
    #[arg(long, default_value = "/system/apex")]
    system_dir: PathBuf,

    /// Persistent active-packages directory
    #[arg(long, default_value = "/data/apex/active")]
    active_dir: PathBuf,

    /// Staged-session directory
    #[arg(long, default_value = "/data/apex/sessions")]
    sessions_dir: PathBuf,

    /// Trusted key directory (repeatable)
    #[arg(long = "key-dir")]
    key_dirs: Vec<PathBuf>,

    /// Hook sandbox helper binary; hooks are skipped when unset
    #[arg(long)]
    hook_helper: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the boot sequence: recovery sweep, staged sessions, full scan
    Bootstrap,

    /// Activate a single package file
    Activate {
        /// Path to the package file or flattened package directory
        path: PathBuf,
    },

    /// Deactivate a single package file
    Deactivate {
        /// Path the package was activated from
        path: PathBuf,
    },

    /// Verify and stage package files into the active directory
    Stage {
        /// Package files to stage (atomic as a batch)
        paths: Vec<PathBuf>,

        /// Hard-link into place instead of renaming
        #[arg(long)]
        link: bool,
    },

    /// Verify package files without staging or activating them
    Verify {
        /// Package files to verify
        paths: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = ApexdConfig::from_env();
    config.apex_root = cli.root;
    config.system_dir = cli.system_dir;
    config.active_dir = cli.active_dir;
    config.sessions_dir = cli.sessions_dir;
    if !cli.key_dirs.is_empty() {
        config.key_dirs = cli.key_dirs;
    }

    let hooks: Box<dyn HookRunner> = match cli.hook_helper {
        Some(helper) => Box::new(ScriptHookRunner::new(helper)),
        None => Box::new(NullHookRunner),
    };

    let lock_file = config.lock_file.clone();
    let mut apexd = Apexd::new(config, Box::new(AvbSignatureReader), hooks);

    match cli.command {
        Commands::Bootstrap => {
            let lock = ApexdLock::try_acquire(&lock_file)
                .context("failed to open daemon lock")?;
            let Some(lock) = lock else {
                bail!("another apexd instance holds {}", lock_file.display());
            };
            lock.write_pid().context("failed to record pid")?;
            apexd.bootstrap();
        }
        Commands::Activate { path } => {
            apexd
                .activate(&path)
                .with_context(|| format!("failed to activate {}", path.display()))?;
        }
        Commands::Deactivate { path } => {
            apexd
                .deactivate(&path)
                .with_context(|| format!("failed to deactivate {}", path.display()))?;
        }
        Commands::Stage { paths, link } => {
            apexd
                .stage_packages(&paths, link)
                .context("failed to stage packages")?;
            println!("staged {} package(s)", paths.len());
        }
        Commands::Verify { paths } => {
            for apex in apexd.verify_packages(&paths)? {
                println!("{}: ok", apex.package_id());
            }
        }
    }

    Ok(())
}
