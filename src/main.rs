//! Browse a remote file tree through the local cache.
use std::io::{IsTerminal as _, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use remote_fs::entry::DirEntry;
use remote_fs::fs::{FsError, RemoteFileSystem, Warmup, WarmupMode};
use remote_fs::node::RemoteNode;
use remote_fs::storage::{DirectoryStorage, STORAGE_FILE_NAME};
use remote_fs::transport::local::LocalTransport;
use tracing::{debug, error, info};

mod app_config;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "Cached access to a remote file tree.")]
struct Args {
    #[arg(short, long, value_parser, help = "Optional path to an rfs config TOML.")]
    config_path: Option<PathBuf>,

    #[arg(short, long, value_parser, help = "Serve this directory instead of remote-root.")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Re-list from the remote instead of using the cached listing.
        #[arg(short, long)]
        refresh: bool,
    },
    /// Show the cached metadata of an entry.
    Stat { path: String },
    /// Print the content of a file.
    Cat { path: String },
    /// Print where a symbolic link points.
    Readlink { path: String },
    /// Re-list a directory and report what changed.
    Refresh { path: String },
    /// Prefetch a subtree.
    Warmup {
        path: String,
        /// Only archive files with these extensions.
        #[arg(short, long = "ext")]
        extensions: Vec<String>,
        /// List every directory instead of fetching file contents.
        #[arg(long)]
        list_only: bool,
    },
    /// Print the on-disk listing cache of a directory.
    DumpCache { path: String },
}

async fn lookup(fs: &RemoteFileSystem<LocalTransport>, path: &str) -> Result<Arc<RemoteNode>, FsError> {
    fs.find(path)
        .await?
        .ok_or_else(|| FsError::NotFound {
            operation: "find",
            path: path.to_owned(),
        })
}

async fn run(fs: RemoteFileSystem<LocalTransport>, command: Command) -> Result<(), FsError> {
    let mut out = std::io::stdout().lock();
    match command {
        Command::Ls { path, refresh } => {
            let dir = lookup(&fs, &path).await?;
            if refresh {
                fs.refresh(&dir).await?;
            }
            for child in fs.children(&dir).await? {
                let stat = fs.metadata(&child).await?;
                writeln!(out, "{stat}")?;
            }
        }
        Command::Stat { path } => {
            let node = lookup(&fs, &path).await?;
            writeln!(out, "{}", fs.metadata(&node).await?)?;
        }
        Command::Cat { path } => {
            let node = lookup(&fs, &path).await?;
            out.write_all(&fs.read(&node).await?)?;
        }
        Command::Readlink { path } => {
            let node = lookup(&fs, &path).await?;
            writeln!(out, "{}", fs.read_symbolic_link_path(&node)?)?;
        }
        Command::Refresh { path } => {
            let dir = lookup(&fs, &path).await?;
            let before = fs.children(&dir).await?.len();
            fs.refresh(&dir).await?;
            let after = fs.children(&dir).await?.len();
            info!(dir = %dir, before, after, "refreshed");
        }
        Command::Warmup {
            path,
            extensions,
            list_only,
        } => {
            let dir = lookup(&fs, &path).await?;
            let mode = if list_only {
                WarmupMode::RecursiveLs
            } else {
                WarmupMode::FilesContent
            };
            match fs.warmup(&dir, mode, &extensions).await? {
                Warmup::Scheduled(job) => {
                    if let Err(e) = job.await {
                        error!("Warmup job failed: {e}");
                    }
                }
                Warmup::Coalesced => info!(dir = %dir, "warmup already running"),
                Warmup::Disabled => info!("archive warmup is disabled in the configuration"),
                Warmup::Listed { directories } => info!(dir = %dir, directories, "listed subtree"),
            }
        }
        Command::DumpCache { path } => {
            let dir = lookup(&fs, &path).await?;
            let Some(state) = dir.as_directory() else {
                return Err(FsError::NotADirectory { path });
            };
            // Make sure the listing exists on disk before reading it back.
            fs.children(&dir).await?;
            let storage = DirectoryStorage::load(&state.cache_dir().join(STORAGE_FILE_NAME))?;
            for entry in storage.list_all() {
                match entry {
                    DirEntry::Valid(stat) => writeln!(out, "{}", stat.to_line())?,
                    DirEntry::Placeholder(name) => writeln!(out, "(missing) {name}")?,
                }
            }
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load_or_create(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Some(root) = args.root {
        config.remote_root = root;
    }
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    Trc::default()
        .plain(!std::io::stderr().is_terminal())
        .init()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        });
    debug!(config = ?config, "Starting with configuration.");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        });

    let transport = LocalTransport::new(config.remote_root.clone());
    let fs = RemoteFileSystem::new(transport, config.fs.clone());
    if let Err(e) = runtime.block_on(run(fs, args.command)) {
        error!("{e}");
        std::process::exit(i32::from(&e));
    }
}
