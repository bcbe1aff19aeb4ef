//! tessera command-line host
//!
//! Opens the storage database, mounts every enabled storage and runs one
//! operation against the unified namespace.
//!
//! ## Usage
//!
//! ```bash
//! # Storage management
//! tessera add /disk local --addition '{"root_folder_path":"/srv/share"}'
//! tessera mounts
//! tessera drivers
//! tessera update /disk --disabled true
//! tessera unmount /disk
//!
//! # File operations on virtual paths
//! tessera ls /disk/docs
//! tessera put ./report.pdf /disk/docs
//! tessera mv /disk/docs/report.pdf /disk/archive
//! tessera cat /disk/archive/report.pdf
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tessera_kernel::vfs::{FsOtherArgs, LinkArgs, UpdateProgress};
use tessera_kernel::{FileStream, Kernel, Obj, SqliteStorageRepository, TesseraConfig};

/// Unified file namespace over many storage backends.
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(about = "Mount storage backends under one virtual namespace")]
struct Cli {
    /// Config file (default: $TESSERA_CONFIG, then ~/.config/tessera/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage database, overriding the config file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List mounted storages and their status
    Mounts,
    /// List registered drivers and their configuration fields
    Drivers,
    /// Add a storage
    Add {
        mount_path: String,
        driver: String,
        /// Driver-specific settings as JSON
        #[arg(long, default_value = "{}")]
        addition: String,
        #[arg(long, default_value = "")]
        remark: String,
        #[arg(long, default_value_t = 0)]
        order: i32,
        /// Listing cache minutes (default from config)
        #[arg(long)]
        cache_expiration: Option<u32>,
    },
    /// Change a storage's settings
    Update {
        mount_path: String,
        #[arg(long)]
        addition: Option<String>,
        #[arg(long)]
        remark: Option<String>,
        #[arg(long)]
        order: Option<i32>,
        #[arg(long)]
        disabled: Option<bool>,
        /// Move the storage to another mount path
        #[arg(long)]
        mount: Option<String>,
    },
    /// Delete a storage (its backend contents are untouched)
    Unmount { mount_path: String },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Bypass the listing cache
        #[arg(short, long)]
        refresh: bool,
    },
    /// Show one object
    Stat { path: String },
    /// Create a directory and any missing parents
    Mkdir { path: String },
    /// Remove a file or directory
    Rm { path: String },
    /// Move into a directory
    Mv { src: String, dst_dir: String },
    /// Copy into a directory
    Cp { src: String, dst_dir: String },
    /// Rename in place
    Rename { path: String, new_name: String },
    /// Upload a local file into a directory
    Put { file: PathBuf, dst_dir: String },
    /// Show the download link for a file
    Link {
        path: String,
        #[arg(long, default_value = "")]
        link_type: String,
    },
    /// Write a file's contents to stdout
    Cat { path: String },
    /// Call a driver-specific method on an object
    Other {
        path: String,
        method: String,
        /// Method arguments as JSON
        #[arg(long, default_value = "null")]
        data: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match TesseraConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(database) = &cli.database {
        config.database = database.clone();
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn open_kernel(config: &TesseraConfig) -> Result<Kernel> {
    if let Some(parent) = config.database.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let repo = SqliteStorageRepository::open(&config.database)
        .with_context(|| format!("Failed to open database {}", config.database.display()))?;
    let kernel = Kernel::new(config, Arc::new(repo)).context("Failed to build kernel")?;
    let working = kernel.start().await.context("Failed to load storages")?;
    tracing::debug!(working, "kernel ready");
    Ok(kernel)
}

async fn run(cli: Cli, config: &TesseraConfig) -> Result<()> {
    let kernel = open_kernel(config).await?;

    // Ctrl-C cancels whatever operation is in flight
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let result = dispatch(&kernel, cli.command, cli.json, &cancel).await;
    kernel.shutdown().await;
    result
}

async fn dispatch(
    kernel: &Kernel,
    command: Command,
    json: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let fs = kernel.fs();
    match command {
        Command::Mounts => cmd_mounts(kernel, json),
        Command::Drivers => cmd_drivers(kernel, json),
        Command::Add {
            mount_path,
            driver,
            addition,
            remark,
            order,
            cache_expiration,
        } => {
            let addition: serde_json::Value =
                serde_json::from_str(&addition).context("--addition is not valid JSON")?;
            let mut record = kernel
                .new_record(&mount_path, &driver)
                .with_addition(addition)
                .with_remark(remark)
                .with_order(order);
            if let Some(minutes) = cache_expiration {
                record = record.with_cache_expiration(minutes);
            }
            let id = kernel.storages().create(record).await?;
            println!("{id}");
            Ok(())
        }
        Command::Update {
            mount_path,
            addition,
            remark,
            order,
            disabled,
            mount,
        } => {
            let mut record = find_record(kernel, &mount_path)?;
            if let Some(addition) = addition {
                let value: serde_json::Value =
                    serde_json::from_str(&addition).context("--addition is not valid JSON")?;
                record = record.with_addition(value);
            }
            if let Some(remark) = remark {
                record.remark = remark;
            }
            if let Some(order) = order {
                record.order = order;
            }
            if let Some(disabled) = disabled {
                record.disabled = disabled;
            }
            if let Some(mount) = mount {
                record.mount_path = mount;
            }
            kernel.storages().update(record).await?;
            Ok(())
        }
        Command::Unmount { mount_path } => {
            let record = find_record(kernel, &mount_path)?;
            kernel.storages().delete(record.id).await?;
            Ok(())
        }
        Command::Ls { path, refresh } => {
            let objs = fs.list(&path, refresh, cancel).await?;
            print_objs(&objs, json)
        }
        Command::Stat { path } => {
            let obj = fs.get(&path, cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&obj)?);
            } else {
                print_objs(std::slice::from_ref(&obj), false)?;
            }
            Ok(())
        }
        Command::Mkdir { path } => Ok(fs.make_dir(&path, cancel).await?),
        Command::Rm { path } => Ok(fs.remove(&path, cancel).await?),
        Command::Mv { src, dst_dir } => Ok(fs.move_obj(&src, &dst_dir, cancel).await?),
        Command::Cp { src, dst_dir } => Ok(fs.copy(&src, &dst_dir, cancel).await?),
        Command::Rename { path, new_name } => Ok(fs.rename(&path, &new_name, cancel).await?),
        Command::Put { file, dst_dir } => cmd_put(kernel, &file, &dst_dir, cancel).await,
        Command::Link { path, link_type } => {
            let args = LinkArgs {
                link_type,
                ..LinkArgs::default()
            };
            let (link, obj) = fs.link(&path, args, cancel).await?;
            if link.file.is_some() {
                println!("(in-process file, {} bytes)", obj.size());
            } else {
                println!("{}", link.url);
                for (k, v) in &link.header {
                    println!("  {k}: {v}");
                }
            }
            link.release()?;
            Ok(())
        }
        Command::Cat { path } => cmd_cat(kernel, &path, cancel).await,
        Command::Other { path, method, data } => {
            let data: serde_json::Value =
                serde_json::from_str(&data).context("--data is not valid JSON")?;
            let value = fs.other(FsOtherArgs { path, method, data }, cancel).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
    }
}

fn find_record(kernel: &Kernel, mount_path: &str) -> Result<tessera_kernel::StorageRecord> {
    let mount_path = tessera_kernel::vfs::path::fix_and_clean_path(mount_path);
    kernel
        .storages()
        .repository()
        .get_storage_by_mount_path(&mount_path)?
        .with_context(|| format!("No storage mounted at {mount_path}"))
}

fn cmd_mounts(kernel: &Kernel, json: bool) -> Result<()> {
    let records = kernel.storages().repository().get_storages()?;
    if json {
        let rows: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "mount_path": r.mount_path,
                    "driver": r.driver,
                    "order": r.order,
                    "status": r.status,
                    "disabled": r.disabled,
                    "remark": r.remark,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No storages. Add one with: tessera add <mount_path> <driver>");
        return Ok(());
    }
    println!("{:<24} {:<10} {:>5}  STATUS", "MOUNT", "DRIVER", "ORDER");
    for r in records {
        let status = if r.disabled { "disabled" } else { r.status.as_str() };
        println!("{:<24} {:<10} {:>5}  {}", r.mount_path, r.driver, r.order, status);
    }
    Ok(())
}

fn cmd_drivers(kernel: &Kernel, json: bool) -> Result<()> {
    let infos = kernel.drivers().infos();
    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }
    for (name, info) in infos {
        println!("{name}");
        for item in &info.additional {
            let required = if item.required { " (required)" } else { "" };
            println!("  {:<20} {:<8}{}", item.name, item.kind, required);
        }
    }
    Ok(())
}

fn print_objs(objs: &[Obj], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(objs)?);
        return Ok(());
    }
    for obj in objs {
        let kind = if obj.is_dir() { "d" } else { "-" };
        println!("{kind} {:>12}  {}", obj.size(), obj.name());
    }
    Ok(())
}

async fn cmd_put(
    kernel: &Kernel,
    file: &Path,
    dst_dir: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", file.display()))?
        .to_string();
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let meta = handle.metadata().await?;
    if !meta.is_file() {
        bail!("{} is not a regular file", file.display());
    }

    let mut stream = FileStream::new(name, meta.len(), handle);
    if let Ok(modified) = meta.modified() {
        stream = stream.with_modified(modified);
    }
    let progress: UpdateProgress = Arc::new(|pct: f64| {
        tracing::debug!(pct, "upload progress");
    });
    kernel
        .fs()
        .put(dst_dir, stream, Some(progress), cancel)
        .await?;
    Ok(())
}

async fn cmd_cat(kernel: &Kernel, path: &str, cancel: &CancellationToken) -> Result<()> {
    let (link, _) = kernel.fs().link(path, LinkArgs::default(), cancel).await?;
    let result: Result<()> = async {
        let Some(file) = link.file.as_ref() else {
            bail!("{path} is served by URL, fetch {} instead", link.url);
        };
        let mut file = file.lock().await;
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(&mut *file, &mut stdout).await?;
        stdout.flush().await?;
        Ok(())
    }
    .await;
    link.release()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["tessera", "ls", "/disk", "--refresh", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Ls { ref path, refresh: true } if path == "/disk"));
    }

    #[test]
    fn test_parse_add_defaults() {
        let cli = Cli::try_parse_from(["tessera", "add", "/m", "memory"]).unwrap();
        match cli.command {
            Command::Add {
                addition,
                order,
                cache_expiration,
                ..
            } => {
                assert_eq!(addition, "{}");
                assert_eq!(order, 0);
                assert!(cache_expiration.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
