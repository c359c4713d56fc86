// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! torrentfs FUSE host
//!
//! Mounts the tree described by an inode database, serving file contents
//! from a directory of downloaded torrent payloads.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use torrentfs_core::{FsConfig, LocalBackend, Ownership, SqliteInodeStore};
use torrentfs_fuse_host::TorrentFs;
use torrentfs_logging::{CliLoggingArgs, LoggingConfig};
use tracing::info;

const COMPONENT: &str = "torrentfs-fuse-host";

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Inode database (SQLite); created when missing
    #[arg(long)]
    inodb: PathBuf,

    /// Directory holding torrent payloads as <hash>/<index>
    #[arg(long)]
    data_dir: PathBuf,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

/// Contents of `--config`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostConfig {
    #[serde(flatten)]
    fs: FsConfig,
    logging: LoggingConfig,
}

fn load_config(config_path: Option<&Path>) -> Result<HostConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config = serde_json::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        }
        None => Ok(HostConfig::default()),
    }
}

/// The root directory starts out owned by whoever owns the mount point.
fn mount_point_owner(mount_point: &Path) -> Result<Ownership> {
    use std::os::unix::fs::MetadataExt;
    let metadata = fs::metadata(mount_point)
        .with_context(|| format!("inspecting mount point {}", mount_point.display()))?;
    Ok(Ownership {
        uid: metadata.uid(),
        gid: metadata.gid(),
    })
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    config.logging.apply_to(&mut args.logging);
    args.logging.init(COMPONENT)?;

    info!(mount_point = %args.mount_point.display(), "starting torrentfs FUSE host");
    info!(fs_config = ?config.fs, "configuration loaded");

    let owner = mount_point_owner(&args.mount_point)?;
    let store = SqliteInodeStore::open(&args.inodb, owner)
        .with_context(|| format!("opening inode database {}", args.inodb.display()))?;
    let backend = LocalBackend::new(&args.data_dir);
    let fs = TorrentFs::new(Arc::new(store), Arc::new(backend), &config.fs.cache);

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        let filesystem = torrentfs_fuse_host::adapter::TorrentFsFuse::new(fs, &config.fs);

        let mut mount_options = vec![
            fuser::MountOption::FSName("torrentfs".to_string()),
            fuser::MountOption::Subtype("torrentfs".to_string()),
            fuser::MountOption::DefaultPermissions,
        ];
        if args.allow_other {
            mount_options.push(fuser::MountOption::AllowOther);
        }
        if args.allow_root {
            mount_options.push(fuser::MountOption::AllowRoot);
        }
        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        info!(
            attr_ttl_ms = config.fs.cache.attr_ttl_ms,
            entry_ttl_ms = config.fs.cache.entry_ttl_ms,
            "mounting filesystem"
        );
        let session = fuser::spawn_mount2(filesystem, &args.mount_point, &mount_options)
            .with_context(|| format!("mounting {}", args.mount_point.display()))?;
        info!("torrentfs mounted; blocking until unmount");
        session.join();
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        drop(fs);
        tracing::warn!("FUSE support not compiled in; rebuild with --features fuse to mount");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use torrentfs_logging::{CliLogLevel, LogFormat};

    #[test]
    fn config_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.fs, FsConfig::default());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn config_loading_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_json = r#"{
            "cache": { "attr_ttl_ms": 500, "entry_ttl_ms": 250 },
            "workers": { "threads": 4 },
            "logging": { "log-level": "debug", "log-format": "json" }
        }"#;
        temp_file.write_all(config_json.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = load_config(Some(temp_file.path())).unwrap();
        assert_eq!(config.fs.cache.attr_ttl_ms, 500);
        assert_eq!(config.fs.cache.entry_ttl_ms, 250);
        assert_eq!(config.fs.workers.threads, 4);
        assert_eq!(config.fs.workers.max_background, 64);
        assert_eq!(config.logging.log_level, Some(CliLogLevel::Debug));
        assert_eq!(config.logging.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"{ not json").unwrap();
        assert!(load_config(Some(temp_file.path())).is_err());
    }

    #[test]
    fn arguments_parse() {
        let args = Args::try_parse_from([
            COMPONENT,
            "/mnt/torrents",
            "--inodb",
            "/var/lib/torrentfs/inodb.sqlite",
            "--data-dir",
            "/var/lib/torrentfs/data",
            "--auto-unmount",
            "--log-level",
            "warn",
        ])
        .unwrap();
        assert_eq!(args.mount_point, PathBuf::from("/mnt/torrents"));
        assert!(args.auto_unmount);
        assert!(!args.allow_other);
        assert_eq!(args.logging.log_level, Some(CliLogLevel::Warn));

        assert!(Args::try_parse_from([COMPONENT, "/mnt/torrents"]).is_err());
    }

    #[test]
    fn mount_point_owner_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let owner = mount_point_owner(dir.path()).unwrap();
        use std::os::unix::fs::MetadataExt;
        assert_eq!(owner.uid, fs::metadata(dir.path()).unwrap().uid());
    }
}
