//! Command-line interface.
//!
//! One binary serves both roles: with `--remote` (or `--ssh`) it is the
//! initiator, otherwise it listens as the responder.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::codec::Level;
use crate::config::{
    Direction, SyncConfig, DEFAULT_BLOCK_SIZE, DEFAULT_PORT, DEFAULT_WINDOW, DEFAULT_WORKERS,
};
use crate::ssh::SshTarget;

#[derive(Debug, Parser)]
#[command(
    name = "bsync",
    version,
    about = "Block-level sync of files and devices over TCP",
    long_about = "Synchronizes a file or block device between two hosts, transferring only \
                  blocks whose fingerprints differ. Run without --remote to serve as the \
                  destination; point --remote (or --ssh) at a responder to push, add \
                  --download to pull."
)]
pub struct Cli {
    /// File or device to synchronize, e.g. /dev/vda or disk.img
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    pub device: PathBuf,

    /// Remote responder address (host:port); enables initiator mode
    #[arg(short = 'r', long = "remote", value_name = "HOST:PORT")]
    pub remote: Option<String>,

    /// Block size in bytes
    #[arg(short = 'b', long = "block-size", value_name = "BYTES", default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,

    /// Skip the first N blocks (assume they are already in sync)
    #[arg(short = 's', long = "skip", value_name = "N", default_value_t = 0)]
    pub skip: u64,

    /// Bind address for responder mode
    #[arg(short = 'l', long = "listen", value_name = "ADDR", default_value = "0.0.0.0")]
    pub listen: IpAddr,

    /// TCP port (bind port in responder mode, remote port with --ssh)
    #[arg(short = 'p', long = "port", value_name = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Do not compress blocks
    #[arg(short = 'n', long = "no-compress")]
    pub no_compress: bool,

    /// Compression level
    #[arg(long = "level", value_enum, default_value = "fastest")]
    pub level: Level,

    /// Number of parallel push workers (0 = one per CPU)
    #[arg(short = 'w', long = "workers", value_name = "N", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Prefetch window: blocks fingerprinted ahead of the transfer
    #[arg(long = "window", value_name = "N", default_value_t = DEFAULT_WINDOW)]
    pub window: u64,

    /// Pull from the remote instead of pushing to it
    #[arg(short = 'd', long = "download")]
    pub download: bool,

    /// Suppress the interactive status line
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Launch the responder on a remote host: [user@]host:/remote/path
    #[arg(short = 't', long = "ssh", value_name = "TARGET")]
    pub ssh: Option<SshTarget>,
}

impl Cli {
    pub fn direction(&self) -> Direction {
        if self.download {
            Direction::Pull
        } else {
            Direction::Push
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            device: self.device.clone(),
            block_size: self.block_size,
            skip: self.skip,
            workers: self.workers,
            window: self.window,
            compress: !self.no_compress,
            level: self.level,
            quiet: self.quiet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_defaults() {
        let cli = Cli::parse_from(["bsync", "-f", "/dev/vda"]);
        assert!(cli.remote.is_none());
        assert_eq!(cli.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(cli.port, DEFAULT_PORT);
        assert!(!cli.no_compress);
        assert_eq!(cli.direction(), Direction::Push);
    }

    #[test]
    fn initiator_flags() {
        let cli = Cli::parse_from([
            "bsync", "-f", "disk.img", "-r", "peer:9000", "-b", "1048576", "-w", "8", "-n", "-q",
            "--window", "16",
        ]);
        let cfg = cli.sync_config();
        assert_eq!(cli.remote.as_deref(), Some("peer:9000"));
        assert_eq!(cfg.block_size, 1 << 20);
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.window, 16);
        assert!(!cfg.compress);
        assert!(cfg.quiet);
    }

    #[test]
    fn ssh_target_parses_inline() {
        let cli = Cli::parse_from(["bsync", "-f", "disk.img", "-t", "root@peer:/dev/vdb"]);
        let t = cli.ssh.unwrap();
        assert_eq!(t.host, "peer");
        assert_eq!(t.path, "/dev/vdb");
    }

    #[test]
    fn download_switches_direction() {
        let cli = Cli::parse_from(["bsync", "-f", "disk.img", "-r", "peer:8080", "-d"]);
        assert_eq!(cli.direction(), Direction::Pull);
    }
}
