//! SSH launcher: start the responder on a remote host and wait for it.
//!
//! The remote peer is expected to have `bsync` on its PATH.  Its stdout is
//! piped back; a forwarding thread relays every line to our stderr and
//! signals readiness on the first line containing `READY` (the responder
//! prints it once its listener is bound).

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::thread;

use anyhow::{bail, Context};
use crossbeam_channel::{bounded, Receiver};
use tracing::{info, warn};

use crate::config::SSH_READY_TIMEOUT;

/// A parsed `[user@]host:/remote/path` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub path: String,
}

impl SshTarget {
    /// `user@host` when a user was given, bare `host` otherwise.
    pub fn login(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

impl FromStr for SshTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some((_, rest)) => (None, rest),
            None => (None, s),
        };
        let (host, path) = rest
            .split_once(':')
            .with_context(|| format!("ssh target `{s}` is not [user@]host:/remote/path"))?;
        if host.is_empty() || path.is_empty() {
            bail!("ssh target `{s}` is missing a host or a path");
        }
        Ok(SshTarget {
            user,
            host: host.to_string(),
            path: path.to_string(),
        })
    }
}

/// A responder process launched over SSH.
pub struct RemoteResponder {
    child: Child,
    ready_rx: Receiver<()>,
}

impl RemoteResponder {
    /// Spawn `ssh <login> bsync -f <path> -p <port> -b <block_size>`.
    pub fn launch(target: &SshTarget, port: u16, block_size: u32) -> anyhow::Result<Self> {
        let login = target.login();
        info!(%login, path = %target.path, port, "launching remote responder over ssh");

        let mut child = Command::new("ssh")
            .arg(&login)
            .arg("bsync")
            .args(["-f", &target.path])
            .args(["-p", &port.to_string()])
            .args(["-b", &block_size.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("spawning ssh")?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let (ready_tx, ready_rx) = bounded::<()>(1);
        thread::spawn(move || {
            let mut seen_ready = false;
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(_) => break,
                };
                eprintln!("[remote] {line}");
                if !seen_ready && line.contains("READY") {
                    seen_ready = true;
                    let _ = ready_tx.send(());
                }
            }
        });

        Ok(RemoteResponder { child, ready_rx })
    }

    /// Block until the remote prints READY; fail if it never does.
    pub fn wait_ready(&self) -> anyhow::Result<()> {
        self.ready_rx
            .recv_timeout(SSH_READY_TIMEOUT)
            .context("remote responder did not report READY in time")
    }

    /// Reap the remote process after the transfer.
    pub fn finish(mut self) {
        match self.child.wait() {
            Ok(status) if status.success() => info!("remote responder exited"),
            Ok(status) => warn!(%status, "remote responder exited abnormally"),
            Err(e) => warn!(error = %e, "could not reap remote responder"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_target() {
        let t: SshTarget = "deploy@mirror1:/dev/vdb".parse().unwrap();
        assert_eq!(t.user.as_deref(), Some("deploy"));
        assert_eq!(t.host, "mirror1");
        assert_eq!(t.path, "/dev/vdb");
        assert_eq!(t.login(), "deploy@mirror1");
    }

    #[test]
    fn parses_userless_target() {
        let t: SshTarget = "mirror1:/srv/disk.img".parse().unwrap();
        assert_eq!(t.user, None);
        assert_eq!(t.login(), "mirror1");
        assert_eq!(t.path, "/srv/disk.img");
    }

    #[test]
    fn rejects_malformed_targets() {
        assert!("mirror1".parse::<SshTarget>().is_err());
        assert!("mirror1:".parse::<SshTarget>().is_err());
        assert!(":/srv/disk.img".parse::<SshTarget>().is_err());
    }
}
