//! SSH/scp transport to the guest over the forwarded loopback port.
//!
//! Every call shells out to the system `ssh`/`scp` binaries through
//! `tokio::process::Command`; no connection state is held between calls, so
//! a guest reboot or crash only costs the next invocation.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// SSH options shared by every ssh/scp invocation.
///
/// * `StrictHostKeyChecking=no` — guest images are ephemeral; host keys
///   change on every fresh boot.
/// * `UserKnownHostsFile=/dev/null` — don't pollute the host's known_hosts.
/// * `LogLevel=ERROR` — suppress banner noise from the guest sshd.
/// * `BatchMode=yes` — fail immediately if a password prompt would appear
///   (guest images carry a password-less root account).
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ConnectTimeout=5",
];

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Outcome of one remote command: combined stdout+stderr plus success flag.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub output: String,
    pub ok: bool,
}

/// The guest's forwarded SSH endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remote {
    pub addr: SocketAddr,
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl Remote {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Copy-pasteable command line for a manual session, shown to the user
    /// in debug mode.
    pub fn ssh_command_line(&self, user: &str) -> String {
        format!(
            "ssh -o StrictHostKeyChecking=no -p {} {}@{}",
            self.addr.port(),
            user,
            self.addr.ip()
        )
    }

    /// Run a shell command inside the guest and collect its combined output.
    ///
    /// A non-zero exit is not an error at this layer; callers distinguish
    /// transport failures (Err) from command failures (`ok == false`).
    pub async fn run(&self, user: &str, cmd: &str) -> Result<ExecResult> {
        debug!(remote = %self, user, cmd, "ssh");

        let output = Command::new("ssh")
            .args(SSH_OPTS)
            .arg("-p")
            .arg(self.addr.port().to_string())
            .arg(format!("{}@{}", user, self.addr.ip()))
            .arg(cmd)
            .output()
            .await
            .context("failed to spawn ssh")?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ExecResult {
            output: combined,
            ok: output.status.success(),
        })
    }

    /// Start a command in the guest and return without waiting for it.
    ///
    /// The command is detached from the SSH session so it survives the
    /// connection closing (stress scripts, background exploits).
    pub async fn run_detached(&self, user: &str, cmd: &str) -> Result<()> {
        let wrapped = format!("nohup sh -c '{cmd}' >/dev/null 2>&1 </dev/null &");
        let result = self.run(user, &wrapped).await?;
        if !result.ok {
            anyhow::bail!("detached command failed to start: {}", result.output.trim());
        }
        Ok(())
    }

    /// Copy a local file or directory into the guest via scp.
    ///
    /// OpenSSH 9 switched scp to the SFTP protocol by default, which minimal
    /// guest images often lack; on failure the copy is retried once with the
    /// legacy protocol (`-O`).
    pub async fn copy(
        &self,
        user: &str,
        local: &Path,
        remote_path: &str,
        recursive: bool,
    ) -> Result<()> {
        match self.scp(user, local, remote_path, recursive, false).await {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!(remote = %self, error = %first, "scp failed, retrying with legacy protocol");
                self.scp(user, local, remote_path, recursive, true)
                    .await
                    .with_context(|| format!("scp (sftp attempt: {first:#})"))
            }
        }
    }

    async fn scp(
        &self,
        user: &str,
        local: &Path,
        remote_path: &str,
        recursive: bool,
        legacy: bool,
    ) -> Result<()> {
        let local = local
            .to_str()
            .context("local path contains non-UTF-8 characters")?;
        let args = build_scp_args(self, user, local, remote_path, recursive, legacy);

        debug!(remote = %self, local, remote_path, legacy, "scp");

        let output = Command::new("scp")
            .args(&args)
            .output()
            .await
            .context("failed to spawn scp")?;

        if !output.status.success() {
            anyhow::bail!(
                "scp {local} -> {remote_path} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

fn build_scp_args(
    remote: &Remote,
    user: &str,
    local: &str,
    remote_path: &str,
    recursive: bool,
    legacy: bool,
) -> Vec<String> {
    let mut args: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();
    if legacy {
        args.push("-O".into());
    }
    if recursive {
        args.push("-r".into());
    }
    args.push("-P".into());
    args.push(remote.addr.port().to_string());
    args.push(local.into());
    args.push(format!("{}@{}:{}", user, remote.addr.ip(), remote_path));
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> Remote {
        Remote::new("127.0.0.1:2222".parse().unwrap())
    }

    #[test]
    fn ssh_command_line_names_user_port_and_host() {
        let line = remote().ssh_command_line("root");
        assert_eq!(
            line,
            "ssh -o StrictHostKeyChecking=no -p 2222 root@127.0.0.1"
        );
    }

    #[test]
    fn scp_args_use_uppercase_port_flag() {
        let args = build_scp_args(&remote(), "user", "/tmp/x.ko", "/tmp/x.ko", false, false);
        let p = args.iter().position(|a| a == "-P").unwrap();
        assert_eq!(args[p + 1], "2222");
        assert_eq!(args.last().unwrap(), "user@127.0.0.1:/tmp/x.ko");
        assert!(!args.contains(&"-O".to_string()));
        assert!(!args.contains(&"-r".to_string()));
    }

    #[test]
    fn scp_args_legacy_fallback_adds_protocol_flag() {
        let args = build_scp_args(&remote(), "root", "/tmp/dir", "/lib/modules", true, true);
        assert!(args.contains(&"-O".to_string()));
        assert!(args.contains(&"-r".to_string()));
    }
}
