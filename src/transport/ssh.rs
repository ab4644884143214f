//! OpenSSH command lines for reaching the build VM.
//!
//! We shell out to the system `ssh`/`scp` clients rather than linking an
//! SSH implementation. The VM is ephemeral, so host keys are neither
//! checked nor remembered.

use std::path::PathBuf;

use crate::process::{Cmd, CommandSpec};

use super::protocol::Marker;

/// Where and how to log in to the build VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// `host` or `host:port`.
    pub addr: String,
    pub user: String,
    pub private_key: PathBuf,
    pub ssh: String,
    pub scp: String,
}

impl SshTarget {
    fn host_and_port(&self) -> (&str, Option<&str>) {
        match self.addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                (host.trim_start_matches('[').trim_end_matches(']'), Some(port))
            }
            _ => (self.addr.as_str(), None),
        }
    }

    fn destination(&self) -> String {
        let (host, _) = self.host_and_port();
        if host.contains(':') {
            format!("{}@[{}]", self.user, host)
        } else {
            format!("{}@{}", self.user, host)
        }
    }

    fn options(&self) -> Vec<String> {
        let mut options = vec!["-i".to_string(), self.private_key.display().to_string()];
        for option in [
            "BatchMode=yes",
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "LogLevel=ERROR",
        ] {
            options.push("-o".into());
            options.push(option.into());
        }
        options
    }

    /// `scp` invocation copying `local` to `remote` on the VM.
    pub fn upload_command(&self, local: &str, remote: &str) -> CommandSpec {
        let mut cmd = Cmd::new(&self.scp).args(self.options());
        if let (_, Some(port)) = self.host_and_port() {
            cmd = cmd.args(["-P", port]);
        }
        cmd.arg(local)
            .arg(format!("{}:{}", self.destination(), remote))
            .spec()
            .clone()
    }

    /// `ssh` invocation that starts the uploaded binary as a server.
    pub fn serve_command(&self, remote: &str, marker: &Marker) -> CommandSpec {
        let path = shell_quote(remote);
        let script = format!(
            "chmod 0700 {path} && exec {path} serve {}",
            shell_quote(marker.as_str())
        );

        let mut cmd = Cmd::new(&self.ssh).args(self.options());
        if let (_, Some(port)) = self.host_and_port() {
            cmd = cmd.args(["-p", port]);
        }
        cmd.arg(self.destination()).arg(script).spec().clone()
    }
}

/// Quote `raw` for a POSIX shell.
pub fn shell_quote(raw: &str) -> String {
    if raw.is_empty() {
        return "''".to_string();
    }
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('\'');
    for ch in raw.chars() {
        if ch == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}
