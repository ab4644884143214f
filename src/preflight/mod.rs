//! Host checks run before touching the build VM.
//!
//! A missing `ssh` would otherwise surface as an opaque spawn error in the
//! middle of the first remote command.

use anyhow::{bail, Result};

use crate::config::RemoteConfig;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Each tuple is (command, package providing it). The error lists every
/// missing tool, not just the first.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check the OpenSSH clients used to reach the build VM, and the
/// executable that gets uploaded to it.
pub fn check_remote(remote: &RemoteConfig) -> Result<()> {
    check_required_tools(&[
        (remote.ssh.as_str(), "openssh-client"),
        (remote.scp.as_str(), "openssh-client"),
    ])?;

    if !remote.executable.is_file() {
        bail!(
            "Missing FreeBSD build of this program: {}",
            remote.executable.display()
        );
    }
    if !remote.private_key.is_file() {
        bail!("Missing SSH private key: {}", remote.private_key.display());
    }

    Ok(())
}
