//! Error kinds that callers need to tell apart.
//!
//! Most functions in this crate return [`anyhow::Result`] with context
//! attached at each layer. When a caller has to react to *what kind* of
//! failure happened (a bad configuration vs. a compromised archive vs. a
//! dead remote session), the root cause is one of these variants and can
//! be recovered with [`anyhow::Error::downcast_ref`].

use thiserror::Error;

use crate::process::RunError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Malformed rule or inconsistent configuration. Never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Archive content tried to reach outside the container root.
    #[error("security violation: {0}")]
    Security(String),

    /// The remote session failed or desynchronised.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An external tool (pkg, buildah, ldconfig, ...) exited unsuccessfully.
    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },
}

impl BuildError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::Security(message.into())
    }
}

impl From<RunError> for BuildError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Transport(err) => Self::Transport(err),
            RunError::Io { program, source } => Self::ExternalTool {
                tool: program,
                message: source.to_string(),
            },
            RunError::Failed { program, message } => Self::ExternalTool {
                tool: program,
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_keep_their_kind() {
        let err: BuildError = RunError::Transport(TransportError::Closed).into();
        assert!(matches!(err, BuildError::Transport(TransportError::Closed)));
    }

    #[test]
    fn command_failures_become_external_tool_errors() {
        let err: BuildError = RunError::Failed {
            program: "pkg".into(),
            message: "exit status: 3".into(),
        }
        .into();
        assert_eq!(err.to_string(), "pkg failed: exit status: 3");
    }
}
