//! Remote command execution over a single byte stream.
//!
//! The build runs on a throwaway FreeBSD VM. To drive it we upload our own
//! executable, start it as `<exe> serve <marker>` over ssh, and then speak
//! a line protocol (see [`protocol`]) on the ssh process's stdin/stdout.
//! [`RemoteRunner`] wraps all of that as an ordinary [`Runner`].
//!
//! Any I/O or protocol error on an established session kills it for good;
//! there is no reconnect. A command that merely exits non-zero is a
//! [`RunError::Failed`] and leaves the session usable.

pub mod protocol;
mod server;
mod session;
mod ssh;

pub use protocol::Marker;
pub use server::{serve_stdio, Outcome, Server};
pub use session::Session;
pub use ssh::{shell_quote, SshTarget};

use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::process::{CommandSpec, LocalRunner, RunError, Runner};
use protocol::Channel;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote channel I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("remote session closed")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("could not connect to {addr}: {message}")]
    Connect { addr: String, message: String },
}

type RemoteSession = Session<BufReader<ChildStdout>, ChildStdin>;

struct Connection {
    child: Child,
    session: RemoteSession,
}

enum State {
    Disconnected,
    Connected(Connection),
    Closed,
}

/// A [`Runner`] that executes commands on the build VM.
///
/// Connects lazily on the first command. Commands are serialised: a second
/// caller blocks until the first command's exit status has arrived.
pub struct RemoteRunner {
    target: SshTarget,
    executable: PathBuf,
    state: Mutex<State>,
}

impl RemoteRunner {
    pub fn new(target: SshTarget, executable: impl Into<PathBuf>) -> Self {
        Self {
            target,
            executable: executable.into(),
            state: Mutex::new(State::Disconnected),
        }
    }

    fn connect(&self) -> Result<Connection, TransportError> {
        let connect_err = |message: String| TransportError::Connect {
            addr: self.target.addr.clone(),
            message,
        };

        if !Path::new(&self.executable).is_file() {
            return Err(connect_err(format!(
                "missing remote executable '{}'",
                self.executable.display()
            )));
        }

        let remote = format!("/tmp/build-{}", Marker::generate());
        let marker = Marker::generate();

        info!(addr = %self.target.addr, path = %remote, "uploading executable");
        let upload = self
            .target
            .upload_command(&self.executable.display().to_string(), &remote);
        LocalRunner
            .run(&upload, &mut io::sink())
            .map_err(|err| connect_err(err.to_string()))?;

        let serve = self.target.serve_command(&remote, &marker);
        debug!(argv = ?serve.argv(), "starting remote server");
        let mut child = spawn_piped(&serve).map_err(|err| connect_err(err.to_string()))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(connect_err("ssh pipes unavailable".into()));
        };

        let session = Session::new(Channel::new(marker, BufReader::new(stdout), stdin));
        Ok(Connection { child, session })
    }

    /// Shut the remote side down and wait for ssh to exit.
    ///
    /// Safe to call more than once.
    pub fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;

        let State::Connected(connection) = std::mem::replace(&mut *state, State::Closed) else {
            return Ok(());
        };

        let Connection {
            mut child,
            mut session,
        } = connection;

        let sent = session.shutdown();
        drop(session);
        let waited = child.wait();

        sent?;
        waited?;
        info!(addr = %self.target.addr, "remote session closed");
        Ok(())
    }
}

impl Runner for RemoteRunner {
    fn run(&self, spec: &CommandSpec, stdout: &mut dyn Write) -> Result<(), RunError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;

        if matches!(*state, State::Disconnected) {
            *state = State::Connected(self.connect()?);
        }

        let State::Connected(connection) = &mut *state else {
            return Err(TransportError::Closed.into());
        };

        debug!(argv = ?spec.argv(), "running remote command");
        let result = connection.session.run(spec, stdout);

        if matches!(result, Err(RunError::Transport(_))) {
            if let State::Connected(mut broken) = std::mem::replace(&mut *state, State::Closed) {
                let _ = broken.child.kill();
                let _ = broken.child.wait();
            }
        }

        result
    }
}

impl Drop for RemoteRunner {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(addr = %self.target.addr, "closing remote session: {}", err);
        }
    }
}

fn poisoned() -> TransportError {
    TransportError::Protocol("remote session lock poisoned".into())
}

fn spawn_piped(spec: &CommandSpec) -> io::Result<Child> {
    Command::new(&spec.program)
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Cmd;

    fn target() -> SshTarget {
        SshTarget {
            addr: "127.0.0.1:1".into(),
            user: "root".into(),
            private_key: "/nonexistent/key".into(),
            ssh: "ssh".into(),
            scp: "scp".into(),
        }
    }

    #[test]
    fn test_missing_executable_is_connect_error() {
        let runner = RemoteRunner::new(target(), "/nonexistent/build.freebsd_amd64");

        let err = Cmd::new("true").lines(&runner).unwrap_err();
        assert!(matches!(
            err,
            RunError::Transport(TransportError::Connect { .. })
        ));
    }

    #[test]
    fn test_close_before_connect_is_noop() {
        let runner = RemoteRunner::new(target(), "/nonexistent/exe");
        runner.close().unwrap();
        runner.close().unwrap();

        let err = Cmd::new("true").lines(&runner).unwrap_err();
        assert!(matches!(err, RunError::Transport(TransportError::Closed)));
    }
}
