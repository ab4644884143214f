//! Command abstraction.
//!
//! Everything above this module runs external tools through a [`Runner`],
//! never through `std::process` directly. A runner is either local
//! ([`LocalRunner`]) or forwards the command to the build VM
//! ([`crate::transport::RemoteRunner`]); call sites cannot tell the
//! difference, which is also what lets tests substitute a recorder.
//!
//! # Example
//!
//! ```rust,ignore
//! use freebsd_builder::process::{Cmd, LocalRunner};
//!
//! let runner = LocalRunner;
//! let id = Cmd::new("buildah").args(["from", "--arch=amd64", base]).first(&runner)?;
//! ```

mod local;

#[cfg(test)]
pub(crate) mod testing;

pub use local::LocalRunner;

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors from running a single command.
#[derive(Debug, Error)]
pub enum RunError {
    /// The command could not be started, or its pipes failed.
    #[error("could not run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The command ran and reported failure.
    #[error("{program} exited with error: {message}")]
    Failed { program: String, message: String },

    /// The channel to the remote host broke; the session is gone.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Where a command's standard input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl Input {
    /// Copy the whole input into `writer`, returning the byte count.
    pub fn copy_to(&self, writer: &mut dyn Write) -> io::Result<u64> {
        match self {
            Input::Bytes(bytes) => {
                writer.write_all(bytes)?;
                Ok(bytes.len() as u64)
            }
            Input::File(path) => {
                let mut file = File::open(path)?;
                io::copy(&mut file, writer)
            }
        }
    }
}

/// A fully described command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Overrides layered on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Working directory as seen by whichever host runs the command.
    pub dir: Option<String>,
    pub stdin: Option<Input>,
}

impl CommandSpec {
    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Something that can execute a [`CommandSpec`].
///
/// Standard output is streamed into `stdout`; standard error always goes
/// to the invoking process's stderr.
pub trait Runner {
    fn run(&self, spec: &CommandSpec, stdout: &mut dyn Write) -> Result<(), RunError>;
}

impl<R: Runner + ?Sized> Runner for &R {
    fn run(&self, spec: &CommandSpec, stdout: &mut dyn Write) -> Result<(), RunError> {
        (**self).run(spec, stdout)
    }
}

/// Builder for a [`CommandSpec`] with convenience terminals.
#[derive(Debug, Clone)]
pub struct Cmd {
    spec: CommandSpec,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            spec: CommandSpec {
                program: program.into(),
                ..Default::default()
            },
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.push((key.into(), value.into()));
        self
    }

    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.spec.dir = Some(dir.into());
        self
    }

    pub fn stdin_bytes(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.spec.stdin = Some(Input::Bytes(input.into()));
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.stdin = Some(Input::File(path.into()));
        self
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Run the command, passing its output through to our stdout.
    pub fn run(&self, runner: &dyn Runner) -> Result<(), RunError> {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        runner.run(&self.spec, &mut lock)
    }

    /// Run the command and collect its non-empty output lines, trimmed.
    pub fn lines(&self, runner: &dyn Runner) -> Result<Vec<String>, RunError> {
        let mut buf = Vec::new();
        runner.run(&self.spec, &mut buf)?;

        Ok(String::from_utf8_lossy(&buf)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// First non-empty output line, or an empty string if there is none.
    pub fn first(&self, runner: &dyn Runner) -> Result<String, RunError> {
        Ok(self.lines(runner)?.into_iter().next().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    #[test]
    fn builder_collects_everything() {
        let cmd = Cmd::new("pkg")
            .args(["--rootdir", "/r"])
            .arg("install")
            .env("ABI", "FreeBSD:14:amd64")
            .dir("/tmp")
            .stdin_bytes("yes\n");

        let spec = cmd.spec();
        assert_eq!(spec.argv(), ["pkg", "--rootdir", "/r", "install"]);
        assert_eq!(spec.env, [("ABI".to_string(), "FreeBSD:14:amd64".to_string())]);
        assert_eq!(spec.dir.as_deref(), Some("/tmp"));
        assert_eq!(spec.stdin, Some(Input::Bytes(b"yes\n".to_vec())));
    }

    #[test]
    fn lines_trims_and_drops_blanks() {
        let runner = RecordingRunner::new().respond("pkg", "  1.2.3 \n\n2.0\n");

        let lines = Cmd::new("pkg").lines(&runner).unwrap();
        assert_eq!(lines, ["1.2.3", "2.0"]);
    }

    #[test]
    fn first_of_empty_output_is_empty() {
        let runner = RecordingRunner::new();
        assert_eq!(Cmd::new("true").first(&runner).unwrap(), "");
    }
}
