//! The remote half: executes commands on behalf of a [`super::Session`].

use std::io::{self, BufRead, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::protocol::{Channel, Control, ExecRequest, Marker, Message};
use super::TransportError;
use crate::process::{Cmd, LocalRunner, Runner};

/// Why the serve loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client closed the stream between commands.
    InputClosed,
    /// The client asked for a shutdown.
    Shutdown,
}

enum Job {
    Running {
        child: Child,
        stdin: Option<ChildStdin>,
        output: JoinHandle<io::Result<Vec<u8>>>,
    },
    /// Could not be started; reported once the client sends `eof`.
    Failed(String),
}

pub struct Server<R, W> {
    channel: Channel<R, W>,
}

impl<R: BufRead, W: Write> Server<R, W> {
    pub fn new(channel: Channel<R, W>) -> Self {
        Self { channel }
    }

    /// Serve commands until the client shuts us down or goes away.
    pub fn serve(mut self) -> Result<Outcome, TransportError> {
        let mut job: Option<Job> = None;

        loop {
            let message = match self.channel.next() {
                Ok(message) => message,
                Err(TransportError::Closed) if job.is_none() => return Ok(Outcome::InputClosed),
                Err(err) => {
                    abandon(job);
                    return Err(err);
                }
            };

            match message {
                Message::Control(Control::Exec, payload) => {
                    if job.is_some() {
                        abandon(job);
                        return Err(TransportError::Protocol("duplicate exec".into()));
                    }
                    let request: ExecRequest = serde_json::from_str(&payload).map_err(|err| {
                        TransportError::Protocol(format!("could not parse exec command: {err}"))
                    })?;
                    job = Some(start(&request));
                }

                Message::Raw(line) => {
                    if let Err(err) = feed(&mut job, &line) {
                        abandon(job);
                        return Err(TransportError::Io(err));
                    }
                }

                Message::Control(Control::Eof, _) => {
                    let Some(current) = job.take() else {
                        return Err(TransportError::Protocol("unexpected eof".into()));
                    };
                    self.finish(current)?;
                }

                Message::Control(Control::Shutdown, _) => {
                    abandon(job);
                    return Ok(Outcome::Shutdown);
                }

                Message::Control(Control::Exited, _) => {
                    abandon(job);
                    return Err(TransportError::Protocol(
                        "unexpected message from remote: exited".into(),
                    ));
                }

                Message::Unknown(command) => {
                    abandon(job);
                    return Err(TransportError::Protocol(format!(
                        "unexpected message from remote: {command:?}"
                    )));
                }
            }
        }
    }

    /// Close the child's input, forward its output, report its status.
    fn finish(&mut self, job: Job) -> Result<(), TransportError> {
        let failure = match job {
            Job::Failed(message) => Some(message),
            Job::Running {
                mut child,
                stdin,
                output,
            } => {
                drop(stdin);

                let output = output
                    .join()
                    .unwrap_or_else(|_| Err(io::Error::other("output reader panicked")));

                let read_failure = match output {
                    Ok(bytes) => {
                        self.channel.send_raw(&bytes)?;
                        if bytes.last().is_some_and(|&byte| byte != b'\n') {
                            self.channel.send_raw(b"\n")?;
                        }
                        None
                    }
                    Err(err) => Some(format!("could not read output: {err}")),
                };

                match child.wait() {
                    Ok(status) if status.success() => read_failure,
                    Ok(status) => Some(status.to_string()),
                    Err(err) => Some(err.to_string()),
                }
            }
        };

        match failure {
            Some(message) => self.channel.send_with(Control::Exited, &message),
            None => self.channel.send(Control::Exited),
        }
    }
}

fn start(request: &ExecRequest) -> Job {
    let Some((program, args)) = request.args.split_first() else {
        return Job::Failed("empty command".into());
    };

    info!(argv = ?request.args, dir = %request.dir, "executing");

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(request.env.iter().filter_map(|pair| pair.split_once('=')))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if !request.dir.is_empty() {
        command.current_dir(&request.dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return Job::Failed(format!("could not start {program}: {err}")),
    };

    let stdin = child.stdin.take();
    let Some(mut stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Job::Failed("stdout pipe unavailable".into());
    };

    // Drain output while the client is still sending input, so a child
    // that writes a lot before reading everything cannot wedge us.
    let output = thread::spawn(move || {
        let mut bytes = Vec::new();
        stdout.read_to_end(&mut bytes)?;
        Ok(bytes)
    });

    Job::Running {
        child,
        stdin,
        output,
    }
}

/// Pass one raw line to the running child's stdin.
fn feed(job: &mut Option<Job>, line: &[u8]) -> io::Result<()> {
    let Some(Job::Running { stdin, .. }) = job else {
        debug!(bytes = line.len(), "discarding input with no command running");
        return Ok(());
    };
    let Some(pipe) = stdin else {
        return Ok(());
    };

    match pipe.write_all(line) {
        // The child stopped reading; drop the rest.
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            *stdin = None;
            Ok(())
        }
        other => other,
    }
}

fn abandon(job: Option<Job>) {
    if let Some(Job::Running {
        mut child, stdin, ..
    }) = job
    {
        drop(stdin);
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Entry point for `serve <marker>`: speak the protocol on stdin/stdout.
///
/// Stdout belongs to the protocol from here on; logs go to stderr.
pub fn serve_stdio(marker: &str, power_off: bool) -> Result<()> {
    let marker = Marker::new(marker)?;
    let stdin = io::stdin();
    let stdout = io::stdout();

    let channel = Channel::new(marker, stdin.lock(), stdout.lock());
    let outcome = Server::new(channel).serve().context("serve loop failed")?;

    match outcome {
        Outcome::InputClosed => info!("client went away, exiting"),
        Outcome::Shutdown if power_off => {
            info!("shutdown requested, powering off");
            LocalRunner
                .run(Cmd::new("halt").arg("-p").spec(), &mut io::sink())
                .context("could not power off")?;
        }
        Outcome::Shutdown => warn!("shutdown requested, exiting without power off"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RunError;
    use crate::transport::session::Session;
    use std::io::BufReader;
    use std::os::unix::net::UnixStream;
    use tempfile::TempDir;

    type Client = Session<BufReader<UnixStream>, UnixStream>;

    fn connect() -> (Client, JoinHandle<Result<Outcome, TransportError>>) {
        let (near, far) = UnixStream::pair().unwrap();
        let marker = Marker::generate();

        let server_marker = marker.clone();
        let server = thread::spawn(move || {
            let reader = BufReader::new(far.try_clone().unwrap());
            Server::new(Channel::new(server_marker, reader, far)).serve()
        });

        let reader = BufReader::new(near.try_clone().unwrap());
        (Session::new(Channel::new(marker, reader, near)), server)
    }

    fn raw_connect() -> (UnixStream, JoinHandle<Result<Outcome, TransportError>>) {
        let (near, far) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            let reader = BufReader::new(far.try_clone().unwrap());
            Server::new(Channel::new(Marker::new("MK").unwrap(), reader, far)).serve()
        });
        (near, server)
    }

    #[test]
    fn test_echo_round_trip() {
        let (mut client, server) = connect();

        let mut out = Vec::new();
        client
            .run(Cmd::new("cat").stdin_bytes("hello\n").spec(), &mut out)
            .unwrap();
        assert_eq!(out, b"hello\n");

        client.shutdown().unwrap();
        assert_eq!(server.join().unwrap().unwrap(), Outcome::Shutdown);
    }

    #[test]
    fn test_failure_keeps_session_usable() {
        let (mut client, server) = connect();

        let err = client
            .run(Cmd::new("sh").args(["-c", "exit 4"]).spec(), &mut Vec::new())
            .unwrap_err();
        match err {
            RunError::Failed { message, .. } => assert!(message.contains('4'), "{message}"),
            other => panic!("unexpected error: {other}"),
        }

        let err = client
            .run(Cmd::new("no_such_program_98765").spec(), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, RunError::Failed { .. }), "{err}");

        let mut out = Vec::new();
        client
            .run(Cmd::new("echo").arg("still here").spec(), &mut out)
            .unwrap();
        assert_eq!(out, b"still here\n");

        drop(client);
        assert_eq!(server.join().unwrap().unwrap(), Outcome::InputClosed);
    }

    #[test]
    fn test_env_and_dir_are_applied() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().canonicalize().unwrap().display().to_string();
        let (mut client, _server) = connect();

        let mut out = Vec::new();
        let cmd = Cmd::new("sh")
            .args(["-c", "echo \"$FLAVOUR\"; pwd"])
            .env("FLAVOUR", "vanilla")
            .dir(dir.clone());
        client.run(cmd.spec(), &mut out).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), format!("vanilla\n{dir}\n"));
    }

    #[test]
    fn test_large_output_does_not_deadlock() {
        let (mut client, _server) = connect();
        let input: String = (0..20_000).map(|i| format!("line {i}\n")).collect();

        let mut out = Vec::new();
        client
            .run(Cmd::new("cat").stdin_bytes(input.clone()).spec(), &mut out)
            .unwrap();
        assert_eq!(out, input.as_bytes());
    }

    #[test]
    fn test_unterminated_output_gets_newline() {
        let (mut client, _server) = connect();

        let mut out = Vec::new();
        client
            .run(Cmd::new("printf").arg("no-newline").spec(), &mut out)
            .unwrap();
        assert_eq!(out, b"no-newline\n");
    }

    #[test]
    fn test_duplicate_exec_is_fatal() {
        let (mut stream, server) = raw_connect();
        stream
            .write_all(b"MK:exec:{\"Args\":[\"cat\"]}\nMK:exec:{\"Args\":[\"cat\"]}\n")
            .unwrap();

        let err = server.join().unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Protocol(ref m) if m.contains("duplicate")));
    }

    #[test]
    fn test_eof_without_exec_is_fatal() {
        let (mut stream, server) = raw_connect();
        stream.write_all(b"MK:eof:\n").unwrap();

        let err = server.join().unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn test_stream_end_mid_command_is_fatal() {
        let (mut stream, server) = raw_connect();
        stream.write_all(b"MK:exec:{\"Args\":[\"cat\"]}\n").unwrap();
        drop(stream);

        let err = server.join().unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
