use std::io::{self, BufRead, Write};

use super::protocol::{Channel, Control, ExecRequest, Message};
use super::TransportError;
use crate::process::{CommandSpec, RunError};

/// Client half of the protocol: one command at a time over a [`Channel`].
///
/// `run` takes `&mut self`, so a session can never have two commands in
/// flight; callers sharing a session serialise through a lock.
pub struct Session<R, W> {
    channel: Channel<R, W>,
}

impl<R: BufRead, W: Write> Session<R, W> {
    pub fn new(channel: Channel<R, W>) -> Self {
        Self { channel }
    }

    /// Execute `spec` on the remote side, streaming its output into `stdout`.
    ///
    /// A [`RunError::Transport`] means the session is unusable afterwards.
    pub fn run(&mut self, spec: &CommandSpec, stdout: &mut dyn Write) -> Result<(), RunError> {
        self.channel
            .send_with(Control::Exec, &ExecRequest::from(spec))?;

        if let Some(input) = &spec.stdin {
            let mut writer = TrackLastByte::new(self.channel.writer());
            input.copy_to(&mut writer).map_err(TransportError::Io)?;
            // The remote side forwards whole lines only.
            if writer.last.is_some_and(|byte| byte != b'\n') {
                writer.write_all(b"\n").map_err(TransportError::Io)?;
            }
        }

        self.channel.send(Control::Eof)?;

        // Keep reading after a local sink failure so the stream stays in
        // step; report the failure once the command has exited.
        let mut sink_error: Option<io::Error> = None;

        loop {
            match self.channel.next()? {
                Message::Raw(line) => {
                    if sink_error.is_none() {
                        if let Err(err) = stdout.write_all(&line) {
                            sink_error = Some(err);
                        }
                    }
                }
                Message::Control(Control::Exited, payload) => {
                    let status = exit_status(spec, &payload);
                    return match sink_error {
                        Some(source) => Err(RunError::Io {
                            program: spec.program.clone(),
                            source,
                        }),
                        None => status,
                    };
                }
                Message::Control(other, _) => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected message from remote: {other:?}"
                    ))
                    .into())
                }
                Message::Unknown(command) => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected message from remote: {command:?}"
                    ))
                    .into())
                }
            }
        }
    }

    /// Ask the remote side to shut down. No reply is expected.
    pub fn shutdown(&mut self) -> Result<(), TransportError> {
        self.channel.send(Control::Shutdown)
    }
}

fn exit_status(spec: &CommandSpec, payload: &str) -> Result<(), RunError> {
    if payload.trim().is_empty() {
        return Ok(());
    }

    let message: String = serde_json::from_str(payload).map_err(|err| {
        TransportError::Protocol(format!("could not parse exit status {payload:?}: {err}"))
    })?;

    Err(RunError::Failed {
        program: spec.program.clone(),
        message,
    })
}

struct TrackLastByte<'a, W> {
    inner: &'a mut W,
    last: Option<u8>,
}

impl<'a, W: Write> TrackLastByte<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, last: None }
    }
}

impl<W: Write> Write for TrackLastByte<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        if written > 0 {
            self.last = Some(buf[written - 1]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
