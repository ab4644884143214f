//! Line framing shared by both ends of a session.
//!
//! Every line on the stream is either raw passthrough (process input or
//! output) or a control line `<marker>:<command>:<payload>`, where the
//! payload is empty or one line of JSON. There is no length prefix: a raw
//! line that happens to start with `<marker>:` would be misread as control
//! traffic, so the marker is a fresh random token per session.

use std::fmt;
use std::io::{BufRead, Write};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::TransportError;
use crate::process::CommandSpec;

const MARKER_LEN: usize = 26;

/// Per-session token that prefixes control lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker(String);

impl Marker {
    pub fn generate() -> Self {
        let token = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(MARKER_LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Accept a caller-supplied marker. It must be non-empty and must not
    /// contain the field separator or a line break.
    pub fn new(token: impl Into<String>) -> Result<Self, TransportError> {
        let token = token.into();
        if token.is_empty() || token.contains([':', '\n', '\r']) {
            return Err(TransportError::Protocol(format!(
                "invalid message marker: {token:?}"
            )));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Control commands understood by both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Exec,
    Eof,
    Exited,
    Shutdown,
}

impl Control {
    pub fn as_str(self) -> &'static str {
        match self {
            Control::Exec => "exec",
            Control::Eof => "eof",
            Control::Exited => "exited",
            Control::Shutdown => "shutdown",
        }
    }

    fn parse(command: &str) -> Option<Self> {
        match command {
            "exec" => Some(Control::Exec),
            "eof" => Some(Control::Eof),
            "exited" => Some(Control::Exited),
            "shutdown" => Some(Control::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of protocol traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Passthrough bytes, including the line terminator when present.
    Raw(Vec<u8>),
    /// A control line and its (possibly empty) payload.
    Control(Control, String),
    /// A marker-prefixed line with a command nobody understands.
    Unknown(String),
}

/// Payload of an `exec` control message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecRequest {
    /// Program followed by its arguments.
    pub args: Vec<String>,
    /// `KEY=value` overrides.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub dir: String,
}

impl From<&CommandSpec> for ExecRequest {
    fn from(spec: &CommandSpec) -> Self {
        Self {
            args: spec.argv(),
            env: spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            dir: spec.dir.clone().unwrap_or_default(),
        }
    }
}

/// A marker-framed line stream over a reader/writer pair.
pub struct Channel<R, W> {
    marker: Marker,
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> Channel<R, W> {
    pub fn new(marker: Marker, reader: R, writer: W) -> Self {
        Self {
            marker,
            reader,
            writer,
        }
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    /// Direct access to the write half, for streaming raw bytes.
    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Send a control message with an empty payload.
    pub fn send(&mut self, command: Control) -> Result<(), TransportError> {
        writeln!(self.writer, "{}:{}:", self.marker, command)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Send a control message with a JSON payload.
    pub fn send_with<T: Serialize>(
        &mut self,
        command: Control,
        payload: &T,
    ) -> Result<(), TransportError> {
        let json = serde_json::to_string(payload).map_err(|err| {
            TransportError::Protocol(format!("could not encode {command} payload: {err}"))
        })?;
        writeln!(self.writer, "{}:{}:{}", self.marker, command, json)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Write passthrough bytes. Not flushed until the next control message.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    /// Read the next line. End of stream is [`TransportError::Closed`].
    pub fn next(&mut self) -> Result<Message, TransportError> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Err(TransportError::Closed);
        }
        Ok(self.decode(line))
    }

    fn decode(&self, line: Vec<u8>) -> Message {
        let prefix = self.marker.as_str().as_bytes();
        let is_control = line.len() > prefix.len()
            && line.starts_with(prefix)
            && line[prefix.len()] == b':';
        if !is_control {
            return Message::Raw(line);
        }

        let body = &line[prefix.len() + 1..];
        let body = body.strip_suffix(b"\n").unwrap_or(body);
        let body = String::from_utf8_lossy(body).into_owned();
        let (command, payload) = body.split_once(':').unwrap_or((body.as_str(), ""));

        match Control::parse(command) {
            Some(control) => Message::Control(control, payload.to_string()),
            None => Message::Unknown(command.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn channel(input: &str) -> Channel<Cursor<Vec<u8>>, Vec<u8>> {
        Channel::new(
            Marker::new("M4RK").unwrap(),
            Cursor::new(input.as_bytes().to_vec()),
            Vec::new(),
        )
    }

    #[test]
    fn test_control_lines_are_framed() {
        let mut ch = channel("");
        ch.send(Control::Eof).unwrap();
        ch.send_with(Control::Exited, &"exit status: 1").unwrap();
        ch.send_raw(b"raw\n").unwrap();

        let written = String::from_utf8(ch.writer().clone()).unwrap();
        assert_eq!(written, "M4RK:eof:\nM4RK:exited:\"exit status: 1\"\nraw\n");
    }

    #[test]
    fn test_decode_distinguishes_raw_and_control() {
        let mut ch = channel(concat!(
            "hello\n",
            "M4RK:exited:\n",
            "M4RK:exec:{\"Args\":[\"ls\"]}\n",
            "M4RK:bogus:\n",
            "M4RKnot-control\n",
        ));

        assert_eq!(ch.next().unwrap(), Message::Raw(b"hello\n".to_vec()));
        assert_eq!(
            ch.next().unwrap(),
            Message::Control(Control::Exited, String::new())
        );
        assert_eq!(
            ch.next().unwrap(),
            Message::Control(Control::Exec, "{\"Args\":[\"ls\"]}".to_string())
        );
        assert_eq!(ch.next().unwrap(), Message::Unknown("bogus".to_string()));
        assert_eq!(ch.next().unwrap(), Message::Raw(b"M4RKnot-control\n".to_vec()));
        assert!(matches!(ch.next(), Err(TransportError::Closed)));
    }

    #[test]
    fn test_payload_may_contain_separators() {
        let mut ch = channel("M4RK:exited:\"a: b\"\n");
        assert_eq!(
            ch.next().unwrap(),
            Message::Control(Control::Exited, "\"a: b\"".to_string())
        );
    }

    #[test]
    fn test_last_line_without_newline_is_raw() {
        let mut ch = channel("partial");
        assert_eq!(ch.next().unwrap(), Message::Raw(b"partial".to_vec()));
    }

    #[test]
    fn test_marker_validation() {
        assert!(Marker::new("").is_err());
        assert!(Marker::new("a:b").is_err());
        assert!(Marker::new("a\nb").is_err());

        let generated = Marker::generate();
        assert_eq!(generated.as_str().len(), MARKER_LEN);
        assert_ne!(generated, Marker::generate());
    }

    #[test]
    fn test_exec_request_from_spec() {
        let spec = CommandSpec {
            program: "pkg".into(),
            args: vec!["install".into()],
            env: vec![("ABI".into(), "FreeBSD:14:amd64".into())],
            dir: None,
            stdin: None,
        };
        let request = ExecRequest::from(&spec);
        assert_eq!(request.args, ["pkg", "install"]);
        assert_eq!(request.env, ["ABI=FreeBSD:14:amd64"]);
        assert_eq!(request.dir, "");

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"Args\""), "{json}");
    }
}
