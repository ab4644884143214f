//! Test doubles for [`Runner`].

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use super::{CommandSpec, RunError, Runner};

/// Records every command and answers with canned output per program.
#[derive(Default)]
pub(crate) struct RecordingRunner {
    responses: HashMap<String, String>,
    failures: HashMap<String, String>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl RecordingRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Answer every invocation of `program` with `output`.
    pub(crate) fn respond(mut self, program: &str, output: &str) -> Self {
        self.responses.insert(program.to_string(), output.to_string());
        self
    }

    /// Make every invocation of `program` fail with `message`.
    pub(crate) fn fail(mut self, program: &str, message: &str) -> Self {
        self.failures.insert(program.to_string(), message.to_string());
        self
    }

    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Recorded argv vectors, for compact assertions.
    pub(crate) fn argvs(&self) -> Vec<Vec<String>> {
        self.calls().iter().map(CommandSpec::argv).collect()
    }

    /// Number of recorded calls to `program`, optionally only those passing `arg`.
    pub(crate) fn count(&self, program: &str, arg: Option<&str>) -> usize {
        self.calls()
            .iter()
            .filter(|spec| spec.program == program)
            .filter(|spec| match arg {
                Some(arg) => spec.args.iter().any(|a| a == arg),
                None => true,
            })
            .count()
    }
}

impl Runner for RecordingRunner {
    fn run(&self, spec: &CommandSpec, stdout: &mut dyn Write) -> Result<(), RunError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }

        if let Some(message) = self.failures.get(&spec.program) {
            return Err(RunError::Failed {
                program: spec.program.clone(),
                message: message.clone(),
            });
        }

        if let Some(output) = self.responses.get(&spec.program) {
            stdout
                .write_all(output.as_bytes())
                .map_err(|source| RunError::Io {
                    program: spec.program.clone(),
                    source,
                })?;
        }

        Ok(())
    }
}
