use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::thread;

use tracing::debug;

use super::{CommandSpec, RunError, Runner};

/// Runs commands as child processes of this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRunner;

impl Runner for LocalRunner {
    fn run(&self, spec: &CommandSpec, stdout: &mut dyn Write) -> Result<(), RunError> {
        debug!(argv = ?spec.argv(), dir = ?spec.dir, "running command");

        let io_err = |source| RunError::Io {
            program: spec.program.clone(),
            source,
        };

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &spec.dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(io_err)?;
        let pipe = child.stdin.take();
        let mut output = child
            .stdout
            .take()
            .ok_or_else(|| io_err(io::Error::other("stdout pipe unavailable")))?;

        // Feed stdin on a helper thread so a chatty child cannot block us
        // while we are still writing its input.
        let copied = thread::scope(|scope| {
            let feeder = match (pipe, &spec.stdin) {
                (Some(mut pipe), Some(input)) => Some(scope.spawn(move || {
                    match input.copy_to(&mut pipe) {
                        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                        other => other.map(|_| ()),
                    }
                })),
                _ => None,
            };

            let copied = io::copy(&mut output, stdout);
            if copied.is_err() {
                // Nothing drains the child any more, so the feeder could
                // wait on it forever.
                let _ = child.kill();
            }
            let fed = feeder
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")))
                })
                .unwrap_or(Ok(()));

            copied.and(fed)
        });

        if let Err(err) = copied {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io_err(err));
        }

        let status = child.wait().map_err(io_err)?;
        if !status.success() {
            return Err(RunError::Failed {
                program: spec.program.clone(),
                message: status.to_string(),
            });
        }

        Ok(())
    }
}
