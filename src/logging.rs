//! Log setup and step grouping.
//!
//! Logs always go to stderr: in `serve` mode stdout is the protocol
//! channel.

use std::fmt::Display;
use std::io;
use std::time::Instant;

use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the default `info`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Run `f` as a named step: inside its own span, logging when it starts
/// and how it ended.
pub fn group<T, E: Display>(name: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
    let span = info_span!("group", name);
    let _entered = span.enter();
    let started = Instant::now();

    info!("{}", name);
    let result = f();
    let elapsed = started.elapsed().as_secs_f32();
    match &result {
        Ok(_) => info!("{} done ({:.1}s)", name, elapsed),
        Err(err) => warn!("{} failed after {:.1}s: {}", name, elapsed, err),
    }
    result
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_passes_result_through() {
        init();
        assert_eq!(group("ok", || Ok::<_, String>(3)), Ok(3));
        assert_eq!(group("bad", || Err::<u8, _>("boom".to_string())), Err("boom".to_string()));
    }

    #[test]
    fn test_group_logs_failure() {
        let logs = testing::CapturedLogs::default();
        let _ = logs.capture(|| group("fetch", || Err::<(), _>("timed out")));
        assert_eq!(logs.count("fetch failed after"), 1);
        assert_eq!(logs.count("timed out"), 1);
    }
}
