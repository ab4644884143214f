//! HTTP downloads.
//!
//! Everything that touches the network goes through [`Fetcher`], so the
//! deployment engine and version resolution can be tested offline.

use std::io::Read;

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Something that can GET a URL.
pub trait Fetcher {
    /// Start a download. A response status of 400 or above is an error.
    fn get(&self, url: &str) -> Result<Box<dyn Read + '_>>;

    /// Download the whole body as text.
    fn get_text(&self, url: &str) -> Result<String> {
        let mut body = String::new();
        self.get(url)?
            .read_to_string(&mut body)
            .with_context(|| format!("reading response from '{}'", url))?;
        Ok(body)
    }
}

/// [`Fetcher`] backed by a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            // Large archives: no overall deadline, only connection setup.
            .timeout(None)
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn get(&self, url: &str) -> Result<Box<dyn Read + '_>> {
        debug!(url, "GET");
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("could not download '{}'", url))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            bail!("could not download '{}': {}", url, status);
        }

        Ok(Box::new(response))
    }
}
