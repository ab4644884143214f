//! Version and release lookups.
//!
//! These are deliberately simple: a version is either written down in the
//! configuration or scraped from a URL, and a release is GitHub's latest
//! release or one named by tag.

use std::fmt;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::error::BuildError;
use crate::fetch::Fetcher;

/// How to find out an asset's version.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawVersionConfig")]
pub enum VersionConfig {
    /// Used as is.
    Literal(String),
    /// Fetched; with a regex, its `version` capture group is the answer,
    /// otherwise the trimmed body is.
    Remote { url: String, regex: Option<Regex> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVersionConfig {
    Literal(String),
    Remote(RawRemote),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRemote {
    url: String,
    #[serde(default)]
    regex: Option<String>,
}

impl TryFrom<RawVersionConfig> for VersionConfig {
    type Error = BuildError;

    fn try_from(raw: RawVersionConfig) -> Result<Self, Self::Error> {
        match raw {
            RawVersionConfig::Literal(version) if version.starts_with("https://") => {
                Ok(Self::Remote {
                    url: version,
                    regex: None,
                })
            }
            RawVersionConfig::Literal(version) => Ok(Self::Literal(version)),
            RawVersionConfig::Remote(RawRemote { url, regex }) => {
                if !url.starts_with("https://") {
                    return Err(BuildError::config(format!(
                        "invalid url in version config: {url:?}"
                    )));
                }
                let regex = regex.map(|r| version_regex(&r)).transpose()?;
                Ok(Self::Remote { url, regex })
            }
        }
    }
}

/// Compile `pattern`, which must have a `version` capture group.
pub fn version_regex(pattern: &str) -> Result<Regex, BuildError> {
    let regex = Regex::new(pattern)
        .map_err(|err| BuildError::config(format!("invalid version regex {pattern:?}: {err}")))?;
    if !regex.capture_names().flatten().any(|name| name == "version") {
        return Err(BuildError::config(format!(
            "version regex has no `version` group: {pattern:?}"
        )));
    }
    Ok(regex)
}

impl VersionConfig {
    pub fn resolve(&self, fetcher: &dyn Fetcher) -> Result<String> {
        let (url, regex) = match self {
            Self::Literal(version) => return Ok(version.clone()),
            Self::Remote { url, regex } => (url, regex),
        };

        let body = fetcher
            .get_text(url)
            .with_context(|| format!("requesting version from '{}'", url))?;

        let Some(regex) = regex else {
            return Ok(body.trim().to_string());
        };

        regex
            .captures(&body)
            .and_then(|caps| caps.name("version"))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| anyhow!("{:?} did not match version regex: {}", url, regex))
    }
}

/// A GitHub repository and, optionally, the tag of the release to use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawReleaseRef")]
pub struct ReleaseRef {
    repo: String,
    tag: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawReleaseRef {
    Repo(String),
    Full(RawReleaseTable),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReleaseTable {
    repo: String,
    #[serde(default)]
    tag: Option<String>,
}

impl TryFrom<RawReleaseRef> for ReleaseRef {
    type Error = BuildError;

    fn try_from(raw: RawReleaseRef) -> Result<Self, Self::Error> {
        match raw {
            RawReleaseRef::Repo(repo) => Self::new(repo, None),
            RawReleaseRef::Full(RawReleaseTable { repo, tag }) => Self::new(repo, tag),
        }
    }
}

impl ReleaseRef {
    pub fn new(repo: impl Into<String>, tag: Option<String>) -> Result<Self, BuildError> {
        let repo = repo.into();
        match repo.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self { repo, tag })
            }
            _ => Err(BuildError::config(format!("invalid repo: {repo:?}"))),
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn owner(&self) -> &str {
        self.repo.split_once('/').map_or("", |(owner, _)| owner)
    }

    pub fn name(&self) -> &str {
        self.repo.split_once('/').map_or("", |(_, name)| name)
    }
}

impl fmt::Display for ReleaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}@{}", self.repo, tag),
            None => f.write_str(&self.repo),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseFile {
    pub name: String,
    pub browser_download_url: String,
}

/// Looks up a release and the version it represents.
pub trait ReleaseResolver {
    fn release(&self, reference: &ReleaseRef) -> Result<(Release, String)>;
}

/// [`ReleaseResolver`] using the public GitHub REST API.
pub struct GitHubReleases<F> {
    fetcher: F,
    api: String,
}

impl<F: Fetcher> GitHubReleases<F> {
    pub fn new(fetcher: F) -> Self {
        Self::with_api(fetcher, "https://api.github.com")
    }

    pub fn with_api(fetcher: F, api: impl Into<String>) -> Self {
        Self {
            fetcher,
            api: api.into().trim_end_matches('/').to_string(),
        }
    }
}

impl<F: Fetcher> ReleaseResolver for GitHubReleases<F> {
    fn release(&self, reference: &ReleaseRef) -> Result<(Release, String)> {
        let url = match reference.tag() {
            Some(tag) => format!("{}/repos/{}/releases/tags/{}", self.api, reference.repo(), tag),
            None => format!("{}/repos/{}/releases/latest", self.api, reference.repo()),
        };
        info!(release = %reference, "fetching release");

        let body = self
            .fetcher
            .get_text(&url)
            .with_context(|| format!("fetching release for {}", reference))?;
        let release: Release = serde_json::from_str(&body)
            .with_context(|| format!("parsing release for {}", reference))?;

        if release.tag_name.is_empty() {
            bail!("release for {} has no tag", reference);
        }
        let version = release
            .tag_name
            .strip_prefix('v')
            .unwrap_or(&release.tag_name)
            .to_string();

        Ok((release, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::MemoryFetcher;

    #[derive(Deserialize)]
    struct Holder {
        version: VersionConfig,
    }

    fn parse(toml_src: &str) -> Result<VersionConfig, toml::de::Error> {
        toml::from_str::<Holder>(toml_src).map(|h| h.version)
    }

    #[test]
    fn test_literal_version() {
        let config = parse("version = \"1.2.3\"").unwrap();
        let fetcher = MemoryFetcher::new();
        assert_eq!(config.resolve(&fetcher).unwrap(), "1.2.3");
        assert!(fetcher.requests().is_empty());
    }

    #[test]
    fn test_url_string_is_fetched() {
        let config = parse("version = \"https://example.com/VERSION\"").unwrap();
        let fetcher = MemoryFetcher::new().serve("https://example.com/VERSION", " 4.5.6\n");
        assert_eq!(config.resolve(&fetcher).unwrap(), "4.5.6");
    }

    #[test]
    fn test_regex_capture() {
        let config = parse(concat!(
            r#"version = { url = "https://example.com/page", "#,
            r#"regex = 'release-(?P<version>[0-9.]+)\.tar' }"#,
        ))
        .unwrap();
        let fetcher = MemoryFetcher::new()
            .serve("https://example.com/page", "<a href=\"release-2.0.1.tar\">");
        assert_eq!(config.resolve(&fetcher).unwrap(), "2.0.1");

        let miss = MemoryFetcher::new().serve("https://example.com/page", "nothing here");
        assert!(config.resolve(&miss).is_err());
    }

    #[test]
    fn test_invalid_version_configs() {
        assert!(parse(r#"version = { url = "http://insecure" }"#).is_err());
        assert!(parse(r#"version = { url = "https://x", regex = "(no group)" }"#).is_err());
        assert!(parse(r#"version = { url = "https://x", extra = 1 }"#).is_err());
    }

    #[test]
    fn test_release_ref_forms() {
        #[derive(Deserialize)]
        struct Holder {
            release: ReleaseRef,
        }

        let short: Holder = toml::from_str(r#"release = "caddyserver/caddy""#).unwrap();
        assert_eq!(short.release.owner(), "caddyserver");
        assert_eq!(short.release.name(), "caddy");
        assert_eq!(short.release.tag(), None);

        let tagged: Holder =
            toml::from_str(r#"release = { repo = "owner/repo", tag = "v1.0" }"#).unwrap();
        assert_eq!(tagged.release.tag(), Some("v1.0"));

        assert!(toml::from_str::<Holder>(r#"release = "noslash""#).is_err());
        assert!(toml::from_str::<Holder>(r#"release = "a/b/c""#).is_err());
    }

    #[test]
    fn test_github_latest_and_tagged() {
        let body = serde_json::json!({
            "tag_name": "v2.7.6",
            "assets": [{
                "name": "caddy_2.7.6_freebsd_amd64.tar.gz",
                "browser_download_url": "https://dl/caddy.tgz",
                "size": 1,
            }],
        })
        .to_string();
        let fetcher = MemoryFetcher::new()
            .serve("https://api.test/repos/caddyserver/caddy/releases/latest", body.clone())
            .serve("https://api.test/repos/caddyserver/caddy/releases/tags/v2.7.6", body);
        let github = GitHubReleases::with_api(fetcher, "https://api.test/");

        let latest = ReleaseRef::new("caddyserver/caddy", None).unwrap();
        let (release, version) = github.release(&latest).unwrap();
        assert_eq!(version, "2.7.6");
        assert_eq!(release.assets[0].browser_download_url, "https://dl/caddy.tgz");

        let tagged = ReleaseRef::new("caddyserver/caddy", Some("v2.7.6".into())).unwrap();
        assert_eq!(github.release(&tagged).unwrap().1, "2.7.6");
    }
}
