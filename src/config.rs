//! `projects.toml`: build VM settings and container projects.
//!
//! ```toml
//! [remote]
//! addr = "172.16.0.2:22"
//!
//! [defaults.container]
//! user = "app=1000"
//!
//! [projects.caddy]
//! arch = ["amd64", "arm64"]
//!
//! [projects.caddy.container]
//! entrypoint = ["/usr/local/bin/caddy", "run"]
//!
//! [[projects.caddy.container.assets]]
//! pkg = "caddy"
//! ```
//!
//! Every container is hydrated from `[defaults.container]`: a field the
//! project leaves empty takes the default.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::deploy::Asset;
use crate::error::BuildError;
use crate::transport::SshTarget;

pub const DEFAULT_CONFIG: &str = "projects.toml";

/// How to reach and use the build VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub addr: String,
    pub user: String,
    pub private_key: PathBuf,
    /// FreeBSD build of this program, uploaded to serve commands.
    pub executable: PathBuf,
    /// Shell script run on the VM before anything else.
    pub setup_script: Option<PathBuf>,
    /// Where the VM's filesystem is mounted locally.
    pub mount: PathBuf,
    /// Image names are `<registry>/<name>:<tag>`.
    pub registry: String,
    pub ssh: String,
    pub scp: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            addr: "172.16.0.2:22".into(),
            user: "root".into(),
            private_key: PathBuf::from("/etc/ssh/freebsd.id_rsa"),
            executable: PathBuf::from("build/build.freebsd_amd64"),
            setup_script: None,
            mount: PathBuf::from("/mnt/firecracker"),
            registry: "ghcr.io/cynix".into(),
            ssh: "ssh".into(),
            scp: "scp".into(),
        }
    }
}

impl RemoteConfig {
    pub fn target(&self) -> SshTarget {
        SshTarget {
            addr: self.addr.clone(),
            user: self.user.clone(),
            private_key: self.private_key.clone(),
            ssh: self.ssh.clone(),
            scp: self.scp.clone(),
        }
    }

    /// Registry host, for `buildah login`.
    pub fn registry_host(&self) -> &str {
        self.registry
            .split_once('/')
            .map_or(self.registry.as_str(), |(host, _)| host)
    }
}

/// Account the image runs as: `name=uid`, or just `name` for an account
/// the base image already has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerUser {
    pub name: String,
    pub uid: Option<u32>,
}

impl ContainerUser {
    pub fn parse(raw: &str) -> Result<Self, BuildError> {
        let (name, uid) = match raw.split_once('=') {
            Some((name, uid)) => {
                let uid = uid
                    .parse()
                    .map_err(|_| BuildError::config(format!("invalid uid in user {raw:?}")))?;
                (name, Some(uid))
            }
            None => (raw, None),
        };

        if name.is_empty() {
            return Err(BuildError::config(format!("invalid user {raw:?}")));
        }
        Ok(Self {
            name: name.to_string(),
            uid,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Base image name under the registry.
    pub base: Option<String>,
    pub assets: Vec<Asset>,
    pub env: BTreeMap<String, String>,
    pub user: Option<ContainerUser>,
    /// Run with `sh -ex` inside the container root after assets deploy.
    pub script: Option<String>,
    pub entrypoint: Vec<String>,
}

impl ContainerConfig {
    /// Fill every empty field from `defaults`.
    pub fn hydrate(&mut self, defaults: &ContainerConfig) {
        if self.base.is_none() {
            self.base = defaults.base.clone();
        }
        if self.assets.is_empty() {
            self.assets = defaults.assets.clone();
        }
        if self.env.is_empty() {
            self.env = defaults.env.clone();
        }
        if self.user.is_none() {
            self.user = defaults.user.clone();
        }
        if self.script.is_none() {
            self.script = defaults.script.clone();
        }
        if self.entrypoint.is_empty() {
            self.entrypoint = defaults.entrypoint.clone();
        }
    }

    /// Whether any asset installs packages.
    pub fn uses_packages(&self) -> bool {
        self.assets.iter().any(|a| matches!(a, Asset::Package(_)))
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub arch: Vec<String>,
    pub container: ContainerConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub projects: BTreeMap<String, Project>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    #[serde(default)]
    remote: RemoteToml,
    #[serde(default)]
    defaults: DefaultsToml,
    #[serde(default)]
    projects: BTreeMap<String, ProjectToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RemoteToml {
    addr: Option<String>,
    user: Option<String>,
    private_key: Option<PathBuf>,
    executable: Option<PathBuf>,
    setup_script: Option<PathBuf>,
    mount: Option<PathBuf>,
    registry: Option<String>,
    ssh: Option<String>,
    scp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsToml {
    container: Option<ContainerToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectToml {
    arch: Option<Vec<String>>,
    container: ContainerToml,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContainerToml {
    base: Option<String>,
    #[serde(default)]
    assets: Vec<Asset>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    user: Option<String>,
    script: Option<String>,
    entrypoint: Option<EntrypointToml>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EntrypointToml {
    Single(String),
    List(Vec<String>),
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ContainerToml {
    fn into_config(self) -> Result<ContainerConfig, BuildError> {
        let user = non_empty(self.user)
            .map(|user| ContainerUser::parse(&user))
            .transpose()?;
        let entrypoint = match self.entrypoint {
            Some(EntrypointToml::Single(entrypoint)) if !entrypoint.is_empty() => vec![entrypoint],
            Some(EntrypointToml::List(entrypoint)) => entrypoint,
            _ => Vec::new(),
        };

        Ok(ContainerConfig {
            base: non_empty(self.base),
            assets: self.assets,
            env: self.env,
            user,
            script: non_empty(self.script),
            entrypoint,
        })
    }
}

impl RemoteToml {
    fn into_config(self) -> RemoteConfig {
        let defaults = RemoteConfig::default();
        RemoteConfig {
            addr: self.addr.unwrap_or(defaults.addr),
            user: self.user.unwrap_or(defaults.user),
            private_key: self.private_key.unwrap_or(defaults.private_key),
            executable: self.executable.unwrap_or(defaults.executable),
            setup_script: self.setup_script,
            mount: self.mount.unwrap_or(defaults.mount),
            registry: self
                .registry
                .map(|r| r.trim_end_matches('/').to_string())
                .unwrap_or(defaults.registry),
            ssh: self.ssh.unwrap_or(defaults.ssh),
            scp: self.scp.unwrap_or(defaults.scp),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config '{}'", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(text)?;

        let defaults = parsed
            .defaults
            .container
            .map(ContainerToml::into_config)
            .transpose()
            .context("invalid [defaults.container]")?
            .unwrap_or_default();

        let mut projects = BTreeMap::new();
        for (name, project) in parsed.projects {
            let mut container = project
                .container
                .into_config()
                .with_context(|| format!("invalid container for project '{}'", name))?;
            container.hydrate(&defaults);

            let arch = match project.arch {
                Some(arch) if !arch.is_empty() => arch,
                _ => vec!["amd64".to_string()],
            };

            projects.insert(
                name.clone(),
                Project {
                    name,
                    arch,
                    container,
                },
            );
        }

        Ok(Self {
            remote: parsed.remote.into_config(),
            projects,
        })
    }

    pub fn project(&self, name: &str) -> Result<&Project> {
        self.projects
            .get(name)
            .ok_or_else(|| anyhow!("unknown project: {:?}", name))
    }
}
