//! Asset deployment into a mounted container root.
//!
//! An [`Asset`] describes one source of files: OS packages, a downloaded
//! archive, a single downloaded file, or an archive attached to a GitHub
//! release. A [`DeploySession`] deploys a container's assets in order,
//! writing into the root and inferring image metadata (entrypoint, version,
//! annotations) as it goes.
//!
//! Archive content is untrusted. Member names that climb out of the
//! archive are skipped, every write is resolved inside the root, and a
//! symlink pointing outside the root fails the deployment.

pub mod archive;
mod download;
pub mod matcher;
pub(crate) mod materialize;
pub mod package;
pub mod paths;
pub mod template;

pub use matcher::ArchiveFile;
pub use package::{OsVersion, PackageInstaller};
pub use template::TemplateContext;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::fetch::Fetcher;
use crate::process::Runner;
use crate::version::{ReleaseRef, ReleaseResolver, VersionConfig};

/// Install a FreeBSD package.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageAsset {
    pub pkg: String,
}

/// Download an archive and extract selected members.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveAsset {
    /// URL template.
    pub archive: String,
    #[serde(default)]
    pub version: Option<VersionConfig>,
    #[serde(default)]
    pub files: Vec<ArchiveFile>,
}

/// Download a single file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileAsset {
    /// URL template.
    pub file: String,
    #[serde(default)]
    pub version: Option<VersionConfig>,
    /// Destination template; defaults to `/usr/local/{package}/`.
    #[serde(default)]
    pub dst: Option<String>,
}

/// Extract an archive attached to a GitHub release.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseAsset {
    pub release: ReleaseRef,
    /// Pattern selecting the release file by name.
    pub glob: String,
    #[serde(default)]
    pub files: Vec<ArchiveFile>,
}

#[derive(Debug, Clone)]
pub enum Asset {
    Package(PackageAsset),
    Archive(ArchiveAsset),
    File(FileAsset),
    Release(ReleaseAsset),
}

const DISCRIMINATORS: &[&str] = &["pkg", "archive", "file", "release"];

impl<'de> Deserialize<'de> for Asset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let table = toml::Table::deserialize(deserializer)?;
        let present: Vec<&str> = DISCRIMINATORS
            .iter()
            .copied()
            .filter(|key| table.contains_key(*key))
            .collect();
        let value = toml::Value::Table(table);

        let asset = match present.as_slice() {
            ["pkg"] => value.try_into().map(Asset::Package),
            ["archive"] => value.try_into().map(Asset::Archive),
            ["file"] => value.try_into().map(Asset::File),
            ["release"] => value.try_into().map(Asset::Release),
            [] => return Err(D::Error::custom("could not determine asset type")),
            keys => {
                return Err(D::Error::custom(format!(
                    "ambiguous asset type: {}",
                    keys.join(", ")
                )))
            }
        };

        asset.map_err(D::Error::custom)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Package(a) => write!(f, "package {}", a.pkg),
            Asset::Archive(a) => write!(f, "archive {}", a.archive),
            Asset::File(a) => write!(f, "file {}", a.file),
            Asset::Release(a) => write!(f, "release {}", a.release),
        }
    }
}

/// Metadata inferred while deploying.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployResult {
    pub version: Option<String>,
    pub entrypoint: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl DeployResult {
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Fold in a later asset's result: earlier version and entrypoint
    /// win, annotations accumulate with later values overwriting.
    pub fn merge(&mut self, later: DeployResult) {
        if self.version.is_none() {
            self.version = later.version;
        }
        if self.entrypoint.is_none() {
            self.entrypoint = later.entrypoint;
        }
        self.annotations.extend(later.annotations);
    }
}

/// Everything about the current build that assets may depend on.
#[derive(Debug, Clone, Default)]
pub struct DeployContext {
    pub template: TemplateContext,
    /// Base image's FreeBSD version, e.g. `14.1`.
    pub freebsd_version: String,
}

/// A container root filesystem.
///
/// `root` is the path commands see (on the build VM); `mount` is where
/// the VM's filesystem is visible to this process, so files land at
/// `mount/root/...`. For a local build `mount` is `/`.
#[derive(Debug, Clone)]
pub struct RootFs {
    mount: PathBuf,
    root: String,
}

impl RootFs {
    pub fn new(mount: impl Into<PathBuf>, root: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
            root: root.into(),
        }
    }

    /// The root as seen by commands.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Host location of a path on the build VM (outside the container).
    pub fn vm_path(&self, path: &str) -> PathBuf {
        self.mount.join(path.trim_start_matches('/'))
    }

    /// Host location of the container root.
    pub fn host_root(&self) -> PathBuf {
        self.vm_path(&self.root)
    }

    /// Host location of container path `path`, resolved inside the root.
    pub fn host_path(&self, path: &str) -> io::Result<PathBuf> {
        paths::secure_join(&self.host_root(), path)
    }

    pub fn mount(&self) -> &Path {
        &self.mount
    }
}

/// State shared by all asset deployments of one container build.
pub struct DeploySession<'a> {
    runner: &'a dyn Runner,
    fetcher: &'a dyn Fetcher,
    releases: &'a dyn ReleaseResolver,
    packages: PackageInstaller,
}

impl<'a> DeploySession<'a> {
    /// Every package asset in `assets` is installed together, by the first
    /// package asset deployed for each architecture.
    pub fn new(
        runner: &'a dyn Runner,
        fetcher: &'a dyn Fetcher,
        releases: &'a dyn ReleaseResolver,
        assets: &[Asset],
    ) -> Self {
        let packages = assets
            .iter()
            .filter_map(|asset| match asset {
                Asset::Package(p) => Some(p.pkg.clone()),
                _ => None,
            })
            .collect();

        Self {
            runner,
            fetcher,
            releases,
            packages: PackageInstaller::new(packages),
        }
    }

    pub fn deploy(
        &mut self,
        asset: &Asset,
        ctx: &DeployContext,
        root: &RootFs,
    ) -> Result<DeployResult> {
        let result = match asset {
            Asset::Package(_) => self.packages.deploy(self.runner, ctx, root),
            Asset::Archive(a) => download::deploy_archive(
                self.fetcher,
                &a.archive,
                a.version.as_ref(),
                &a.files,
                &ctx.template,
                root,
            ),
            Asset::File(a) => download::deploy_file(self.fetcher, a, &ctx.template, root),
            Asset::Release(a) => {
                download::deploy_release(self.fetcher, self.releases, a, &ctx.template, root)
            }
        };

        result.with_context(|| format!("deploying {} for {}", asset, ctx.template.arch))
    }

    /// Deploy `assets` in order and merge what they infer.
    pub fn deploy_all(
        &mut self,
        assets: &[Asset],
        ctx: &DeployContext,
        root: &RootFs,
    ) -> Result<DeployResult> {
        let mut merged = DeployResult::default();
        for asset in assets {
            merged.merge(self.deploy(asset, ctx, root)?);
        }
        Ok(merged)
    }
}
