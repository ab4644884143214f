//! FreeBSD packages installed with `pkg --rootdir`.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::{DeployContext, DeployResult, RootFs};
use crate::error::BuildError;
use crate::logging;
use crate::process::{Cmd, Runner};

/// Library directories always passed to `ldconfig`.
const STANDARD_LIB_DIRS: &[&str] = &["/lib", "/usr/lib", "/usr/local/lib"];

/// A FreeBSD release as reported by the base image, e.g. `14.1-RELEASE-p3`
/// reduced to its major and minor numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsVersion {
    major: String,
    minor: String,
}

impl OsVersion {
    /// Accepts `MM.N` with an optional patch suffix starting at `p` or
    /// `-`, and the compact `MMpN` form.
    pub fn parse(version: &str) -> Result<Self, BuildError> {
        let invalid = || BuildError::config(format!("invalid FreeBSD version: {version:?}"));

        let (major, minor) = match version.split_once('.') {
            Some((major, rest)) => {
                let end = rest.find(['p', '-']).unwrap_or(rest.len());
                (major, &rest[..end])
            }
            None => version.split_once('p').ok_or_else(invalid)?,
        };

        let digits = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_digit());
        if !digits(major, 2) || !digits(minor, 1) {
            return Err(invalid());
        }

        Ok(Self {
            major: major.to_string(),
            minor: minor.to_string(),
        })
    }

    /// `ABI` value for `pkg`, e.g. `FreeBSD:14:aarch64`.
    pub fn abi(&self, arch: &str) -> String {
        let machine = if arch == "arm64" { "aarch64" } else { arch };
        format!("FreeBSD:{}:{}", self.major, machine)
    }

    /// `OSVERSION` value for `pkg`, e.g. `1401000`.
    pub fn osversion(&self) -> String {
        format!("{}0{}000", self.major, self.minor)
    }
}

/// Installs every package of a container at most once per architecture.
#[derive(Debug, Default)]
pub struct PackageInstaller {
    packages: Vec<String>,
    installed: HashSet<String>,
}

impl PackageInstaller {
    pub fn new(packages: Vec<String>) -> Self {
        Self {
            packages,
            installed: HashSet::new(),
        }
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    pub fn deploy(
        &mut self,
        runner: &dyn Runner,
        ctx: &DeployContext,
        root: &RootFs,
    ) -> Result<DeployResult> {
        let arch = &ctx.template.arch;
        if self.packages.is_empty() || self.installed.contains(arch) {
            return Ok(DeployResult::default());
        }

        let os = OsVersion::parse(&ctx.freebsd_version)?;
        let abi = os.abi(arch);
        let osversion = os.osversion();
        let pkg = |command: &str| {
            Cmd::new("pkg")
                .args(["--rootdir", root.root(), command])
                .env("ABI", abi.as_str())
                .env("ASSUME_ALWAYS_YES", "yes")
                .env("OSVERSION", osversion.as_str())
                .env("PKG_CACHEDIR", "/tmp/pkg")
        };

        logging::group("Installing packages", || {
            pkg("install")
                .args(&self.packages)
                .run(runner)
                .map_err(BuildError::from)
                .context("could not install packages")
        })?;
        self.installed.insert(arch.clone());

        let mut result = DeployResult {
            entrypoint: Some(format!("/usr/local/bin/{}", self.packages[0])),
            ..Default::default()
        };

        let versions = pkg("query")
            .arg("%v")
            .args(&self.packages)
            .lines(runner)
            .map_err(BuildError::from)
            .context("could not query package versions")?;
        for (name, version) in self.packages.iter().zip(&versions) {
            if result.version.is_none() {
                result.version = Some(version.clone());
            }
            result.annotate(format!("org.freebsd.pkg.{name}.version"), version.clone());
        }

        for cache in ["/var/cache/pkg", "/var/db/pkg"] {
            let path = root.host_path(cache)?;
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), "could not clean up: {}", err),
            }
        }

        rebuild_linker_hints(runner, root)?;
        Ok(result)
    }
}

/// Run `ldconfig` over the standard library directories plus those
/// listed in the packages' `libdata/ldconfig` hint files.
fn rebuild_linker_hints(runner: &dyn Runner, root: &RootFs) -> Result<()> {
    let mut dirs: BTreeSet<String> = STANDARD_LIB_DIRS.iter().map(|d| d.to_string()).collect();

    let hints = root.host_path("/usr/local/libdata/ldconfig")?;
    let pattern = format!("{}/*", glob::Pattern::escape(&hints.display().to_string()));
    for file in glob::glob(&pattern).context("invalid ldconfig hints pattern")? {
        let file = file.context("listing ldconfig hints")?;
        let content = fs::read_to_string(&file)
            .with_context(|| format!("could not read file '{}'", file.display()))?;
        dirs.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    // ldconfig runs on the build host, so the directories must exist
    // there as well as in the container.
    for dir in &dirs {
        let host = root.vm_path(dir);
        fs::create_dir_all(&host)
            .with_context(|| format!("could not create dir '{}'", host.display()))?;
    }

    info!(dirs = dirs.len(), "rebuilding linker hints");
    Cmd::new("ldconfig")
        .arg("-f")
        .arg(format!("{}/var/run/ld-elf.so.hints", root.root().trim_end_matches('/')))
        .args(dirs)
        .run(runner)
        .map_err(BuildError::from)
        .context("could not rebuild linker hints")
}
