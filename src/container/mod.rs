//! Container image builds with buildah on the build VM.
//!
//! One [`ContainerBuild`] produces a multi-arch manifest for one package:
//! for every architecture it creates a working container from the base
//! image, mounts it, deploys the project's assets into the mount, applies
//! the image configuration and commits it into the manifest. Pushing is a
//! separate step.

mod overlay;

pub use overlay::copy_overlay;

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{ContainerConfig, Project, RemoteConfig};
use crate::deploy::{Asset, DeployContext, DeployResult, DeploySession, RootFs, TemplateContext};
use crate::error::BuildError;
use crate::fetch::Fetcher;
use crate::logging;
use crate::process::{Cmd, Runner};
use crate::version::ReleaseResolver;

/// Annotation on base images carrying their FreeBSD release.
pub const FREEBSD_VERSION_ANNOTATION: &str = "org.freebsd.version";

/// Target triple for a supported architecture.
pub fn triple(arch: &str) -> Result<&'static str, BuildError> {
    match arch {
        "amd64" => Ok("x86_64-unknown-freebsd"),
        "arm64" => Ok("aarch64-unknown-freebsd"),
        other => Err(BuildError::config(format!("unsupported arch: {other:?}"))),
    }
}

/// Fully qualified base image for `container`.
pub fn base_image(registry: &str, container: &ContainerConfig) -> String {
    match &container.base {
        Some(base) => format!("{registry}/{base}"),
        None if container.uses_packages() => format!("{registry}/freebsd:runtime"),
        None => format!("{registry}/freebsd:static"),
    }
}

/// Names of a built manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Images {
    pub latest: String,
    pub tagged: Option<String>,
}

/// Registry credentials for pushing.
#[derive(Clone)]
pub struct RegistryLogin {
    pub username: String,
    pub password: String,
}

/// A buildah working container, removed again however the build ends.
struct WorkingContainer<'a> {
    runner: &'a dyn Runner,
    id: String,
    root: Option<String>,
}

impl<'a> WorkingContainer<'a> {
    fn create(runner: &'a dyn Runner, base: &str, arch: &str) -> Result<Self> {
        info!(arch, base, "creating working container");
        let id = Cmd::new("buildah")
            .arg("from")
            .arg(format!("--arch={arch}"))
            .arg(base)
            .first(runner)
            .map_err(BuildError::from)?;
        if id.is_empty() {
            return Err(BuildError::ExternalTool {
                tool: "buildah".into(),
                message: "from printed no container id".into(),
            }
            .into());
        }

        let mut container = Self {
            runner,
            id,
            root: None,
        };
        let root = container
            .buildah("mount", &[])
            .first(runner)
            .map_err(BuildError::from)?;
        container.root = Some(root);
        Ok(container)
    }

    fn buildah(&self, command: &str, args: &[String]) -> Cmd {
        Cmd::new("buildah")
            .arg(command)
            .args(args.iter().cloned())
            .arg(self.id.as_str())
    }

    fn root(&self) -> &str {
        self.root.as_deref().unwrap_or_default()
    }

    fn commit(mut self, manifest: &str) -> Result<()> {
        info!(id = %self.id, manifest, "committing image");
        self.buildah("unmount", &[]).run(self.runner).map_err(BuildError::from)?;
        self.root = None;

        self.buildah("commit", &[format!("--manifest={manifest}"), "--rm".to_string()])
            .run(self.runner)
            .map_err(BuildError::from)?;
        self.id.clear();
        Ok(())
    }
}

impl Drop for WorkingContainer<'_> {
    fn drop(&mut self) {
        if self.root.take().is_some() {
            if let Err(err) = self.buildah("unmount", &[]).run(self.runner) {
                warn!(id = %self.id, "could not unmount container: {}", err);
            }
        }
        if !self.id.is_empty() {
            if let Err(err) = self.buildah("rm", &[]).run(self.runner) {
                warn!(id = %self.id, "could not remove container: {}", err);
            }
        }
    }
}

pub struct ContainerBuild<'a> {
    runner: &'a dyn Runner,
    fetcher: &'a dyn Fetcher,
    releases: &'a dyn ReleaseResolver,
    remote: &'a RemoteConfig,
    /// Directory holding `<package>/root` overlays.
    workdir: PathBuf,
}

impl<'a> ContainerBuild<'a> {
    pub fn new(
        runner: &'a dyn Runner,
        fetcher: &'a dyn Fetcher,
        releases: &'a dyn ReleaseResolver,
        remote: &'a RemoteConfig,
    ) -> Self {
        Self {
            runner,
            fetcher,
            releases,
            remote,
            workdir: PathBuf::from("."),
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Build `package` of `project` for every configured architecture.
    /// An empty `version` is inferred from the assets.
    fn image(&self, package: &str, tag: &str) -> String {
        format!("{}/{}:{}", self.remote.registry, package, tag)
    }

    pub fn build(&self, project: &Project, package: &str, version: &str) -> Result<Images> {
        let container = &project.container;
        if container.assets.is_empty() {
            let msg = format!("no assets defined for {:?}", project.name);
            return Err(BuildError::config(msg).into());
        }
        for arch in &project.arch {
            triple(arch)?;
        }

        if let Some(script) = &self.remote.setup_script {
            logging::group("Setting up build VM", || {
                Cmd::new("sh")
                    .arg("-e")
                    .stdin_file(script.clone())
                    .run(self.runner)
                    .map_err(BuildError::from)
                    .with_context(|| format!("could not run {}", script.display()))
            })?;
        }

        let base = base_image(&self.remote.registry, container);
        Cmd::new("podman")
            .args(["pull", base.as_str()])
            .run(self.runner)
            .map_err(BuildError::from)
            .with_context(|| format!("could not pull {:?}", base))?;

        let freebsd_version = Cmd::new("podman")
            .args(["image", "inspect"])
            .arg(format!("--format={{{{index .Annotations \"{FREEBSD_VERSION_ANNOTATION}\"}}}}"))
            .arg(base.as_str())
            .first(self.runner)
            .map_err(BuildError::from)
            .with_context(|| format!("could not inspect {:?}", base))?;
        info!(base = %base, freebsd = %freebsd_version, "base image");

        let mut images = Images {
            latest: self.image(package, "latest"),
            tagged: (!version.is_empty()).then(|| self.image(package, version)),
        };

        let mut session =
            DeploySession::new(self.runner, self.fetcher, self.releases, &container.assets);
        for arch in &project.arch {
            let ctx = DeployContext {
                template: TemplateContext {
                    project: project.name.clone(),
                    version: version.to_string(),
                    package: package.to_string(),
                    arch: arch.clone(),
                    triple: triple(arch)?.to_string(),
                },
                freebsd_version: freebsd_version.clone(),
            };

            let inferred = logging::group(&format!("Building {arch}"), || {
                self.build_arch(&mut session, container, &ctx, &base, &images.latest)
            })
            .with_context(|| format!("could not build {} container for {}", package, arch))?;

            if images.tagged.is_none() {
                if let Some(version) = inferred {
                    info!(version = %version, "deduced image version");
                    images.tagged = Some(self.image(package, &version));
                }
            }
        }

        Ok(images)
    }

    /// Returns the version the assets inferred, if any.
    fn build_arch(
        &self,
        session: &mut DeploySession<'_>,
        container: &ContainerConfig,
        ctx: &DeployContext,
        base: &str,
        manifest: &str,
    ) -> Result<Option<String>> {
        let working = WorkingContainer::create(self.runner, base, &ctx.template.arch)?;
        let root = RootFs::new(&self.remote.mount, working.root());

        let overlay = self.workdir.join(&ctx.template.package).join("root");
        if overlay.is_dir() {
            info!(src = %overlay.display(), "copying overlay");
            copy_overlay(&overlay, &root.host_root())
                .with_context(|| format!("could not copy {}", overlay.display()))?;
        }

        if let Some(user) = &container.user {
            if let Some(uid) = user.uid {
                info!(user = %user.name, uid, "creating user");
                let uid = uid.to_string();
                Cmd::new("pw")
                    .args(["-R", root.root(), "groupadd", "-n"])
                    .args([user.name.as_str(), "-g", uid.as_str()])
                    .run(self.runner)
                    .map_err(BuildError::from)
                    .with_context(|| format!("could not create group {:?}", user.name))?;
                Cmd::new("pw")
                    .args(["-R", root.root(), "useradd", "-n", user.name.as_str()])
                    .args(["-u", uid.as_str(), "-g", user.name.as_str()])
                    .args(["-d", "/nonexistent", "-s", "/sbin/nologin"])
                    .run(self.runner)
                    .map_err(BuildError::from)
                    .with_context(|| format!("could not create user {:?}", user.name))?;
            }
        }

        let mut merged = DeployResult::default();
        for asset in &container.assets {
            let result = session.deploy(asset, ctx, &root)?;

            if container.entrypoint.is_empty() && merged.entrypoint.is_none() {
                if let (Some(entrypoint), Asset::File(_)) = (&result.entrypoint, asset) {
                    let path = root.host_path(entrypoint)?;
                    fs::set_permissions(&path, Permissions::from_mode(0o755))
                        .with_context(|| format!("could not chmod entrypoint {:?}", entrypoint))?;
                }
            }
            merged.merge(result);
        }

        restrict_sbin(&root)?;

        if let Some(script) = &container.script {
            logging::group("Running build script", || {
                Cmd::new("sh")
                    .arg("-ex")
                    .dir(root.root())
                    .stdin_bytes(script.as_str())
                    .run(self.runner)
                    .map_err(BuildError::from)
                    .context("could not run build script")
            })?;
        }

        let args = config_args(container, &merged)?;
        logging::group("Configuring image", || {
            for arg in &args {
                info!("{}", arg);
            }
            working
                .buildah("config", &args)
                .run(self.runner)
                .map_err(BuildError::from)
                .context("could not configure container")
        })?;

        working.commit(manifest).context("could not commit container")?;
        Ok(merged.version)
    }

    /// Log in to the registry and push both manifest names.
    pub fn push(&self, images: &Images, login: Option<&RegistryLogin>) -> Result<()> {
        if let Some(login) = login {
            let host = self.remote.registry_host();
            Cmd::new("buildah")
                .arg("login")
                .arg(format!("--username={}", login.username))
                .args(["--password-stdin", host])
                .stdin_bytes(login.password.as_str())
                .run(self.runner)
                .map_err(BuildError::from)
                .with_context(|| format!("could not login to {}", host))?;
        }

        let targets = std::iter::once(&images.latest).chain(images.tagged.as_ref());
        for target in targets {
            logging::group(&format!("Pushing {target}"), || {
                Cmd::new("buildah")
                    .args(["manifest", "push", "--all", images.latest.as_str()])
                    .arg(format!("docker://{target}"))
                    .run(self.runner)
                    .map_err(BuildError::from)
                    .with_context(|| format!("could not push {:?}", target))
            })?;
        }
        Ok(())
    }
}

/// `/usr/local/sbin` is executable but not listable by other users.
fn restrict_sbin(root: &RootFs) -> Result<()> {
    let sbin = root.host_path("/usr/local/sbin")?;
    match fs::set_permissions(&sbin, Permissions::from_mode(0o711)) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            Err(err).with_context(|| format!("could not chmod {}", sbin.display()))
        }
        _ => Ok(()),
    }
}

/// Arguments for `buildah config`.
fn config_args(container: &ContainerConfig, inferred: &DeployResult) -> Result<Vec<String>> {
    let mut args = vec!["--cmd=[]".to_string()];

    for (key, value) in &inferred.annotations {
        args.push(format!("--annotation={key}={value}"));
    }

    let entrypoint = if container.entrypoint.is_empty() {
        inferred.entrypoint.iter().cloned().collect()
    } else {
        container.entrypoint.clone()
    };
    if entrypoint.is_empty() {
        warn!("no entrypoint configured or inferred");
    }
    args.push(format!("--entrypoint={}", serde_json::to_string(&entrypoint)?));
    args.push("--cmd=".to_string());

    for (key, value) in &container.env {
        args.push(format!("--env={key}={value}"));
    }

    if let Some(user) = &container.user {
        args.push(format!("--user={0}:{0}", user.name));
    }

    Ok(args)
}

/// Deploy `assets` straight into a local directory, without buildah.
pub fn deploy_local(
    runner: &dyn Runner,
    fetcher: &dyn Fetcher,
    releases: &dyn ReleaseResolver,
    assets: &[Asset],
    ctx: &DeployContext,
    dir: &Path,
) -> Result<DeployResult> {
    let dir = dir
        .canonicalize()
        .with_context(|| format!("could not resolve {}", dir.display()))?;
    let root = RootFs::new("/", dir.to_string_lossy());
    let mut session = DeploySession::new(runner, fetcher, releases, assets);
    session.deploy_all(assets, ctx, &root)
}
