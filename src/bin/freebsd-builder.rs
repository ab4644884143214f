use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use freebsd_builder::config::{Config, DEFAULT_CONFIG};
use freebsd_builder::container::{self, ContainerBuild, RegistryLogin};
use freebsd_builder::deploy::{DeployContext, TemplateContext};
use freebsd_builder::fetch::HttpFetcher;
use freebsd_builder::process::LocalRunner;
use freebsd_builder::transport::{serve_stdio, RemoteRunner};
use freebsd_builder::version::GitHubReleases;
use freebsd_builder::{logging, preflight};

#[derive(Parser)]
#[command(name = "freebsd-builder", version, about = "Build FreeBSD container images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve commands on stdin/stdout (runs on the build VM).
    Serve {
        marker: String,
        /// Do not power the host off on shutdown.
        #[arg(long)]
        no_poweroff: bool,
    },
    /// Build a project's container image on the build VM.
    Container {
        #[arg(long)]
        project: String,
        /// Image tag; inferred from the assets when empty.
        #[arg(long, default_value = "")]
        version: String,
        /// Container (package) name.
        #[arg(long)]
        container: String,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Push the manifest after building.
        #[arg(long)]
        push: bool,
        #[arg(long, env = "REGISTRY_USER")]
        registry_user: Option<String>,
        #[arg(long, env = "REGISTRY_PASSWORD", hide_env_values = true)]
        registry_password: Option<String>,
    },
    /// Deploy a project's assets into a local directory.
    Deploy {
        #[arg(long)]
        project: String,
        #[arg(long)]
        root: PathBuf,
        #[arg(long, default_value = "amd64")]
        arch: String,
        /// FreeBSD release the packages are for.
        #[arg(long, default_value = "14.1")]
        os_version: String,
        #[arg(long, default_value = "")]
        version: String,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Print the parsed configuration.
    Dump {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

fn main() {
    logging::init();

    if let Err(err) = run(Cli::parse()) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve {
            marker,
            no_poweroff,
        } => serve_stdio(&marker, !no_poweroff).context("could not serve"),
        Command::Container {
            project,
            version,
            container,
            config,
            push,
            registry_user,
            registry_password,
        } => {
            let login = match (registry_user, registry_password) {
                (Some(username), Some(password)) => Some(RegistryLogin { username, password }),
                _ => None,
            };
            build_container(&config, &project, &container, &version, push, login.as_ref())
        }
        Command::Deploy {
            project,
            root,
            arch,
            os_version,
            version,
            config,
        } => deploy(&config, &project, &root, &arch, &os_version, &version),
        Command::Dump { config } => {
            let config = Config::load(&config)?;
            println!("{:#?}", config);
            Ok(())
        }
    }
}

fn build_container(
    config_path: &Path,
    project: &str,
    package: &str,
    version: &str,
    push: bool,
    login: Option<&RegistryLogin>,
) -> Result<()> {
    let config = Config::load(config_path)?;
    let project = config.project(project)?;
    preflight::check_remote(&config.remote)?;

    let fetcher = HttpFetcher::new()?;
    let releases = GitHubReleases::new(fetcher.clone());
    let runner = RemoteRunner::new(config.remote.target(), &config.remote.executable);

    let build = ContainerBuild::new(&runner, &fetcher, &releases, &config.remote);
    let images = build
        .build(project, package, version)
        .with_context(|| format!("failed to build {:?}", package))?;
    info!(latest = %images.latest, tagged = ?images.tagged, "built");

    if push {
        build.push(&images, login)?;
    }

    runner.close().context("could not shut down build VM session")?;
    Ok(())
}

fn deploy(
    config_path: &Path,
    project: &str,
    root: &Path,
    arch: &str,
    os_version: &str,
    version: &str,
) -> Result<()> {
    let config = Config::load(config_path)?;
    let project = config.project(project)?;

    let fetcher = HttpFetcher::new()?;
    let releases = GitHubReleases::new(fetcher.clone());
    let ctx = DeployContext {
        template: TemplateContext {
            project: project.name.clone(),
            version: version.to_string(),
            package: project.name.clone(),
            arch: arch.to_string(),
            triple: container::triple(arch)?.to_string(),
        },
        freebsd_version: os_version.to_string(),
    };

    let result = container::deploy_local(
        &LocalRunner,
        &fetcher,
        &releases,
        &project.container.assets,
        &ctx,
        root,
    )?;
    info!(
        entrypoint = ?result.entrypoint,
        version = ?result.version,
        annotations = result.annotations.len(),
        "deployed"
    );
    Ok(())
}
