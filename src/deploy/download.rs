//! Assets that are downloaded: archives, single files and release archives.

use std::io::Read;

use anyhow::{anyhow, Context, Result};
use tracing::info;

use super::archive;
use super::matcher::{self, ArchiveFile, Resolver};
use super::paths;
use super::{materialize, DeployResult, FileAsset, ReleaseAsset, RootFs, TemplateContext};
use crate::error::BuildError;
use crate::fetch::Fetcher;
use crate::logging;
use crate::version::{ReleaseResolver, VersionConfig};

const DEFAULT_FILE_DST: &str = "/usr/local/{package}/";
const FILE_MODE: u32 = 0o644;

/// Resolve the version if the build has none, template `url` and start
/// the download. `f` receives the file name taken from the URL path, the
/// effective context and the body.
fn fetch_templated<T>(
    fetcher: &dyn Fetcher,
    url: &str,
    version: Option<&VersionConfig>,
    ctx: &TemplateContext,
    f: impl FnOnce(&str, &TemplateContext, Box<dyn Read + '_>) -> Result<T>,
) -> Result<T> {
    let mut ctx = ctx.clone();
    if ctx.version.is_empty() {
        if let Some(version) = version {
            ctx.version = version.resolve(fetcher)?;
        }
    }

    let url = ctx.apply(url);
    let parsed = reqwest::Url::parse(&url)
        .map_err(|err| BuildError::config(format!("invalid url {url:?}: {err}")))?;
    let filename = paths::basename(parsed.path()).to_string();

    logging::group(&format!("Deploying {url:?}"), || {
        let body = fetcher.get(&url)?;
        f(&filename, &ctx, body)
    })
}

fn non_empty(version: &str) -> Option<String> {
    (!version.is_empty()).then(|| version.to_string())
}

pub(super) fn deploy_archive(
    fetcher: &dyn Fetcher,
    url: &str,
    version: Option<&VersionConfig>,
    files: &[ArchiveFile],
    ctx: &TemplateContext,
    root: &RootFs,
) -> Result<DeployResult> {
    if files.is_empty() {
        return Err(BuildError::config(format!("no files specified for {url:?}")).into());
    }

    fetch_templated(fetcher, url, version, ctx, |filename, ctx, body| {
        let mut resolver = Resolver::new(files, ctx)?;
        let mut tarball = archive::open(filename, body)?;
        let entrypoint =
            archive::extract(filename, &mut tarball, &mut resolver, &root.host_root())?;

        Ok(DeployResult {
            version: non_empty(&ctx.version),
            entrypoint,
            ..Default::default()
        })
    })
}

pub(super) fn deploy_file(
    fetcher: &dyn Fetcher,
    asset: &FileAsset,
    ctx: &TemplateContext,
    root: &RootFs,
) -> Result<DeployResult> {
    fetch_templated(fetcher, &asset.file, asset.version.as_ref(), ctx, |filename, ctx, mut body| {
        let dst = ctx.apply(asset.dst.as_deref().unwrap_or(DEFAULT_FILE_DST));
        let dst = matcher::destination(filename, &dst)?;

        info!(file = filename, dst = %dst, "downloading");
        materialize::write_file(&root.host_root(), &dst, &mut body, FILE_MODE, None)?;

        Ok(DeployResult {
            version: non_empty(&ctx.version),
            entrypoint: Some(dst),
            ..Default::default()
        })
    })
}

pub(super) fn deploy_release(
    fetcher: &dyn Fetcher,
    releases: &dyn ReleaseResolver,
    asset: &ReleaseAsset,
    ctx: &TemplateContext,
    root: &RootFs,
) -> Result<DeployResult> {
    let (release, version) = releases.release(&asset.release)?;

    let ctx = TemplateContext {
        version: version.clone(),
        ..ctx.clone()
    };
    let glob = ctx.apply(&asset.glob);
    let pattern = matcher::Glob::new(&glob)
        .map_err(|err| BuildError::config(format!("invalid release glob {glob:?}: {err}")))?;

    let file = release
        .assets
        .iter()
        .find(|file| pattern.matches(&file.name))
        .ok_or_else(|| {
            anyhow!(
                "could not find matching asset from release in {:?}: {:?}",
                asset.release.repo(),
                glob
            )
        })?;
    info!(release = %asset.release, file = %file.name, version = %version, "using release file");

    let url = &file.browser_download_url;
    let mut result = deploy_archive(fetcher, url, None, &asset.files, &ctx, root)
        .with_context(|| format!("deploying '{}' from {}", file.name, asset.release))?;
    result.version = Some(version.clone());
    result.annotate(
        format!(
            "com.github.repos.{}.{}.version",
            asset.release.owner(),
            asset.release.name()
        ),
        version,
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::archive::testing::{gzip, tarball, Member};
    use crate::fetch::testing::MemoryFetcher;
    use crate::version::{Release, ReleaseFile, ReleaseRef};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct OneRelease(Release);

    #[derive(serde::Deserialize)]
    struct Pinned {
        version: VersionConfig,
    }

    impl ReleaseResolver for OneRelease {
        fn release(&self, _: &ReleaseRef) -> Result<(Release, String)> {
            Ok((self.0.clone(), self.0.tag_name.trim_start_matches('v').to_string()))
        }
    }

    fn ctx(version: &str) -> TemplateContext {
        TemplateContext {
            project: "foo".into(),
            version: version.into(),
            package: "foo".into(),
            arch: "amd64".into(),
            triple: "x86_64-unknown-freebsd".into(),
        }
    }

    fn rules(rules: &[(&str, &str)]) -> Vec<ArchiveFile> {
        rules
            .iter()
            .map(|(src, dst)| ArchiveFile {
                src: src.to_string(),
                dst: dst.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_archive_entrypoint_end_to_end() {
        let temp = TempDir::new().unwrap();
        let root = RootFs::new(temp.path(), "/ctr");
        let body = gzip(&tarball(&[
            Member::Dir("bin", 0o755),
            Member::File("bin/foo", 0o755, b"#!/bin/sh\n"),
            Member::File("README", 0o644, b"docs"),
        ]));
        let fetcher =
            MemoryFetcher::new().serve("https://dl/foo-x86_64-unknown-freebsd.tar.gz", body);

        let result = deploy_archive(
            &fetcher,
            "https://dl/foo-{triple}.tar.gz",
            None,
            &rules(&[("bin/foo", "/usr/local/bin/")]),
            &ctx(""),
            &root,
        )
        .unwrap();

        let placed = temp.path().join("ctr/usr/local/bin/foo");
        assert_eq!(fs::metadata(&placed).unwrap().permissions().mode() & 0o777, 0o755);
        assert_eq!(result.entrypoint.as_deref(), Some("/usr/local/bin/foo"));
        assert_eq!(result.version, None);
        assert!(!temp.path().join("ctr/README").exists());
    }

    #[test]
    fn test_archive_resolves_version_when_unset() {
        let temp = TempDir::new().unwrap();
        let root = RootFs::new(temp.path(), "/ctr");
        let fetcher = MemoryFetcher::new()
            .serve("https://v/latest", "release 2.4.1\n")
            .serve(
                "https://dl/foo-2.4.1.tar.gz",
                gzip(&tarball(&[Member::File("foo-2.4.1/foo", 0o755, b"x")])),
            );
        let version = toml::from_str::<Pinned>(
            "version = { url = \"https://v/latest\", regex = 'release (?P<version>\\S+)' }",
        )
        .unwrap()
        .version;

        let result = deploy_archive(
            &fetcher,
            "https://dl/foo-{version}.tar.gz",
            Some(&version),
            &rules(&[("foo-{version}/foo", "/usr/local/bin/")]),
            &ctx(""),
            &root,
        )
        .unwrap();
        assert_eq!(result.version.as_deref(), Some("2.4.1"));
        assert!(temp.path().join("ctr/usr/local/bin/foo").is_file());

        // A version given for the build wins over the asset's own.
        let fetcher = MemoryFetcher::new().serve(
            "https://dl/foo-9.tar.gz",
            gzip(&tarball(&[Member::File("foo-9/foo", 0o755, b"x")])),
        );
        deploy_archive(
            &fetcher,
            "https://dl/foo-{version}.tar.gz",
            Some(&version),
            &rules(&[("foo-{version}/foo", "/usr/local/bin/")]),
            &ctx("9"),
            &root,
        )
        .unwrap();
        assert_eq!(fetcher.requests(), ["https://dl/foo-9.tar.gz"]);
    }

    #[test]
    fn test_archive_without_rules_is_config_error() {
        let temp = TempDir::new().unwrap();
        let root = RootFs::new(temp.path(), "/ctr");
        let fetcher = MemoryFetcher::new();

        let err =
            deploy_archive(&fetcher, "https://dl/x.tgz", None, &[], &ctx(""), &root).unwrap_err();
        assert!(matches!(err.downcast_ref::<BuildError>(), Some(BuildError::Config(_))));
        assert!(fetcher.requests().is_empty());
    }

    #[test]
    fn test_file_default_destination() {
        let temp = TempDir::new().unwrap();
        let root = RootFs::new(temp.path(), "/ctr");
        let fetcher = MemoryFetcher::new().serve("https://dl/files/foo.conf?raw=1", "k = v\n");
        let asset = FileAsset {
            file: "https://dl/files/{project}.conf?raw=1".into(),
            version: None,
            dst: None,
        };

        let result = deploy_file(&fetcher, &asset, &ctx("1.0"), &root).unwrap();

        assert_eq!(result.entrypoint.as_deref(), Some("/usr/local/foo/foo.conf"));
        assert_eq!(result.version.as_deref(), Some("1.0"));
        assert_eq!(
            fs::read_to_string(temp.path().join("ctr/usr/local/foo/foo.conf")).unwrap(),
            "k = v\n"
        );
    }

    #[test]
    fn test_http_error_fails_deploy() {
        let temp = TempDir::new().unwrap();
        let root = RootFs::new(temp.path(), "/ctr");
        let asset = FileAsset {
            file: "https://dl/missing".into(),
            version: None,
            dst: Some("/etc/".into()),
        };
        assert!(deploy_file(&MemoryFetcher::new(), &asset, &ctx(""), &root).is_err());
        assert!(!temp.path().join("ctr/etc").exists());
    }

    fn release() -> Release {
        Release {
            tag_name: "v0.9.0".into(),
            assets: vec![
                ReleaseFile {
                    name: "tool_0.9.0_linux_amd64.tar.gz".into(),
                    browser_download_url: "https://gh/linux.tar.gz".into(),
                },
                ReleaseFile {
                    name: "tool_0.9.0_freebsd_amd64.tar.gz".into(),
                    browser_download_url: "https://gh/freebsd.tar.gz".into(),
                },
            ],
        }
    }

    #[test]
    fn test_release_picks_matching_file() {
        let temp = TempDir::new().unwrap();
        let root = RootFs::new(temp.path(), "/ctr");
        let fetcher = MemoryFetcher::new().serve(
            "https://gh/freebsd.tar.gz",
            gzip(&tarball(&[Member::File("tool", 0o755, b"bin")])),
        );
        let asset = ReleaseAsset {
            release: ReleaseRef::new("acme/tool", None).unwrap(),
            glob: "*_freebsd_{arch}.{tgz,tar.gz}".into(),
            files: rules(&[("tool", "/usr/local/bin/")]),
        };

        let result =
            deploy_release(&fetcher, &OneRelease(release()), &asset, &ctx(""), &root).unwrap();

        assert_eq!(fetcher.requests(), ["https://gh/freebsd.tar.gz"]);
        assert_eq!(result.version.as_deref(), Some("0.9.0"));
        assert_eq!(result.entrypoint.as_deref(), Some("/usr/local/bin/tool"));
        assert_eq!(result.annotations["com.github.repos.acme.tool.version"], "0.9.0");
    }

    #[test]
    fn test_release_without_match_fails() {
        let temp = TempDir::new().unwrap();
        let root = RootFs::new(temp.path(), "/ctr");
        let asset = ReleaseAsset {
            release: ReleaseRef::new("acme/tool", None).unwrap(),
            glob: "*_windows.zip".into(),
            files: rules(&[("tool", "/usr/local/bin/")]),
        };

        let releases = OneRelease(release());
        let err = deploy_release(&MemoryFetcher::new(), &releases, &asset, &ctx(""), &root)
            .unwrap_err();
        assert!(err.to_string().contains("could not find matching asset"), "{err}");
    }
}
