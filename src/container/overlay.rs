//! Copies a project's `<package>/root` directory over the container root.

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

use crate::deploy::materialize;

/// Copy `src` recursively into the container at host path `root`,
/// preserving modes and symlinks. Returns the number of entries copied.
///
/// Destinations are resolved inside `root`, so symlinks that the base
/// image ships (e.g. `/usr/local/etc`) are followed without escaping it.
pub fn copy_overlay(src: &Path, root: &Path) -> Result<usize> {
    let mut copied = 0;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to read directory: {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("Failed to relativise: {}", entry.path().display()))?;
        let dst = format!("/{}", rel.to_string_lossy());
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            materialize::create_symlink(root, &dst, &target.to_string_lossy())?;
        } else if file_type.is_dir() {
            let mode = entry.metadata()?.permissions().mode();
            materialize::create_dir(root, &dst, mode)?;
        } else {
            let mode = entry.metadata()?.permissions().mode();
            let mut file = File::open(entry.path())
                .with_context(|| format!("Failed to copy file: {}", entry.path().display()))?;
            materialize::write_file(root, &dst, &mut file, mode, None)?;
        }

        debug!(dst = %dst, "copied");
        copied += 1;
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_copy_overlay() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();

        fs::create_dir_all(src.path().join("usr/local/etc/rc.d")).unwrap();
        fs::write(src.path().join("usr/local/etc/app.conf"), "listen = 80\n").unwrap();
        fs::write(src.path().join("usr/local/etc/rc.d/app"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(
            src.path().join("usr/local/etc/rc.d/app"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        symlink("app.conf", src.path().join("usr/local/etc/default.conf")).unwrap();

        // The base image keeps /usr/local/etc elsewhere.
        fs::create_dir_all(root.path().join("etc/local")).unwrap();
        fs::create_dir_all(root.path().join("usr/local")).unwrap();
        symlink("/etc/local", root.path().join("usr/local/etc")).unwrap();

        let copied = copy_overlay(src.path(), root.path()).unwrap();
        assert_eq!(copied, 7);

        let etc = root.path().join("etc/local");
        assert_eq!(fs::read_to_string(etc.join("app.conf")).unwrap(), "listen = 80\n");
        assert_eq!(
            fs::metadata(etc.join("rc.d/app")).unwrap().permissions().mode() & 0o777,
            0o755
        );
        assert_eq!(fs::read_link(etc.join("default.conf")).unwrap(), Path::new("app.conf"));
    }

    #[test]
    fn test_escaping_overlay_symlink_rejected() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        symlink("../../outside", src.path().join("link")).unwrap();

        assert!(copy_overlay(src.path(), root.path()).is_err());
    }
}
