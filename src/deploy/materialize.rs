//! Writes into the container root.
//!
//! Every host path is derived with [`paths::secure_join`], so a symlink
//! planted by earlier content cannot redirect a write outside the root.
//! Files are opened with `O_NOFOLLOW` and an existing symlink at the
//! destination is replaced rather than written through.

use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{symlink, DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use super::paths;
use crate::error::BuildError;

const PARENT_MODE: u32 = 0o755;

/// Host path for the parent of container path `dst`, created if needed,
/// joined with `dst`'s final component (unresolved).
fn prepare(root: &Path, dst: &str) -> Result<PathBuf> {
    let parent = paths::secure_join(root, paths::dirname(dst))
        .with_context(|| format!("resolving parent of '{}'", dst))?;
    DirBuilder::new()
        .recursive(true)
        .mode(PARENT_MODE)
        .create(&parent)
        .with_context(|| format!("could not create dir '{}'", parent.display()))?;
    Ok(parent.join(paths::basename(dst)))
}

/// Remove whatever non-directory currently sits at `path`.
fn clear(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path)
            .with_context(|| format!("could not replace '{}'", path.display())),
        _ => Ok(()),
    }
}

/// Create directory `dst`. An existing directory, or a symlink resolving
/// to one inside the root, is left as it is.
pub fn create_dir(root: &Path, dst: &str, mode: u32) -> Result<()> {
    let resolved = paths::secure_join(root, dst)
        .with_context(|| format!("resolving '{}'", dst))?;
    if resolved.is_dir() {
        return Ok(());
    }

    let path = prepare(root, dst)?;
    clear(&path)?;

    match DirBuilder::new().mode(mode & 0o777).create(&path) {
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other.with_context(|| format!("could not create dir '{}'", path.display())),
    }
}

/// Create a symlink at `dst`. A target that would resolve outside the
/// root is a [`BuildError::Security`].
pub fn create_symlink(root: &Path, dst: &str, target: &str) -> Result<()> {
    if paths::symlink_escapes(dst, target) {
        return Err(BuildError::security(format!("insecure symlink '{dst}' -> '{target}'")).into());
    }

    let path = prepare(root, dst)?;
    clear(&path)?;
    symlink(paths::clean(target), &path).with_context(|| {
        format!("could not create symlink '{}' -> '{}'", path.display(), target)
    })
}

/// Write `content` to `dst` with permissions `mode`, returning the number
/// of bytes written. If `expected` is given, any other count is an error.
pub fn write_file(
    root: &Path,
    dst: &str,
    content: &mut dyn Read,
    mode: u32,
    expected: Option<u64>,
) -> Result<u64> {
    let path = prepare(root, dst)?;
    clear(&path)?;

    let mode = mode & 0o777;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .custom_flags(libc::O_NOFOLLOW)
        .open(&path)
        .with_context(|| format!("could not create file '{}'", path.display()))?;

    let written = io::copy(content, &mut file)
        .with_context(|| format!("could not write file '{}'", path.display()))?;
    if let Some(expected) = expected {
        if written != expected {
            bail!(
                "wrote {} bytes instead of {} to '{}'",
                written,
                expected,
                path.display()
            );
        }
    }

    // The umask applies at creation; make the mode exact.
    fs::set_permissions(&path, Permissions::from_mode(mode))
        .with_context(|| format!("could not chmod '{}'", path.display()))?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_write_file_creates_parents_and_mode() {
        let temp = TempDir::new().unwrap();
        let mut script = &b"#!/bin/sh\n"[..];
        let n =
            write_file(temp.path(), "/usr/local/bin/tool", &mut script, 0o755, Some(10)).unwrap();

        let path = temp.path().join("usr/local/bin/tool");
        assert_eq!(n, 10);
        assert_eq!(mode_of(&path), 0o755);
        assert_eq!(mode_of(&temp.path().join("usr/local")), 0o755);
    }

    #[test]
    fn test_size_mismatch_is_error() {
        let temp = TempDir::new().unwrap();
        assert!(write_file(temp.path(), "/f", &mut &b"abc"[..], 0o644, Some(4)).is_err());
    }

    #[test]
    fn test_existing_symlink_is_replaced_not_followed() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let victim = outside.path().join("victim");
        fs::write(&victim, "original").unwrap();

        fs::create_dir_all(temp.path().join("etc")).unwrap();
        symlink(&victim, temp.path().join("etc/conf")).unwrap();

        write_file(temp.path(), "/etc/conf", &mut &b"new"[..], 0o644, None).unwrap();

        assert_eq!(fs::read_to_string(&victim).unwrap(), "original");
        let placed = temp.path().join("etc/conf");
        assert!(!fs::symlink_metadata(&placed).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(placed).unwrap(), "new");
    }

    #[test]
    fn test_symlinked_parent_is_resolved_inside_root() {
        let temp = TempDir::new().unwrap();
        symlink("/", temp.path().join("up")).unwrap();

        write_file(temp.path(), "/up/tmp/f", &mut &b"x"[..], 0o644, None).unwrap();
        assert!(temp.path().join("tmp/f").is_file());
    }

    #[test]
    fn test_escaping_symlink_is_security_error() {
        let temp = TempDir::new().unwrap();
        let err = create_symlink(temp.path(), "/usr/bin/x", "../../../etc/shadow").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Security(_))
        ));
        assert!(!temp.path().join("usr").exists());

        create_symlink(temp.path(), "/usr/bin/y", "../lib/y").unwrap();
        assert_eq!(
            fs::read_link(temp.path().join("usr/bin/y")).unwrap(),
            Path::new("../lib/y")
        );
    }

    #[test]
    fn test_existing_dir_is_tolerated() {
        let temp = TempDir::new().unwrap();
        create_dir(temp.path(), "/var/db", 0o700).unwrap();
        create_dir(temp.path(), "/var/db", 0o755).unwrap();
        assert_eq!(mode_of(&temp.path().join("var/db")), 0o700);
    }
}
