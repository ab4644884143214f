//! Archive format detection and rule-driven extraction.

use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use tar::EntryType;
use tracing::{debug, info, warn};

use super::matcher::{Resolution, Resolver};
use super::{materialize, paths};

/// Enough to see the `ustar` magic at offset 257.
const SNIFF_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Gzip,
    Zstd,
    Tar,
}

/// Identify a stream from its first bytes, falling back to the file name
/// for old-style tarballs without the `ustar` magic.
pub fn identify(filename: &str, head: &[u8]) -> Result<Format> {
    if head.starts_with(&[0x1f, 0x8b]) {
        return Ok(Format::Gzip);
    }
    if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        return Ok(Format::Zstd);
    }
    if head.len() >= 262 && &head[257..262] == b"ustar" {
        return Ok(Format::Tar);
    }

    let unsupported = if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Some("xz")
    } else if head.starts_with(b"BZh") {
        Some("bzip2")
    } else if head.starts_with(b"PK\x03\x04") {
        Some("zip")
    } else {
        None
    };
    if let Some(kind) = unsupported {
        bail!("unsupported archive format ({}) for '{}'", kind, filename);
    }

    if filename.ends_with(".tar") {
        return Ok(Format::Tar);
    }

    bail!("could not identify archive format of '{}'", filename)
}

fn sniff<'a>(
    filename: &str,
    mut reader: Box<dyn Read + 'a>,
) -> Result<(Format, Box<dyn Read + 'a>)> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    (&mut reader)
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .with_context(|| format!("reading '{}'", filename))?;

    let format = identify(filename, &head)?;
    Ok((format, Box::new(Cursor::new(head).chain(reader))))
}

/// Open a possibly compressed tarball.
pub fn open<'a>(
    filename: &str,
    reader: Box<dyn Read + 'a>,
) -> Result<tar::Archive<Box<dyn Read + 'a>>> {
    let (format, reader) = sniff(filename, reader)?;
    let (inner_name, reader): (String, Box<dyn Read + 'a>) = match format {
        Format::Tar => return Ok(tar::Archive::new(reader)),
        Format::Gzip => (
            strip_ext(filename, &[".tgz", ".gz"]),
            Box::new(GzDecoder::new(reader)),
        ),
        Format::Zstd => (
            strip_ext(filename, &[".tzst", ".zst"]),
            Box::new(
                zstd::stream::read::Decoder::new(reader)
                    .with_context(|| format!("opening zstd stream '{}'", filename))?,
            ),
        ),
    };

    match sniff(&inner_name, reader)? {
        (Format::Tar, reader) => Ok(tar::Archive::new(reader)),
        _ => bail!("could not extract '{}': not a tar archive", filename),
    }
}

fn strip_ext(filename: &str, exts: &[&str]) -> String {
    for ext in exts {
        if let Some(stem) = filename.strip_suffix(ext) {
            return match *ext {
                ".tgz" | ".tzst" => format!("{stem}.tar"),
                _ => stem.to_string(),
            };
        }
    }
    filename.to_string()
}

/// Extract the members of `archive` that `resolver` maps, into the host
/// directory `root`. Returns the inferred entrypoint, if any.
pub fn extract<R: Read>(
    filename: &str,
    archive: &mut tar::Archive<R>,
    resolver: &mut Resolver,
    root: &Path,
) -> Result<Option<String>> {
    let mut entrypoint: Option<String> = None;
    let mut pruned: Vec<String> = Vec::new();

    for entry in archive
        .entries()
        .with_context(|| format!("reading '{}'", filename))?
    {
        let mut entry = entry.with_context(|| format!("reading '{}'", filename))?;
        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let kind = entry.header().entry_type();
        let is_dir = kind.is_dir();

        let Some(name) = paths::entry_name(&raw) else {
            warn!(archive = filename, entry = %raw, "ignoring unsafe path");
            continue;
        };

        if pruned.iter().any(|dir| is_under(&name, dir)) {
            continue;
        }

        let (dst, rule) = match resolver.resolve(&name, is_dir)? {
            Resolution::Matched { dst, rule } => (dst, rule),
            Resolution::Unmatched => {
                debug!(entry = %name, "skipping");
                if is_dir && !resolver.may_match_under(&name) {
                    pruned.push(name);
                }
                continue;
            }
            Resolution::Conflict {
                rule,
                existing,
                candidate,
            } => {
                warn!(
                    archive = filename,
                    rule = %rule,
                    existing = %existing,
                    candidate = %candidate,
                    "ignoring duplicate match"
                );
                if is_dir {
                    pruned.push(name);
                }
                continue;
            }
        };

        let mode = entry
            .header()
            .mode()
            .with_context(|| format!("reading mode of '{}'", name))?;

        let placeable = matches!(
            kind,
            EntryType::Directory | EntryType::Regular | EntryType::Continuous | EntryType::Symlink
        );
        if !placeable {
            warn!(
                archive = filename,
                entry = %name,
                kind = ?kind,
                "ignoring unsupported entry type"
            );
            continue;
        }

        if rule == 0 && !is_dir && mode & 0o111 != 0 && entrypoint.is_none() {
            entrypoint = Some(dst.clone());
        }

        info!(entry = %name, dst = %dst, "extracting");

        match kind {
            EntryType::Directory => materialize::create_dir(root, &dst, mode)?,
            EntryType::Symlink => {
                let target = entry
                    .link_name_bytes()
                    .map(|t| String::from_utf8_lossy(&t).into_owned())
                    .unwrap_or_default();
                if target.is_empty() {
                    bail!("symlink '{}' in '{}' has no target", name, filename);
                }
                materialize::create_symlink(root, &dst, &target)
                    .with_context(|| format!("extracting '{}' from '{}'", name, filename))?;
            }
            _ => {
                let size = entry.header().size()?;
                materialize::write_file(root, &dst, &mut entry, mode, Some(size))
                    .with_context(|| format!("could not copy archive file '{}'", name))?;
            }
        }
    }

    Ok(entrypoint)
}

fn is_under(name: &str, dir: &str) -> bool {
    name.len() > dir.len() && name.starts_with(dir) && name.as_bytes()[dir.len()] == b'/'
}
