//! Streaming tar archive pipeline.
//!
//! Saving walks a directory and writes every entry into a compressed tar
//! stream. Restoring reads such a stream and recreates each entry under a
//! destination directory. Memory use is bounded by the copy buffer, not by
//! the size of the tree.
//!
//! Entries are classified into [`ArchiveEntry`] values before anything
//! touches the filesystem, so only [`ArchiveEntry::from_tar`] and
//! [`append_entry`] know about tar headers.

use crate::compression::{self, CompressionType};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tarstash_core::cancel::check;
use tarstash_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const DIR_MODE: u32 = 0o755;

/// One item inside an archive stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the archived root.
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Permission bits.
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Regular { size: u64 },
    Symlink { target: PathBuf },
    /// Link to an earlier entry, named relative to the archived root.
    Hardlink { target: PathBuf },
    /// Fifo, character or block device. Restored as a plain file holding the
    /// stored content.
    Special,
    /// Metadata-only entries such as pax global headers.
    Ignorable,
    Unsupported { type_code: char },
}

/// Counts reported by [`create_archive`] and [`extract_archive`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries: u64,
    pub bytes: u64,
}

impl ArchiveEntry {
    /// Classify a tar entry.
    pub fn from_tar<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Self> {
        let path = entry
            .path()
            .map_err(|e| Error::io("failed to read entry path", e))?
            .into_owned();
        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644);
        let entry_type = header.entry_type();

        let link_target = || -> Result<PathBuf> {
            entry
                .link_name()
                .map_err(|e| Error::io(format!("{}: failed to read link name", path.display()), e))?
                .map(|target| target.into_owned())
                .ok_or_else(|| Error::io(
                    format!("{}: missing link name", path.display()),
                    io::Error::new(io::ErrorKind::InvalidData, "link entry without target"),
                ))
        };

        let kind = match entry_type {
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::Regular {
                size: entry.size(),
            },
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
                EntryKind::Special
            }
            tar::EntryType::Symlink => EntryKind::Symlink {
                target: link_target()?,
            },
            tar::EntryType::Link => EntryKind::Hardlink {
                target: link_target()?,
            },
            tar::EntryType::XGlobalHeader => EntryKind::Ignorable,
            other => EntryKind::Unsupported {
                type_code: char::from(other.as_byte()),
            },
        };

        Ok(Self { path, kind, mode })
    }

    /// Classify a filesystem object found while walking the archive root.
    /// Returns `None` for objects a tar stream cannot carry (sockets).
    fn from_fs(path: PathBuf, meta: &fs::Metadata) -> Option<Self> {
        let file_type = meta.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::Regular { size: meta.len() }
        } else if file_type.is_symlink() {
            EntryKind::Symlink {
                target: PathBuf::new(),
            }
        } else if is_special(&file_type) {
            EntryKind::Special
        } else {
            return None;
        };
        Some(Self {
            path,
            kind,
            mode: permission_bits(meta),
        })
    }
}

#[cfg(unix)]
fn is_special(file_type: &fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_fifo() || file_type.is_char_device() || file_type.is_block_device()
}

#[cfg(not(unix))]
fn is_special(_file_type: &fs::FileType) -> bool {
    false
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}

/// Identity of a file with more than one link, used to emit hardlinks.
#[cfg(unix)]
fn link_identity(meta: &fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    (meta.is_file() && meta.nlink() > 1).then(|| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn link_identity(_meta: &fs::Metadata) -> Option<(u64, u64)> {
    None
}

/// Archive everything below `root` into `writer` as a compressed tar stream.
///
/// Entries are written in file-name order, so an unchanged tree always
/// produces the same sequence of entries. `root` itself is not recorded.
pub fn create_archive<W: Write>(
    writer: W,
    root: &Path,
    compression: CompressionType,
    level: Option<i32>,
    cancel: &CancellationToken,
) -> Result<ArchiveStats> {
    let mut stats = ArchiveStats::default();
    compression::encode(writer, compression, level, |sink| {
        let mut builder = tar::Builder::new(sink);
        builder.follow_symlinks(false);
        let mut seen_links: HashMap<(u64, u64), PathBuf> = HashMap::new();

        for item in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
        {
            check(cancel)?;
            let item = item.map_err(|e| {
                let context = match e.path() {
                    Some(p) => format!("failed to walk {}", p.display()),
                    None => format!("failed to walk {}", root.display()),
                };
                Error::io(context, e.into())
            })?;
            let abs_path = item.path();
            let rel_path = abs_path
                .strip_prefix(root)
                .map_err(|e| Error::Internal(format!("{}: {}", abs_path.display(), e)))?
                .to_path_buf();
            let meta = item
                .metadata()
                .map_err(|e| Error::io(format!("failed to stat {}", abs_path.display()), e.into()))?;

            let Some(mut entry) = ArchiveEntry::from_fs(rel_path, &meta) else {
                debug!(path = %abs_path.display(), "skipping unarchivable file");
                continue;
            };

            if let EntryKind::Symlink { target } = &mut entry.kind {
                *target = fs::read_link(abs_path).map_err(|e| {
                    Error::io(format!("failed to read link {}", abs_path.display()), e)
                })?;
            }
            if let Some(id) = link_identity(&meta) {
                match seen_links.get(&id) {
                    Some(first) => {
                        entry.kind = EntryKind::Hardlink {
                            target: first.clone(),
                        }
                    }
                    None => {
                        seen_links.insert(id, entry.path.clone());
                    }
                }
            }

            append_entry(&mut builder, &entry, abs_path, &meta, cancel)?;
            stats.entries += 1;
            if let EntryKind::Regular { size } = entry.kind {
                stats.bytes += size;
            }
        }

        builder
            .into_inner()
            .map_err(|e| Error::io("failed to finish tar stream", e))?;
        Ok(())
    })?;
    Ok(stats)
}

/// Write one classified entry through the tar codec.
fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    entry: &ArchiveEntry,
    abs_path: &Path,
    meta: &fs::Metadata,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(meta, tar::HeaderMode::Complete);
    let name = &entry.path;
    let fail = |e: io::Error| {
        if cancel.is_cancelled() {
            Error::Cancelled
        } else {
            Error::io(format!("failed to archive {}", name.display()), e)
        }
    };

    match &entry.kind {
        EntryKind::Directory | EntryKind::Special => {
            header.set_size(0);
            builder.append_data(&mut header, name, io::empty()).map_err(fail)
        }
        EntryKind::Regular { .. } => {
            let file = fs::File::open(abs_path)
                .map_err(|e| Error::io(format!("failed to open {}", abs_path.display()), e))?;
            let reader = CancelOnRead { inner: file, cancel };
            builder.append_data(&mut header, name, reader).map_err(fail)
        }
        EntryKind::Symlink { target } => {
            header.set_size(0);
            builder.append_link(&mut header, name, target).map_err(fail)
        }
        EntryKind::Hardlink { target } => {
            header.set_entry_type(tar::EntryType::Link);
            header.set_size(0);
            builder.append_link(&mut header, name, target).map_err(fail)
        }
        EntryKind::Ignorable | EntryKind::Unsupported { .. } => Err(Error::Internal(format!(
            "{}: entry cannot be archived",
            name.display()
        ))),
    }
}

/// Reader that stops a file copy once the operation has been cancelled.
struct CancelOnRead<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<R: Read> Read for CancelOnRead<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Restore a compressed tar stream from `reader` into `dest`.
pub fn extract_archive<R: Read>(
    reader: R,
    dest: &Path,
    compression: CompressionType,
    cancel: &CancellationToken,
) -> Result<ArchiveStats> {
    compression::decode(reader, compression, |source| {
        let mut archive = tar::Archive::new(source);
        let mut stats = ArchiveStats::default();
        let entries = archive
            .entries()
            .map_err(|e| Error::io("failed to read archive", e))?;

        for entry in entries {
            check(cancel)?;
            let mut entry = entry.map_err(|e| Error::io("failed to read archive entry", e))?;
            let item = ArchiveEntry::from_tar(&entry)?;
            stats.bytes += unpack_entry(&item, &mut entry, dest, cancel)?;
            stats.entries += 1;
        }
        Ok(stats)
    })
}

/// Materialize one entry under `dest`, returning the content bytes written.
pub fn unpack_entry<R: Read>(
    entry: &ArchiveEntry,
    content: &mut R,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    match &entry.kind {
        EntryKind::Ignorable => Ok(0),
        EntryKind::Unsupported { type_code } => Err(Error::UnsupportedEntryType {
            name: entry.path.display().to_string(),
            type_code: *type_code,
        }),
        EntryKind::Directory => {
            create_dirs(&safe_join(dest, &entry.path)?)?;
            Ok(0)
        }
        EntryKind::Regular { .. } | EntryKind::Special => {
            let target = safe_join(dest, &entry.path)?;
            create_parent(&target)?;
            remove_existing(&target)?;
            let mut out = fs::File::create(&target)
                .map_err(|e| Error::io(format!("{}: creating new file", target.display()), e))?;
            let written = copy_with_cancel(content, &mut out, cancel)
                .map_err(|e| match e {
                    Error::Io { source, .. } => {
                        Error::io(format!("{}: writing file", target.display()), source)
                    }
                    other => other,
                })?;
            apply_mode(&out, &target, entry.mode)?;
            Ok(written)
        }
        EntryKind::Symlink { target: link } => {
            let target = safe_join(dest, &entry.path)?;
            create_parent(&target)?;
            remove_existing(&target)?;
            make_symlink(link, &target)
                .map_err(|e| Error::io(format!("{}: making symbolic link", target.display()), e))?;
            Ok(0)
        }
        EntryKind::Hardlink { target: link } => {
            let target = safe_join(dest, &entry.path)?;
            create_parent(&target)?;
            remove_existing(&target)?;
            let original = safe_join(dest, link)?;
            fs::hard_link(&original, &target)
                .map_err(|e| Error::io(format!("{}: making hard link", target.display()), e))?;
            Ok(0)
        }
    }
}

/// Join an archive path onto `dest`, refusing absolute paths and `..`.
fn safe_join(dest: &Path, rel: &Path) -> Result<PathBuf> {
    let mut out = dest.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::UnsafeEntryPath(rel.to_path_buf()));
            }
        }
    }
    Ok(out)
}

fn create_dirs(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder
        .create(path)
        .map_err(|e| Error::io(format!("failed to make directory {}", path.display()), e))
}

fn create_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) => create_dirs(parent),
        None => Ok(()),
    }
}

/// Clear a file or link left at `path` so the restored entry replaces it
/// instead of writing through it.
fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path)
            .map_err(|e| Error::io(format!("{}: removing existing file", path.display()), e)),
        _ => Ok(()),
    }
}

fn copy_with_cancel<R: Read + ?Sized, W: Write>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        check(cancel)?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io("read failed", e)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(|e| Error::io("write failed", e))?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(unix)]
fn apply_mode(file: &fs::File, path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| Error::io(format!("{}: changing file mode", path.display()), e))
}

#[cfg(not(unix))]
fn apply_mode(_file: &fs::File, _path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &Path, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, path)
}

#[cfg(windows)]
fn make_symlink(link: &Path, path: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(link, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarstash_core::ErrorKind;

    fn archive_bytes(root: &Path) -> Vec<u8> {
        let mut out = Vec::new();
        create_archive(
            &mut out,
            root,
            CompressionType::Zstd,
            None,
            &CancellationToken::new(),
        )
        .unwrap();
        out
    }

    /// Build an uncompressed archive holding a single raw header.
    fn raw_archive(path: &str, entry_type: tar::EntryType) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_size(0);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, io::empty()).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_roundtrip_files_and_dirs() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::write(src.path().join("top.txt"), b"top").unwrap();
        fs::write(src.path().join("a/b/deep.bin"), [0u8, 1, 2, 255]).unwrap();
        fs::create_dir(src.path().join("empty")).unwrap();

        let bytes = archive_bytes(src.path());
        let dest = tempfile::tempdir().unwrap();
        let stats = extract_archive(
            bytes.as_slice(),
            dest.path(),
            CompressionType::Zstd,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(fs::read(dest.path().join("top.txt")).unwrap(), b"top");
        assert_eq!(
            fs::read(dest.path().join("a/b/deep.bin")).unwrap(),
            vec![0u8, 1, 2, 255]
        );
        assert!(dest.path().join("empty").is_dir());
        assert_eq!(stats.entries, 5);
        assert_eq!(stats.bytes, 7);
    }

    #[cfg(unix)]
    #[test]
    fn test_roundtrip_symlinks_hardlinks_and_modes() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("script.sh"), b"#!/bin/sh\n").unwrap();
        fs::set_permissions(
            src.path().join("script.sh"),
            fs::Permissions::from_mode(0o751),
        )
        .unwrap();
        fs::write(src.path().join("original"), b"shared").unwrap();
        fs::hard_link(src.path().join("original"), src.path().join("twin")).unwrap();
        std::os::unix::fs::symlink("../outside/target", src.path().join("link")).unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract_archive(
            archive_bytes(src.path()).as_slice(),
            dest.path(),
            CompressionType::Zstd,
            &CancellationToken::new(),
        )
        .unwrap();

        let mode = fs::metadata(dest.path().join("script.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o751);
        assert_eq!(
            fs::read_link(dest.path().join("link")).unwrap(),
            PathBuf::from("../outside/target")
        );
        let original = fs::metadata(dest.path().join("original")).unwrap();
        let twin = fs::metadata(dest.path().join("twin")).unwrap();
        assert_eq!(original.ino(), twin.ino());
        assert_eq!(fs::read(dest.path().join("twin")).unwrap(), b"shared");
    }

    #[test]
    fn test_classify_tar_entries() {
        let bytes = raw_archive("pax_global_header", tar::EntryType::XGlobalHeader);
        let mut archive = tar::Archive::new(bytes.as_slice());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        let item = ArchiveEntry::from_tar(&entry).unwrap();
        assert_eq!(item.kind, EntryKind::Ignorable);

        let bytes = raw_archive("pipe", tar::EntryType::Fifo);
        let mut archive = tar::Archive::new(bytes.as_slice());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        let item = ArchiveEntry::from_tar(&entry).unwrap();
        assert_eq!(item.kind, EntryKind::Special);
        assert_eq!(item.mode, 0o644);
    }

    #[test]
    fn test_ignorable_entries_are_skipped() {
        let bytes = raw_archive("pax_global_header", tar::EntryType::XGlobalHeader);
        let dest = tempfile::tempdir().unwrap();
        let stats = extract_archive(
            bytes.as_slice(),
            dest.path(),
            CompressionType::None,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(stats.entries, 1);
        assert!(!dest.path().join("pax_global_header").exists());
    }

    #[test]
    fn test_special_entries_restore_as_files() {
        let bytes = raw_archive("dev/pipe", tar::EntryType::Fifo);
        let dest = tempfile::tempdir().unwrap();
        extract_archive(
            bytes.as_slice(),
            dest.path(),
            CompressionType::None,
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(dest.path().join("dev/pipe").is_file());
    }

    #[test]
    fn test_unsupported_entry_type_fails() {
        let bytes = raw_archive("volume", tar::EntryType::new(b'V'));
        let dest = tempfile::tempdir().unwrap();
        let err = extract_archive(
            bytes.as_slice(),
            dest.path(),
            CompressionType::None,
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedEntryType);
        assert_eq!(err.to_string(), "volume: unsupported entry type 'V'");
    }

    #[test]
    fn test_rejects_parent_dir_paths() {
        let entry = ArchiveEntry {
            path: PathBuf::from("../evil"),
            kind: EntryKind::Directory,
            mode: 0o755,
        };
        let dest = tempfile::tempdir().unwrap();
        let err = unpack_entry(&entry, &mut io::empty(), dest.path(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnsafeEntryPath(_)));
        assert!(!dest.path().parent().unwrap().join("evil").exists());
    }

    #[test]
    fn test_hardlink_resolves_against_destination_root() {
        let dest = tempfile::tempdir().unwrap();
        fs::create_dir(dest.path().join("sub")).unwrap();
        fs::write(dest.path().join("sub/a"), b"data").unwrap();
        let entry = ArchiveEntry {
            path: PathBuf::from("other/b"),
            kind: EntryKind::Hardlink {
                target: PathBuf::from("sub/a"),
            },
            mode: 0o644,
        };
        unpack_entry(&entry, &mut io::empty(), dest.path(), &CancellationToken::new()).unwrap();
        assert_eq!(fs::read(dest.path().join("other/b")).unwrap(), b"data");
    }

    #[test]
    fn test_cancelled_extract_stops() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), b"x").unwrap();
        let bytes = archive_bytes(src.path());
        let token = CancellationToken::new();
        token.cancel();
        let dest = tempfile::tempdir().unwrap();
        let err = extract_archive(bytes.as_slice(), dest.path(), CompressionType::Zstd, &token)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_replaces_read_only_files_and_links() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("locked.txt"), b"fresh").unwrap();
        fs::write(src.path().join("linked.txt"), b"fresh link").unwrap();
        let bytes = archive_bytes(src.path());

        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.txt");
        fs::write(&victim, b"untouched").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let locked = dest.path().join("locked.txt");
        fs::write(&locked, b"stale").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o444)).unwrap();
        std::os::unix::fs::symlink(&victim, dest.path().join("linked.txt")).unwrap();

        extract_archive(
            bytes.as_slice(),
            dest.path(),
            CompressionType::Zstd,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(fs::read(&locked).unwrap(), b"fresh");
        let linked = dest.path().join("linked.txt");
        assert!(!fs::symlink_metadata(&linked).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&linked).unwrap(), b"fresh link");
        assert_eq!(fs::read(&victim).unwrap(), b"untouched");
    }

    #[test]
    fn test_append_refuses_unarchivable_kinds() {
        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("f");
        fs::write(&path, b"x").unwrap();
        let meta = fs::symlink_metadata(&path).unwrap();
        let mut builder = tar::Builder::new(Vec::new());

        for kind in [EntryKind::Ignorable, EntryKind::Unsupported { type_code: 'V' }] {
            let entry = ArchiveEntry {
                path: PathBuf::from("f"),
                kind,
                mode: 0o644,
            };
            let err = append_entry(&mut builder, &entry, &path, &meta, &CancellationToken::new())
                .unwrap_err();
            assert_eq!(err.to_string(), "internal error: f: entry cannot be archived");
        }
        assert!(builder.get_ref().is_empty());
    }
}
