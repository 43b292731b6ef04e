//! Cache key utilities.
//!
//! Keys are usually built from a fixed prefix plus a digest of the files
//! that decide whether the cache is still valid (a lockfile, a toolchain
//! file). The digest depends on file order; callers wanting an
//! order-independent key must sort their paths first.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tarstash_core::cancel::check;
use tarstash_core::{Error, Result, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Digest length in bytes; the hex form is twice as long.
pub const DIGEST_LEN: usize = 16;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Hash the contents of `paths`, in order, into a hex digest.
///
/// Directories are skipped so glob results can be passed straight through.
/// Any failure to open, stat or read a file aborts the whole digest.
pub fn hash_files<P: AsRef<Path>>(paths: &[P], cancel: &CancellationToken) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in paths {
        let path = path.as_ref();
        hash_one(path, &mut hasher, cancel)
            .with_context(|| format!("failed to hash {}", path.display()))?;
    }
    let digest = hasher.finalize();
    Ok(hex::encode(&digest[..DIGEST_LEN]))
}

fn hash_one(path: &Path, hasher: &mut Sha256, cancel: &CancellationToken) -> Result<()> {
    check(cancel)?;
    trace!(path = %path.display(), "opening");
    let mut file = File::open(path).map_err(|e| Error::io("failed to open file", e))?;

    let meta = file
        .metadata()
        .map_err(|e| Error::io("failed to stat file", e))?;
    if meta.is_dir() {
        trace!(path = %path.display(), "skipping directory");
        return Ok(());
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        check(cancel)?;
        match file.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io("failed to read file", e)),
        }
    }
}

/// Expand `pattern` and hash the matches in the order the expansion yields.
pub fn hash_glob(pattern: &str, cancel: &CancellationToken) -> Result<String> {
    let matches = glob_paths(pattern)?;
    trace!(pattern, matches = matches.len(), "expanded glob");
    hash_files(&matches, cancel)
}

fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    glob::glob(pattern)
        .map_err(|e| Error::Glob(format!("{}: {}", pattern, e)))?
        .map(|entry| {
            entry.map_err(|e| {
                let context = format!("failed to glob {}", e.path().display());
                Error::io(context, e.into_error())
            })
        })
        .collect()
}

/// Expand `{{ hashGlob "pattern" }}` and `{{ hashFiles "a" "b" }}`
/// placeholders in a key template.
pub fn expand_key(template: &str, cancel: &CancellationToken) -> Result<String> {
    let placeholder = Regex::new(r#"\{\{\s*(\w+)((?:\s+"[^"]*")*)\s*\}\}"#)
        .map_err(|e| Error::Internal(e.to_string()))?;
    let argument =
        Regex::new(r#""([^"]*)""#).map_err(|e| Error::Internal(e.to_string()))?;

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder.captures_iter(template) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let func = caps.get(1).map_or("", |m| m.as_str());
        let args: Vec<&str> = caps
            .get(2)
            .map(|m| {
                argument
                    .captures_iter(m.as_str())
                    .filter_map(|c| c.get(1).map(|a| a.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let digest = match (func, args.as_slice()) {
            ("hashGlob", [pattern]) => hash_glob(pattern, cancel)?,
            ("hashFiles", paths) if !paths.is_empty() => hash_files(paths, cancel)?,
            ("hashGlob" | "hashFiles", _) => {
                return Err(Error::InvalidArgument(format!(
                    "wrong number of arguments to {} in key {:?}",
                    func, template
                )));
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "unknown function {} in key {:?}",
                    func, template
                )));
            }
        };
        out.push_str(&template[last..whole.start]);
        out.push_str(&digest);
        last = whole.end;
    }
    out.push_str(&template[last..]);

    if out.contains("{{") || out.contains("}}") {
        return Err(Error::InvalidArgument(format!(
            "malformed placeholder in key {:?}",
            template
        )));
    }
    Ok(out)
}

/// Check if a key matches a prefix pattern.
pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tarstash_core::ErrorKind;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn test_hash_is_deterministic_and_order_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let f1 = dir.path().join("f1");
        let f2 = dir.path().join("f2");
        fs::write(&f1, b"first").unwrap();
        fs::write(&f2, b"second").unwrap();

        let forward = hash_files(&[&f1, &f2], &token()).unwrap();
        let again = hash_files(&[&f1, &f2], &token()).unwrap();
        let reversed = hash_files(&[&f2, &f1], &token()).unwrap();

        assert_eq!(forward, again);
        assert_ne!(forward, reversed);
        assert_eq!(forward.len(), DIGEST_LEN * 2);
    }

    #[test]
    fn test_hash_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Cargo.lock");
        fs::write(&file, b"lock").unwrap();

        let with_dir = hash_files(&[dir.path(), file.as_path()], &token()).unwrap();
        let only_file = hash_files(&[file.as_path()], &token()).unwrap();
        assert_eq!(with_dir, only_file);
    }

    #[test]
    fn test_hash_missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = hash_files(&[&missing], &token()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_hash_glob_matches_hash_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.lock"), b"a").unwrap();
        fs::write(dir.path().join("b.lock"), b"b").unwrap();
        fs::write(dir.path().join("c.txt"), b"c").unwrap();

        let pattern = format!("{}/*.lock", dir.path().display());
        let globbed = hash_glob(&pattern, &token()).unwrap();
        let direct = hash_files(
            &[dir.path().join("a.lock"), dir.path().join("b.lock")],
            &token(),
        )
        .unwrap();
        assert_eq!(globbed, direct);
    }

    #[test]
    fn test_expand_key_template() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("go.sum");
        fs::write(&lock, b"module").unwrap();
        let digest = hash_files(&[&lock], &token()).unwrap();

        let template = format!("deps-{{{{ hashGlob \"{}\" }}}}-v1", lock.display());
        assert_eq!(
            expand_key(&template, &token()).unwrap(),
            format!("deps-{}-v1", digest)
        );

        let template = format!("deps-{{{{hashFiles \"{}\"}}}}", lock.display());
        assert_eq!(
            expand_key(&template, &token()).unwrap(),
            format!("deps-{}", digest)
        );

        assert_eq!(expand_key("plain-key", &token()).unwrap(), "plain-key");
    }

    #[test]
    fn test_expand_key_rejects_bad_templates() {
        let err = expand_key("k-{{ env \"HOME\" }}", &token()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = expand_key("k-{{ hashGlob }}", &token()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = expand_key("k-{{ hashGlob \"a\"", &token()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_matches_prefix() {
        assert!(matches_prefix("cargo-abc123", "cargo-"));
        assert!(matches_prefix("cargo-abc123", "cargo"));
        assert!(!matches_prefix("npm-abc123", "cargo-"));
    }
}
