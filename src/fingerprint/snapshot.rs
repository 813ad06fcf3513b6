//! Directory walk producing a [`FingerprintMap`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::{Result, VigilError};

/// Relative path (always `/`-separated) to hex content digest.
pub type FingerprintMap = BTreeMap<String, String>;

/// What a scan includes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// Directory names pruned from the walk wherever they appear.
    pub excluded_dirs: BTreeSet<String>,
    /// File extensions, with leading dot, that are fingerprinted.
    pub allowed_extensions: BTreeSet<String>,
    /// Files of this size or larger are skipped.
    pub max_file_size: u64,
    /// Directories nested deeper than this below the root are not visited.
    pub max_depth: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            excluded_dirs: BTreeSet::from([".git".to_string()]),
            allowed_extensions: BTreeSet::new(),
            max_file_size: 500 * 1024,
            max_depth: 32,
        }
    }
}

impl ScanOptions {
    fn wants_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.allowed_extensions.contains(&format!(".{ext}")))
    }
}

/// Walk `root` and fingerprint every included file.
///
/// Any IO error while listing a directory or reading a file fails the whole
/// scan with [`VigilError::ScanFailure`]; a partial map is never returned.
pub fn snapshot(root: &Path, options: &ScanOptions) -> Result<FingerprintMap> {
    let mut map = FingerprintMap::new();
    walk(root, root, 0, options, &mut map)?;
    Ok(map)
}

fn walk(
    root: &Path,
    dir: &Path,
    depth: usize,
    options: &ScanOptions,
    map: &mut FingerprintMap,
) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|source| VigilError::ScanFailure {
        path: dir.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| VigilError::ScanFailure {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        // file_type() does not follow symlinks, so linked directories are never entered.
        let file_type = entry.file_type().map_err(|source| VigilError::ScanFailure {
            path: path.clone(),
            source,
        })?;

        if file_type.is_dir() {
            let name = entry.file_name();
            if options
                .excluded_dirs
                .contains(name.to_string_lossy().as_ref())
            {
                continue;
            }
            if depth < options.max_depth {
                walk(root, &path, depth + 1, options, map)?;
            }
            continue;
        }

        if !options.wants_extension(&path) {
            continue;
        }
        let metadata = if file_type.is_symlink() {
            match fs::metadata(&path) {
                Ok(target) if target.is_file() => target,
                // Dangling links (editor lock files among them) and links to directories.
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(VigilError::ScanFailure { path, source }),
            }
        } else if file_type.is_file() {
            entry.metadata().map_err(|source| VigilError::ScanFailure {
                path: path.clone(),
                source,
            })?
        } else {
            continue;
        };

        let size = metadata.len();
        if size >= options.max_file_size {
            continue;
        }

        let relative = relative_key(root, &path);
        let digest = fingerprint_file(&path, &relative, size)?;
        map.insert(relative, digest);
    }

    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn fingerprint_file(path: &Path, relative: &str, size: u64) -> Result<String> {
    let bytes = fs::read(path).map_err(|source| VigilError::ScanFailure {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    hasher.update(format!("{relative} {size}\0").as_bytes());
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn py_options() -> ScanOptions {
        ScanOptions {
            allowed_extensions: BTreeSet::from([".py".to_string()]),
            ..ScanOptions::default()
        }
    }

    #[test]
    fn test_snapshot_includes_only_allowed_extensions() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.py"), "print(1)").unwrap();
        fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();
        fs::write(tmp.path().join("Makefile"), "ignored").unwrap();

        let map = snapshot(tmp.path(), &py_options()).unwrap();

        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a.py"]);
        assert_eq!(map["a.py"].len(), 64);
    }

    #[test]
    fn test_snapshot_prunes_excluded_dirs() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join(".git/objects")).unwrap();
        fs::write(tmp.path().join(".git/objects/hook.py"), "x").unwrap();
        fs::create_dir_all(tmp.path().join("pkg")).unwrap();
        fs::write(tmp.path().join("pkg/mod.py"), "y").unwrap();

        let map = snapshot(tmp.path(), &py_options()).unwrap();

        assert!(map.contains_key("pkg/mod.py"));
        assert!(!map.keys().any(|k| k.starts_with(".git")));
    }

    #[test]
    fn test_snapshot_skips_files_at_or_over_size_ceiling() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("small.py"), "abc").unwrap();
        fs::write(tmp.path().join("big.py"), "x".repeat(16)).unwrap();

        let options = ScanOptions {
            max_file_size: 16,
            ..py_options()
        };
        let map = snapshot(tmp.path(), &options).unwrap();

        assert!(map.contains_key("small.py"));
        assert!(!map.contains_key("big.py"));
    }

    #[test]
    fn test_snapshot_respects_max_depth() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        fs::write(tmp.path().join("a/one.py"), "1").unwrap();
        fs::write(tmp.path().join("a/b/two.py"), "2").unwrap();

        let options = ScanOptions {
            max_depth: 1,
            ..py_options()
        };
        let map = snapshot(tmp.path(), &options).unwrap();

        assert!(map.contains_key("a/one.py"));
        assert!(!map.contains_key("a/b/two.py"));
    }

    #[test]
    fn test_digest_covers_path_and_content() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.py"), "same").unwrap();
        fs::write(tmp.path().join("b.py"), "same").unwrap();

        let map = snapshot(tmp.path(), &py_options()).unwrap();
        assert_ne!(map["a.py"], map["b.py"]);

        let again = snapshot(tmp.path(), &py_options()).unwrap();
        assert_eq!(map, again);
    }

    #[test]
    fn test_symlinked_files_are_followed_but_linked_dirs_are_not() {
        use std::os::unix::fs::symlink;

        let tmp = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        fs::write(elsewhere.path().join("shared.py"), "shared").unwrap();
        fs::create_dir_all(elsewhere.path().join("lib")).unwrap();
        fs::write(elsewhere.path().join("lib/inner.py"), "inner").unwrap();

        symlink(elsewhere.path().join("shared.py"), tmp.path().join("shared.py")).unwrap();
        symlink(elsewhere.path().join("lib"), tmp.path().join("lib")).unwrap();
        symlink(tmp.path().join("gone.py"), tmp.path().join(".#a.py")).unwrap();

        let map = snapshot(tmp.path(), &py_options()).unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["shared.py"]);

        fs::write(elsewhere.path().join("shared.py"), "changed").unwrap();
        let again = snapshot(tmp.path(), &py_options()).unwrap();
        assert_ne!(map["shared.py"], again["shared.py"]);
    }

    #[test]
    fn test_missing_root_is_scan_failure() {
        let tmp = TempDir::new().unwrap();
        let err = snapshot(&tmp.path().join("nope"), &py_options()).unwrap_err();
        assert_eq!(err.code(), "VGL-3002");
    }
}
