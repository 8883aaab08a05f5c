//! Filesystem surgery on the build root.
//!
//! Everything here operates on a plain working directory: recursive
//! deletion with byte accounting, the symlink-aware subtree merge, the
//! `/usr` flattening pass and the garbage-directory cleanup. Symlinks are
//! never followed.

use std::fs;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{FlatpodError, Result};
use crate::utils::logger::Progress;

/// Top-level entries that have no place in a runtime image.
const GARBAGE_ENTRIES: &[&str] = &[
    "dev",
    "home",
    "media",
    "mnt",
    "proc",
    "root",
    "run",
    "sys",
    "tmp",
    "var/cache",
    "var/mail",
    "var/tmp",
    "var/run",
    "content",
    "manifest.json",
];

/// Delete a subtree, children before directories, advancing the progress
/// reporter once per entry. Returns the number of file bytes removed.
pub fn remove_recursive(path: &Path, progress: &mut Progress) -> Result<u64> {
    let mut bytes = 0;

    for entry in WalkDir::new(path).contents_first(true) {
        let entry = entry.map_err(|e| FlatpodError::Repo(e.to_string()))?;
        let meta = fs::symlink_metadata(entry.path())?;
        if meta.is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            bytes += meta.len();
            fs::remove_file(entry.path())?;
        }
        progress.tick();
    }

    Ok(bytes)
}

/// Lexically fold `.` and `..` out of a path.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Does `link` (a symlink) point at `other`? Relative targets resolve
/// against the link's parent, absolute targets against `root`.
fn symlink_resolves_to(link: &Path, other: &Path, root: &Path) -> Result<bool> {
    let target = fs::read_link(link)?;
    let resolved = if target.is_absolute() {
        root.join(target.strip_prefix("/").unwrap_or(&target))
    } else {
        match link.parent() {
            Some(parent) => parent.join(&target),
            None => target.clone(),
        }
    };
    Ok(normalize(&resolved) == normalize(other))
}

/// Merge every entry of `src` into `dst`, then delete `src` itself unless
/// `keep_root`.
///
/// For each entry the two symlink-equivalence cases are checked before
/// anything is moved: a `src` symlink aliasing the `dst` copy is dropped
/// in favor of the real data, and a `dst` symlink aliasing the `src` copy
/// is dropped so the move can land. Absolute symlink targets resolve
/// against `root`. Entries are moved with `rename`, which fails rather
/// than silently copying across filesystems.
pub fn merge_to(src: &Path, dst: &Path, root: &Path, keep_root: bool) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(src)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    let mut dst_known = dst.is_dir();

    for src_child in entries {
        let name = src_child
            .file_name()
            .ok_or_else(|| FlatpodError::BadPath(src_child.clone()))?;
        let dst_child = dst.join(name);

        // merging a directory into a child of itself
        if normalize(&src_child) == normalize(dst) {
            continue;
        }

        if fs::symlink_metadata(&dst_child).is_ok() {
            let src_meta = fs::symlink_metadata(&src_child)?;
            if src_meta.file_type().is_symlink()
                && symlink_resolves_to(&src_child, &dst_child, root)?
            {
                // alias of the real file on the dst side
                fs::remove_file(&src_child)?;
                continue;
            }
            let dst_meta = fs::symlink_metadata(&dst_child)?;
            if dst_meta.file_type().is_symlink()
                && symlink_resolves_to(&dst_child, &src_child, root)?
            {
                // stale alias of the data we are about to move
                fs::remove_file(&dst_child)?;
            }
        }

        if fs::symlink_metadata(&src_child)?.is_dir() {
            merge_to(&src_child, &dst_child, root, false)?;
        } else {
            if !dst_known {
                fs::create_dir_all(dst)?;
                dst_known = true;
            }
            fs::rename(&src_child, &dst_child)?;
        }
    }

    if !keep_root {
        fs::remove_dir(src)?;
    }

    Ok(())
}

/// Flatten `/usr` up into the root: `/usr/local/*` first (so `/usr/bin`
/// later absorbs `/usr/local/bin`), then `/usr/*`.
pub fn merge_usr(root: &Path) -> Result<()> {
    let usr = root.join("usr");
    if !usr.is_dir() {
        return Err(FlatpodError::BadPath(usr));
    }

    let usr_local = usr.join("local");
    if usr_local.is_dir() {
        merge_to(&usr_local, root, root, false)?;
    }
    merge_to(&usr, root, root, false)
}

/// Delete the garbage entries left behind by a checked-out image: mount
/// points, volatile state, and the staged manifest/config blobs. Files go
/// directly; a non-empty directory takes the recursive path. Idempotent.
pub fn clean_root(root: &Path) -> Result<()> {
    for name in GARBAGE_ENTRIES {
        let path = root.join(name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir(&path).or_else(|_| fs::remove_dir_all(&path))?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, MetadataExt};
    use tempfile::tempdir;

    #[test]
    fn test_remove_recursive_counts_bytes() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("victim");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a"), "12345").unwrap();
        fs::write(root.join("sub/b"), "123").unwrap();

        let mut progress = Progress::new("deleting");
        let bytes = remove_recursive(&root, &mut progress).unwrap();
        progress.finish();

        assert_eq!(bytes, 8);
        assert!(!root.exists());
    }

    #[test]
    fn test_merge_prefers_real_file_over_src_symlink() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let a = root.join("a");
        let b = root.join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        fs::write(b.join("x"), "real data").unwrap();
        let inode = fs::metadata(b.join("x")).unwrap().ino();
        symlink(b.join("x"), a.join("x")).unwrap();

        merge_to(&a, &b, root, false).unwrap();

        assert!(!a.exists());
        let meta = fs::symlink_metadata(b.join("x")).unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.ino(), inode);
        assert_eq!(fs::read_to_string(b.join("x")).unwrap(), "real data");
    }

    #[test]
    fn test_merge_replaces_stale_dst_symlink() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let a = root.join("a");
        let b = root.join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        fs::write(a.join("x"), "real data").unwrap();
        symlink(a.join("x"), b.join("x")).unwrap();

        merge_to(&a, &b, root, false).unwrap();

        let meta = fs::symlink_metadata(b.join("x")).unwrap();
        assert!(meta.is_file());
        assert_eq!(fs::read_to_string(b.join("x")).unwrap(), "real data");
    }

    #[test]
    fn test_merge_resolves_absolute_targets_against_root() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::create_dir_all(root.join("bin")).unwrap();

        fs::write(root.join("bin/sh"), "shell").unwrap();
        // /usr/bin/sh -> /bin/sh, absolute within the image
        symlink("/bin/sh", root.join("usr/bin/sh")).unwrap();

        merge_to(&root.join("usr/bin"), &root.join("bin"), root, false).unwrap();

        let meta = fs::symlink_metadata(root.join("bin/sh")).unwrap();
        assert!(meta.is_file());
        assert_eq!(fs::read_to_string(root.join("bin/sh")).unwrap(), "shell");
    }

    #[test]
    fn test_merge_into_own_child_keeps_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("build");
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/env"), "env").unwrap();
        fs::write(root.join("etc"), "").unwrap();
        fs::create_dir_all(root.join("files")).unwrap();

        merge_to(&root, &root.join("files"), &root, true).unwrap();

        assert!(root.is_dir());
        assert!(root.join("files/usr/bin/env").is_file());
        assert!(root.join("files/etc").is_file());
        assert!(!root.join("usr").exists());
        assert!(!root.join("etc").exists());
    }

    #[test]
    fn test_usr_merge_ordering() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("rootfs");
        fs::create_dir_all(root.join("usr/local/bin")).unwrap();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/local/bin/foo"), "foo").unwrap();
        fs::write(root.join("usr/bin/bar"), "bar").unwrap();

        merge_usr(&root).unwrap();

        assert!(root.join("bin/foo").is_file());
        assert!(root.join("bin/bar").is_file());
        assert!(!root.join("usr").exists());
    }

    #[test]
    fn test_usr_merge_requires_usr() {
        let dir = tempdir().unwrap();
        assert!(merge_usr(dir.path()).is_err());
    }

    #[test]
    fn test_clean_root_is_idempotent() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("proc")).unwrap();
        fs::create_dir_all(root.join("var/cache/apt")).unwrap();
        fs::write(root.join("var/cache/apt/pkgcache.bin"), "x").unwrap();
        fs::write(root.join("manifest.json"), "{}").unwrap();
        fs::write(root.join("content"), "{}").unwrap();
        fs::create_dir_all(root.join("usr")).unwrap();
        symlink("/run", root.join("var/run")).unwrap();

        clean_root(root).unwrap();

        assert!(!root.join("proc").exists());
        assert!(!root.join("var/cache").exists());
        assert!(!root.join("manifest.json").exists());
        assert!(!root.join("content").exists());
        assert!(fs::symlink_metadata(root.join("var/run")).is_err());
        assert!(root.join("usr").is_dir());
        assert!(root.join("var").is_dir());

        // second pass has nothing left to do
        clean_root(root).unwrap();
        assert!(root.join("usr").is_dir());
    }
}
