//! Tree and commit object models, and the directory ⇄ store conversions.
//!
//! Trees are canonical JSON (sorted entry names, fixed field order) so that
//! identical directory contents always hash to the identical tree id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ObjectId, ObjectStore};
use crate::error::{FlatpodError, Result};

/// One directory entry inside a tree object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TreeEntry {
    File { object: ObjectId, mode: u32 },
    Dir { object: ObjectId },
    Symlink { target: String },
}

/// A directory snapshot: entry name → entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: BTreeMap<String, TreeEntry>,
}

/// An immutable snapshot of a tree, with an optional parent pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub tree: ObjectId,
    pub parent: Option<ObjectId>,
    pub subject: String,
    pub timestamp: String,
}

fn utf8_name(name: std::ffi::OsString, at: &Path) -> Result<String> {
    name.into_string()
        .map_err(|_| FlatpodError::BadPath(at.to_path_buf()))
}

impl ObjectStore {
    /// Write a directory into the store as a tree, returning the root tree
    /// id.
    ///
    /// With `canonical_permissions` file modes are normalized to 0o644 /
    /// 0o755 (by any-exec bit) and directories to 0o755, so two identical
    /// inputs produce identical trees regardless of the working directory's
    /// permissions. Hardlink groups are detected by `(dev, ino)` and hashed
    /// once.
    pub fn write_directory(&self, path: &Path, canonical_permissions: bool) -> Result<ObjectId> {
        let mut hardlinks: HashMap<(u64, u64), ObjectId> = HashMap::new();
        self.write_directory_inner(path, canonical_permissions, &mut hardlinks)
    }

    fn write_directory_inner(
        &self,
        path: &Path,
        canonical_permissions: bool,
        hardlinks: &mut HashMap<(u64, u64), ObjectId>,
    ) -> Result<ObjectId> {
        let mut tree = Tree::default();

        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let child = entry.path();
            let name = utf8_name(entry.file_name(), &child)?;
            let meta = fs::symlink_metadata(&child)?;

            let tree_entry = if meta.file_type().is_symlink() {
                let target = fs::read_link(&child)?;
                TreeEntry::Symlink {
                    target: utf8_name(target.into_os_string(), &child)?,
                }
            } else if meta.is_dir() {
                TreeEntry::Dir {
                    object: self.write_directory_inner(&child, canonical_permissions, hardlinks)?,
                }
            } else {
                let inode = (meta.dev(), meta.ino());
                let cached = if meta.nlink() > 1 {
                    hardlinks.get(&inode).cloned()
                } else {
                    None
                };
                let object = match cached {
                    Some(id) => id,
                    None => {
                        let id = self.write_object(&fs::read(&child)?)?;
                        if meta.nlink() > 1 {
                            hardlinks.insert(inode, id.clone());
                        }
                        id
                    }
                };
                let mode = if canonical_permissions {
                    if meta.mode() & 0o111 != 0 {
                        0o755
                    } else {
                        0o644
                    }
                } else {
                    meta.mode() & 0o7777
                };
                TreeEntry::File { object, mode }
            };

            tree.entries.insert(name, tree_entry);
        }

        self.write_tree(&tree)
    }

    /// Store a tree object.
    pub fn write_tree(&self, tree: &Tree) -> Result<ObjectId> {
        self.write_object(&serde_json::to_vec(tree)?)
    }

    /// Read a tree object back.
    pub fn read_tree(&self, id: &ObjectId) -> Result<Tree> {
        Ok(serde_json::from_slice(&self.read_object(id)?)?)
    }

    /// Overlay the commit a ref points at onto an existing directory,
    /// unioning file content: directories are created as needed, files and
    /// symlinks always overwritten, pre-existing siblings left alone.
    pub fn checkout(&self, ref_name: &str, target: &Path) -> Result<()> {
        let commit_id = self.resolve_required(ref_name)?;
        let commit = self.read_commit(&commit_id)?;
        fs::create_dir_all(target)?;
        self.materialize_tree(&commit.tree, target)
    }

    fn materialize_tree(&self, tree_id: &ObjectId, dir: &Path) -> Result<()> {
        let tree = self.read_tree(tree_id)?;

        for (name, entry) in &tree.entries {
            let path = dir.join(name);
            match entry {
                TreeEntry::Dir { object } => {
                    if let Ok(meta) = fs::symlink_metadata(&path) {
                        if !meta.is_dir() {
                            fs::remove_file(&path)?;
                            fs::create_dir(&path)?;
                        }
                    } else {
                        fs::create_dir(&path)?;
                    }
                    self.materialize_tree(object, &path)?;
                }
                TreeEntry::File { object, mode } => {
                    remove_existing(&path)?;
                    fs::write(&path, self.read_object(object)?)?;
                    fs::set_permissions(&path, fs::Permissions::from_mode(*mode))?;
                }
                TreeEntry::Symlink { target } => {
                    remove_existing(&path)?;
                    symlink(target, &path)?;
                }
            }
        }

        Ok(())
    }

    /// Read one file out of a committed tree without a checkout. `None` if
    /// the path does not exist in the commit.
    pub fn read_file(&self, commit_id: &ObjectId, path: &str) -> Result<Option<Vec<u8>>> {
        let commit = self.read_commit(commit_id)?;
        let mut tree = self.read_tree(&commit.tree)?;

        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(component) = components.next() {
            match tree.entries.get(component) {
                Some(TreeEntry::File { object, .. }) if components.peek().is_none() => {
                    return Ok(Some(self.read_object(object)?));
                }
                Some(TreeEntry::Dir { object }) if components.peek().is_some() => {
                    tree = self.read_tree(object)?;
                }
                _ => return Ok(None),
            }
        }

        Ok(None)
    }

    /// Add a tree and everything below it to the live set.
    pub(super) fn collect_tree_objects(
        &self,
        tree_id: &ObjectId,
        out: &mut HashSet<ObjectId>,
    ) -> Result<()> {
        if !out.insert(tree_id.clone()) {
            return Ok(());
        }
        let tree = self.read_tree(tree_id)?;
        for entry in tree.entries.values() {
            match entry {
                TreeEntry::File { object, .. } => {
                    out.insert(object.clone());
                }
                TreeEntry::Dir { object } => {
                    self.collect_tree_objects(object, out)?;
                }
                TreeEntry::Symlink { .. } => {}
            }
        }
        Ok(())
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
