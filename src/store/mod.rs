//! Content-addressed object store.
//!
//! Stores file blobs, trees and commits keyed by their SHA256, with mutable
//! refs pointing at commits. Ref updates are batched in transactions that
//! become visible atomically on commit; an uncommitted transaction is
//! aborted when dropped. The store is exclusively owned for the duration of
//! an operation; no concurrent writer is assumed.
//!
//! ```text
//! <repo>/objects/<2-hex>/<62-hex>   content-addressed objects
//! <repo>/refs/<namespace>/<name…>   one file per ref, holding a commit id
//! <repo>/summary                    regenerated ref→commit index
//! ```

mod object;
mod tree;

pub use object::ObjectId;
pub use tree::{Commit, Tree, TreeEntry};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{FlatpodError, Result};
use crate::utils::logger::Logger;

/// Internal store subdirectory holding uncompressed object copies. The
/// store exposes no API to purge it, so the janitor reaches in directly.
pub const UNCOMPRESSED_CACHE_DIR: &str = "uncompressed-objects-cache";

/// Result of a prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub objects_found: u64,
    pub objects_deleted: u64,
    pub bytes_deleted: u64,
}

/// A content-addressed object store rooted at a directory.
#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open (or initialize) a store at the given path.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("refs"))?;
        Ok(ObjectStore { root })
    }

    /// The store's root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join("objects").join(id.rel_path())
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join("refs").join(name)
    }

    /// Store a blob, returning its id. Writing an object that already
    /// exists is a no-op.
    pub fn write_object(&self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::for_bytes(data);
        let path = self.object_path(&id);

        if path.exists() {
            return Ok(id);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write atomically using temp file
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, data)?;
        fs::rename(&temp_path, &path)?;

        Ok(id)
    }

    /// Read a blob back by id.
    pub fn read_object(&self, id: &ObjectId) -> Result<Vec<u8>> {
        fs::read(self.object_path(id)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                FlatpodError::Repo(format!("object {} is missing", id))
            } else {
                FlatpodError::Io(e)
            }
        })
    }

    /// Resolve a ref to the commit it points at; `None` if the ref does
    /// not exist.
    pub fn resolve(&self, name: &str) -> Result<Option<ObjectId>> {
        match fs::read_to_string(self.ref_path(name)) {
            Ok(contents) => Ok(Some(ObjectId::from_hex(&contents)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a ref that is required to exist.
    pub fn resolve_required(&self, name: &str) -> Result<ObjectId> {
        self.resolve(name)?
            .ok_or_else(|| FlatpodError::RefNotFound(name.to_string()))
    }

    /// Enumerate refs. With a prefix, only refs below `refs/<prefix>/` are
    /// returned, with the prefix stripped; callers restore the canonical
    /// form themselves.
    pub fn list_refs(&self, prefix: Option<&str>) -> Result<BTreeSet<String>> {
        let base = match prefix {
            Some(p) => self.ref_path(p),
            None => self.root.join("refs"),
        };

        let mut refs = BTreeSet::new();
        if !base.is_dir() {
            return Ok(refs);
        }

        for entry in WalkDir::new(&base) {
            let entry = entry.map_err(|e| FlatpodError::Repo(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&base)
                .map_err(|_| FlatpodError::BadPath(entry.path().to_path_buf()))?;
            match rel.to_str() {
                Some(name) => refs.insert(name.to_string()),
                None => return Err(FlatpodError::BadPath(rel.to_path_buf())),
            };
        }

        Ok(refs)
    }

    /// Begin a batch of ref updates. Updates become visible only when the
    /// returned transaction is committed; dropping it aborts the batch.
    pub fn begin_transaction(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            updates: BTreeMap::new(),
            committed: false,
        }
    }

    /// Write a commit object for the given tree.
    pub fn write_commit(
        &self,
        parent: Option<&ObjectId>,
        subject: &str,
        tree: &ObjectId,
        timestamp: &str,
    ) -> Result<ObjectId> {
        let commit = Commit {
            tree: tree.clone(),
            parent: parent.cloned(),
            subject: subject.to_string(),
            timestamp: timestamp.to_string(),
        };
        self.write_object(&serde_json::to_vec(&commit)?)
    }

    /// Read a commit object back.
    pub fn read_commit(&self, id: &ObjectId) -> Result<Commit> {
        Ok(serde_json::from_slice(&self.read_object(id)?)?)
    }

    /// Rewrite the `summary` index from the current refs.
    pub fn regenerate_summary(&self) -> Result<()> {
        let mut lines = String::new();
        for name in self.list_refs(None)? {
            if let Some(commit) = self.resolve(&name)? {
                lines.push_str(&format!("{} {}\n", name, commit));
            }
        }

        let summary = self.root.join("summary");
        let temp_path = summary.with_extension("tmp");
        fs::write(&temp_path, lines)?;
        fs::rename(&temp_path, &summary)?;
        Ok(())
    }

    /// Delete every object unreachable from the refs.
    ///
    /// The live set is each ref's commit plus its tree closure; `depth`
    /// parent generations are also kept (the pipeline always prunes with
    /// depth 0, so commit history is reclaimed). `refs_only` exists for
    /// interface parity; every object in this store is ref-rooted, so the
    /// two modes coincide. Returns counts and reclaimed bytes.
    pub fn prune(&self, _refs_only: bool, depth: u32) -> Result<PruneStats> {
        let mut live: HashSet<ObjectId> = HashSet::new();

        for name in self.list_refs(None)? {
            let Some(mut commit_id) = self.resolve(&name)? else {
                continue;
            };
            let mut generation = 0;
            loop {
                if !live.insert(commit_id.clone()) {
                    break;
                }
                let commit = self.read_commit(&commit_id)?;
                self.collect_tree_objects(&commit.tree, &mut live)?;
                match commit.parent {
                    Some(parent) if generation < depth => {
                        commit_id = parent;
                        generation += 1;
                    }
                    _ => break,
                }
            }
        }

        let mut stats = PruneStats::default();
        let objects_dir = self.root.join("objects");
        for entry in WalkDir::new(&objects_dir).min_depth(2) {
            let entry = entry.map_err(|e| FlatpodError::Repo(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            stats.objects_found += 1;

            let rel = entry
                .path()
                .strip_prefix(&objects_dir)
                .map_err(|_| FlatpodError::BadPath(entry.path().to_path_buf()))?;
            let hex = rel.to_string_lossy().replace('/', "");
            let id = match ObjectId::from_hex(&hex) {
                Ok(id) => id,
                // stray non-object file; leave it alone
                Err(_) => continue,
            };

            if !live.contains(&id) {
                stats.bytes_deleted += entry.metadata().map(|m| m.len()).unwrap_or(0);
                fs::remove_file(entry.path())?;
                stats.objects_deleted += 1;
            }
        }

        Ok(stats)
    }
}

/// A batch of pending ref updates.
///
/// Either `commit()` applies the whole batch, or dropping the transaction
/// discards it; no partially applied state is ever observable.
pub struct Transaction<'a> {
    store: &'a ObjectStore,
    updates: BTreeMap<String, Option<ObjectId>>,
    committed: bool,
}

impl<'a> Transaction<'a> {
    /// Stage a ref update; `None` deletes the ref.
    pub fn set_ref(&mut self, name: &str, commit: Option<ObjectId>) {
        self.updates.insert(name.to_string(), commit);
    }

    /// Apply all staged updates.
    pub fn commit(mut self) -> Result<()> {
        for (name, commit) in std::mem::take(&mut self.updates) {
            let path = self.store.ref_path(&name);
            match commit {
                Some(id) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let temp_path = path.with_extension("reftmp");
                    fs::write(&temp_path, format!("{}\n", id))?;
                    fs::rename(&temp_path, &path)?;
                }
                None => match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.updates.is_empty() {
            Logger::debug(&format!(
                "aborting transaction with {} staged ref update(s)",
                self.updates.len()
            ));
        }
    }
}
