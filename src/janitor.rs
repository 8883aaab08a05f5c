//! Repository janitor.
//!
//! Independent cleanup pipeline: sweep the temp-build tree, optionally
//! clear the uncompressed-object cache, compute the set of unused refs
//! (distinguishing "used by an installed runtime" from "used only as an
//! OCI intermediate" from "orphaned"), delete them in one transaction,
//! then prune unreachable objects.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use clap::ValueEnum;
use walkdir::WalkDir;

use crate::context::Context;
use crate::error::{FlatpodError, Result};
use crate::flatpak;
use crate::image::{escape, OciManifest};
use crate::rootfs;
use crate::store::{ObjectStore, UNCOMPRESSED_CACHE_DIR};
use crate::utils::logger::{Logger, Progress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CleanupMode {
    /// Only prune unreachable objects
    Prune,
    /// Also drop every OCI intermediate ref
    Oci,
    /// Also drop refs no installed runtime depends on
    Unused,
    /// Drop unused runtimes, all OCI intermediates, and the object cache
    All,
}

/// Run the janitor in the given mode and report megabytes reclaimed.
pub fn run(ctx: &Context, mode: CleanupMode) -> Result<()> {
    let installed = if mode == CleanupMode::Prune {
        Vec::new()
    } else {
        flatpak::installed_runtimes()?
    };
    run_with_installed(ctx, mode, &installed)
}

/// The janitor proper, with the installed-runtime set injected.
pub fn run_with_installed(ctx: &Context, mode: CleanupMode, installed: &[String]) -> Result<()> {
    let store = ObjectStore::open(ctx.repo_path())?;

    let mut bytes = clean_build_dirs(&ctx.builds_path())?;

    if mode == CleanupMode::All {
        bytes += purge_uncompressed_cache(&store)?;
    }

    if mode != CleanupMode::Prune {
        let mut unused = match mode {
            CleanupMode::Unused => compute_unused_refs(&store, installed, true)?,
            CleanupMode::All => compute_unused_refs(&store, installed, false)?,
            _ => BTreeSet::new(),
        };

        if matches!(mode, CleanupMode::Oci | CleanupMode::All) {
            for name in store.list_refs(Some("ociimage"))? {
                unused.insert(format!("ociimage/{}", name));
            }
        }

        Logger::debug(&format!("Deleting {} unused ref(s)", unused.len()));
        let mut txn = store.begin_transaction();
        for name in &unused {
            txn.set_ref(name, None);
        }
        txn.commit()?;
        store.regenerate_summary()?;
    }

    let stats = store.prune(true, 0)?;
    bytes += stats.bytes_deleted;
    Logger::debug(&format!(
        "Pruned {} of {} object(s)",
        stats.objects_deleted, stats.objects_found
    ));

    println!("{}", format_report(bytes));
    Ok(())
}

fn format_report(bytes: u64) -> String {
    format!("{:.2}mb deleted", bytes as f64 / (1024.0 * 1024.0))
}

/// Delete everything under the temp-build parent, fixing up directory
/// permissions first so trees checked out from hostile images cannot block
/// their own removal. Returns file bytes removed.
fn clean_build_dirs(builds: &Path) -> Result<u64> {
    for entry in WalkDir::new(builds) {
        let entry = entry.map_err(|e| FlatpodError::Repo(e.to_string()))?;
        if entry.file_type().is_dir() {
            let meta = entry.metadata().map_err(|e| FlatpodError::Repo(e.to_string()))?;
            let mode = meta.permissions().mode();
            if mode & 0o700 != 0o700 {
                fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700))?;
            }
        }
    }

    let mut progress = Progress::new("Removing build directories");
    let mut bytes = 0;
    for entry in fs::read_dir(builds)? {
        bytes += rootfs::remove_recursive(&entry?.path(), &mut progress)?;
    }
    progress.finish();
    Ok(bytes)
}

/// Empty the store's uncompressed-object cache. The store has no API for
/// this; reaching into its well-known subdirectory is a deliberate
/// layering violation.
fn purge_uncompressed_cache(store: &ObjectStore) -> Result<u64> {
    let cache = store.path().join(UNCOMPRESSED_CACHE_DIR);
    if !cache.is_dir() {
        return Ok(0);
    }

    let mut progress = Progress::new("Clearing object cache");
    let mut bytes = 0;
    for entry in fs::read_dir(&cache)? {
        bytes += rootfs::remove_recursive(&entry?.path(), &mut progress)?;
    }
    progress.finish();
    Ok(bytes)
}

/// Compute the refs no installed runtime depends on.
///
/// Candidates are the `runtime/` refs, or every ref in the store when
/// `include_oci_branches`. Each installed runtime then subtracts its own
/// branch and, transitively, the image ref recorded in its
/// `files/.flatpod-info` plus that manifest's layer and config refs.
/// Already-collected intermediates are skipped without error.
pub fn compute_unused_refs(
    store: &ObjectStore,
    installed: &[String],
    include_oci_branches: bool,
) -> Result<BTreeSet<String>> {
    let mut candidates: BTreeSet<String> = if include_oci_branches {
        store.list_refs(None)?
    } else {
        // the store strips the prefix when given one; restore the
        // canonical form
        store
            .list_refs(Some("runtime"))?
            .into_iter()
            .map(|name| format!("runtime/{}", name))
            .collect()
    };

    for full_name in installed {
        let runtime_ref = format!("runtime/{}", full_name);
        candidates.remove(&runtime_ref);

        if !include_oci_branches {
            continue;
        }

        let Some(commit) = store.resolve(&runtime_ref)? else {
            continue;
        };
        let Some(info) = store.read_file(&commit, "files/.flatpod-info")? else {
            continue;
        };
        let Some(image_name) = parse_flatpod_info(&String::from_utf8_lossy(&info)) else {
            continue;
        };

        let image_ref = format!("ociimage/{}", escape(&image_name));
        candidates.remove(&image_ref);

        // the image may already have been garbage-collected
        let Some(image_commit) = store.resolve(&image_ref)? else {
            continue;
        };
        let Some(manifest_data) = store.read_file(&image_commit, "manifest.json")? else {
            continue;
        };
        let manifest: OciManifest = serde_json::from_slice(&manifest_data)?;
        for descriptor in manifest
            .layers
            .iter()
            .chain(std::iter::once(&manifest.config))
        {
            candidates.remove(&descriptor.store_ref());
        }
    }

    Ok(candidates)
}

/// Extract the image reference from a `.flatpod-info` stamp.
fn parse_flatpod_info(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("name="))
        .map(|name| name.to_string())
}
