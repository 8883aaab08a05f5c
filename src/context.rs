use std::fs;
use std::path::{Path, PathBuf};

use directories_next::ProjectDirs;

use crate::error::{FlatpodError, Result};

/// Directory layout the tool operates in.
///
/// Everything lives under the user data directory:
///
/// ```text
/// <data>/flatpod/repo/     object store
/// <data>/flatpod/builds/   per-run temp build directories
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    data_dir: PathBuf,
}

impl Context {
    /// Open the default per-user context, creating the directory layout
    /// on demand.
    pub fn open() -> Result<Self> {
        let dirs = ProjectDirs::from("", "", "flatpod").ok_or_else(|| {
            FlatpodError::BadArgument("cannot determine user data directory".to_string())
        })?;
        Self::at(dirs.data_dir())
    }

    /// Open a context rooted at an explicit data directory.
    pub fn at<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let context = Context {
            data_dir: data_dir.as_ref().to_path_buf(),
        };
        fs::create_dir_all(context.repo_path())?;
        fs::create_dir_all(context.builds_path())?;
        Ok(context)
    }

    /// The object store location.
    pub fn repo_path(&self) -> PathBuf {
        self.data_dir.join("repo")
    }

    /// Parent directory for per-run build directories.
    pub fn builds_path(&self) -> PathBuf {
        self.data_dir.join("builds")
    }

    /// `file://` URI of the object store, for remote registration.
    pub fn repo_uri(&self) -> String {
        format!("file://{}", self.repo_path().display())
    }
}
