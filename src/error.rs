use std::path::PathBuf;

/// Errors surfaced by the conversion pipeline and the repository janitor.
#[derive(Debug, thiserror::Error)]
pub enum FlatpodError {
    #[error("Invalid argument: {0}")]
    BadArgument(String),

    #[error("Image pull failed with exit code {code}")]
    PullFailed { code: i32 },

    #[error("Repository error: {0}")]
    Repo(String),

    #[error("Ref not found: {0}")]
    RefNotFound(String),

    #[error("Runtime {0} is already installed")]
    AlreadyInstalled(String),

    #[error("Unsupported image architecture: {0}")]
    UnsupportedArch(String),

    #[error("{tool} failed with status {status}")]
    ExternalTool { tool: String, status: i32 },

    #[error("Path error: {}", .0.display())]
    BadPath(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlatpodError>;
