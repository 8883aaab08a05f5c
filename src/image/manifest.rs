//! OCI Image Manifest and Configuration Parsing
//!
//! Reads the `manifest.json` and `content` (image configuration) blobs the
//! pull tool stages into the object store, once checked out on disk.
//!
//! See: https://github.com/opencontainers/image-spec/blob/main/manifest.md

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

/// Content descriptor - refers to a blob by digest
#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    /// Content hash (e.g., "sha256:abc123...")
    pub digest: String,
}

impl Descriptor {
    /// The digest without its `sha256:` prefix, used as an object-store
    /// ref token.
    pub fn token(&self) -> &str {
        self.digest.strip_prefix("sha256:").unwrap_or(&self.digest)
    }

    /// Object-store ref holding this blob's tree.
    pub fn store_ref(&self) -> String {
        format!("ociimage/{}", self.token())
    }
}

/// OCI Image Manifest
#[derive(Debug, Clone, Deserialize)]
pub struct OciManifest {
    /// Reference to the image configuration blob
    pub config: Descriptor,

    /// Layer descriptors, oldest first
    pub layers: Vec<Descriptor>,
}

impl OciManifest {
    /// Parse `manifest.json` from a checked-out image root.
    pub fn read_from(dir: &Path) -> Result<Self> {
        let data = std::fs::read(dir.join("manifest.json"))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Runtime configuration embedded in the image configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciContainerConfig {
    /// Environment variables (["KEY=VALUE", ...])
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,

    /// Default command
    #[serde(rename = "Cmd")]
    pub cmd: Option<Vec<String>>,
}

/// OCI Image Configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OciImageConfig {
    /// CPU architecture (e.g., "amd64", "arm64")
    pub architecture: String,

    /// Runtime configuration
    #[serde(default)]
    pub config: OciContainerConfig,
}

impl OciImageConfig {
    /// Parse the `content` blob from a checked-out image root.
    pub fn read_from(dir: &Path) -> Result<Self> {
        let data = std::fs::read(dir.join("content"))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Split `Env` into `(name, value)` pairs on the first `=`.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.config
            .env
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(name, value)| (name.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Look up one environment entry by name.
    pub fn env_var(&self, name: &str) -> Option<String> {
        self.env_pairs()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}
