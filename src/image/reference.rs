//! Image Reference Parsing
//!
//! Parses Docker-style image references like:
//! - alpine
//! - alpine:3.18
//! - quay.io/owner/repo:tag
//! - registry.example.com/app

use crate::error::{FlatpodError, Result};

/// Parsed image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host (e.g., "docker.io", "quay.io")
    pub server: String,

    /// Image name (e.g., "alpine", "owner/repo")
    pub name: String,

    /// Tag (e.g., "latest", "3.18")
    pub tag: String,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// The first slash-separated component is taken as the registry server
    /// iff it contains a dot; otherwise the server defaults to `docker.io`.
    /// The tag defaults to `latest`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        if s.is_empty() {
            return Err(FlatpodError::BadArgument(
                "empty image reference".to_string(),
            ));
        }

        let (server, rest) = match s.split_once('/') {
            Some((first, rest)) if first.contains('.') => (first, rest),
            _ => ("docker.io", s),
        };

        if rest.is_empty() {
            return Err(FlatpodError::BadArgument(format!(
                "image reference '{}' has no name",
                s
            )));
        }

        let (name, tag) = match rest.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (rest, "latest"),
        };

        Ok(Self {
            server: server.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Get the full reference string
    pub fn full_name(&self) -> String {
        format!("{}/{}:{}", self.server, self.name, self.tag)
    }

    /// Filesystem-safe token used as part of an object-store ref.
    ///
    /// Percent-encodes every character outside the unreserved set, then
    /// replaces `%` with `_`. Injective over valid image references; not
    /// required to be reversible.
    pub fn escaped(&self) -> String {
        escape(&self.full_name())
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = FlatpodError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Percent-encode every character outside `[A-Za-z0-9._~-]`, then replace
/// `%` with `_`.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            other => {
                out.push('_');
                out.push_str(&format!("{:02X}", other));
            }
        }
    }
    out
}

/// OCI architecture name → flatpak architecture name.
const ARCHITECTURES: &[(&str, &str)] = &[
    ("386", "i386"),
    ("amd64", "x86_64"),
    ("arm", "arm"),
    ("arm64", "aarch64"),
    ("mips", "mips"),
    ("mipsle", "mipsel"),
    ("mips64", "mips64"),
    ("mips64le", "mips64el"),
];

/// Map an OCI architecture name to the flatpak one.
pub fn architecture_for(oci_arch: &str) -> Option<&'static str> {
    ARCHITECTURES
        .iter()
        .find(|(oci, _)| *oci == oci_arch)
        .map(|(_, flatpak)| *flatpak)
}

/// Identity of the runtime being produced, derived from the image
/// reference unless overridden by the caller.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    /// Reverse-DNS-style identifier
    pub id: String,

    /// Runtime branch (the image tag; `latest` maps to `master`)
    pub branch: String,

    /// Flatpak architecture, filled in after reading the image config
    pub arch: Option<String>,
}

impl RuntimeInfo {
    /// Derive the runtime identity from an image reference, applying any
    /// caller overrides.
    pub fn derive(
        reference: &ImageReference,
        id_override: Option<&str>,
        branch_override: Option<&str>,
    ) -> Self {
        let id = match id_override {
            Some(id) => id.to_string(),
            None => {
                let mut components: Vec<&str> = reference.server.split('.').collect();
                components.reverse();
                format!("{}.{}", components.join("."), reference.name).replace('/', ".")
            }
        };

        let branch = match branch_override {
            Some(branch) => branch.to_string(),
            None if reference.tag == "latest" => "master".to_string(),
            None => reference.tag.clone(),
        };

        RuntimeInfo {
            id,
            branch,
            arch: None,
        }
    }

    /// Record the architecture read from the image config.
    pub fn set_architecture(&mut self, oci_arch: &str) -> Result<()> {
        match architecture_for(oci_arch) {
            Some(arch) => {
                self.arch = Some(arch.to_string());
                Ok(())
            }
            None => Err(FlatpodError::UnsupportedArch(oci_arch.to_string())),
        }
    }

    /// `<id>/<arch>/<branch>`
    pub fn full_name(&self) -> String {
        format!(
            "{}/{}/{}",
            self.id,
            self.arch.as_deref().unwrap_or("undefined"),
            self.branch
        )
    }

    /// Object-store ref for this runtime.
    pub fn runtime_ref(&self) -> String {
        format!("runtime/{}", self.full_name())
    }
}
