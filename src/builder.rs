//! Runtime Layout Builder.
//!
//! Turns a checked-out, layered image root into a flatpak runtime tree:
//! applies the layers (with OCI whiteout semantics), cleans and
//! `/usr`-merges the root, relocates it under `files/`, synthesizes the
//! runtime metadata and the shell entry machinery, and commits the result
//! as a `runtime/<id>/<arch>/<branch>` branch.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{SecondsFormat, Utc};

use crate::error::{FlatpodError, Result};
use crate::image::{ImageReference, OciImageConfig, OciManifest, RuntimeInfo};
use crate::rootfs;
use crate::store::{ObjectId, ObjectStore, TreeEntry};
use crate::utils::logger::Logger;

/// External appstream compiler, invoked with its stdout silenced.
pub const COMPOSE_COMMAND: &str = "appstream-compose";

/// Shell entry point script, sourced via `ENV`/`BASH_ENV` and by `PS1`.
const OCI_INIT_SCRIPT: &str = r#"#!/bin/sh
if [ ! -e /var/run/.oci-init ] && [ -d /etc/oci-init.d ]; then
  . /etc/oci-init.d/*.sh
  touch /var/run/.oci-init
fi
if [ -z "$__OCI_INIT_PS1" ]; then
  unset PS1
  PS1="$($SHELL -c 'echo $PS1') "
  if [ -n "$BASH_VERSION" ]; then
    [ -z "$__OCI_INIT_BASH_ENV" ] || source "$__OCI_INIT_BASH_ENV"
  else
    [ -z "$__OCI_INIT_ENV" ] || source "$__OCI_INIT_ENV"
  fi
fi
"#;

/// PS1 fallback when the image config does not set one: re-derive it by
/// spawning the user's shell.
const DEFAULT_PS1: &str = "$($SHELL -c 'echo $PS1') ";

/// A whiteout found in a layer's tree, to be applied to the build root
/// before that layer is checked out.
#[derive(Debug)]
enum Whiteout {
    /// `.wh.<name>` — delete the named sibling
    Remove { marker: PathBuf, target: PathBuf },
    /// `.wh..wh..opq` — the directory hides everything below it
    Opaque { marker: PathBuf, dir: PathBuf },
}

pub struct RuntimeBuilder<'a> {
    store: &'a ObjectStore,
    build_dir: &'a Path,
    image: &'a ImageReference,
}

impl<'a> RuntimeBuilder<'a> {
    pub fn new(store: &'a ObjectStore, build_dir: &'a Path, image: &'a ImageReference) -> Self {
        RuntimeBuilder {
            store,
            build_dir,
            image,
        }
    }

    /// Check out the image root and stack its layers (oldest first,
    /// config blob last), then read the manifest and image configuration.
    pub fn checkout_image(&self) -> Result<(OciManifest, OciImageConfig)> {
        let image_ref = format!("ociimage/{}", self.image.escaped());
        self.store.checkout(&image_ref, self.build_dir)?;

        let manifest = OciManifest::read_from(self.build_dir)?;
        for descriptor in manifest.layers.iter().chain(std::iter::once(&manifest.config)) {
            Logger::debug(&format!("Applying layer {}", descriptor.digest));
            self.apply_layer(&descriptor.store_ref())?;
        }

        let config = OciImageConfig::read_from(self.build_dir)?;
        Ok((manifest, config))
    }

    /// Overlay one layer onto the build root with whiteout semantics:
    /// deletions recorded in the layer are applied first (while the tree
    /// still holds only older layers), then the layer is unioned in and
    /// its marker files stripped.
    fn apply_layer(&self, ref_name: &str) -> Result<()> {
        let commit_id = self.store.resolve_required(ref_name)?;
        let commit = self.store.read_commit(&commit_id)?;

        let mut whiteouts = Vec::new();
        self.collect_whiteouts(&commit.tree, Path::new(""), &mut whiteouts)?;

        for whiteout in &whiteouts {
            match whiteout {
                Whiteout::Remove { target, .. } => {
                    remove_any(&self.build_dir.join(target))?;
                }
                Whiteout::Opaque { dir, .. } => {
                    let dir = self.build_dir.join(dir);
                    if dir.is_dir() {
                        for entry in fs::read_dir(&dir)? {
                            remove_any(&entry?.path())?;
                        }
                    }
                }
            }
        }

        self.store.checkout(ref_name, self.build_dir)?;

        for whiteout in &whiteouts {
            let marker = match whiteout {
                Whiteout::Remove { marker, .. } | Whiteout::Opaque { marker, .. } => marker,
            };
            match fs::remove_file(self.build_dir.join(marker)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn collect_whiteouts(
        &self,
        tree_id: &ObjectId,
        prefix: &Path,
        out: &mut Vec<Whiteout>,
    ) -> Result<()> {
        let tree = self.store.read_tree(tree_id)?;
        for (name, entry) in &tree.entries {
            if name == ".wh..wh..opq" {
                out.push(Whiteout::Opaque {
                    marker: prefix.join(name),
                    dir: prefix.to_path_buf(),
                });
            } else if let Some(target) = name.strip_prefix(".wh.") {
                out.push(Whiteout::Remove {
                    marker: prefix.join(name),
                    target: prefix.join(target),
                });
            } else if let TreeEntry::Dir { object } = entry {
                self.collect_whiteouts(object, &prefix.join(name), out)?;
            }
        }
        Ok(())
    }

    /// Clean the checked-out root, flatten `/usr`, and relocate everything
    /// under `files/`.
    pub fn prepare_tree(&self) -> Result<()> {
        rootfs::clean_root(self.build_dir)?;
        rootfs::merge_usr(self.build_dir)?;

        let files = self.build_dir.join("files");
        fs::create_dir_all(&files)?;
        rootfs::merge_to(self.build_dir, &files, self.build_dir, true)
    }

    /// Write the synthesized runtime files: `metadata`, the appdata XML,
    /// the entrypoint launch script, the init-script infrastructure and
    /// the provenance stamp. The appdata XML still needs a
    /// `compile_appdata()` pass afterwards.
    pub fn write_runtime_files(&self, info: &RuntimeInfo, config: &OciImageConfig) -> Result<()> {
        fs::write(
            self.build_dir.join("metadata"),
            build_metadata(info, config),
        )?;

        let appdata_dir = self.build_dir.join("files/share/appdata");
        fs::create_dir_all(&appdata_dir)?;
        fs::write(
            appdata_dir.join(format!("{}.appdata.xml", info.id)),
            build_appdata_xml(info),
        )?;

        let bin = self.build_dir.join("files/bin");
        fs::create_dir_all(&bin)?;

        if let Some(cmd) = &config.config.cmd {
            write_executable(&bin.join("oci-run"), &build_launch_script(cmd))?;
        }
        write_executable(&bin.join("oci-init"), OCI_INIT_SCRIPT)?;

        if self.build_dir.join("files/opt").exists() {
            let init_d = self.build_dir.join("files/etc/oci-init.d");
            fs::create_dir_all(&init_d)?;
            fs::write(
                init_d.join("link-opt.sh"),
                "[ -e /opt ] || ln -s /usr/opt /opt\n",
            )?;
        }

        fs::write(
            self.build_dir.join("files/.flatpod-info"),
            format!("[Image]\nname={}\n", self.image.full_name()),
        )?;

        Ok(())
    }

    /// Compile the appdata XML with the external appstream tool, its
    /// stdout silenced.
    pub fn compile_appdata(&self, info: &RuntimeInfo) -> Result<()> {
        let prefix = self.build_dir.join("files");
        let status = Command::new(COMPOSE_COMMAND)
            .arg(format!("--prefix={}", prefix.display()))
            .arg(format!("--basename={}", info.id))
            .arg("--origin=flatpak")
            .arg(&info.id)
            .stdout(Stdio::null())
            .status()
            .map_err(|e| {
                FlatpodError::Repo(format!("cannot run {}: {}", COMPOSE_COMMAND, e))
            })?;
        if !status.success() {
            return Err(FlatpodError::ExternalTool {
                tool: COMPOSE_COMMAND.to_string(),
                status: status.code().unwrap_or(1),
            });
        }
        Ok(())
    }

    /// Commit the prepared build directory onto the runtime branch. The
    /// ref update and the commit publish atomically; an error anywhere
    /// aborts the transaction.
    pub fn commit(&self, info: &RuntimeInfo) -> Result<ObjectId> {
        let runtime_ref = info.runtime_ref();
        let parent = self.store.resolve(&runtime_ref)?;

        let mut txn = self.store.begin_transaction();
        let tree = self.store.write_directory(self.build_dir, true)?;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let subject = format!("flatpod update on {}", timestamp);
        let commit = self
            .store
            .write_commit(parent.as_ref(), &subject, &tree, &timestamp)?;

        txn.set_ref(&runtime_ref, Some(commit.clone()));
        txn.commit()?;
        self.store.regenerate_summary()?;

        Logger::detail(&runtime_ref, commit.as_hex());
        Ok(commit)
    }
}

fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn write_executable(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// Quote one word for /bin/sh.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Entrypoint script execing the image's default command.
fn build_launch_script(cmd: &[String]) -> String {
    let quoted: Vec<String> = cmd.iter().map(|w| shell_quote(w)).collect();
    format!("#!/bin/sh\nexec {} \"$@\"\n", quoted.join(" "))
}

/// Ordered key-value list with replace-on-set semantics, matching how a
/// key file treats repeated assignments.
struct EnvSection {
    entries: Vec<(String, String)>,
}

impl EnvSection {
    fn new() -> Self {
        EnvSection { entries: Vec::new() }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, name: &str, value: String) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }
}

/// The `metadata` key file naming the runtime and wiring the shell
/// environment through `oci-init`.
fn build_metadata(info: &RuntimeInfo, config: &OciImageConfig) -> String {
    let mut env = EnvSection::new();
    for (name, value) in config.env_pairs() {
        env.set(&name, value);
    }

    let original_ps1 = env.get("PS1").unwrap_or(DEFAULT_PS1).to_string();
    let init_env = env.get("ENV").unwrap_or("").to_string();
    let init_bash_env = env.get("BASH_ENV").unwrap_or("").to_string();

    env.set(
        "PS1",
        format!("$(__OCI_INIT_PS1=1 . /usr/bin/oci-init){}", original_ps1),
    );
    env.set("__OCI_INIT_ENV", init_env);
    env.set("__OCI_INIT_BASH_ENV", init_bash_env);
    env.set("ENV", "/usr/bin/oci-init".to_string());
    env.set("BASH_ENV", "/usr/bin/oci-init".to_string());

    let mut out = String::new();
    out.push_str("[Runtime]\n");
    out.push_str(&format!("name={}\n", info.id));
    out.push_str(&format!("runtime={}\n", info.full_name()));
    out.push_str(&format!("sdk={}\n", info.full_name()));
    out.push('\n');
    out.push_str("[Environment]\n");
    for (name, value) in &env.entries {
        out.push_str(&format!("{}={}\n", name, value));
    }
    out
}

/// Minimal appstream component manifest for the runtime.
fn build_appdata_xml(info: &RuntimeInfo) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<component type="runtime">
  <id>{}</id>
  <name>{}</name>
  <metadata_license>CC0-1.0</metadata_license>
  <summary>Flatpod-generated runtime</summary>
</component>
"#,
        info.id,
        info.full_name()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageReference;
    use tempfile::tempdir;

    fn runtime_info() -> RuntimeInfo {
        let image = ImageReference::parse("alpine:3.18").unwrap();
        let mut info = RuntimeInfo::derive(&image, None, None);
        info.set_architecture("amd64").unwrap();
        info
    }

    fn image_config(json: &str) -> OciImageConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_launch_script_quoting() {
        let cmd = vec!["/bin/echo".to_string(), "hi".to_string()];
        assert_eq!(
            build_launch_script(&cmd),
            "#!/bin/sh\nexec '/bin/echo' 'hi' \"$@\"\n"
        );

        let tricky = vec!["/bin/sh".to_string(), "-c".to_string(), "it's".to_string()];
        assert_eq!(
            build_launch_script(&tricky),
            "#!/bin/sh\nexec '/bin/sh' '-c' 'it'\\''s' \"$@\"\n"
        );
    }

    #[test]
    fn test_oci_init_script_literal() {
        assert!(OCI_INIT_SCRIPT.starts_with("#!/bin/sh\n"));
        assert!(OCI_INIT_SCRIPT.contains(". /etc/oci-init.d/*.sh"));
        assert!(OCI_INIT_SCRIPT.contains("touch /var/run/.oci-init"));
        assert!(OCI_INIT_SCRIPT.contains(r#"PS1="$($SHELL -c 'echo $PS1') ""#));
        assert!(OCI_INIT_SCRIPT.contains(r#"[ -z "$__OCI_INIT_BASH_ENV" ] || source "$__OCI_INIT_BASH_ENV""#));
        assert!(OCI_INIT_SCRIPT.contains(r#"[ -z "$__OCI_INIT_ENV" ] || source "$__OCI_INIT_ENV""#));
    }

    #[test]
    fn test_metadata_sections() {
        let info = runtime_info();
        let config = image_config(
            r#"{
                "architecture": "amd64",
                "config": { "Env": ["PATH=/usr/bin:/bin", "PS1=alpine$ "] }
            }"#,
        );

        let metadata = build_metadata(&info, &config);
        let lines: Vec<&str> = metadata.lines().collect();

        assert_eq!(lines[0], "[Runtime]");
        assert_eq!(lines[1], "name=io.docker.alpine");
        assert_eq!(lines[2], "runtime=io.docker.alpine/x86_64/3.18");
        assert_eq!(lines[3], "sdk=io.docker.alpine/x86_64/3.18");
        assert!(metadata.contains("\n[Environment]\n"));
        assert!(metadata.contains("PATH=/usr/bin:/bin\n"));
        assert!(metadata.contains("PS1=$(__OCI_INIT_PS1=1 . /usr/bin/oci-init)alpine$ \n"));
        assert!(metadata.contains("__OCI_INIT_ENV=\n"));
        assert!(metadata.contains("__OCI_INIT_BASH_ENV=\n"));
        assert!(metadata.contains("ENV=/usr/bin/oci-init\n"));
        assert!(metadata.contains("BASH_ENV=/usr/bin/oci-init\n"));

        // each key appears exactly once
        assert_eq!(metadata.matches("\nPS1=").count(), 1);
        assert_eq!(metadata.matches("\nENV=").count(), 1);
    }

    #[test]
    fn test_metadata_default_ps1_and_captured_env() {
        let info = runtime_info();
        let config = image_config(
            r#"{
                "architecture": "amd64",
                "config": { "Env": ["ENV=/etc/profile.d/custom.sh"] }
            }"#,
        );

        let metadata = build_metadata(&info, &config);
        assert!(metadata
            .contains("PS1=$(__OCI_INIT_PS1=1 . /usr/bin/oci-init)$($SHELL -c 'echo $PS1') \n"));
        assert!(metadata.contains("__OCI_INIT_ENV=/etc/profile.d/custom.sh\n"));
        assert!(metadata.contains("ENV=/usr/bin/oci-init\n"));
    }

    #[test]
    fn test_write_runtime_files_with_and_without_cmd() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(dir.path().join("repo")).unwrap();
        let image = ImageReference::parse("alpine:3.18").unwrap();
        let info = runtime_info();

        for (idx, (json, expect_run)) in [
            (
                r#"{"architecture":"amd64","config":{"Cmd":["/bin/echo","hi"]}}"#,
                true,
            ),
            (r#"{"architecture":"amd64"}"#, false),
        ]
        .iter()
        .enumerate()
        {
            let build = dir.path().join(format!("build{}", idx));
            fs::create_dir_all(build.join("files")).unwrap();
            let builder = RuntimeBuilder::new(&store, &build, &image);
            let config = image_config(json);

            builder.write_runtime_files(&info, &config).unwrap();

            let run_path = build.join("files/bin/oci-run");
            assert_eq!(run_path.exists(), *expect_run);
            if *expect_run {
                let mode = fs::metadata(&run_path).unwrap().permissions().mode();
                assert_eq!(mode & 0o111, 0o111);
                assert_eq!(
                    fs::read_to_string(&run_path).unwrap(),
                    "#!/bin/sh\nexec '/bin/echo' 'hi' \"$@\"\n"
                );
            }

            let init_path = build.join("files/bin/oci-init");
            assert!(init_path.exists());
            let mode = fs::metadata(&init_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
            assert_eq!(fs::read_to_string(&init_path).unwrap(), OCI_INIT_SCRIPT);

            assert!(build.join("metadata").is_file());
            assert!(build
                .join("files/share/appdata/io.docker.alpine.appdata.xml")
                .is_file());
            // no files/opt in this tree, so no link-opt.sh either
            assert!(!build.join("files/etc/oci-init.d/link-opt.sh").exists());

            assert_eq!(
                fs::read_to_string(build.join("files/.flatpod-info")).unwrap(),
                "[Image]\nname=docker.io/alpine:3.18\n"
            );
        }
    }

    #[test]
    fn test_link_opt_written_when_opt_exists() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(dir.path().join("repo")).unwrap();
        let image = ImageReference::parse("alpine:3.18").unwrap();
        let info = runtime_info();

        let build = dir.path().join("build");
        fs::create_dir_all(build.join("files/opt")).unwrap();
        let builder = RuntimeBuilder::new(&store, &build, &image);
        let config = image_config(r#"{"architecture":"amd64"}"#);

        builder.write_runtime_files(&info, &config).unwrap();

        assert_eq!(
            fs::read_to_string(build.join("files/etc/oci-init.d/link-opt.sh")).unwrap(),
            "[ -e /opt ] || ln -s /usr/opt /opt\n"
        );
    }

    #[test]
    fn test_appdata_xml_contents() {
        let info = runtime_info();
        let xml = build_appdata_xml(&info);
        assert!(xml.contains("<id>io.docker.alpine</id>"));
        assert!(xml.contains("<name>io.docker.alpine/x86_64/3.18</name>"));
        assert!(xml.contains("<metadata_license>CC0-1.0</metadata_license>"));
        assert!(xml.contains("<summary>Flatpod-generated runtime</summary>"));
    }

    #[test]
    fn test_layer_whiteouts_delete_lower_entries() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(dir.path().join("repo")).unwrap();

        // lower layer: a file to be whited out and a dir to be made opaque
        let lower = dir.path().join("lower");
        fs::create_dir_all(lower.join("etc/keys")).unwrap();
        fs::write(lower.join("etc/secret"), "old").unwrap();
        fs::write(lower.join("etc/keys/k1"), "old key").unwrap();
        let tree = store.write_directory(&lower, true).unwrap();
        let commit = store.write_commit(None, "lower", &tree, "t").unwrap();
        let mut txn = store.begin_transaction();
        txn.set_ref("ociimage/lower", Some(commit));
        txn.commit().unwrap();

        // upper layer: whiteout for etc/secret, opaque etc/keys with new content
        let upper = dir.path().join("upper");
        fs::create_dir_all(upper.join("etc/keys")).unwrap();
        fs::write(upper.join("etc/.wh.secret"), "").unwrap();
        fs::write(upper.join("etc/keys/.wh..wh..opq"), "").unwrap();
        fs::write(upper.join("etc/keys/k2"), "new key").unwrap();
        let tree = store.write_directory(&upper, true).unwrap();
        let commit = store.write_commit(None, "upper", &tree, "t").unwrap();
        let mut txn = store.begin_transaction();
        txn.set_ref("ociimage/upper", Some(commit));
        txn.commit().unwrap();

        let image = ImageReference::parse("alpine").unwrap();
        let build = dir.path().join("build");
        fs::create_dir_all(&build).unwrap();
        let builder = RuntimeBuilder::new(&store, &build, &image);

        builder.apply_layer("ociimage/lower").unwrap();
        builder.apply_layer("ociimage/upper").unwrap();

        assert!(!build.join("etc/secret").exists());
        assert!(!build.join("etc/.wh.secret").exists());
        assert!(!build.join("etc/keys/k1").exists());
        assert!(!build.join("etc/keys/.wh..wh..opq").exists());
        assert_eq!(
            fs::read_to_string(build.join("etc/keys/k2")).unwrap(),
            "new key"
        );
    }

    #[test]
    fn test_commit_publishes_runtime_ref() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(dir.path().join("repo")).unwrap();
        let image = ImageReference::parse("alpine:3.18").unwrap();
        let info = runtime_info();

        let build = dir.path().join("build");
        fs::create_dir_all(build.join("files/bin")).unwrap();
        fs::write(build.join("metadata"), "[Runtime]\nname=io.docker.alpine\n").unwrap();

        let builder = RuntimeBuilder::new(&store, &build, &image);
        let first = builder.commit(&info).unwrap();
        assert_eq!(
            store.resolve("runtime/io.docker.alpine/x86_64/3.18").unwrap(),
            Some(first.clone())
        );

        // a second commit records the first as its parent
        fs::write(build.join("files/extra"), "more").unwrap();
        let second = builder.commit(&info).unwrap();
        let commit = store.read_commit(&second).unwrap();
        assert_eq!(commit.parent, Some(first));
        assert!(commit.subject.starts_with("flatpod update on "));
    }
}
