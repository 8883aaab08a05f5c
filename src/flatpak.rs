//! Interface to the flatpak installation on the host.
//!
//! Registers the local object store as a remote, installs or updates the
//! produced runtime, and lists the runtimes installed from that remote
//! (the janitor's live set).

use std::process::Command;

use crate::error::{FlatpodError, Result};
use crate::image::RuntimeInfo;
use crate::utils::logger::Logger;

/// Name of the local remote pointing at the object store.
pub const REMOTE_NAME: &str = "flatpod-origin";

fn flatpak() -> Command {
    let mut cmd = Command::new("flatpak");
    cmd.arg("--user");
    cmd
}

fn run(mut cmd: Command) -> Result<std::process::Output> {
    let output = cmd
        .output()
        .map_err(|e| FlatpodError::Repo(format!("cannot run flatpak: {}", e)))?;
    Ok(output)
}

fn tool_error(output: &std::process::Output) -> FlatpodError {
    FlatpodError::ExternalTool {
        tool: format!("flatpak ({})", String::from_utf8_lossy(&output.stderr).trim()),
        status: output.status.code().unwrap_or(1),
    }
}

/// Register (or repoint) the local remote at the store's URI, with GPG
/// verification disabled.
pub fn register_remote(repo_uri: &str) -> Result<()> {
    let mut add = flatpak();
    add.args(["remote-add", "--no-gpg-verify", REMOTE_NAME, repo_uri]);
    if run(add)?.status.success() {
        return Ok(());
    }

    // the remote already exists; repoint it
    let mut modify = flatpak();
    modify.args([
        "remote-modify",
        &format!("--url={}", repo_uri),
        "--no-gpg-verify",
        REMOTE_NAME,
    ]);
    let output = run(modify)?;
    if !output.status.success() {
        return Err(tool_error(&output));
    }
    Ok(())
}

/// Install the runtime from the local remote, falling through to an update
/// when it is already installed.
pub fn install_or_update(info: &RuntimeInfo) -> Result<()> {
    match install(info) {
        Err(FlatpodError::AlreadyInstalled(_)) => {
            Logger::debug(&format!(
                "{} is already installed, updating instead",
                info.full_name()
            ));
            update(info)
        }
        other => other,
    }
}

fn install(info: &RuntimeInfo) -> Result<()> {
    let mut install = flatpak();
    install.args(["install", "-y", REMOTE_NAME, &info.runtime_ref()]);
    let output = run(install)?;
    if output.status.success() {
        Logger::success(&format!("Installed {}", info.full_name()));
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("already installed") {
        return Err(FlatpodError::AlreadyInstalled(info.full_name()));
    }
    Err(tool_error(&output))
}

fn update(info: &RuntimeInfo) -> Result<()> {
    let mut update = flatpak();
    update.args(["update", "-y", &info.runtime_ref()]);
    let output = run(update)?;
    if !output.status.success() {
        return Err(tool_error(&output));
    }
    Logger::success(&format!("Updated {}", info.full_name()));
    Ok(())
}

/// List installed runtimes originating from our remote, as
/// `<id>/<arch>/<branch>` strings.
pub fn installed_runtimes() -> Result<Vec<String>> {
    let mut list = flatpak();
    list.args(["list", "--runtime", "--columns=ref,origin"]);
    let output = run(list)?;
    if !output.status.success() {
        return Err(tool_error(&output));
    }
    Ok(parse_installed_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `flatpak list --columns=ref,origin` output, keeping refs whose
/// origin is our remote.
fn parse_installed_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let runtime_ref = fields.next()?;
            let origin = fields.next()?;
            if origin == REMOTE_NAME {
                Some(runtime_ref.to_string())
            } else {
                None
            }
        })
        .collect()
}
