//! The image → runtime conversion pipeline.
//!
//! Strictly sequential: pull, check out and stack the layers, prepare the
//! tree, synthesize the runtime files, commit, install. The per-run build
//! directory is deleted on success (unless kept on request) and left in
//! place for inspection on failure.

use std::path::Path;

use crate::builder::RuntimeBuilder;
use crate::context::Context;
use crate::error::Result;
use crate::flatpak;
use crate::image::{ImageReference, RuntimeInfo};
use crate::puller;
use crate::rootfs;
use crate::store::ObjectStore;
use crate::utils::logger::{Logger, Progress};

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    pub keep_build_dir: bool,
    pub runtime_id: Option<String>,
    pub runtime_branch: Option<String>,
}

/// Convert one image into an installed runtime.
pub fn convert(ctx: &Context, raw_reference: &str, options: &ConvertOptions) -> Result<()> {
    let image = ImageReference::parse(raw_reference)?;
    let store = ObjectStore::open(ctx.repo_path())?;

    puller::pull(&image, store.path())?;

    let build_dir = tempfile::Builder::new()
        .prefix(&format!("{}.", image.escaped()))
        .tempdir_in(ctx.builds_path())?
        .into_path();

    match convert_in(ctx, &store, &build_dir, &image, options) {
        Ok(info) => {
            if options.keep_build_dir {
                Logger::detail("build directory", &build_dir.display().to_string());
            } else {
                let mut progress = Progress::new("Cleaning build directory");
                rootfs::remove_recursive(&build_dir, &mut progress)?;
                progress.finish();
            }
            Logger::success(&format!("Converted {} to {}", image, info.full_name()));
            Ok(())
        }
        Err(e) => {
            Logger::error(&format!(
                "[ERROR] conversion failed; partial tree left at {}",
                build_dir.display()
            ));
            Err(e)
        }
    }
}

fn convert_in(
    ctx: &Context,
    store: &ObjectStore,
    build_dir: &Path,
    image: &ImageReference,
    options: &ConvertOptions,
) -> Result<RuntimeInfo> {
    let mut info = RuntimeInfo::derive(
        image,
        options.runtime_id.as_deref(),
        options.runtime_branch.as_deref(),
    );

    let builder = RuntimeBuilder::new(store, build_dir, image);

    Logger::info(&format!("Checking out {}", image));
    let (_manifest, config) = builder.checkout_image()?;
    info.set_architecture(&config.architecture)?;
    Logger::detail("runtime", &info.full_name());

    Logger::info("Preparing runtime tree");
    builder.prepare_tree()?;
    builder.write_runtime_files(&info, &config)?;
    builder.compile_appdata(&info)?;

    Logger::info("Committing");
    builder.commit(&info)?;

    flatpak::register_remote(&ctx.repo_uri())?;
    flatpak::install_or_update(&info)?;

    Ok(info)
}
