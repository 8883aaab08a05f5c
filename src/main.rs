mod builder;
mod context;
mod error;
mod flatpak;
mod image;
mod janitor;
mod pipeline;
mod puller;
mod rootfs;
mod store;
mod utils;

use clap::Parser;

use context::Context;
use error::{FlatpodError, Result};
use janitor::CleanupMode;
use pipeline::ConvertOptions;
use utils::logger::Logger;

/// Flatpod - convert OCI container images into flatpak runtimes
#[derive(Parser, Debug)]
#[clap(author, version, about = "Convert OCI container images into flatpak runtimes")]
struct FlatpodCli {
    /// Image reference to convert ([server/]name[:tag])
    image: Option<String>,

    /// Enable debug-level logging
    #[clap(long)]
    verbose: bool,

    /// Suppress non-error output
    #[clap(long)]
    quiet: bool,

    /// Do not delete the temp build directory on success
    #[clap(long)]
    keep_build_dir: bool,

    /// Override the derived runtime id
    #[clap(short = 'i', long, value_name = "ID")]
    runtime_id: Option<String>,

    /// Override the derived runtime branch
    #[clap(short = 'b', long, value_name = "BRANCH")]
    runtime_branch: Option<String>,

    /// Run the repository janitor in the given mode and exit
    #[clap(long, value_enum, value_name = "MODE")]
    cleanup: Option<CleanupMode>,
}

fn main() {
    let cli = FlatpodCli::parse();

    // Set environment toggles based on global flags
    if cli.quiet {
        std::env::set_var("FLATPOD_QUIET", "1");
    }
    if cli.verbose {
        std::env::set_var("FLATPOD_VERBOSE", "1");
    }

    if let Err(e) = run(cli) {
        Logger::error(&e.to_string());
        let code = match e {
            FlatpodError::PullFailed { code } => code,
            FlatpodError::BadArgument(_) => 1,
            _ => 1,
        };
        std::process::exit(code);
    }
}

fn run(cli: FlatpodCli) -> Result<()> {
    let ctx = Context::open()?;

    // The external pull tool inherits this; per-run temp directories land
    // next to the repo rather than in /tmp.
    std::env::set_var("TMPDIR", ctx.builds_path());

    if let Some(mode) = cli.cleanup {
        return janitor::run(&ctx, mode);
    }

    let image = cli.image.ok_or_else(|| {
        FlatpodError::BadArgument("an image reference is required".to_string())
    })?;

    let options = ConvertOptions {
        keep_build_dir: cli.keep_build_dir,
        runtime_id: cli.runtime_id,
        runtime_branch: cli.runtime_branch,
    };

    pipeline::convert(&ctx, &image, &options)
}
