mod cli;
mod fuse_fs;
mod logging;
mod session;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;
use tracing::{info, warn};

use cli::{Cli, Command};
use fuse_fs::HorcruxFs;
use session::Session;

fn main() {
    let verbosity = Arc::new(logging::init());

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Generate {
            chunksize,
            name,
            in_dir,
            out_dir,
        } => generate(&chunksize, &name, &in_dir, &out_dir),
        Command::Mount {
            name,
            access,
            mnt_dir,
        } => mount(&name, &access, &mnt_dir, verbosity),
    };

    if let Err(err) = result {
        eprintln!("horcrux: {err:#}");
        std::process::exit(1);
    }
}

fn generate(chunksize: &str, name: &str, in_dir: &PathBuf, out_dir: &PathBuf) -> Result<()> {
    let chunk_size = horcrux_core::parse_chunk_size(chunksize).unwrap_or_else(|_| {
        warn!(
            requested = chunksize,
            default = horcrux_core::format::CHUNKSIZE_DEFAULT_STR,
            "invalid or out-of-range chunk size, falling back to default"
        );
        horcrux_core::format::CHUNKSIZE_DEFAULT
    });

    horcrux_core::packager::package(name, in_dir, out_dir, chunk_size)
        .with_context(|| format!("packaging {} into {}", in_dir.display(), out_dir.display()))?;
    Ok(())
}

fn mount(name: &str, access: &str, mnt_dir: &PathBuf, verbosity: Arc<logging::Verbosity>) -> Result<()> {
    let cache_dir = cache_dir_for(name)?;
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("cannot create {}", cache_dir.display()))?;

    let session = Session::open(name, access, cache_dir).context("cannot open session")?;
    let subtype = format!("horcrux.{name}");
    info!(name, mnt_dir = %mnt_dir.display(), "mounting");

    signals::spawn(mnt_dir.clone(), verbosity);

    let fs = HorcruxFs::new(session);
    let options = vec![
        MountOption::FSName("horcrux".to_string()),
        MountOption::Subtype(subtype),
        MountOption::DefaultPermissions,
    ];
    fuser::mount2(fs, mnt_dir, &options)
        .with_context(|| format!("cannot mount at {}", mnt_dir.display()))?;
    Ok(())
}

/// `<home>/.horcrux/<name>/`, created by the caller if missing rather than
/// requiring it to exist ahead of time.
fn cache_dir_for(name: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".horcrux").join(name))
}
