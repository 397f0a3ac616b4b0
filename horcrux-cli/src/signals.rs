use std::path::PathBuf;
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::logging::Verbosity;

/// Spawn the background thread that reacts to SIGINT/SIGTERM by unmounting
/// and SIGUSR1/SIGUSR2 by adjusting log verbosity, mirroring the original
/// tool's signal channel.
pub fn spawn(mnt_dir: PathBuf, verbosity: Arc<Verbosity>) {
    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGUSR1, SIGUSR2]).expect("cannot register signal handlers");

    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGUSR1 => verbosity.increase(),
                SIGUSR2 => verbosity.decrease(),
                SIGINT | SIGTERM => {
                    error!("interrupted, unmounting {}", mnt_dir.display());
                    if let Err(e) = unmount(&mnt_dir) {
                        error!(error = %e, "unmount failed");
                    }
                    info!("exiting");
                    std::process::exit(1);
                }
                _ => {}
            }
        }
    });
}

fn unmount(mnt_dir: &std::path::Path) -> std::io::Result<()> {
    std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mnt_dir)
        .status()
        .map(|_| ())
}
