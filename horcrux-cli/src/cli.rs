use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "horcrux", version, about = "Horcrux CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Convert a directory into the Horcrux on-disk format
    #[command(visible_alias = "g", visible_alias = "gen")]
    Generate {
        /// Chunk size, with an optional k/m/g suffix
        #[arg(short = 's', long = "chunksize", default_value = horcrux_core::format::CHUNKSIZE_DEFAULT_STR)]
        chunksize: String,

        /// Name under which this tree will be packaged
        name: String,
        /// Source directory to package
        in_dir: PathBuf,
        /// Destination directory for the packaged output
        out_dir: PathBuf,
    },

    /// Mount a packaged Horcrux tree over FUSE
    #[command(visible_alias = "m", visible_alias = "mnt")]
    Mount {
        /// Name the tree was packaged under
        name: String,
        /// Access spec: cp://<dir>, scp://user[::pwd]@host:path, s3://bucket@region, minio://host:port/bucket
        access: String,
        /// Local mount point
        mnt_dir: PathBuf,
    },
}
