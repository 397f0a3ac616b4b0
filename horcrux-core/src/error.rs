use std::path::PathBuf;

/// Error kinds surfaced by the tree, engine, packager and backends.
///
/// These map directly onto the kinds called out in the design: a missing
/// entry or chunk is `NotFound`, a malformed access spec or type mismatch is
/// `InvalidArgument`, and so on. `horcrux-cli` translates these into `libc`
/// errno values at the FUSE boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("I/O error on {path}: {source}")]
    IOError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend authentication failed: {0}")]
    AuthError(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IOError {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
