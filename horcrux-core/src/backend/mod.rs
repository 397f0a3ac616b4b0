//! Backend abstraction: a small capability set `{init, name, get}`. The
//! engine is oblivious to which variant is in use — it only calls `get`.

use std::path::Path;

use crate::error::{Error, Result};

#[cfg(feature = "scp")]
pub mod scp;

mod cp;
#[cfg(feature = "s3")]
mod s3;

pub use cp::CpBackend;
#[cfg(feature = "s3")]
pub use s3::{MinioBackend, S3Backend};
#[cfg(feature = "scp")]
pub use scp::ScpBackend;

/// An interchangeable remote fetcher. `get` retrieves the object named
/// `src` and writes it to local path `dst`; on error the partial
/// destination is removed.
pub trait Backend: Send + Sync {
    /// Establish any session (auth, TCP/SSH) and return an optional prefix
    /// prepended to every object name.
    fn init(&mut self) -> Result<Option<String>>;

    /// A label for logging and FUSE subtype.
    fn name(&self) -> &str;

    /// Retrieve the object named `src` and write it to local path `dst`.
    fn get(&self, src: &str, dst: &Path) -> Result<()>;
}

/// Parse an access spec of the form `scheme://rest` and construct the
/// matching backend.
pub fn parse(spec: &str) -> Result<Box<dyn Backend>> {
    let (scheme, rest) = spec
        .split_once("://")
        .ok_or_else(|| Error::InvalidArgument(format!("bad access spec: {spec}")))?;

    match scheme {
        "cp" => Ok(Box::new(CpBackend::new(rest))),
        #[cfg(feature = "scp")]
        "scp" => Ok(Box::new(ScpBackend::parse(rest)?)),
        #[cfg(feature = "s3")]
        "s3" => Ok(Box::new(S3Backend::parse(rest)?)),
        #[cfg(feature = "s3")]
        "minio" => Ok(Box::new(s3::MinioBackend::parse(rest)?)),
        other => Err(Error::InvalidArgument(format!(
            "unsupported access scheme: {other}"
        ))),
    }
}

/// Remove a partially-written destination file, ignoring errors (the file
/// may never have existed).
pub(crate) fn cleanup_partial(dst: &Path) {
    let _ = std::fs::remove_file(dst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cp() {
        let b = parse("cp://some/dir").unwrap();
        assert_eq!(b.name(), "cp");
    }

    #[test]
    fn parse_rejects_missing_scheme() {
        assert!(parse("not-a-spec").is_err());
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(parse("ftp://host/path").is_err());
    }
}
