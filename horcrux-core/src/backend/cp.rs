//! Local-copy backend: mostly for testing and verifying before uploading to
//! a remote location.

use std::path::Path;

use tracing::debug;

use super::{cleanup_partial, Backend};
use crate::error::{Error, Result};

pub struct CpBackend {
    src_dir: String,
}

impl CpBackend {
    pub fn new(src_dir: &str) -> Self {
        Self {
            src_dir: src_dir.to_string(),
        }
    }
}

impl Backend for CpBackend {
    fn init(&mut self) -> Result<Option<String>> {
        debug!(src_dir = %self.src_dir, "cp backend init");
        Ok(Some(self.src_dir.clone()))
    }

    fn name(&self) -> &str {
        "cp"
    }

    fn get(&self, src: &str, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        if let Err(e) = std::fs::copy(src, dst) {
            cleanup_partial(dst);
            return Err(Error::io(src, e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn get_copies_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"hello").unwrap();
        let dst = dir.path().join("nested/dst.bin");

        let backend = CpBackend::new(dir.path().to_str().unwrap());
        backend.get(src.to_str().unwrap(), &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }

    #[test]
    fn get_missing_src_removes_partial_and_errors() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("dst.bin");
        let backend = CpBackend::new(dir.path().to_str().unwrap());
        let err = backend.get(
            dir.path().join("does-not-exist").to_str().unwrap(),
            &dst,
        );
        assert!(err.is_err());
        assert!(!dst.exists());
    }
}
