//! Metadata persistence: serializes a `Meta` snapshot to the `.meta` file
//! under an advisory exclusive lock, writing to a sibling temp file and
//! renaming over the original rather than truncating in place. A crash or
//! kill between truncate and write used to leave a zero-byte `.meta` file;
//! rename is atomic on the same filesystem, so readers only ever see the
//! old or the new version, never a partial one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::format::Meta;

pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a brand-new `.meta` file; fails if one already exists.
    pub fn create(path: PathBuf, meta: &Meta) -> Result<Self> {
        let json = serde_json::to_vec_pretty(meta)
            .map_err(|e| Error::InvalidArgument(format!("cannot serialize metadata: {e}")))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        file.write_all(&json).map_err(|e| Error::io(&path, e))?;
        Ok(Self { path })
    }

    pub fn load(path: PathBuf) -> Result<Meta> {
        let data = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::InvalidArgument(format!("cannot parse {}: {e}", path.display())))
    }

    /// Overwrite the metadata file with `meta`, holding an exclusive
    /// advisory lock across the whole write-and-rename so a concurrent
    /// `save` never interleaves with this one.
    pub fn save(&self, meta: &Meta) -> Result<()> {
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        lock_exclusive(&lock_file).map_err(|e| Error::io(&self.path, e))?;

        let result = self.write_via_tempfile(meta);

        let _ = unlock(&lock_file);
        result
    }

    fn write_via_tempfile(&self, meta: &Meta) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta)
            .map_err(|e| Error::InvalidArgument(format!("cannot serialize metadata: {e}")))?;

        let tmp_path = self.path.with_extension("meta.tmp");
        let mut tmp = File::create(&tmp_path).map_err(|e| Error::io(&tmp_path, e))?;
        tmp.write_all(&json).map_err(|e| Error::io(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| Error::io(&tmp_path, e))?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            Error::io(&self.path, e)
        })?;
        debug!(path = %self.path.display(), "metadata saved");
        Ok(())
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn unlock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChunkType, Config, Mode, Stat};
    use tempfile::tempdir;

    fn sample_meta() -> Meta {
        Meta {
            config: Config::new(1 << 20),
            current_version: "v1".into(),
            num_files: 1,
            entries: vec![crate::format::Entry {
                name: "root".into(),
                prefix: String::new(),
                is_dir: true,
                stat: Stat {
                    mode: Mode::DIR,
                    size: 0,
                    uid: 0,
                    gid: 0,
                },
                num_chunks: 0,
            }],
        }
    }

    #[test]
    fn create_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.meta");
        let meta = sample_meta();
        MetaStore::create(path.clone(), &meta).unwrap();

        let loaded = MetaStore::load(path).unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.current_version, "v1");
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.meta");
        let meta = sample_meta();
        MetaStore::create(path.clone(), &meta).unwrap();
        assert!(MetaStore::create(path, &meta).is_err());
    }

    #[test]
    fn save_replaces_contents_without_truncating_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.meta");
        let mut meta = sample_meta();
        let store = MetaStore::create(path.clone(), &meta).unwrap();

        meta.current_version = "v2".into();
        meta.entries[0].stat.size = 42;
        store.save(&meta).unwrap();

        let loaded = MetaStore::load(path.clone()).unwrap();
        assert_eq!(loaded.current_version, "v2");
        assert_eq!(loaded.entries[0].stat.size, 42);
        // no leftover temp file
        assert!(!path.with_extension("meta.tmp").exists());
    }
}
