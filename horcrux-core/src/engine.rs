//! Chunked I/O engine: turns byte-range reads/writes against a file entry
//! into per-chunk cache-file operations, fetching missing chunks from the
//! backend on demand. Concurrent callers asking for the same missing chunk
//! share one fetch instead of racing duplicate downloads.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::format::Entry;

enum FetchState {
    InProgress,
    Done(std::result::Result<(), String>),
}

type Shared = Arc<(Mutex<FetchState>, Condvar)>;

enum Role {
    Leader(Shared),
    Follower(Shared),
}

/// The outcome of a `write`: how many bytes landed, and whether the file's
/// entry needs updating (size grew, or new chunks were allocated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub wrote: usize,
    pub new_size: Option<u64>,
    pub new_num_chunks: Option<u64>,
}

pub struct Engine {
    chunk_size: u64,
    backend: Arc<dyn Backend>,
    inflight: Mutex<HashMap<PathBuf, Shared>>,
}

impl Engine {
    pub fn new(chunk_size: u64, backend: Arc<dyn Backend>) -> Self {
        Self {
            chunk_size,
            backend,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Read up to `size` bytes starting at `offset`, bounded by
    /// `num_chunks` (the entry's currently allocated chunk count).
    pub fn read(
        &self,
        cache_name: &Path,
        remote_name: &str,
        num_chunks: u64,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>> {
        if size == 0 || num_chunks == 0 {
            return Ok(Vec::new());
        }

        let mut chunk_idx = offset / self.chunk_size;
        let mut off_in_chunk = offset - chunk_idx * self.chunk_size;
        if chunk_idx >= num_chunks {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(size);
        let mut remain = size;
        while remain > 0 && chunk_idx < num_chunks {
            let want = remain.min((self.chunk_size - off_in_chunk) as usize);
            let data = self.read_chunk(cache_name, remote_name, chunk_idx, off_in_chunk, want)?;
            let got = data.len();
            out.extend_from_slice(&data);
            remain -= got;
            off_in_chunk = 0;
            chunk_idx += 1;
            if got < want {
                break;
            }
        }
        Ok(out)
    }

    /// Write `data` at `offset`. Chunks within `entry_num_chunks` are
    /// written in place (fetching first if the write is partial and the
    /// chunk isn't cached yet); anything past that allocates new chunks.
    pub fn write(
        &self,
        cache_name: &Path,
        remote_name: Option<&str>,
        entry_size: u64,
        entry_num_chunks: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<WriteOutcome> {
        let mut chunk_idx = offset / self.chunk_size;
        let mut off_in_chunk = offset - chunk_idx * self.chunk_size;
        let mut remain = data.len();
        let mut wrote = 0usize;

        while remain > 0 && chunk_idx < entry_num_chunks {
            let to_write = remain.min(self.chunk_size as usize - off_in_chunk as usize);
            let n = self.write_existing_chunk(
                cache_name,
                remote_name,
                chunk_idx,
                off_in_chunk,
                &data[wrote..wrote + to_write],
            )?;
            if n == 0 {
                return Err(Error::io(cache_name, std::io::Error::other("short write")));
            }
            off_in_chunk = 0;
            wrote += n;
            remain -= n;
            chunk_idx += 1;
        }

        if remain == 0 {
            let end = offset + wrote as u64;
            let new_size = (end > entry_size).then_some(end);
            return Ok(WriteOutcome {
                wrote,
                new_size,
                new_num_chunks: None,
            });
        }

        while remain > 0 {
            let to_write = remain.min(self.chunk_size as usize);
            let n = self.create_chunk(cache_name, chunk_idx, off_in_chunk, &data[wrote..wrote + to_write])?;
            off_in_chunk = 0;
            wrote += n;
            remain -= n;
            chunk_idx += 1;
        }

        let new_size = offset + wrote as u64;
        let new_num_chunks = Entry::num_chunks_for_size(new_size, self.chunk_size).max(chunk_idx);
        Ok(WriteOutcome {
            wrote,
            new_size: Some(new_size),
            new_num_chunks: Some(new_num_chunks),
        })
    }

    fn read_chunk(
        &self,
        cache_name: &Path,
        remote_name: &str,
        chunk_idx: u64,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>> {
        let chunk_path = chunk_path(cache_name, chunk_idx);
        let remote_chunk_name = format!("{remote_name}.{chunk_idx}");
        self.ensure_chunk(&chunk_path, &remote_chunk_name)?;

        let file = std::fs::File::open(&chunk_path).map_err(|e| Error::io(&chunk_path, e))?;
        let cap = size.min(self.chunk_size as usize);
        let mut buf = vec![0u8; cap];
        let n = read_at_to_eof(&file, &mut buf, offset).map_err(|e| Error::io(&chunk_path, e))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_existing_chunk(
        &self,
        cache_name: &Path,
        remote_name: Option<&str>,
        chunk_idx: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let chunk_path = chunk_path(cache_name, chunk_idx);
        let present = chunk_path.exists();

        if !present {
            if let Some(parent) = chunk_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            // A partial write to a chunk we don't have cached must start
            // from the remote copy, or the untouched bytes would be lost.
            if data.len() < self.chunk_size as usize {
                let remote_name = remote_name.ok_or_else(|| {
                    Error::InvalidArgument(
                        "partial write to uncached chunk with no remote backend".into(),
                    )
                })?;
                let remote_chunk_name = format!("{remote_name}.{chunk_idx}");
                self.ensure_chunk(&chunk_path, &remote_chunk_name)?;
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&chunk_path)
            .map_err(|e| Error::io(&chunk_path, e))?;
        file.write_at(data, offset).map_err(|e| Error::io(&chunk_path, e))
    }

    fn create_chunk(
        &self,
        cache_name: &Path,
        chunk_idx: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let chunk_path = chunk_path(cache_name, chunk_idx);
        if let Some(parent) = chunk_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&chunk_path)
            .map_err(|e| Error::io(&chunk_path, e))?;
        file.write_at(data, offset).map_err(|e| Error::io(&chunk_path, e))
    }

    /// Make sure `chunk_path` exists locally, fetching it from the backend
    /// if not. Concurrent callers for the same path wait on one fetch
    /// rather than issuing redundant downloads.
    fn ensure_chunk(&self, chunk_path: &Path, remote_chunk_name: &str) -> Result<()> {
        if chunk_path.exists() {
            return Ok(());
        }

        match self.join_fetch(chunk_path) {
            Role::Follower(shared) => {
                let (lock, cvar) = &*shared;
                let mut state = lock.lock().expect("fetch state lock poisoned");
                while matches!(*state, FetchState::InProgress) {
                    state = cvar.wait(state).expect("fetch state lock poisoned");
                }
                match &*state {
                    FetchState::Done(Ok(())) => Ok(()),
                    FetchState::Done(Err(msg)) => {
                        Err(Error::io(chunk_path, std::io::Error::other(msg.clone())))
                    }
                    FetchState::InProgress => unreachable!("condvar woke before state settled"),
                }
            }
            Role::Leader(shared) => {
                let result = self.fetch_chunk(chunk_path, remote_chunk_name);
                let (lock, cvar) = &*shared;
                {
                    let mut state = lock.lock().expect("fetch state lock poisoned");
                    *state = FetchState::Done(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
                }
                cvar.notify_all();
                self.inflight
                    .lock()
                    .expect("inflight map lock poisoned")
                    .remove(chunk_path);
                result
            }
        }
    }

    fn join_fetch(&self, chunk_path: &Path) -> Role {
        let mut map = self.inflight.lock().expect("inflight map lock poisoned");
        if let Some(shared) = map.get(chunk_path) {
            Role::Follower(shared.clone())
        } else {
            let shared: Shared = Arc::new((Mutex::new(FetchState::InProgress), Condvar::new()));
            map.insert(chunk_path.to_path_buf(), shared.clone());
            Role::Leader(shared)
        }
    }

    fn fetch_chunk(&self, chunk_path: &Path, remote_chunk_name: &str) -> Result<()> {
        debug!(chunk = %chunk_path.display(), remote = %remote_chunk_name, "fetching chunk");
        if let Some(parent) = chunk_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let part_path = part_path_for(chunk_path);
        self.backend.get(remote_chunk_name, &part_path)?;
        std::fs::rename(&part_path, chunk_path).map_err(|e| {
            warn!(chunk = %chunk_path.display(), "rename of fetched chunk failed");
            Error::io(chunk_path, e)
        })
    }
}

fn chunk_path(cache_name: &Path, chunk_idx: u64) -> PathBuf {
    let mut s = cache_name.as_os_str().to_os_string();
    s.push(format!(".{chunk_idx}"));
    PathBuf::from(s)
}

fn part_path_for(chunk_path: &Path) -> PathBuf {
    let mut s = chunk_path.as_os_str().to_os_string();
    s.push(".part");
    PathBuf::from(s)
}

fn read_at_to_eof(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut total = 0;
    loop {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                total += n;
                if total == buf.len() {
                    return Ok(total);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct FakeBackend {
        objects: StdMutex<Map<String, Vec<u8>>>,
    }

    impl FakeBackend {
        fn new(objects: Map<String, Vec<u8>>) -> Self {
            Self {
                objects: StdMutex::new(objects),
            }
        }
    }

    impl Backend for FakeBackend {
        fn init(&mut self) -> Result<Option<String>> {
            Ok(None)
        }

        fn name(&self) -> &str {
            "fake"
        }

        fn get(&self, src: &str, dst: &Path) -> Result<()> {
            let objects = self.objects.lock().unwrap();
            let data = objects
                .get(src)
                .ok_or_else(|| Error::NotFound(src.to_string()))?;
            std::fs::write(dst, data).map_err(|e| Error::io(dst, e))
        }
    }

    #[test]
    fn read_fetches_missing_chunk_then_reuses_cache() {
        let dir = tempdir().unwrap();
        let cache_name = dir.path().join("cached/file");
        let mut objects = Map::new();
        objects.insert("remote/file.0".to_string(), b"hello world".to_vec());
        let backend: Arc<dyn Backend> = Arc::new(FakeBackend::new(objects));
        let engine = Engine::new(1 << 20, backend);

        let data = engine.read(&cache_name, "remote/file", 1, 0, 5).unwrap();
        assert_eq!(data, b"hello");
        assert!(chunk_path(&cache_name, 0).exists());

        let data = engine.read(&cache_name, "remote/file", 1, 6, 5).unwrap();
        assert_eq!(data, b"world");
    }

    #[test]
    fn read_past_allocated_chunks_is_empty() {
        let dir = tempdir().unwrap();
        let cache_name = dir.path().join("file");
        let backend: Arc<dyn Backend> = Arc::new(FakeBackend::new(Map::new()));
        let engine = Engine::new(16, backend);
        let data = engine.read(&cache_name, "remote/file", 1, 16, 4).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn write_within_existing_chunk_extends_size_without_new_chunks() {
        let dir = tempdir().unwrap();
        let cache_name = dir.path().join("file");
        let backend: Arc<dyn Backend> = Arc::new(FakeBackend::new(Map::new()));
        let engine = Engine::new(1 << 20, backend);

        // First write creates chunk 0 beyond current entry_num_chunks (0).
        let outcome = engine.write(&cache_name, None, 0, 0, 0, b"abc").unwrap();
        assert_eq!(outcome.wrote, 3);
        assert_eq!(outcome.new_size, Some(3));
        assert_eq!(outcome.new_num_chunks, Some(1));

        let outcome = engine.write(&cache_name, None, 3, 1, 1, b"X").unwrap();
        assert_eq!(outcome.wrote, 1);
        assert_eq!(outcome.new_size, None);
        assert_eq!(outcome.new_num_chunks, None);

        let data = engine.read(&cache_name, "remote/file", 1, 0, 3).unwrap();
        assert_eq!(data, b"aXc");
    }

    #[test]
    fn partial_write_to_uncached_chunk_fetches_remote_first() {
        let dir = tempdir().unwrap();
        let cache_name = dir.path().join("file");
        let mut objects = Map::new();
        objects.insert("remote/file.0".to_string(), b"0123456789".to_vec());
        let backend: Arc<dyn Backend> = Arc::new(FakeBackend::new(objects));
        let engine = Engine::new(10, backend);

        let outcome = engine
            .write(&cache_name, Some("remote/file"), 10, 1, 2, b"XY")
            .unwrap();
        assert_eq!(outcome.wrote, 2);

        let data = engine.read(&cache_name, "remote/file", 1, 0, 10).unwrap();
        assert_eq!(data, b"01XY456789");
    }

    #[test]
    fn missing_remote_object_cleans_up_and_errors() {
        let dir = tempdir().unwrap();
        let cache_name = dir.path().join("file");
        let backend: Arc<dyn Backend> = Arc::new(FakeBackend::new(Map::new()));
        let engine = Engine::new(1 << 20, backend);

        let err = engine.read(&cache_name, "remote/file", 1, 0, 4).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!chunk_path(&cache_name, 0).exists());
    }
}
