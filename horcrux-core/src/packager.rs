//! Packager: walks a source directory and converts it into the on-disk
//! format — a `<name>.meta` file plus a `v1/` tree of chunked file copies —
//! ready to be uploaded to a remote location and served by the mounter.

use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::format::{Config, Entry, Mode, Meta, Stat, START_VERSION};
use crate::meta_store::MetaStore;

/// Split `src` into fixed-size chunks under `dst_base`, named
/// `<dst_base>.0`, `<dst_base>.1`, ... Returns the chunk count.
fn split_file(src: &Path, dst_base: &Path, chunk_size: u64) -> Result<u64> {
    use std::io::Read;

    let mut input = fs::File::open(src).map_err(|e| Error::io(src, e))?;
    let size = input
        .metadata()
        .map_err(|e| Error::io(src, e))?
        .len();
    let num_chunks = Entry::num_chunks_for_size(size, chunk_size);

    debug!(file = %src.display(), size, num_chunks, "splitting file");

    let mut buf = vec![0u8; chunk_size as usize];
    for idx in 0..num_chunks {
        let mut filled = 0;
        loop {
            let n = input
                .read(&mut buf[filled..])
                .map_err(|e| Error::io(src, e))?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == buf.len() {
                break;
            }
        }
        if filled == 0 {
            break;
        }
        let chunk_path = PathBuf::from(format!("{}.{idx}", dst_base.display()));
        fs::write(&chunk_path, &buf[..filled]).map_err(|e| Error::io(&chunk_path, e))?;
    }
    Ok(num_chunks)
}

fn stat_of(path: &Path) -> Result<Stat> {
    let meta = fs::symlink_metadata(path).map_err(|e| Error::io(path, e))?;
    Ok(Stat {
        mode: Mode::from_unix(meta.mode()),
        size: meta.len(),
        uid: meta.uid(),
        gid: meta.gid(),
    })
}

/// Convert `in_path` (a directory) into the on-disk format under
/// `out_path/<name>`, writing `out_path/<name>.meta` and a `v1/` payload
/// tree. Fails with `Exists` if `out_path` already exists.
pub fn package(name: &str, in_path: &Path, out_path: &Path, chunk_size: u64) -> Result<()> {
    let in_path = in_path
        .canonicalize()
        .map_err(|e| Error::io(in_path, e))?;

    let root_stat = stat_of(&in_path)?;
    if !root_stat.mode.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "{} is not a directory",
            in_path.display()
        )));
    }

    if out_path.exists() {
        return Err(Error::Exists(out_path.display().to_string()));
    }
    fs::create_dir_all(out_path).map_err(|e| Error::io(out_path, e))?;

    let current_version = Meta::version_label(START_VERSION);
    let payload_root = out_path.join(&current_version);
    let in_base = in_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());

    fs::create_dir_all(payload_root.join(&in_base)).map_err(|e| Error::io(out_path, e))?;

    let mut entries = vec![Entry {
        name: in_base.clone(),
        prefix: String::new(),
        is_dir: true,
        stat: root_stat,
        num_chunks: 1,
    }];

    let mut dirs_to_visit = VecDeque::new();
    dirs_to_visit.push_back(in_base.clone());

    while let Some(rel_dir) = dirs_to_visit.pop_front() {
        let abs_dir = in_path.parent().unwrap_or(Path::new("")).join(&rel_dir);
        let read_dir = fs::read_dir(&abs_dir).map_err(|e| Error::io(&abs_dir, e))?;

        let mut names: Vec<String> = read_dir
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        for name in names {
            let abs_path = abs_dir.join(&name);
            let stat = stat_of(&abs_path)?;
            let is_dir = stat.mode.is_dir();
            let dst_rel = format!("{rel_dir}/{name}");
            let dst_path = payload_root.join(&dst_rel);

            let num_chunks = if is_dir {
                fs::create_dir(&dst_path).map_err(|e| Error::io(&dst_path, e))?;
                dirs_to_visit.push_back(dst_rel.clone());
                1
            } else {
                split_file(&abs_path, &dst_path, chunk_size)?
            };

            entries.push(Entry {
                name,
                prefix: rel_dir.clone(),
                is_dir,
                stat,
                num_chunks,
            });
        }
    }

    let num_files = entries.len();
    let meta = Meta {
        config: Config::new(chunk_size),
        current_version,
        num_files,
        entries,
    };

    let meta_path = out_path.join(format!("{name}.meta"));
    MetaStore::create(meta_path, &meta)?;

    info!(name, files = num_files, out = %out_path.display(), "packaging complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn packages_nested_tree() {
        let src = tempdir().unwrap();
        let root = src.path().join("project");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), b"hello").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/b.bin"), vec![7u8; 10]).unwrap();

        let out = tempdir().unwrap();
        let out_path = out.path().join("packed");
        package("proj", &root, &out_path, 4).unwrap();

        assert!(out_path.join("proj.meta").exists());
        let meta = MetaStore::load(out_path.join("proj.meta")).unwrap();
        assert_eq!(meta.num_files, 4); // root, a.txt, sub, b.bin
        assert_eq!(meta.current_version, "v1");

        let a_entry = meta.entries.iter().find(|e| e.name == "a.txt").unwrap();
        assert_eq!(a_entry.num_chunks, 2); // 5 bytes / 4-byte chunks

        let b_entry = meta.entries.iter().find(|e| e.name == "b.bin").unwrap();
        assert_eq!(b_entry.num_chunks, 3); // 10 bytes / 4-byte chunks

        assert!(out_path.join("v1/project/a.txt.0").exists());
        assert!(out_path.join("v1/project/sub/b.bin.2").exists());
    }

    #[test]
    fn refuses_to_overwrite_existing_output() {
        let src = tempdir().unwrap();
        let root = src.path().join("project");
        fs::create_dir(&root).unwrap();

        let out = tempdir().unwrap();
        let out_path = out.path().join("packed");
        fs::create_dir(&out_path).unwrap();

        let err = package("proj", &root, &out_path, 4096).unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
    }

    #[test]
    fn rejects_non_directory_input() {
        let src = tempdir().unwrap();
        let file = src.path().join("file.txt");
        fs::write(&file, b"x").unwrap();

        let out = tempdir().unwrap();
        let out_path = out.path().join("packed");
        let err = package("proj", &file, &out_path, 4096).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
