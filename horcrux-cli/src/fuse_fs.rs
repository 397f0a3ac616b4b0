use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use libc::{EEXIST, EINVAL, EIO, ENOENT, ENOSYS, ENOTDIR, ENOTEMPTY};
use tracing::{debug, error, warn};

use horcrux_core::format::{Entry, Mode, Stat};
use horcrux_core::Error;

use crate::session::Session;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Maps fuser's flat inode numbers onto tree positions (`prefix`, `name`),
/// assigned on first sight and stable for the life of the mount.
#[derive(Default)]
struct Inodes {
    next: u64,
    by_ino: HashMap<u64, (String, String)>,
    by_path: HashMap<(String, String), u64>,
}

impl Inodes {
    fn new(root_name: &str) -> Self {
        let mut inodes = Inodes {
            next: ROOT_INO + 1,
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
        };
        inodes
            .by_ino
            .insert(ROOT_INO, (String::new(), root_name.to_string()));
        inodes
            .by_path
            .insert((String::new(), root_name.to_string()), ROOT_INO);
        inodes
    }

    fn get_or_assign(&mut self, prefix: &str, name: &str) -> u64 {
        let key = (prefix.to_string(), name.to_string());
        if let Some(&ino) = self.by_path.get(&key) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_path.insert(key.clone(), ino);
        self.by_ino.insert(ino, key);
        ino
    }

    fn path(&self, ino: u64) -> Option<&(String, String)> {
        self.by_ino.get(&ino)
    }

    fn forget(&mut self, ino: u64) {
        if let Some(key) = self.by_ino.remove(&ino) {
            self.by_path.remove(&key);
        }
    }

    fn rekey(&mut self, old_prefix: &str, old_name: &str, new_prefix: &str, new_name: &str) {
        let old_key = (old_prefix.to_string(), old_name.to_string());
        if let Some(ino) = self.by_path.remove(&old_key) {
            let new_key = (new_prefix.to_string(), new_name.to_string());
            self.by_path.insert(new_key.clone(), ino);
            self.by_ino.insert(ino, new_key);
        }
    }
}

pub struct HorcruxFs {
    session: Session,
    inodes: Inodes,
}

impl HorcruxFs {
    pub fn new(session: Session) -> Self {
        let root_name = session
            .tree
            .read()
            .root()
            .entry
            .name
            .clone();
        Self {
            session,
            inodes: Inodes::new(&root_name),
        }
    }

    fn attr_for(&self, ino: u64, entry: &Entry) -> FileAttr {
        let kind = file_type(entry.stat.mode);
        let perm = entry.stat.mode.perm() as u16;
        FileAttr {
            ino,
            size: entry.stat.size,
            blocks: entry.stat.size.div_ceil(512),
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind,
            perm,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: entry.stat.uid,
            gid: entry.stat.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

fn file_type(mode: Mode) -> FileType {
    if mode.contains(Mode::DIR) {
        FileType::Directory
    } else if mode.contains(Mode::SYMLINK) {
        FileType::Symlink
    } else if mode.contains(Mode::CHAR_DEVICE) {
        FileType::CharDevice
    } else if mode.contains(Mode::BLOCK_DEVICE) {
        FileType::BlockDevice
    } else if mode.contains(Mode::NAMED_PIPE) {
        FileType::NamedPipe
    } else if mode.contains(Mode::SOCKET) {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn errno_for(err: &Error) -> i32 {
    match err {
        Error::NotFound(_) => ENOENT,
        Error::InvalidArgument(_) => EINVAL,
        Error::Exists(_) => EEXIST,
        Error::NotEmpty(_) => ENOTEMPTY,
        Error::AuthError(_) => EIO,
        Error::IOError { source, .. } => source.raw_os_error().unwrap_or(EIO),
    }
}

impl Filesystem for HorcruxFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            return reply.error(EINVAL);
        };
        let Some((parent_prefix, parent_name)) = self.inodes.path(parent) else {
            return reply.error(ENOENT);
        };
        let parent_dir = join(parent_prefix, parent_name);

        let read = self.session.tree.read();
        match read.lookup(&parent_dir, name) {
            Ok(node) => {
                let ino = self.inodes.get_or_assign(&parent_dir, name);
                let attr = self.attr_for(ino, &node.entry);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        if ino != ROOT_INO {
            self.inodes.forget(ino);
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some((prefix, name)) = self.inodes.path(ino).cloned() else {
            return reply.error(ENOENT);
        };
        let read = self.session.tree.read();
        let node = if ino == ROOT_INO {
            Ok(read.root())
        } else {
            read.lookup(&prefix, &name)
        };
        match node {
            Ok(node) => reply.attr(&TTL, &self.attr_for(ino, &node.entry)),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some((prefix, name)) = self.inodes.path(ino).cloned() else {
            return reply.error(ENOENT);
        };
        let read = self.session.tree.read();
        let node = if ino == ROOT_INO {
            Ok(read.root())
        } else {
            read.lookup(&prefix, &name)
        };
        let node = match node {
            Ok(node) => node,
            Err(e) => return reply.error(errno_for(&e)),
        };
        if !node.is_dir() {
            return reply.error(ENOTDIR);
        }

        let self_dir = join(&prefix, &name);
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        let inodes = &mut self.inodes;
        for child in node.children() {
            let child_ino = inodes.get_or_assign(&self_dir, &child.entry.name);
            entries.push((child_ino, file_type(child.entry.stat.mode), child.entry.name.clone()));
        }
        drop(read);

        for (i, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        if self.inodes.path(ino).is_none() {
            return reply.error(ENOENT);
        }
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some((prefix, name)) = self.inodes.path(ino).cloned() else {
            return reply.error(ENOENT);
        };
        let entry = {
            let read = self.session.tree.read();
            match read.lookup(&prefix, &name) {
                Ok(node) => node.entry.clone(),
                Err(e) => return reply.error(errno_for(&e)),
            }
        };

        let cache_path = self.session.cache_path(&prefix, &name);
        let remote_name = self.session.remote_name(&prefix, &name);
        match self.session.engine.read(
            &cache_path,
            &remote_name,
            entry.num_chunks,
            offset as u64,
            size as usize,
        ) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!(error = ?e, file = %name, "read failed");
                reply.error(errno_for(&e));
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some((prefix, name)) = self.inodes.path(ino).cloned() else {
            return reply.error(ENOENT);
        };
        let entry = {
            let read = self.session.tree.read();
            match read.lookup(&prefix, &name) {
                Ok(node) => node.entry.clone(),
                Err(e) => return reply.error(errno_for(&e)),
            }
        };

        let cache_path = self.session.cache_path(&prefix, &name);
        let remote_name = self.session.remote_name(&prefix, &name);
        let remote_name = (entry.num_chunks > 0).then_some(remote_name.as_str());

        let outcome = match self.session.engine.write(
            &cache_path,
            remote_name,
            entry.stat.size,
            entry.num_chunks,
            offset as u64,
            data,
        ) {
            Ok(o) => o,
            Err(e) => {
                error!(error = ?e, file = %name, "write failed");
                return reply.error(errno_for(&e));
            }
        };

        if outcome.new_size.is_some() || outcome.new_num_chunks.is_some() {
            let mut new_entry = entry.clone();
            if let Some(size) = outcome.new_size {
                new_entry.stat.size = size;
            }
            if let Some(n) = outcome.new_num_chunks {
                new_entry.num_chunks = n;
            }
            if let Err(e) = self.session.tree.write().update(&entry, new_entry) {
                warn!(error = ?e, file = %name, "dir tree update after write failed");
            }
            if let Err(e) = self.session.save_meta() {
                error!(error = ?e, "metadata save after write failed");
                return reply.error(EIO);
            }
        }

        reply.written(outcome.wrote as u32);
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            return reply.error(EINVAL);
        };
        let Some((parent_prefix, parent_name)) = self.inodes.path(parent).cloned() else {
            return reply.error(ENOENT);
        };
        let parent_dir = join(&parent_prefix, &parent_name);

        let (uid, gid) = {
            let read = self.session.tree.read();
            let parent_entry = match read.lookup(&parent_prefix, &parent_name).or_else(|_| {
                if parent == ROOT_INO {
                    Ok(read.root())
                } else {
                    Err(Error::NotFound(parent_dir.clone()))
                }
            }) {
                Ok(node) => node.entry.clone(),
                Err(e) => return reply.error(errno_for(&e)),
            };
            (parent_entry.stat.uid, parent_entry.stat.gid)
        };

        let new_entry = Entry {
            name: name.to_string(),
            prefix: parent_dir.clone(),
            is_dir: false,
            stat: Stat {
                mode: Mode::from_bits_truncate(mode & Mode::PERM_MASK.bits()),
                size: 0,
                uid,
                gid,
            },
            num_chunks: 0,
        };

        if let Err(e) = self.session.tree.write().insert(new_entry.clone()) {
            return reply.error(errno_for(&e));
        }
        if let Err(e) = self.session.save_meta() {
            error!(error = ?e, "metadata save after create failed");
            return reply.error(EIO);
        }

        let ino = self.inodes.get_or_assign(&parent_dir, name);
        let attr = self.attr_for(ino, &new_entry);
        reply.created(&TTL, &attr, 0, 0, 0);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            return reply.error(EINVAL);
        };
        let Some((parent_prefix, parent_name)) = self.inodes.path(parent).cloned() else {
            return reply.error(ENOENT);
        };
        let parent_dir = join(&parent_prefix, &parent_name);

        let (uid, gid) = {
            let read = self.session.tree.read();
            match read.lookup(&parent_prefix, &parent_name).or_else(|_| {
                if parent == ROOT_INO {
                    Ok(read.root())
                } else {
                    Err(Error::NotFound(parent_dir.clone()))
                }
            }) {
                Ok(node) => (node.entry.stat.uid, node.entry.stat.gid),
                Err(e) => return reply.error(errno_for(&e)),
            }
        };

        let new_entry = Entry {
            name: name.to_string(),
            prefix: parent_dir.clone(),
            is_dir: true,
            stat: Stat {
                mode: Mode::DIR | Mode::from_bits_truncate(mode & Mode::PERM_MASK.bits()),
                size: 4096,
                uid,
                gid,
            },
            num_chunks: 0,
        };

        if let Err(e) = self.session.tree.write().insert(new_entry.clone()) {
            return reply.error(errno_for(&e));
        }
        if let Err(e) = self.session.save_meta() {
            error!(error = ?e, "metadata save after mkdir failed");
            return reply.error(EIO);
        }

        let ino = self.inodes.get_or_assign(&parent_dir, name);
        reply.entry(&TTL, &self.attr_for(ino, &new_entry), 0);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove(parent, name, false, reply);
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove(parent, name, true, reply);
    }

    fn rename(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        // Rename was never implemented upstream either — the mapping from
        // remote chunk names to local paths would need to survive it, and
        // nothing here tracks that yet.
        reply.error(ENOSYS);
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }
}

impl HorcruxFs {
    fn remove(&mut self, parent: u64, name: &OsStr, must_be_dir: bool, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            return reply.error(EINVAL);
        };
        let Some((parent_prefix, parent_name)) = self.inodes.path(parent).cloned() else {
            return reply.error(ENOENT);
        };
        let parent_dir = join(&parent_prefix, &parent_name);

        match self
            .session
            .tree
            .write()
            .delete(&parent_dir, name, must_be_dir)
        {
            Ok(_) => {}
            Err(e) => return reply.error(errno_for(&e)),
        }
        if let Err(e) = self.session.save_meta() {
            error!(error = ?e, "metadata save after remove failed");
            return reply.error(EIO);
        }
        if let Some(ino) = self.inodes.by_path.remove(&(parent_dir, name.to_string())) {
            self.inodes.by_ino.remove(&ino);
        }
        reply.ok();
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
