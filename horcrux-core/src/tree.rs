//! In-memory directory tree: the hierarchical index over the flat `Meta`
//! entry list, guarded by a single `RwLock` so readers never block each
//! other and mutation sees a consistent snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::format::{Entry, Meta};

/// One node in the in-memory index: the entry itself, plus — for
/// directories — an ordered child-name vector and a name→child map kept in
/// sync with each other.
#[derive(Debug)]
pub struct TreeNode {
    pub entry: Entry,
    child_order: Vec<String>,
    children: HashMap<String, TreeNode>,
}

impl TreeNode {
    fn new(entry: Entry) -> Self {
        Self {
            entry,
            child_order: Vec::new(),
            children: HashMap::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.entry.is_dir
    }

    /// Children in insertion order, as `readdir` must present them.
    pub fn children(&self) -> impl Iterator<Item = &TreeNode> {
        self.child_order.iter().map(move |name| &self.children[name])
    }

    pub fn child(&self, name: &str) -> Option<&TreeNode> {
        self.children.get(name)
    }

    fn insert_child(&mut self, node: TreeNode) {
        self.child_order.push(node.entry.name.clone());
        self.children.insert(node.entry.name.clone(), node);
    }

    fn remove_child(&mut self, name: &str) -> Option<TreeNode> {
        let removed = self.children.remove(name);
        if removed.is_some() {
            self.child_order.retain(|n| n != name);
        }
        removed
    }
}

/// The directory tree, guarded by a single read-write lock: multiple
/// concurrent lookups/readdirs, exclusive mutation for insert/update/delete.
/// The lock is held only across tree operations, never across backend
/// fetches or cache I/O.
pub struct Tree {
    root: RwLock<TreeNode>,
}

/// A read guard over the tree, scoped to a single lookup/readdir.
pub struct TreeRead<'a>(RwLockReadGuard<'a, TreeNode>);

impl<'a> TreeRead<'a> {
    pub fn root(&self) -> &TreeNode {
        &self.0
    }

    /// Walk from the root by the slash-separated segments of `prefix`, then
    /// resolve the final child by `name`.
    pub fn lookup(&self, prefix: &str, name: &str) -> Result<&TreeNode> {
        let dir = self.resolve_dir(prefix)?;
        dir.child(name)
            .ok_or_else(|| Error::NotFound(join(prefix, name)))
    }

    pub fn resolve_dir(&self, prefix: &str) -> Result<&TreeNode> {
        let mut node = &*self.0;
        if prefix.is_empty() {
            return Ok(node);
        }
        let mut segments = prefix.split('/');
        // The first segment of any prefix names the tree root itself, not
        // a child to descend into (`prefix` always starts with the root's
        // own basename).
        let top = segments.next().expect("split always yields one segment");
        if top != node.entry.name {
            return Err(Error::NotFound(top.to_string()));
        }
        for segment in segments {
            if !node.is_dir() {
                return Err(Error::InvalidArgument(format!(
                    "{} is not a directory",
                    node.entry.name
                )));
            }
            node = node
                .child(segment)
                .ok_or_else(|| Error::NotFound(segment.to_string()))?;
        }
        // The fully-resolved prefix must itself name a directory: every
        // segment of `prefix` is an ancestor, and a non-directory ancestor
        // means the prefix was never valid to begin with.
        if !node.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                node.entry.name
            )));
        }
        Ok(node)
    }

    /// Level-order walk producing the entry list and file count.
    pub fn flatten(&self, config: crate::format::Config, current_version: String) -> Meta {
        let mut entries = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(&*self.0);
        while let Some(node) = queue.pop_front() {
            entries.push(node.entry.clone());
            for child in node.children() {
                queue.push_back(child);
            }
        }
        Meta {
            config,
            current_version,
            num_files: entries.len(),
            entries,
        }
    }
}

/// A write guard over the tree, scoped to a single insert/update/delete.
pub struct TreeWrite<'a>(RwLockWriteGuard<'a, TreeNode>);

impl<'a> TreeWrite<'a> {
    /// Find the parent by `entry.prefix`; fail with `Exists` if
    /// `entry.name` is already present; fail with `InvalidArgument` if the
    /// parent is not a directory; append to the ordered vector and name map.
    pub fn insert(&mut self, entry: Entry) -> Result<()> {
        let prefix = entry.prefix.clone();
        let name = entry.name.clone();
        let parent = resolve_dir_mut(&mut self.0, &prefix)?;
        if !parent.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                parent.entry.name
            )));
        }
        if parent.child(&name).is_some() {
            return Err(Error::Exists(join(&prefix, &name)));
        }
        parent.insert_child(TreeNode::new(entry));
        Ok(())
    }

    /// Locate by `(old.prefix, old.name)`; the stored entry must equal
    /// `old` byte-for-byte; replace in place with `new`.
    pub fn update(&mut self, old: &Entry, new: Entry) -> Result<()> {
        let parent = resolve_dir_mut(&mut self.0, &old.prefix)?;
        let child = parent
            .children
            .get_mut(&old.name)
            .ok_or_else(|| Error::NotFound(join(&old.prefix, &old.name)))?;
        if &child.entry != old {
            return Err(Error::InvalidArgument(format!(
                "stale entry for {}",
                old.name
            )));
        }
        child.entry = new;
        Ok(())
    }

    /// Locate child; if `must_be_dir`, require it is a directory with zero
    /// children (`NotEmpty` otherwise); remove from both child collections;
    /// return the removed entry.
    pub fn delete(&mut self, prefix: &str, name: &str, must_be_dir: bool) -> Result<Entry> {
        let parent = resolve_dir_mut(&mut self.0, prefix)?;
        let target = parent
            .child(name)
            .ok_or_else(|| Error::NotFound(join(prefix, name)))?;
        if must_be_dir {
            if !target.is_dir() {
                return Err(Error::InvalidArgument(format!("{name} is not a directory")));
            }
            if target.child_order.first().is_some() {
                return Err(Error::NotEmpty(join(prefix, name)));
            }
        }
        Ok(parent.remove_child(name).expect("just checked presence").entry)
    }
}

fn resolve_dir_mut<'a>(root: &'a mut TreeNode, prefix: &str) -> Result<&'a mut TreeNode> {
    let mut node = root;
    if prefix.is_empty() {
        return Ok(node);
    }
    let mut segments = prefix.split('/');
    // As in `resolve_dir`: the first segment names the tree root itself.
    let top = segments.next().expect("split always yields one segment");
    if top != node.entry.name {
        return Err(Error::NotFound(top.to_string()));
    }
    for segment in segments {
        if !node.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                node.entry.name
            )));
        }
        node = node
            .children
            .get_mut(segment)
            .ok_or_else(|| Error::NotFound(segment.to_string()))?;
    }
    if !node.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "{} is not a directory",
            node.entry.name
        )));
    }
    Ok(node)
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

impl Tree {
    /// Insert entries in `Meta` order. The first entry is the root (its
    /// `prefix` must be empty). Fails if order violates parent-before-child.
    pub fn build(meta: &Meta) -> Result<Self> {
        let mut entries = meta.entries.iter();
        let root_entry = entries
            .next()
            .ok_or_else(|| Error::InvalidArgument("empty entry list".into()))?;
        if !root_entry.prefix.is_empty() {
            return Err(Error::InvalidArgument(
                "root entry must have an empty prefix".into(),
            ));
        }
        let tree = Tree {
            root: RwLock::new(TreeNode::new(root_entry.clone())),
        };
        for entry in entries {
            tree.write().insert(entry.clone())?;
        }
        Ok(tree)
    }

    pub fn read(&self) -> TreeRead<'_> {
        TreeRead(self.root.read().expect("tree lock poisoned"))
    }

    pub fn write(&self) -> TreeWrite<'_> {
        TreeWrite(self.root.write().expect("tree lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChunkType, Config, Mode, Stat};

    fn entry(name: &str, prefix: &str, is_dir: bool) -> Entry {
        Entry {
            name: name.into(),
            prefix: prefix.into(),
            is_dir,
            stat: Stat {
                mode: if is_dir { Mode::DIR } else { Mode::empty() },
                size: 0,
                uid: 0,
                gid: 0,
            },
            num_chunks: 0,
        }
    }

    fn sample_meta() -> Meta {
        Meta {
            config: Config {
                version: "1.3",
                chunk_type: ChunkType::Static,
                chunk_size: 1 << 20,
            },
            current_version: "v1".into(),
            num_files: 4,
            entries: vec![
                entry("root", "", true),
                entry("a.txt", "root", false),
                entry("sub", "root", true),
                entry("b.bin", "root/sub", false),
            ],
        }
    }

    #[test]
    fn build_then_lookup() {
        let tree = Tree::build(&sample_meta()).unwrap();
        let read = tree.read();
        assert!(read.lookup("root", "a.txt").is_ok());
        assert!(read.lookup("root", "sub").unwrap().is_dir());
        assert!(read.lookup("root/sub", "b.bin").is_ok());
        assert!(matches!(
            read.lookup("root", "missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn lookup_through_non_dir_is_invalid_argument() {
        let tree = Tree::build(&sample_meta()).unwrap();
        let read = tree.read();
        assert!(matches!(
            read.lookup("root/a.txt", "x"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn insert_duplicate_fails_exists() {
        let tree = Tree::build(&sample_meta()).unwrap();
        let err = tree.write().insert(entry("a.txt", "root", false)).unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
    }

    #[test]
    fn insert_into_non_dir_parent_fails() {
        let tree = Tree::build(&sample_meta()).unwrap();
        let err = tree
            .write()
            .insert(entry("c.txt", "root/a.txt", false))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn delete_nonempty_dir_fails_not_empty() {
        let tree = Tree::build(&sample_meta()).unwrap();
        let err = tree.write().delete("root", "sub", true).unwrap_err();
        assert!(matches!(err, Error::NotEmpty(_)));
        // listing is unchanged
        assert!(tree.read().lookup("root", "sub").is_ok());
    }

    #[test]
    fn delete_then_flatten_round_trips_insertion_order() {
        let tree = Tree::build(&sample_meta()).unwrap();
        tree.write().delete("root/sub", "b.bin", false).unwrap();
        tree.write().delete("root", "sub", true).unwrap();
        let meta = tree.read().flatten(sample_meta().config, "v1".into());
        assert_eq!(meta.num_files, 2);
        assert_eq!(meta.entries[0].name, "root");
        assert_eq!(meta.entries[1].name, "a.txt");
    }

    #[test]
    fn flatten_build_round_trip_preserves_order() {
        let meta = sample_meta();
        let tree = Tree::build(&meta).unwrap();
        let flattened = tree.read().flatten(meta.config, meta.current_version.clone());
        let names: Vec<_> = flattened.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["root", "a.txt", "sub", "b.bin"]);
    }

    #[test]
    fn update_requires_exact_old_match() {
        let tree = Tree::build(&sample_meta()).unwrap();
        let old = entry("a.txt", "root", false);
        let mut stale = old.clone();
        stale.stat.size = 999;
        let err = tree.write().update(&stale, old.clone()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let mut new = old.clone();
        new.stat.size = 3;
        new.num_chunks = 1;
        tree.write().update(&old, new.clone()).unwrap();
        assert_eq!(tree.read().lookup("root", "a.txt").unwrap().entry, new);
    }
}
