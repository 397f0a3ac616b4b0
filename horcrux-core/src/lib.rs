pub mod backend;
pub mod engine;
pub mod error;
pub mod format;
pub mod meta_store;
pub mod packager;
pub mod tree;

pub use engine::{Engine, WriteOutcome};
pub use error::{Error, Result};
pub use format::{parse_chunk_size, ChunkSizeFallback, ChunkType, Config, Entry, Meta, Mode, Stat};
pub use meta_store::MetaStore;
pub use tree::{Tree, TreeNode};
