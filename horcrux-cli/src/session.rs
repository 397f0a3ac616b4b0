use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use horcrux_core::backend::{self, Backend};
use horcrux_core::format::{Config, Meta};
use horcrux_core::{Engine, MetaStore, Tree};

/// Everything the FUSE adapter needs to serve one mounted tree: the
/// directory index, the chunked I/O engine, and where metadata lives.
pub struct Session {
    pub tree: Tree,
    pub engine: Engine,
    pub meta_store: MetaStore,
    pub config: Config,
    pub current_version: String,
    pub cache_dir: PathBuf,
    pub remote_prefix: Option<String>,
}

impl Session {
    pub fn open(name: &str, access: &str, cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("cannot create cache dir {}", cache_dir.display()))?;

        let mut backend = backend::parse(access).context("invalid access spec")?;
        let remote_prefix = backend.init().context("cannot initialize backend")?;

        info!(backend = backend.name(), remote_prefix = ?remote_prefix, "backend ready");

        let meta_name = format!("{name}.meta");
        let meta_path = cache_dir.join(&meta_name);

        if !meta_path.exists() {
            let remote_meta_name = match &remote_prefix {
                Some(prefix) => format!("{prefix}/{meta_name}"),
                None => meta_name.clone(),
            };
            backend
                .get(&remote_meta_name, &meta_path)
                .context("cannot fetch metadata file")?;
        } else {
            info!("metadata file present locally, reusing it");
        }

        let meta = MetaStore::load(meta_path.clone()).context("cannot parse metadata file")?;
        let tree = Tree::build(&meta).context("cannot build directory tree from metadata")?;
        let meta_store = MetaStore::new(meta_path);
        let backend: Arc<dyn Backend> = Arc::from(backend);
        let engine = Engine::new(meta.config.chunk_size, backend);

        Ok(Self {
            tree,
            engine,
            meta_store,
            config: meta.config,
            current_version: meta.current_version,
            cache_dir,
            remote_prefix,
        })
    }

    pub fn save_meta(&self) -> Result<()> {
        let meta = self
            .tree
            .read()
            .flatten(self.config, self.current_version.clone());
        self.meta_store.save(&meta).context("cannot save metadata")
    }

    /// Path under the cache dir for `prefix/name`'s payload, mirroring the
    /// packaged layout's `<version>/<prefix>/<name>`.
    pub fn cache_path(&self, prefix: &str, name: &str) -> PathBuf {
        self.cache_dir
            .join(&self.current_version)
            .join(rel_path(prefix, name))
    }

    /// The object name the backend should fetch for `prefix/name`.
    pub fn remote_name(&self, prefix: &str, name: &str) -> String {
        let rel = rel_path(prefix, name);
        match &self.remote_prefix {
            Some(p) => format!("{p}/{}/{rel}", self.current_version),
            None => format!("{}/{rel}", self.current_version),
        }
    }
}

fn rel_path(prefix: &str, name: &str) -> PathBuf {
    if prefix.is_empty() {
        PathBuf::from(name)
    } else {
        Path::new(prefix).join(name)
    }
}
