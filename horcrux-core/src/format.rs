//! The on-disk / wire representation of a packaged tree: `Config`, `Stat`,
//! `Entry` and `Meta`. Field names on the serde side are load-bearing so the
//! JSON produced here stays byte-compatible across versions.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// `"1.3"` — the format version string stamped into every `Config`.
pub const FORMAT_VERSION: &str = "1.3";

pub const MIN_VERSION: u32 = 1;
pub const MAX_VERSION: u32 = 1000;
pub const START_VERSION: u32 = MIN_VERSION;

pub const CHUNKSIZE_MIN: u64 = 1 << 20; // 1 MiB
pub const CHUNKSIZE_DEFAULT: u64 = 64 << 20; // 64 MiB
pub const CHUNKSIZE_DEFAULT_STR: &str = "64M";

/// Only `Static` is implemented. `Rollsum` exists as a named variant so a
/// packaged tree that asks for it fails with a clear `InvalidArgument`
/// instead of a deserialization error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkType {
    #[serde(rename = "static")]
    Static,
    #[serde(rename = "rollsum")]
    Rollsum,
}

impl ChunkType {
    pub fn is_implemented(self) -> bool {
        matches!(self, ChunkType::Static)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "Version")]
    pub version: &'static str,
    #[serde(rename = "Chunk Type")]
    pub chunk_type: ChunkType,
    #[serde(rename = "Chunk Size")]
    pub chunk_size: u64,
}

impl Config {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            chunk_type: ChunkType::Static,
            chunk_size,
        }
    }
}

bitflags! {
    /// Mode bits: low 9 bits are the usual permission bits, the rest are
    /// type/setuid/setgid flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Mode: u32 {
        const PERM_MASK    = 0o777;
        const SETUID       = 1 << 11;
        const SETGID       = 1 << 12;
        const DIR          = 1 << 16;
        const CHAR_DEVICE  = 1 << 17;
        const BLOCK_DEVICE = 1 << 18;
        const NAMED_PIPE   = 1 << 19;
        const SYMLINK      = 1 << 20;
        const SOCKET       = 1 << 21;
    }
}

impl Mode {
    pub fn perm(self) -> u32 {
        (self & Mode::PERM_MASK).bits()
    }

    pub fn is_dir(self) -> bool {
        self.contains(Mode::DIR)
    }

    /// Build a `Mode` from a raw POSIX `st_mode` value.
    pub fn from_unix(raw: u32) -> Self {
        let mut mode = Mode::from_bits_truncate(raw & 0o777);
        const S_IFMT: u32 = 0o170000;
        const S_IFREG: u32 = 0o100000;
        const S_IFDIR: u32 = 0o040000;
        const S_IFCHR: u32 = 0o020000;
        const S_IFBLK: u32 = 0o060000;
        const S_IFIFO: u32 = 0o010000;
        const S_IFLNK: u32 = 0o120000;
        const S_IFSOCK: u32 = 0o140000;
        match raw & S_IFMT {
            S_IFREG => {}
            S_IFDIR => mode |= Mode::DIR,
            S_IFCHR => mode |= Mode::CHAR_DEVICE,
            S_IFBLK => mode |= Mode::BLOCK_DEVICE,
            S_IFIFO => mode |= Mode::NAMED_PIPE,
            S_IFLNK => mode |= Mode::SYMLINK,
            S_IFSOCK => mode |= Mode::SOCKET,
            _ => {}
        }
        if raw & 0o4000 != 0 {
            mode |= Mode::SETUID;
        }
        if raw & 0o2000 != 0 {
            mode |= Mode::SETGID;
        }
        mode
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    #[serde(rename = "Mode")]
    pub mode: Mode,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Uid")]
    pub uid: u32,
    #[serde(rename = "Gid")]
    pub gid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Prefix")]
    pub prefix: String,
    #[serde(rename = "IsDir")]
    pub is_dir: bool,
    #[serde(rename = "Stat")]
    pub stat: Stat,
    #[serde(rename = "Number of Chunks")]
    pub num_chunks: u64,
}

impl Entry {
    pub fn num_chunks_for_size(size: u64, chunk_size: u64) -> u64 {
        if size == 0 {
            0
        } else {
            size.div_ceil(chunk_size)
        }
    }
}

/// Parse a chunk-size argument like `"64M"`, `"128k"`, `"1g"`, or a bare
/// byte count. `k`/`K`, `m`/`M`, `g`/`G` shift by 10/20/30 bits. Invalid
/// input, a value below `CHUNKSIZE_MIN`, or a non-power-of-two falls back
/// to `CHUNKSIZE_DEFAULT`; the caller is expected to warn when `Err` comes
/// back with the fallback already applied.
pub fn parse_chunk_size(s: &str) -> std::result::Result<u64, ChunkSizeFallback> {
    let validate = |n: u64| -> std::result::Result<u64, ChunkSizeFallback> {
        if n < CHUNKSIZE_MIN || !n.is_power_of_two() {
            Err(ChunkSizeFallback)
        } else {
            Ok(n)
        }
    };

    let s = s.trim();
    let (digits, shift) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 10),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 20),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };

    match digits.parse::<u64>() {
        Ok(n) => n
            .checked_shl(shift)
            .ok_or(ChunkSizeFallback)
            .and_then(validate),
        Err(_) => Err(ChunkSizeFallback),
    }
}

/// Marker that [`parse_chunk_size`] fell back to [`CHUNKSIZE_DEFAULT`]; the
/// caller logs a warning and uses the default.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSizeFallback;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "Config")]
    pub config: Config,
    #[serde(rename = "Current Version")]
    pub current_version: String,
    #[serde(rename = "Num Files")]
    pub num_files: usize,
    #[serde(rename = "Entry List")]
    pub entries: Vec<Entry>,
}

impl Meta {
    pub fn version_label(n: u32) -> String {
        format!("v{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_unix_dir() {
        let m = Mode::from_unix(0o040755);
        assert!(m.is_dir());
        assert_eq!(m.perm(), 0o755);
    }

    #[test]
    fn mode_from_unix_setuid_regular() {
        let m = Mode::from_unix(0o104755);
        assert!(!m.is_dir());
        assert!(m.contains(Mode::SETUID));
        assert_eq!(m.perm(), 0o755);
    }

    #[test]
    fn num_chunks_for_size_boundaries() {
        assert_eq!(Entry::num_chunks_for_size(0, 1024), 0);
        assert_eq!(Entry::num_chunks_for_size(1, 1024), 1);
        assert_eq!(Entry::num_chunks_for_size(1024, 1024), 1);
        assert_eq!(Entry::num_chunks_for_size(1025, 1024), 2);
    }

    #[test]
    fn parse_chunk_size_suffixes() {
        assert_eq!(parse_chunk_size("64M").unwrap(), 64 << 20);
        assert_eq!(parse_chunk_size("1g").unwrap(), 1 << 30);
        assert_eq!(parse_chunk_size("1024k").unwrap(), 1 << 20);
        assert_eq!(parse_chunk_size(&(2u64 << 20).to_string()).unwrap(), 2 << 20);
    }

    #[test]
    fn parse_chunk_size_rejects_below_minimum() {
        assert!(parse_chunk_size("512k").is_err());
    }

    #[test]
    fn parse_chunk_size_rejects_non_power_of_two() {
        assert!(parse_chunk_size("3M").is_err());
    }

    #[test]
    fn parse_chunk_size_rejects_garbage() {
        assert!(parse_chunk_size("not-a-size").is_err());
        assert!(parse_chunk_size("").is_err());
    }

    #[test]
    fn meta_round_trips_field_names() {
        let meta = Meta {
            config: Config::new(CHUNKSIZE_DEFAULT),
            current_version: Meta::version_label(START_VERSION),
            num_files: 1,
            entries: vec![Entry {
                name: "root".into(),
                prefix: String::new(),
                is_dir: true,
                stat: Stat {
                    mode: Mode::DIR | Mode::from_bits_truncate(0o755),
                    size: 4096,
                    uid: 0,
                    gid: 0,
                },
                num_chunks: 1,
            }],
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"Current Version\""));
        assert!(json.contains("\"Number of Chunks\""));
        let back: Meta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].name, "root");
    }
}
