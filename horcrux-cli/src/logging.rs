use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::reload;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Handle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

const LEVELS: &[LevelFilter] = &[
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// Lets SIGUSR1/SIGUSR2 nudge the log level up or down at runtime, the way
/// the original tool did with logrus's global level.
pub struct Verbosity {
    handle: Handle,
    current: Mutex<usize>,
}

impl Verbosity {
    pub fn increase(&self) {
        self.step(1);
    }

    pub fn decrease(&self) {
        self.step(-1);
    }

    fn step(&self, delta: i32) {
        let mut idx = self.current.lock().expect("verbosity lock poisoned");
        let new_idx = (*idx as i32 + delta).clamp(0, LEVELS.len() as i32 - 1) as usize;
        if new_idx == *idx {
            return;
        }
        *idx = new_idx;
        let level = LEVELS[new_idx];
        let _ = self.handle.modify(|filter| *filter = EnvFilter::new(level.to_string()));
        tracing::warn!(level = %level, "log verbosity changed");
    }
}

/// Install a `fmt` subscriber honoring `RUST_LOG`, falling back to `info`.
pub fn init() -> Verbosity {
    let env_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let starting_idx = LEVELS
        .iter()
        .position(|l| l.to_string().eq_ignore_ascii_case(&env_level))
        .unwrap_or(2);

    let filter = EnvFilter::try_new(&env_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Verbosity {
        handle,
        current: Mutex::new(starting_idx),
    }
}
