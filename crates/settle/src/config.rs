//! Process-wide runtime configuration.

use parking_lot::RwLock;

/// When to capture where a rejection came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CausalityTrace {
    /// Never capture. Cheapest.
    #[default]
    Off,
    /// Capture a backtrace when a rejected container is created. Only takes
    /// effect with the `causal-trace` feature enabled.
    Rejections,
}

/// Runtime settings.
///
/// ```rust
/// use settle::config::{self, CausalityTrace, Config};
///
/// config::set(Config::new().with_causality_trace(CausalityTrace::Rejections));
/// assert_eq!(config::get().causality_trace, CausalityTrace::Rejections);
/// # config::set(Config::new());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Causal trace capture for rejections.
    pub causality_trace: CausalityTrace,
}

impl Config {
    /// The defaults.
    pub const fn new() -> Self {
        Self {
            causality_trace: CausalityTrace::Off,
        }
    }

    /// Set [`causality_trace`](Self::causality_trace).
    pub const fn with_causality_trace(mut self, trace: CausalityTrace) -> Self {
        self.causality_trace = trace;
        self
    }
}

static CONFIG: RwLock<Config> = parking_lot::const_rwlock(Config::new());

/// Replace the process-wide configuration.
pub fn set(config: Config) {
    *CONFIG.write() = config;
}

/// The current configuration.
#[inline]
pub fn get() -> Config {
    *CONFIG.read()
}
