//! Runtime configuration.
//!
//! Defaults are reasonable for tests and small services; every knob can be
//! overridden programmatically or through `WEFT_*` environment variables.

use thiserror::Error;

/// How the runtime clock advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeMode {
    /// Elapsed wall-clock time from runtime start.
    #[default]
    Wall,
    /// Deterministic virtual time: only moves when the driver is idle and
    /// advances it to the next timer deadline.
    Virtual,
}

/// Errors from parsing configuration overrides.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that did not parse.
    #[error("invalid value for {var}: {value:?}")]
    Invalid {
        /// The offending variable.
        var: &'static str,
        /// Its raw value.
        value: String,
    },
}

/// Tunables for a [`Runtime`](super::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Clock mode.
    pub time: TimeMode,
    /// Shared cap on the total number of offload threads across pools.
    pub thread_budget: usize,
    /// Cap for the compute offload pool.
    pub compute_threads: usize,
    /// Cap for the blocking offload pool.
    pub blocking_threads: usize,
    /// Per-context ready-queue depth at which saturation is reported.
    pub context_pressure: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4);
        Self {
            time: TimeMode::default(),
            thread_budget: 64,
            compute_threads: parallelism,
            blocking_threads: 64,
            context_pressure: 8192,
        }
    }
}

impl RuntimeConfig {
    /// A configuration using the deterministic virtual clock.
    #[must_use]
    pub fn virtual_time() -> Self {
        Self {
            time: TimeMode::Virtual,
            ..Self::default()
        }
    }

    /// Defaults with `WEFT_*` environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a set variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Applies `WEFT_*` environment overrides to `self`.
    ///
    /// Recognised variables: `WEFT_TIME_MODE` (`wall`/`virtual`),
    /// `WEFT_THREAD_BUDGET`, `WEFT_COMPUTE_THREADS`, `WEFT_BLOCKING_THREADS`,
    /// `WEFT_CONTEXT_PRESSURE`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a set variable does not parse.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(value) = read_env("WEFT_TIME_MODE") {
            self.time = match value.to_ascii_lowercase().as_str() {
                "wall" => TimeMode::Wall,
                "virtual" => TimeMode::Virtual,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "WEFT_TIME_MODE",
                        value,
                    })
                }
            };
        }
        self.thread_budget = parse_env("WEFT_THREAD_BUDGET", self.thread_budget)?;
        self.compute_threads = parse_env("WEFT_COMPUTE_THREADS", self.compute_threads)?;
        self.blocking_threads = parse_env("WEFT_BLOCKING_THREADS", self.blocking_threads)?;
        self.context_pressure = parse_env("WEFT_CONTEXT_PRESSURE", self.context_pressure)?;
        Ok(self)
    }
}

fn read_env(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_env(var: &'static str, current: usize) -> Result<usize, ConfigError> {
    match read_env(var) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(current),
    }
}
