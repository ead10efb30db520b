use std::{env, num::NonZeroUsize};

use log::warn;

/// Environment variable holding the shared seed as a string-encoded integer.
pub const GLOBAL_SEED_VAR: &str = "TRAINING_GLOBAL_SEED";

/// Environment variable marking hosted platforms that tear the process
/// group down abruptly on completion.
pub const HOSTED_PLATFORM_VAR: &str = "TRAINING_HOSTED_PLATFORM";

/// Process topology for spawn-based strategies.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    num_processes: NonZeroUsize,
    num_nodes: NonZeroUsize,
}

impl SpawnConfig {
    /// Creates a single-node topology with `num_processes` workers.
    ///
    /// # Args
    /// * `num_processes` - Worker processes per node.
    ///
    /// # Returns
    /// A `SpawnConfig` instance.
    pub fn new(num_processes: NonZeroUsize) -> Self {
        Self {
            num_processes,
            num_nodes: NonZeroUsize::MIN,
        }
    }

    /// Sets the node count of the topology.
    pub fn with_nodes(mut self, num_nodes: NonZeroUsize) -> Self {
        self.num_nodes = num_nodes;
        self
    }

    /// Returns the worker count per node.
    pub fn num_processes(&self) -> usize {
        self.num_processes.get()
    }

    /// Returns the node count.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes.get()
    }

    /// Returns the total number of cooperating processes.
    pub fn world_size(&self) -> usize {
        self.num_nodes.get() * self.num_processes.get()
    }
}

/// Snapshot of the environment-derived configuration this layer consumes
/// but does not own.
#[derive(Debug, Clone, Default)]
pub struct RuntimeEnv {
    /// Shared seed; when set, every worker seeds identically.
    pub global_seed: Option<u64>,
    /// Whether the host platform kills the process group on completion,
    /// selecting the rescue-checkpoint recovery path.
    pub hosted_platform: bool,
}

impl RuntimeEnv {
    /// Reads the snapshot from the process environment.
    pub fn from_env() -> Self {
        Self::parse(
            env::var(GLOBAL_SEED_VAR).ok().as_deref(),
            env::var(HOSTED_PLATFORM_VAR).ok().as_deref(),
        )
    }

    fn parse(seed_raw: Option<&str>, hosted_raw: Option<&str>) -> Self {
        let global_seed = seed_raw.and_then(|raw| match raw.parse() {
            Ok(seed) => Some(seed),
            Err(_) => {
                warn!(var = GLOBAL_SEED_VAR, value = raw; "ignoring non-integer seed");
                None
            }
        });

        let hosted_platform = hosted_raw
            .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            global_seed,
            hosted_platform,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seed_and_platform_flag() {
        let env = RuntimeEnv::parse(Some("1234"), Some("1"));
        assert_eq!(env.global_seed, Some(1234));
        assert!(env.hosted_platform);

        let env = RuntimeEnv::parse(Some("not-a-number"), Some("no"));
        assert_eq!(env.global_seed, None);
        assert!(!env.hosted_platform);

        let env = RuntimeEnv::parse(None, None);
        assert_eq!(env.global_seed, None);
        assert!(!env.hosted_platform);
    }

    #[test]
    fn world_size_is_nodes_times_processes() {
        let cfg = SpawnConfig::new(NonZeroUsize::new(4).unwrap())
            .with_nodes(NonZeroUsize::new(2).unwrap());
        assert_eq!(cfg.world_size(), 8);
    }
}
