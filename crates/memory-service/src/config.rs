use serde::{Deserialize, Serialize};

/// Heap size used when the configuration does not name one: 32 MiB.
pub const DEFAULT_HEAP_SIZE: usize = 32 * 1024 * 1024;

/// Settings consumed once by [`MemoryService::init`](crate::MemoryService::init).
///
/// Missing fields take their defaults, so an empty document is a valid
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size in bytes of the block backing the service heap.
    #[serde(alias = "default_size")]
    pub heap_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: MemoryConfig = toml::from_str("").unwrap();
        assert_eq!(config, MemoryConfig::default());
        assert_eq!(config.heap_size, 32 * 1024 * 1024);
    }

    #[test]
    fn test_heap_size_and_alias() {
        let config: MemoryConfig = toml::from_str("heap_size = 65536").unwrap();
        assert_eq!(config.heap_size, 65536);
        let config: MemoryConfig = toml::from_str("default_size = 4096").unwrap();
        assert_eq!(config.heap_size, 4096);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = MemoryConfig { heap_size: 1 << 20 };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(text.trim(), "heap_size = 1048576");
        assert_eq!(toml::from_str::<MemoryConfig>(&text).unwrap(), config);
    }
}
