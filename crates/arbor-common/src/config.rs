//! Configuration structures for Arbor trees.

use serde::{Deserialize, Serialize};

/// Default maximum entries per node.
pub const DEFAULT_MAX_ENTRIES: u8 = 255;

/// Default fill factor percentage used by builders.
pub const DEFAULT_FILL_FACTOR: u8 = 100;

/// Fill factor used by full rebuilds.
pub const REBUILD_FILL_FACTOR: u8 = 95;

/// Options fixed at tree creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Each key maps to exactly one value when true.
    pub unique: bool,
    /// Maximum entries per node and per leaf.
    pub max_entries: u8,
    /// Target percentage of max entries to use when building, leaving the
    /// remainder for later in-place growth.
    pub fill_factor: u8,
    /// Names of the metadata keys stored with every entry value. The schema
    /// cannot change after creation.
    pub metadata_keys: Vec<String>,
    /// Use 1-byte value-length fields (inline value sections up to 127
    /// bytes; larger lists spill into ext_data).
    pub small_leaves: bool,
    /// Allow the allocator to extend the tree's total byte length when the
    /// free tail is exhausted.
    pub auto_grow: bool,
    /// Pad records and the region tail with free space for in-place
    /// growth. Disable for read-only snapshots.
    pub add_free_space: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            unique: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            fill_factor: DEFAULT_FILL_FACTOR,
            metadata_keys: Vec::new(),
            small_leaves: true,
            auto_grow: true,
            add_free_space: true,
        }
    }
}

impl TreeOptions {
    /// Returns true when entry values carry a metadata tuple.
    pub fn has_metadata(&self) -> bool {
        !self.metadata_keys.is_empty()
    }
}

/// Configuration for chunk-buffered readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Bytes fetched from the byte source per buffered read.
    pub chunk_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self { chunk_size: 4096 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_options_defaults() {
        let opts = TreeOptions::default();
        assert!(opts.unique);
        assert_eq!(opts.max_entries, 255);
        assert_eq!(opts.fill_factor, 100);
        assert!(opts.metadata_keys.is_empty());
        assert!(!opts.has_metadata());
        assert!(opts.small_leaves);
        assert!(opts.auto_grow);
    }

    #[test]
    fn test_tree_options_metadata() {
        let opts = TreeOptions {
            metadata_keys: vec!["created".to_string(), "rev".to_string()],
            ..Default::default()
        };
        assert!(opts.has_metadata());
        assert_eq!(opts.metadata_keys.len(), 2);
    }

    #[test]
    fn test_tree_options_serde_roundtrip() {
        let original = TreeOptions {
            unique: false,
            max_entries: 50,
            fill_factor: 80,
            metadata_keys: vec!["ts".to_string()],
            small_leaves: false,
            auto_grow: false,
            add_free_space: false,
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: TreeOptions = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.unique, deserialized.unique);
        assert_eq!(original.max_entries, deserialized.max_entries);
        assert_eq!(original.fill_factor, deserialized.fill_factor);
        assert_eq!(original.metadata_keys, deserialized.metadata_keys);
        assert_eq!(original.small_leaves, deserialized.small_leaves);
        assert_eq!(original.auto_grow, deserialized.auto_grow);
    }

    #[test]
    fn test_reader_config_default() {
        let config = ReaderConfig::default();
        assert_eq!(config.chunk_size, 4096);
    }
}
