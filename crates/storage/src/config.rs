//! Index configuration via `index.toml`
//!
//! Each index directory carries an `index.toml`. Opening an index with no
//! config file writes one; on later opens the file on disk wins over the
//! caller's settings except that the declared key type must still match.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::block::DEFAULT_BLOCK_SIZE;
use crate::error::{Result, StorageError};
use crate::key::KeyType;
use crate::page::validate_page_size;

/// Config file name placed in the index directory.
pub const CONFIG_FILE_NAME: &str = "index.toml";

/// On-disk layout of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageKind {
    /// Balanced B+tree
    #[default]
    #[serde(rename = "btree")]
    BTree,
    /// Flat sequence of blocks
    #[serde(rename = "segment_tree")]
    SegmentTree,
}

impl StorageKind {
    /// On-disk tag
    pub fn to_u8(self) -> u8 {
        match self {
            StorageKind::BTree => 1,
            StorageKind::SegmentTree => 2,
        }
    }

    /// Parse an on-disk tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(StorageKind::BTree),
            2 => Some(StorageKind::SegmentTree),
            _ => None,
        }
    }
}

/// When modified pages reach the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Flush and sync after every mutation
    #[default]
    Always,
    /// Only on an explicit `flush` or when the index is dropped
    Manual,
}

/// Index configuration loaded from `index.toml`.
///
/// # Example
///
/// ```toml
/// field = "_id"
/// key_type = "string"
/// storage = "btree"
/// page_size = 262144
/// cache_capacity = 64
/// flush = "always"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Dotted path of the indexed field.
    #[serde(default = "default_field")]
    pub field: String,
    /// Declared key type, fixed for the life of the index.
    #[serde(default = "default_key_type")]
    pub key_type: KeyType,
    /// `"btree"` or `"segment_tree"`.
    #[serde(default)]
    pub storage: StorageKind,
    /// Page size in bytes; a multiple of 512.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Resident nodes or segments kept in memory.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// `"always"` or `"manual"`.
    #[serde(default)]
    pub flush: FlushMode,
}

fn default_field() -> String {
    "_id".to_string()
}

fn default_key_type() -> KeyType {
    KeyType::String
}

fn default_page_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_cache_capacity() -> usize {
    64
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            field: default_field(),
            key_type: default_key_type(),
            storage: StorageKind::default(),
            page_size: default_page_size(),
            cache_capacity: default_cache_capacity(),
            flush: FlushMode::default(),
        }
    }
}

impl IndexConfig {
    /// Config for an index over `field` with keys of `key_type`
    pub fn new(field: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            field: field.into(),
            key_type,
            ..Self::default()
        }
    }

    /// Use `storage` as the on-disk layout
    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    /// Use pages of `page_size` bytes
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Keep at most `capacity` nodes resident
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Use `flush` as the flush policy
    pub fn with_flush(mut self, flush: FlushMode) -> Self {
        self.flush = flush;
        self
    }

    /// Check field values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty field path, a bad page size or a
    /// zero cache capacity.
    pub fn validate(&self) -> Result<()> {
        if self.field.is_empty() || self.field.split('.').any(str::is_empty) {
            return Err(StorageError::InvalidConfig(format!(
                "invalid field path '{}'",
                self.field
            )));
        }
        validate_page_size(self.page_size)?;
        if self.cache_capacity == 0 {
            return Err(StorageError::InvalidConfig(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# tapedb index configuration
#
# Dotted path of the indexed field
field = "_id"

# Key type, fixed for the life of the index:
#   "string", "int32", "int64", "uint32", "uint64" or "float64"
key_type = "string"

# Layout: "btree" (default) or "segment_tree"
storage = "btree"

# Page size in bytes, a multiple of 512 (default: 262144)
page_size = 262144

# Nodes or segments kept in memory (default: 64)
cache_capacity = 64

# Flush policy: "always" (default) or "manual"
#   "always" = write and sync after every insert or remove
#   "manual" = write on flush() or when the index is dropped
flush = "always"
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: IndexConfig = toml::from_str(&content).map_err(|e| {
            StorageError::InvalidConfig(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            StorageError::InvalidConfig(format!("failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
