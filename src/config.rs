//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::constants::CELL_SIZE;
use crate::policy::CachePolicyKind;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxistripeConfig {
    /// Cache configuration.
    pub cache: Option<CacheSection>,
    /// I/O and striping configuration.
    pub io: Option<IoSection>,
    /// Per-file weighting.
    pub files: Option<FilesSection>,
}

impl OxistripeConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXISTRIPE_CONFIG` env var (if set),
    /// then apply `OXISTRIPE__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXISTRIPE_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXISTRIPE__") {
                continue;
            }
            let path = key["OXISTRIPE__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["cache", "size"] => {
                    self.cache_mut().size = Some(parse_value(&key, &value)?);
                }
                ["cache", "init_size"] => {
                    self.cache_mut().init_size = Some(parse_value(&key, &value)?);
                }
                ["cache", "kind"] => {
                    self.cache_mut().kind = Some(value.to_string());
                }
                ["cache", "expandable"] => {
                    self.cache_mut().expandable = Some(parse_value(&key, &value)?);
                }
                ["cache", "writable"] => {
                    self.cache_mut().writable = Some(parse_value(&key, &value)?);
                }
                ["cache", "dirty_pages_threshold"] => {
                    self.cache_mut().dirty_pages_threshold = Some(parse_value(&key, &value)?);
                }
                ["io", "raid_block_pages"] => {
                    self.io_mut().raid_block_pages = Some(parse_value(&key, &value)?);
                }
                ["io", "num_nodes"] => {
                    self.io_mut().num_nodes = Some(parse_value(&key, &value)?);
                }
                ["io", "aio_depth_per_file"] => {
                    self.io_mut().aio_depth_per_file = Some(parse_value(&key, &value)?);
                }
                ["io", "test_hit_rate"] => {
                    self.io_mut().test_hit_rate = Some(parse_value(&key, &value)?);
                }
                ["files", "weights"] => {
                    self.files_mut().weights = Some(
                        value
                            .split(',')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect(),
                    );
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Resolve the configuration into engine parameters.
    pub fn to_params(&self) -> Result<CacheParams, ConfigError> {
        let mut params = CacheParams::default();
        if let Some(cache) = &self.cache {
            cache.apply_to(&mut params)?;
        }
        if let Some(io) = &self.io {
            io.apply_to(&mut params)?;
        }
        if let Some(files) = &self.files {
            files.apply_to(&mut params)?;
        }
        Ok(params)
    }

    fn cache_mut(&mut self) -> &mut CacheSection {
        self.cache.get_or_insert_with(CacheSection::default)
    }

    fn io_mut(&mut self) -> &mut IoSection {
        self.io.get_or_insert_with(IoSection::default)
    }

    fn files_mut(&mut self) -> &mut FilesSection {
        self.files.get_or_insert_with(FilesSection::default)
    }
}

/// Cache configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSection {
    /// Cache size in bytes.
    pub size: Option<usize>,
    /// Initial size of an expandable cache, in bytes.
    pub init_size: Option<usize>,
    /// Eviction policy: one of `lru`, `lfu`, `fifo`, `clock`, `gclock`.
    pub kind: Option<String>,
    /// Whether the table may grow.
    pub expandable: Option<bool>,
    /// Whether writes are accepted.
    pub writable: Option<bool>,
    /// Dirty pages per cell before it is queued for flushing.
    pub dirty_pages_threshold: Option<usize>,
}

impl CacheSection {
    fn apply_to(&self, params: &mut CacheParams) -> Result<(), ConfigError> {
        if let Some(value) = self.size {
            params.cache_size = value;
        }
        if let Some(value) = self.init_size {
            params.init_cache_size = Some(value);
        }
        if let Some(value) = &self.kind {
            params.cache_type = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "cache.kind".into(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = self.expandable {
            params.expandable = value;
        }
        if let Some(value) = self.writable {
            params.writable = value;
        }
        if let Some(value) = self.dirty_pages_threshold {
            params.dirty_pages_threshold = value;
        }
        Ok(())
    }
}

/// I/O and striping configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IoSection {
    /// RAID striping block, in pages.
    pub raid_block_pages: Option<usize>,
    /// Number of NUMA nodes requests are spread across.
    pub num_nodes: Option<usize>,
    /// Async I/O depth per file descriptor.
    pub aio_depth_per_file: Option<usize>,
    /// Simulated hit percentage (0-100); testing only.
    pub test_hit_rate: Option<u32>,
}

impl IoSection {
    fn apply_to(&self, params: &mut CacheParams) -> Result<(), ConfigError> {
        if let Some(value) = self.raid_block_pages {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "io.raid_block_pages".into(),
                    value: value.to_string(),
                });
            }
            params.raid_block_pages = value;
        }
        if let Some(value) = self.num_nodes {
            params.num_nodes = value.max(1);
        }
        if let Some(value) = self.aio_depth_per_file {
            params.aio_depth_per_file = value;
        }
        if let Some(value) = self.test_hit_rate {
            if value > 100 {
                return Err(ConfigError::InvalidValue {
                    key: "io.test_hit_rate".into(),
                    value: value.to_string(),
                });
            }
            params.test_hit_rate = value;
        }
        Ok(())
    }
}

/// Per-file weighting overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilesSection {
    /// `"name:weight"` entries.
    pub weights: Option<Vec<String>>,
}

impl FilesSection {
    fn apply_to(&self, params: &mut CacheParams) -> Result<(), ConfigError> {
        if let Some(entries) = &self.weights {
            let mut weights = Vec::with_capacity(entries.len());
            for entry in entries {
                weights.push(FileWeight::parse(entry)?);
            }
            params.file_weights = weights;
        }
        Ok(())
    }
}

/// A file name with its access weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWeight {
    /// File name.
    pub name: String,
    /// Relative weight.
    pub weight: u32,
}

impl FileWeight {
    fn parse(entry: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: "files.weights".into(),
            value: entry.to_string(),
        };
        let Some((name, weight)) = entry.rsplit_once(':') else {
            return Err(ConfigError::MissingField(format!(
                "files.weights: weight for \"{entry}\""
            )));
        };
        if name.is_empty() {
            return Err(invalid());
        }
        let weight = weight.parse().map_err(|_| invalid())?;
        Ok(Self {
            name: name.to_string(),
            weight,
        })
    }
}

/// Resolved engine parameters.
#[derive(Debug, Clone)]
pub struct CacheParams {
    /// Cache size in bytes.
    pub cache_size: usize,
    /// Initial size of an expandable cache; `None` picks the default.
    pub init_cache_size: Option<usize>,
    /// Eviction policy.
    pub cache_type: CachePolicyKind,
    /// Whether the table may grow.
    pub expandable: bool,
    /// Whether writes are accepted.
    pub writable: bool,
    /// Dirty pages per cell before it is queued for flushing.
    pub dirty_pages_threshold: usize,
    /// RAID striping block, in pages.
    pub raid_block_pages: usize,
    /// Number of NUMA nodes requests are spread across.
    pub num_nodes: usize,
    /// Async I/O depth per file descriptor.
    pub aio_depth_per_file: usize,
    /// Simulated hit percentage (0-100); testing only.
    pub test_hit_rate: u32,
    /// Per-file access weights.
    pub file_weights: Vec<FileWeight>,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            cache_size: 128 * 1024 * 1024,
            init_cache_size: None,
            cache_type: CachePolicyKind::Gclock,
            expandable: true,
            writable: true,
            dirty_pages_threshold: CELL_SIZE / 2,
            raid_block_pages: 16,
            num_nodes: 1,
            aio_depth_per_file: 32,
            test_hit_rate: 0,
            file_weights: Vec::new(),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
