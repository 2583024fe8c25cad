// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Startup configuration with strict validation.
//!
//! Command-line options are merged with the network config file (JSON) and
//! validated at boot-up time. Any invalid value results in a
//! HardValidationError that prevents startup.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{ConduitError, ConduitResult, HardValidationError};
use crate::sizing::InstancePolicy;
use crate::types::{Bandwidth, MaxClients};

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_MAX_CLIENTS: i64 = 50;
pub const DEFAULT_BANDWIDTH_MBPS: f64 = 40.0;
pub const DEFAULT_STATS_FILE: &str = "stats.json";

/// Identity key persisted in the data directory.
pub const KEY_FILE_NAME: &str = "conduit_key.json";

/// Options as given on the command line (before validation).
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub data_dir: Option<PathBuf>,
    pub psiphon_config: Option<PathBuf>,
    /// `0` is treated as "not given".
    pub max_clients: Option<i64>,
    /// `-1` for unlimited.
    pub bandwidth_mbps: Option<f64>,
    pub verbosity: u8,
    pub stats_file: Option<PathBuf>,
    /// Include the per-instance breakdown in the stats file.
    pub per_instance_stats: bool,
    pub instances: Option<usize>,
    pub engine: Option<PathBuf>,
}

/// Fields read from the network config file. Everything else is passed
/// through to the engine untouched.
#[derive(Debug, Default, Deserialize)]
struct RawInproxyConfig {
    #[serde(rename = "InproxyMaxClients", default)]
    max_clients: Option<i64>,
    #[serde(rename = "InproxyLimitUpstreamBytesPerSecond", default)]
    upstream_bytes_per_second: Option<i64>,
    #[serde(rename = "InproxyLimitDownstreamBytesPerSecond", default)]
    downstream_bytes_per_second: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PersistedKey {
    #[serde(rename = "privateKeyBase64", default)]
    private_key_base64: String,
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub psiphon_config: Option<PathBuf>,
    /// Parsed network config; empty when no file was given.
    pub base_config: Map<String, Value>,
    /// Persisted proxy session key, if one exists.
    pub private_key: Option<String>,
    pub max_clients: MaxClients,
    pub bandwidth: Bandwidth,
    pub verbosity: u8,
    /// Absolute or data-dir-relative destination of the stats document.
    pub stats_file: Option<PathBuf>,
    pub per_instance_stats: bool,
    pub instances: usize,
    pub engine: Option<PathBuf>,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Create the data directory, read the config and key files and validate.
    pub fn resolve(options: Options) -> ConduitResult<Config> {
        let data_dir = options
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        create_private_dir(&data_dir)?;

        let contents = match &options.psiphon_config {
            Some(path) => Some(Self::read_config_file(path)?),
            None => None,
        };
        let private_key = load_private_key(&data_dir);

        Self::resolve_with(options, data_dir, contents.as_deref(), private_key)
    }

    fn read_config_file(path: &Path) -> ConduitResult<String> {
        if !path.exists() {
            return Err(ConduitError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        std::fs::read_to_string(path).map_err(|e| ConduitError::Io {
            context: "reading psiphon config file",
            source: e,
        })
    }

    /// Validate options against already-read config file contents.
    pub fn resolve_with(
        options: Options,
        data_dir: PathBuf,
        contents: Option<&str>,
        private_key: Option<String>,
    ) -> ConduitResult<Config> {
        let base_config = match contents {
            Some(text) => parse_base_config(text)?,
            None => Map::new(),
        };
        let raw: RawInproxyConfig = serde_json::from_value(Value::Object(base_config.clone()))
            .map_err(|e| ConduitError::ConfigParse {
                message: format!("psiphon config: {}", e),
            })?;

        let max_clients = Self::validate_max_clients(options.max_clients, &raw)?;
        let bandwidth = Self::validate_bandwidth(options.bandwidth_mbps, &raw)?;
        let instances = InstancePolicy::default().resolve(max_clients, options.instances)?;

        let stats_file = options.stats_file.map(|path| {
            if path.is_relative() {
                data_dir.join(path)
            } else {
                path
            }
        });

        Ok(Config {
            data_dir,
            psiphon_config: options.psiphon_config,
            base_config,
            private_key,
            max_clients,
            bandwidth,
            verbosity: options.verbosity,
            stats_file,
            per_instance_stats: options.per_instance_stats,
            instances,
            engine: options.engine,
        })
    }

    /// Flag, then config file, then default.
    fn validate_max_clients(
        flag: Option<i64>,
        raw: &RawInproxyConfig,
    ) -> Result<MaxClients, HardValidationError> {
        let value = flag
            .filter(|&n| n != 0)
            .or(raw.max_clients.filter(|&n| n != 0))
            .unwrap_or(DEFAULT_MAX_CLIENTS);
        MaxClients::new(value)
    }

    /// Flag, then the tighter of the config file's two limits, then default.
    fn validate_bandwidth(
        flag: Option<f64>,
        raw: &RawInproxyConfig,
    ) -> Result<Bandwidth, HardValidationError> {
        if let Some(mbps) = flag {
            return Bandwidth::from_mbps(mbps);
        }

        let limits = [raw.upstream_bytes_per_second, raw.downstream_bytes_per_second];
        if let Some(negative) = limits.iter().flatten().find(|&&v| v < 0) {
            return Err(HardValidationError::InvalidBandwidth {
                value: format!("{} bytes/s", negative),
            });
        }

        let tightest = limits.iter().flatten().copied().filter(|&v| v > 0).min();
        match tightest {
            Some(bytes) => Ok(Bandwidth::from_bytes_per_second(bytes as u64)),
            None if limits.iter().any(Option::is_some) => Ok(Bandwidth::Unlimited),
            None => Bandwidth::from_mbps(DEFAULT_BANDWIDTH_MBPS),
        }
    }
}

fn parse_base_config(text: &str) -> ConduitResult<Map<String, Value>> {
    let value: Value = serde_json::from_str(text).map_err(|e| ConduitError::ConfigParse {
        message: format!("psiphon config: {}", e),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ConduitError::ConfigParse {
            message: "psiphon config: expected a JSON object".to_string(),
        }),
    }
}

/// Create `dir` (and parents) readable by the owner only.
pub fn create_private_dir(dir: &Path) -> ConduitResult<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| ConduitError::Io {
            context: "creating data directory",
            source: e,
        })
}

/// Read the persisted session key. A missing or malformed file means no key.
pub fn load_private_key(data_dir: &Path) -> Option<String> {
    let path = data_dir.join(KEY_FILE_NAME);
    let data = std::fs::read(&path).ok()?;
    match serde_json::from_slice::<PersistedKey>(&data) {
        Ok(key) if !key.private_key_base64.is_empty() => {
            tracing::debug!(path = %path.display(), "Loaded existing key");
            Some(key.private_key_base64)
        }
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed key file");
            None
        }
    }
}
