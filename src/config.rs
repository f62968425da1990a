/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::alloc::{class_for_label, parse_chunk_sizes, ParseChunkSizesError, SIZE_CLASS_COUNT};
use crate::pool::{MatchPolicy, PoolType};
use config::{Config, ConfigError};
use serde::Deserialize;
use thiserror::Error;

#[cfg(not(test))]
use config::File;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("chunk sizes: {0}")]
    ChunkSizes(#[from] ParseChunkSizesError),

    #[error("unknown block size label: {0}")]
    UnknownSizeLabel(String),

    #[error("unknown pool sharing mode: {0}")]
    UnknownSharing(String),

    #[error("unknown match policy: {0}")]
    UnknownMatchPolicy(String),
}

#[derive(Debug, Deserialize, Default)]
pub struct Buffer {
    /// Free-list retention per size class, e.g. "128:512 4k:100 8k:50".
    pub chunk_sizes: String,
    /// Size label of the default block class, e.g. "4k".
    pub default_block_size: String,
    pub water_mark: u64,
}

impl Buffer {
    pub fn default_size_class(&self) -> Result<usize, SettingsError> {
        class_for_label(&self.default_block_size)
            .ok_or_else(|| SettingsError::UnknownSizeLabel(self.default_block_size.clone()))
    }

    pub fn chunk_counts(&self) -> Result<[usize; SIZE_CLASS_COUNT], SettingsError> {
        Ok(parse_chunk_sizes(&self.chunk_sizes)?)
    }
}

impl From<Buffer> for config::ValueKind {
    fn from(buffer: Buffer) -> Self {
        let mut properties = std::collections::HashMap::new();
        properties.insert(
            "chunk_sizes".to_string(),
            config::Value::from(buffer.chunk_sizes),
        );
        properties.insert(
            "default_block_size".to_string(),
            config::Value::from(buffer.default_block_size),
        );
        properties.insert(
            "water_mark".to_string(),
            config::Value::from(buffer.water_mark),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Pool {
    /// "thread" for one pool per worker, "global" for a shared pool.
    pub sharing: String,
    /// "none", "ip", "host", or "both".
    pub match_policy: String,
    pub capacity: u32,
    pub keep_alive_timeout_secs: u32,
    /// Idle connections to an origin kept open through timeouts.
    pub min_keep_alive: u32,
}

impl Pool {
    pub fn pool_type(&self) -> Result<PoolType, SettingsError> {
        match self.sharing.as_str() {
            "thread" => Ok(PoolType::PerThread),
            "global" => Ok(PoolType::Global),
            other => Err(SettingsError::UnknownSharing(other.to_string())),
        }
    }

    pub fn policy(&self) -> Result<MatchPolicy, SettingsError> {
        match self.match_policy.as_str() {
            "none" => Ok(MatchPolicy::None),
            "ip" => Ok(MatchPolicy::Ip),
            "host" => Ok(MatchPolicy::Host),
            "both" => Ok(MatchPolicy::Both),
            other => Err(SettingsError::UnknownMatchPolicy(other.to_string())),
        }
    }
}

impl From<Pool> for config::ValueKind {
    fn from(pool: Pool) -> Self {
        let mut properties = std::collections::HashMap::new();
        properties.insert("sharing".to_string(), config::Value::from(pool.sharing));
        properties.insert(
            "match_policy".to_string(),
            config::Value::from(pool.match_policy),
        );
        properties.insert("capacity".to_string(), config::Value::from(pool.capacity));
        properties.insert(
            "keep_alive_timeout_secs".to_string(),
            config::Value::from(pool.keep_alive_timeout_secs),
        );
        properties.insert(
            "min_keep_alive".to_string(),
            config::Value::from(pool.min_keep_alive),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Settings {
    pub buffer: Buffer,
    pub pool: Pool,
}

impl Settings {
    #[cfg(not(test))]
    pub fn new(config_file: &str) -> Result<Settings, SettingsError> {
        let config = Config::builder()
            .add_source(File::with_name(config_file).format(config::FileFormat::Ini))
            .set_default("buffer", Buffer::default())?
            .set_default("pool", Pool::default())?
            .build()?;

        Ok(config.try_deserialize()?)
    }

    #[cfg(test)]
    pub fn new(_config_file: &str) -> Result<Settings, SettingsError> {
        let config = Config::builder()
            .set_default(
                "buffer",
                Buffer {
                    chunk_sizes: String::from("128:512 4k:100 8k:50"),
                    default_block_size: String::from("4k"),
                    water_mark: 0,
                },
            )?
            .set_default(
                "pool",
                Pool {
                    sharing: String::from("thread"),
                    match_policy: String::from("both"),
                    capacity: 512,
                    keep_alive_timeout_secs: 120,
                    min_keep_alive: 0,
                },
            )?
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let settings = Settings::new("unused").unwrap();

        assert_eq!(settings.buffer.default_size_class().unwrap(), 5);

        let counts = settings.buffer.chunk_counts().unwrap();
        assert_eq!(counts[0], 512);
        assert_eq!(counts[5], 100);
        assert_eq!(counts[6], 50);

        assert_eq!(settings.pool.pool_type().unwrap(), PoolType::PerThread);
        assert_eq!(settings.pool.policy().unwrap(), MatchPolicy::Both);
        assert_eq!(settings.pool.capacity, 512);
    }

    #[test]
    fn bad_values_are_errors() {
        let buffer = Buffer {
            chunk_sizes: String::from("3k:10"),
            default_block_size: String::from("5k"),
            water_mark: 0,
        };

        assert!(matches!(
            buffer.default_size_class(),
            Err(SettingsError::UnknownSizeLabel(_))
        ));
        assert!(matches!(
            buffer.chunk_counts(),
            Err(SettingsError::ChunkSizes(_))
        ));

        let pool = Pool {
            sharing: String::from("shared"),
            match_policy: String::from("always"),
            ..Default::default()
        };

        assert!(matches!(
            pool.pool_type(),
            Err(SettingsError::UnknownSharing(_))
        ));
        assert!(matches!(
            pool.policy(),
            Err(SettingsError::UnknownMatchPolicy(_))
        ));
    }
}
