//! Per-model session configuration
//!
//! Capability flags and status masks are fixed per instrument model.
//! They are either built in code with the `with_*` methods or loaded
//! from a TOML table of models:
//!
//! ```toml
//! [models.keysight_e3631a]
//! stb_polling_supported = false
//!
//! [models.yenista_t100shp]
//! error_check_supported = false
//! stb_event_mask = 0x01
//! default_timeout = "30s"
//! ```
//!
//! Omitted keys take the IEEE 488.2 defaults of [`SessionConfig::default`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errorqueue::DEFAULT_CAP;
use crate::registers::StatusByte;

/// Default upper bound on incoming binary blocks (64 MiB)
pub const DEFAULT_MAX_BLOCK_LEN: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

// Masks are written as plain integers in configuration files
mod mask {
    use serde::{Deserialize, Deserializer, Serializer};
    use crate::registers::StatusByte;

    pub fn serialize<S: Serializer>(mask: &StatusByte, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u8(mask.bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<StatusByte, D::Error> {
        u8::deserialize(de).map(StatusByte::from_raw)
    }
}

/// Capabilities and defaults of one instrument model
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// The instrument answers `*STB?`; enables the `check_errors` fast path
    pub stb_polling_supported: bool,
    /// The instrument has a SCPI error queue
    pub error_check_supported: bool,
    /// Status bit(s) signalling operation complete
    #[serde(with = "mask")]
    pub stb_event_mask: StatusByte,
    /// Status bit(s) signalling a non-empty error queue
    #[serde(with = "mask")]
    pub stb_error_mask: StatusByte,
    /// Maximum error queue reads per drain
    pub error_queue_cap: usize,
    /// Query popping the head of the error queue
    pub error_query: String,
    /// Timeout for synchronised commands that do not specify one
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Bus I/O timeout used when opening a transport
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Largest binary block accepted from the instrument, in bytes
    pub max_block_len: usize,
    /// Never touch the bus; queries return caller supplied substitutes
    pub dummy_mode: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            stb_polling_supported: true,
            error_check_supported: true,
            stb_event_mask: StatusByte::EVENT_STATUS,
            stb_error_mask: StatusByte::ERROR_QUEUE,
            error_queue_cap: DEFAULT_CAP,
            error_query: String::from("SYST:ERR?"),
            default_timeout: Duration::from_secs(60),
            io_timeout: Duration::from_secs(5),
            max_block_len: DEFAULT_MAX_BLOCK_LEN,
            dummy_mode: false,
        }
    }
}

impl SessionConfig {

    pub fn new() -> SessionConfig {
        SessionConfig::default()
    }

    pub fn with_stb_polling(mut self, supported: bool) -> Self {
        self.stb_polling_supported = supported;
        self
    }

    pub fn with_error_check(mut self, supported: bool) -> Self {
        self.error_check_supported = supported;
        self
    }

    pub fn with_event_mask(mut self, mask: StatusByte) -> Self {
        self.stb_event_mask = mask;
        self
    }

    pub fn with_error_mask(mut self, mask: StatusByte) -> Self {
        self.stb_error_mask = mask;
        self
    }

    pub fn with_error_queue_cap(mut self, cap: usize) -> Self {
        self.error_queue_cap = cap;
        self
    }

    pub fn with_error_query(mut self, query: &str) -> Self {
        self.error_query = query.to_string();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_max_block_len(mut self, len: usize) -> Self {
        self.max_block_len = len;
        self
    }

    pub fn with_dummy_mode(mut self, dummy: bool) -> Self {
        self.dummy_mode = dummy;
        self
    }

    /// Check the configuration for values the session cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.error_queue_cap == 0 {
            return Err(ConfigError::Invalid(String::from("error_queue_cap must be at least 1")));
        }
        if self.stb_event_mask.is_empty() {
            return Err(ConfigError::Invalid(String::from("stb_event_mask must not be empty")));
        }
        if self.max_block_len == 0 {
            return Err(ConfigError::Invalid(String::from("max_block_len must be at least 1")));
        }
        if self.error_query.trim().is_empty() {
            return Err(ConfigError::Invalid(String::from("error_query must not be empty")));
        }
        Ok(())
    }

    /// Parse a single model configuration from TOML
    pub fn from_toml_str(text: &str) -> Result<SessionConfig, ConfigError> {
        let config: SessionConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}


/// Configurations of several instrument models, keyed by model name
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelTable {
    #[serde(default)]
    models: HashMap<String, SessionConfig>,
}

impl ModelTable {

    pub fn from_toml_str(text: &str) -> Result<ModelTable, ConfigError> {
        let table: ModelTable = toml::from_str(text)?;
        for (name, config) in &table.models {
            config.validate()
                .map_err(|e| ConfigError::Invalid(format!("model {}: {}", name, e)))?;
        }
        Ok(table)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<ModelTable, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        ModelTable::from_toml_str(&text)
    }

    /// Configuration of `model`, if listed
    pub fn get(&self, model: &str) -> Option<&SessionConfig> {
        self.models.get(model)
    }

    /// Configuration of `model`, falling back to the defaults
    pub fn get_or_default(&self, model: &str) -> SessionConfig {
        self.models.get(model).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}


#[cfg(test)]
mod tests {

    use std::time::Duration;
    use assert_matches::assert_matches;
    use super::{SessionConfig, ModelTable, ConfigError};
    use crate::registers::StatusByte;

    const MODELS: &str = r#"
        [models.keysight_e3631a]
        stb_polling_supported = false

        [models.hp_6624a]
        stb_polling_supported = false
        error_check_supported = false

        [models.yenista_t100shp]
        error_check_supported = false
        stb_event_mask = 0x01
        default_timeout = "30s"
    "#;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert!(config.stb_polling_supported);
        assert!(config.error_check_supported);
        assert_eq!(config.stb_event_mask, StatusByte::EVENT_STATUS);
        assert_eq!(config.stb_error_mask, StatusByte::ERROR_QUEUE);
        assert_eq!(config.error_queue_cap, 50);
        assert_eq!(config.default_timeout, Duration::from_secs(60));
        assert_eq!(config.max_block_len, 64 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn model_table() {
        let table = ModelTable::from_toml_str(MODELS).unwrap();
        assert_eq!(table.len(), 3);

        let yenista = table.get("yenista_t100shp").unwrap();
        assert!(!yenista.error_check_supported);
        assert!(yenista.stb_polling_supported);
        assert_eq!(yenista.stb_event_mask, StatusByte::DEVICE0);
        assert_eq!(yenista.default_timeout, Duration::from_secs(30));

        let hp = table.get("hp_6624a").unwrap();
        assert!(!hp.stb_polling_supported && !hp.error_check_supported);

        assert!(table.get("unknown").is_none());
        assert_eq!(table.get_or_default("unknown"), SessionConfig::default());
    }

    #[test]
    fn reject_zero_cap() {
        let res = SessionConfig::from_toml_str("error_queue_cap = 0");
        assert_matches!(res, Err(ConfigError::Invalid(_)));

        let res = SessionConfig::from_toml_str("max_block_len = 0");
        assert_matches!(res, Err(ConfigError::Invalid(_)));

        let res = ModelTable::from_toml_str("[models.bad]\nerror_queue_cap = 0");
        assert_matches!(res, Err(ConfigError::Invalid(msg)) if msg.contains("bad"));
    }

    #[test]
    fn reject_unknown_keys() {
        let res = SessionConfig::from_toml_str("stb_poling_supported = false");
        assert_matches!(res, Err(ConfigError::Toml(_)));
    }

    #[test]
    fn builder() {
        let config = SessionConfig::new()
            .with_stb_polling(false)
            .with_error_queue_cap(10)
            .with_event_mask(StatusByte::DEVICE0 | StatusByte::EVENT_STATUS);
        assert!(!config.stb_polling_supported);
        assert_eq!(config.error_queue_cap, 10);
        assert_eq!(config.stb_event_mask.bits(), 0x21);
    }
}
