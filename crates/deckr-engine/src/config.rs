//! Engine configuration
//!
//! Bounded-wait policy for generative calls, normalizer limits and store
//! sizing. Loadable from TOML; missing keys use defaults.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on a single generative call, in seconds
    pub generation_timeout_secs: u64,
    /// Maximum generative calls in flight at once
    pub max_concurrent_generations: usize,
    /// Largest image (width * height) the normalizer will paint
    pub max_image_pixels: u64,
    /// Command queue depth of the deck store
    pub store_channel_capacity: usize,
    /// Name used for added slides when the plan omits one
    pub default_new_slide_name: String,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With generation timeout
    #[inline]
    #[must_use]
    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// With max concurrent generative calls
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_generations(mut self, max: usize) -> Self {
        self.max_concurrent_generations = max;
        self
    }

    /// With max image pixels
    #[inline]
    #[must_use]
    pub fn with_max_image_pixels(mut self, max: u64) -> Self {
        self.max_image_pixels = max;
        self
    }

    /// Generation timeout as a `Duration`
    #[inline]
    #[must_use]
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    /// Parse from TOML text and validate
    ///
    /// # Errors
    /// - `ConfigError::Parse` on malformed TOML
    /// - `ConfigError::Invalid` if a limit is zero
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Returns `ConfigError::Io` if the file cannot be read, otherwise as
    /// [`EngineConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Returns `ConfigError::Serialize` if encoding fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check limits
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("generation_timeout_secs", self.generation_timeout_secs == 0),
            ("max_concurrent_generations", self.max_concurrent_generations == 0),
            ("max_image_pixels", self.max_image_pixels == 0),
            ("store_channel_capacity", self.store_channel_capacity == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Invalid {
                field: (*field).to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: 300,
            max_concurrent_generations: 5,
            max_image_pixels: 40_000_000,
            store_channel_capacity: 100,
            default_new_slide_name: "New Slide".to_string(),
        }
    }
}
