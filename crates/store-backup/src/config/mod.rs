//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use std::path::Path;

use crate::error::Result;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::load_partial(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file without validating it, for callers that merge
    /// overrides before calling [`Config::validate`].
    pub fn load_partial<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_partial(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Self::parse_partial(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML string without validating it.
    pub fn parse_partial(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}
