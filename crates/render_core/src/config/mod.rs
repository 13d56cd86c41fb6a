//! Settings files
//!
//! Any serde struct implementing [`Config`] can be read from and written to
//! `.toml` or `.ron` files; the extension picks the format.

use std::path::Path;

pub use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Ron,
}

impl Format {
    fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Format::Toml),
            Some("ron") => Ok(Format::Ron),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Settings that round-trip through TOML or RON
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Read settings from `path`
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = Format::from_path(path)?;
        let contents = std::fs::read_to_string(path)?;
        match format {
            Format::Toml => Self::from_toml_str(&contents),
            Format::Ron => Self::from_ron_str(&contents),
        }
    }

    /// Write settings to `path`
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match Format::from_path(path)? {
            Format::Toml => self.to_toml_string()?,
            Format::Ron => self.to_ron_string()?,
        };
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Parse TOML text
    fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse RON text
    fn from_ron_str(contents: &str) -> Result<Self, ConfigError> {
        ron::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Render as TOML
    fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Render as RON
    fn to_ron_string(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}

/// Failures reading, writing or validating settings
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("Config file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Text is not valid for the target type
    #[error("Config parse failed: {0}")]
    Parse(String),

    /// Value could not be rendered
    #[error("Config serialization failed: {0}")]
    Serialize(String),

    /// Path has neither a `.toml` nor a `.ron` extension
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// Values parsed but failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
