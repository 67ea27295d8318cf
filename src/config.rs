use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

/// Default cap on the size of a loader-derived source: 64 MiB.
pub const DEFAULT_MAX_DERIVED_SIZE: usize = 64 * 1024 * 1024;
/// Default cap on decode steps per track.
pub const DEFAULT_MAX_TRACK_STEPS:  usize = 1 << 20;
/// Default cap on nested loader replacements.
pub const DEFAULT_MAX_LOADER_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for a [`Registry`](crate::Registry).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_loader_depth: usize,
    /// Loaders refuse to produce a source larger than this.
    pub max_derived_size: usize,
    /// Decode steps after which a track is cut off.
    pub max_track_steps:  usize,
    /// Format names whose scanners never run.
    pub disabled_formats: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_loader_depth: DEFAULT_MAX_LOADER_DEPTH,
            max_derived_size: DEFAULT_MAX_DERIVED_SIZE,
            max_track_steps:  DEFAULT_MAX_TRACK_STEPS,
            disabled_formats: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read(path)?)
    }

    pub fn is_disabled(&self, format: &str) -> bool {
        self.disabled_formats.iter().any(|f| f.eq_ignore_ascii_case(format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = RegistryConfig::from_json(br#"{ "disabled_formats": ["PSX"] }"#).unwrap();
        assert_eq!(cfg.max_track_steps, DEFAULT_MAX_TRACK_STEPS);
        assert!(cfg.is_disabled("psx"));
        assert!(!cfg.is_disabled("midi"));
        assert!(RegistryConfig::from_json(b"{ nope").is_err());
    }
}
