//! Composition configuration.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{ComposeError, Result};
use crate::merge::{MergeMode, MergeOptions};
use crate::quantization::RoundingMode;
use crate::store::DirectoryStore;

/// Configuration for loading and composing adapter stacks.
///
/// # Example
///
/// ```rust
/// use lora_compose::ComposeConfig;
///
/// let config = ComposeConfig {
///     search_dirs: vec!["models/loras".into()],
///     ..ComposeConfig::preset_quantized(42)
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Directories searched, in order, for adapter files.
    #[serde(default = "default_search_dirs")]
    pub search_dirs: Vec<PathBuf>,
    /// File extensions tried after the bare name.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Target representation for static merges.
    #[serde(default)]
    pub merge_mode: MergeMode,
    /// Rounding into quantized weights.
    #[serde(default)]
    pub rounding: RoundingMode,
    /// Base seed for stochastic rounding.
    #[serde(default)]
    pub seed: u64,
}

fn default_search_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("loras")]
}

fn default_extensions() -> Vec<String> {
    vec!["safetensors".into()]
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            search_dirs: default_search_dirs(),
            extensions: default_extensions(),
            merge_mode: MergeMode::Auto,
            rounding: RoundingMode::Stochastic,
            seed: 0,
        }
    }
}

impl ComposeConfig {
    /// Merge into quantized weights with stochastic rounding from `seed`.
    #[must_use]
    pub fn preset_quantized(seed: u64) -> Self {
        Self {
            merge_mode: MergeMode::Quantized,
            rounding: RoundingMode::Stochastic,
            seed,
            ..Self::default()
        }
    }

    /// Dequantize every target and merge in float.
    #[must_use]
    pub fn preset_float() -> Self {
        Self {
            merge_mode: MergeMode::Float,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration; missing fields take their defaults.
    ///
    /// # Errors
    /// Returns `Json` on malformed input, `InvalidConfig` if validation fails.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read, otherwise as [`from_json_str`](Self::from_json_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loaded composition config");
        Self::from_json_str(&json)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if no search directory or extension is set, or
    /// an extension is empty.
    pub fn validate(&self) -> Result<()> {
        if self.search_dirs.is_empty() {
            return Err(ComposeError::InvalidConfig(
                "at least one search directory required".into(),
            ));
        }
        if self.extensions.is_empty() {
            return Err(ComposeError::InvalidConfig(
                "at least one adapter extension required".into(),
            ));
        }
        if let Some(bad) = self
            .extensions
            .iter()
            .find(|e| e.is_empty() || e.starts_with('.'))
        {
            return Err(ComposeError::InvalidConfig(format!(
                "extension {bad:?} must be non-empty and without a leading dot"
            )));
        }
        // Allowed, but small deltas vanish instead of averaging out.
        if self.merge_mode != MergeMode::Float && self.rounding == RoundingMode::Nearest {
            tracing::warn!(
                "nearest rounding drops deltas smaller than half a quantization step; \
                 consider stochastic rounding"
            );
        }
        Ok(())
    }

    /// Merge options derived from this configuration.
    #[must_use]
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            mode: self.merge_mode,
            rounding: self.rounding,
            seed: self.seed,
        }
    }

    /// Adapter store over the configured directories.
    #[must_use]
    pub fn directory_store(&self, device: &Device) -> DirectoryStore {
        DirectoryStore::new(self.search_dirs.clone())
            .with_extensions(self.extensions.clone())
            .with_device(device.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ComposeConfig::default();
        assert_eq!(config.merge_mode, MergeMode::Auto);
        assert_eq!(config.rounding, RoundingMode::Stochastic);
        assert_eq!(config.extensions, vec!["safetensors".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let q = ComposeConfig::preset_quantized(7);
        assert_eq!(q.merge_mode, MergeMode::Quantized);
        assert_eq!(q.merge_options().seed, 7);

        let f = ComposeConfig::preset_float();
        assert_eq!(f.merge_options().mode, MergeMode::Float);
    }

    #[test]
    fn test_from_json_partial() {
        let config = ComposeConfig::from_json_str(
            r#"{"search_dirs": ["a", "b"], "merge_mode": "quantized", "rounding": "nearest", "seed": 3}"#,
        )
        .unwrap();
        assert_eq!(config.search_dirs, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(config.merge_mode, MergeMode::Quantized);
        assert_eq!(config.rounding, RoundingMode::Nearest);
        assert_eq!(config.extensions, default_extensions());
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            ComposeConfig::from_json_str("{not json"),
            Err(ComposeError::Json(_))
        ));
        assert!(matches!(
            ComposeConfig::from_json_str(r#"{"search_dirs": []}"#),
            Err(ComposeError::InvalidConfig(_))
        ));
        assert!(matches!(
            ComposeConfig::from_json_str(r#"{"extensions": [".pt"]}"#),
            Err(ComposeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let path = std::env::temp_dir().join("lora_compose_no_such_config.json");
        assert!(matches!(ComposeConfig::from_file(&path), Err(ComposeError::Io(_))));
    }

    #[test]
    fn test_directory_store_roots() {
        let config = ComposeConfig {
            search_dirs: vec!["x".into()],
            ..ComposeConfig::default()
        };
        let store = config.directory_store(&Device::Cpu);
        assert_eq!(store.roots(), &[PathBuf::from("x")]);
    }
}
