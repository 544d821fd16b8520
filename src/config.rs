//! Configuration loading and validation.
//!
//! Storyloom reads an optional `resolver.toml`; every knob has a safe
//! default, so a missing file means default behavior, not an error.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level resolver configuration.
#[derive(Debug, Default, Deserialize)]
pub struct ResolverConfig {
    /// Evaluation limits.
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Unknown-variable suggestion tuning.
    #[serde(default)]
    pub suggestions: SuggestionConfig,
}

/// Evaluation limits.
#[derive(Debug, Deserialize)]
pub struct EvaluationConfig {
    /// Fuel ceiling per rendered body; evaluation fails closed above it.
    #[serde(default = "default_fuel")]
    pub fuel: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            fuel: default_fuel(),
        }
    }
}

/// Unknown-variable suggestion tuning.
#[derive(Debug, Deserialize)]
pub struct SuggestionConfig {
    /// Maximum edit distance for a nearest-match suggestion.
    #[serde(default = "default_max_distance")]
    pub max_distance: usize,
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            max_distance: default_max_distance(),
        }
    }
}

// Default value functions for serde

fn default_fuel() -> u64 {
    crate::evaluator::DEFAULT_FUEL
}
fn default_max_distance() -> usize {
    crate::validator::DEFAULT_SUGGESTION_DISTANCE
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<ResolverConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: ResolverConfig = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Resolve the default config directory (`~/.storyloom/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".storyloom"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = ResolverConfig::default();
        assert_eq!(config.evaluation.fuel, crate::evaluator::DEFAULT_FUEL);
        assert_eq!(
            config.suggestions.max_distance,
            crate::validator::DEFAULT_SUGGESTION_DISTANCE
        );
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
[evaluation]
fuel = 10000
"#;
        let config: ResolverConfig = toml::from_str(toml_str).expect("should parse");
        assert_eq!(config.evaluation.fuel, 10000);
        assert_eq!(
            config.suggestions.max_distance,
            crate::validator::DEFAULT_SUGGESTION_DISTANCE
        );
    }

    #[test]
    fn parse_empty_config() {
        let config: ResolverConfig = toml::from_str("").expect("should parse");
        assert_eq!(config.evaluation.fuel, crate::evaluator::DEFAULT_FUEL);
    }

    #[test]
    fn config_dir_resolves() {
        let dir = config_dir();
        assert!(dir.is_ok());
        let path = dir.expect("already checked");
        assert!(path.ends_with(".storyloom"));
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let path = dir.path().join("resolver.toml");
        std::fs::write(&path, "[suggestions]\nmax_distance = 1\n").expect("write config");
        let config = load_config(&path).expect("load");
        assert_eq!(config.suggestions.max_distance, 1);
    }
}
