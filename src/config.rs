//! Translator configuration.
//!
//! Read from `querybind/config.toml` under the platform config directory:
//!
//! ```toml
//! dialect = "postgres"
//!
//! [optimizer]
//! redundant_subquery_elision = false
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::dialect::DialectKind;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    pub dialect: DialectKind,
    pub optimizer: OptimizerConfig,
}

/// Per-pass toggles. Every pass is on by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enum_type_normalization: bool,
    /// Also resolves `Last`; with it off, reversed queries fail to format.
    pub order_by_combination: bool,
    pub apply_join_rewrite: bool,
    pub redundant_subquery_elision: bool,
    pub auto_increment_insert_adjustment: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enum_type_normalization: true,
            order_by_combination: true,
            apply_join_rewrite: true,
            redundant_subquery_elision: true,
            auto_increment_insert_adjustment: true,
        }
    }
}

impl TranslatorConfig {
    pub fn with_dialect(dialect: DialectKind) -> Self {
        Self {
            dialect,
            ..Self::default()
        }
    }

    pub fn get_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("querybind")
            .join("config.toml")
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse translator config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Loads the default config file, or the defaults when there is none.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::get_config_path();
        if !path.exists() {
            debug!(path = %path.display(), "no translator config, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_every_pass() {
        let config = TranslatorConfig::default();
        assert_eq!(config.dialect, DialectKind::Sql92);
        assert!(config.optimizer.order_by_combination);
        assert!(config.optimizer.auto_increment_insert_adjustment);
    }

    #[test]
    fn test_partial_toml() {
        let config = TranslatorConfig::from_toml_str(
            r#"
            dialect = "mysql"

            [optimizer]
            apply_join_rewrite = false
            "#,
        )
        .unwrap();
        assert_eq!(config.dialect, DialectKind::MySql);
        assert!(!config.optimizer.apply_join_rewrite);
        assert!(config.optimizer.redundant_subquery_elision);
    }

    #[test]
    fn test_unknown_dialect_is_rejected() {
        let err = TranslatorConfig::from_toml_str("dialect = \"oracle\"").unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse translator config"));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("querybind-config-{}", std::process::id()))
            .join("config.toml");
        let config = TranslatorConfig::with_dialect(DialectKind::Postgres);
        config.save(&path).unwrap();
        let loaded = TranslatorConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_file(&path);
    }
}
