//! Engine configuration, read from `<state>/config.json`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::{Classifier, ClassifierThresholds, DomainRuleSpec, DomainRules};
use crate::error::{EngineError, EngineResult};
use crate::merge::PrecedenceTable;
use crate::run_output::{read_json, write_json_atomic};
use crate::workspace::SupervisorOptions;

/// An external program and its fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Branch workspaces fork from and merge into. Defaults to the branch
    /// checked out at `init`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub thresholds: ClassifierThresholds,
    pub precedence: PrecedenceTable,
    /// Replaces the built-in path rules when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_rules: Option<Vec<DomainRuleSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<CommandSpec>,
    pub worker_timeout_secs: u64,
    pub max_concurrent: usize,
    /// Treat a `partial` worker result as success.
    pub accept_partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<CommandSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_branch: None,
            thresholds: ClassifierThresholds::default(),
            precedence: PrecedenceTable::default(),
            domain_rules: None,
            worker: None,
            worker_timeout_secs: 1800,
            max_concurrent: 4,
            accept_partial: false,
            mirror: None,
        }
    }
}

impl EngineConfig {
    /// Load `path`, or defaults if it does not exist.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let config: Option<Self> = read_json(path).map_err(|e| EngineError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = config.unwrap_or_default();
        config.validate(path)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> EngineResult<()> {
        write_json_atomic(path, self)
    }

    fn validate(&self, path: &Path) -> EngineResult<()> {
        let invalid = |reason: &str| EngineError::Config {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if !(0.0..=1.0).contains(&self.thresholds.max_overlap) {
            return Err(invalid("thresholds.max_overlap must be within 0.0..=1.0"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("max_concurrent must be at least 1"));
        }
        if self.worker_timeout_secs == 0 {
            return Err(invalid("worker_timeout_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            worker_timeout: self.worker_timeout(),
            max_concurrent: self.max_concurrent,
            accept_partial: self.accept_partial,
        }
    }

    /// Classifier built from the configured rules, thresholds and precedence.
    pub fn classifier(&self) -> EngineResult<Classifier> {
        let rules = match &self.domain_rules {
            Some(specs) => DomainRules::compile(specs)?,
            None => DomainRules::default(),
        };
        Ok(Classifier::new(
            rules,
            self.thresholds,
            self.precedence.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.thresholds.min_files, 5);
        assert_eq!(config.worker_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"thresholds": {"min_files": 3}, "worker": {"program": "gen"}, "accept_partial": true}"#,
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.thresholds.min_files, 3);
        assert_eq!(config.thresholds.min_domains, 2);
        assert_eq!(config.worker.unwrap().program, "gen");
        assert!(config.accept_partial);
        assert_eq!(config.max_concurrent, 4);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("config.json");
        let config = EngineConfig {
            base_branch: Some("trunk".into()),
            max_concurrent: 2,
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_concurrent": 0}"#).unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::Config { .. })
        ));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::Config { .. })
        ));
    }

    #[test]
    fn bad_domain_rule_fails_classifier_build() {
        let config = EngineConfig {
            domain_rules: Some(vec![DomainRuleSpec {
                domain: "api".into(),
                patterns: vec!["(".into()],
            }]),
            ..EngineConfig::default()
        };
        assert!(config.classifier().is_err());
    }
}
