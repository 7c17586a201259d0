//! Path-based domain rules for task entries that carry no domain label.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// One domain and the path patterns that select it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRuleSpec {
    pub domain: String,
    pub patterns: Vec<String>,
}

impl DomainRuleSpec {
    fn new(domain: &str, patterns: &[&str]) -> Self {
        Self {
            domain: domain.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Built-in rules. Order matters: the first matching domain wins.
pub fn default_rule_specs() -> Vec<DomainRuleSpec> {
    vec![
        DomainRuleSpec::new(
            "backend",
            &[
                r"^src/backend/",
                r"^src/api/",
                r"^src/services/",
                r"^src/models/",
                r"^backend/",
                r"^api/",
                r"^services/",
                r"^models/",
                r"\.service\.py$",
                r"\.controller\.py$",
                r"\.router\.py$",
            ],
        ),
        DomainRuleSpec::new(
            "frontend",
            &[
                r"^src/frontend/",
                r"^src/components/",
                r"^src/pages/",
                r"^src/ui/",
                r"^frontend/",
                r"^components/",
                r"^pages/",
                r"^ui/",
                r"\.tsx?$",
                r"\.jsx?$",
                r"\.vue$",
                r"\.svelte$",
            ],
        ),
        DomainRuleSpec::new(
            "database",
            &[
                r"^migrations/",
                r"^alembic/",
                r"^src/database/",
                r"^src/schemas/",
                r"^database/",
                r"^schemas/",
                r"migration.*\.py$",
                r"\.sql$",
            ],
        ),
        DomainRuleSpec::new(
            "tests",
            &[
                r"^tests/",
                r"^test/",
                r"test_.*\.py$",
                r".*_test\.py$",
                r"\.test\.ts$",
                r"\.spec\.ts$",
            ],
        ),
        DomainRuleSpec::new(
            "docs",
            &[
                r"^docs/",
                r"^documentation/",
                r"README.*\.md$",
                r"\.md$",
                r"\.rst$",
            ],
        ),
    ]
}

/// Compiled, ordered domain rules.
#[derive(Debug, Clone)]
pub struct DomainRules {
    rules: Vec<(String, Vec<Regex>)>,
}

impl DomainRules {
    /// Compile `specs`. Patterns match case-insensitively.
    pub fn compile(specs: &[DomainRuleSpec]) -> EngineResult<Self> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut compiled = Vec::with_capacity(spec.patterns.len());
            for pattern in &spec.patterns {
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| EngineError::Config {
                        path: "domain_rules".into(),
                        reason: format!("bad pattern {pattern:?} for {}: {e}", spec.domain),
                    })?;
                compiled.push(re);
            }
            rules.push((spec.domain.to_lowercase(), compiled));
        }
        Ok(Self { rules })
    }

    /// Domain of the first rule matching `path`, if any.
    pub fn classify(&self, path: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(path)))
            .map(|(domain, _)| domain.as_str())
    }
}

impl Default for DomainRules {
    fn default() -> Self {
        // Built-in patterns are static and known to compile.
        let rules = default_rule_specs()
            .into_iter()
            .map(|spec| {
                let compiled = spec
                    .patterns
                    .iter()
                    .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
                    .collect();
                (spec.domain, compiled)
            })
            .collect();
        Self { rules }
    }
}

/// Human-readable task description for `domain` with `file_count` files.
pub fn describe(domain: &str, file_count: usize) -> String {
    let base = match domain {
        "backend" | "api" | "service" | "services" | "server" => "Backend API implementation",
        "frontend" | "ui" | "web" | "presentation" | "client" => "Frontend UI implementation",
        "database" | "data" | "db" | "schema" | "models" | "migrations" => {
            "Database schema and migrations"
        }
        "tests" | "test" | "qa" => "Test suite implementation",
        "docs" | "documentation" | "doc" => "Documentation updates",
        super::UNCLASSIFIED_DOMAIN => "Additional implementation tasks",
        _ => "Implementation tasks",
    };
    let plural = if file_count == 1 { "" } else { "s" };
    format!("{base} ({file_count} file{plural})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_first_matching_rule() {
        let rules = DomainRules::default();
        assert_eq!(rules.classify("src/api/routes.py"), Some("backend"));
        assert_eq!(rules.classify("src/components/Nav.tsx"), Some("frontend"));
        assert_eq!(rules.classify("migrations/0001_init.sql"), Some("database"));
        assert_eq!(rules.classify("tests/test_routes.py"), Some("tests"));
        assert_eq!(rules.classify("docs/guide.md"), Some("docs"));
        // Frontend's extension rule precedes the tests rules.
        assert_eq!(rules.classify("src/app.test.ts"), Some("frontend"));
        assert_eq!(rules.classify("Makefile"), None);
    }

    #[test]
    fn matching_ignores_case() {
        let rules = DomainRules::default();
        assert_eq!(rules.classify("Docs/Intro.MD"), Some("docs"));
    }

    #[test]
    fn custom_rules_replace_defaults() {
        let rules = DomainRules::compile(&[DomainRuleSpec::new("infra", &[r"^deploy/"])]).unwrap();
        assert_eq!(rules.classify("deploy/main.tf"), Some("infra"));
        assert_eq!(rules.classify("src/api/x.py"), None);
    }

    #[test]
    fn bad_pattern_is_a_config_error() {
        let err = DomainRules::compile(&[DomainRuleSpec::new("x", &["("])]).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn description_counts_files() {
        assert_eq!(describe("backend", 2), "Backend API implementation (2 files)");
        assert_eq!(describe("docs", 1), "Documentation updates (1 file)");
        assert_eq!(describe("infra", 3), "Implementation tasks (3 files)");
    }
}
