//! Domain merge precedence.
//!
//! Lower layers merge first so that code depending on them lands on top of
//! an already-merged foundation: data, then service/API, then presentation,
//! then tests, then docs.

use serde::{Deserialize, Serialize};

use crate::classifier::UNCLASSIFIED_DOMAIN;

/// Ordered tiers of domain names. A domain's rank is the index of the first
/// tier naming it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrecedenceTable {
    tiers: Vec<Vec<String>>,
}

impl Default for PrecedenceTable {
    fn default() -> Self {
        let tier = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
        Self {
            tiers: vec![
                tier(&["database", "data", "db", "schema", "models", "migrations"]),
                tier(&["backend", "api", "service", "services", "server"]),
                tier(&["frontend", "ui", "web", "presentation", "client"]),
                tier(&["tests", "test", "qa"]),
                tier(&["docs", "documentation", "doc"]),
            ],
        }
    }
}

impl PrecedenceTable {
    pub fn new(tiers: Vec<Vec<String>>) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    /// Tier index of `domain`, or `None` if no tier names it.
    pub fn rank(&self, domain: &str) -> Option<usize> {
        let domain = domain.to_lowercase();
        self.tiers
            .iter()
            .position(|tier| tier.iter().any(|d| d.eq_ignore_ascii_case(&domain)))
    }

    /// Merge order for `domains`, which are given in first-seen order.
    ///
    /// Ranked domains come first by tier (first-seen order within a tier),
    /// then unranked domains in first-seen order, then the unclassified
    /// bucket. Duplicates are dropped.
    pub fn order<'a, I>(&self, domains: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen: Vec<&str> = Vec::new();
        for d in domains {
            if !seen.contains(&d) {
                seen.push(d);
            }
        }

        let mut ranked: Vec<(usize, usize, &str)> = Vec::new();
        let mut unranked: Vec<&str> = Vec::new();
        let mut trailing = false;
        for (idx, d) in seen.into_iter().enumerate() {
            if d == UNCLASSIFIED_DOMAIN {
                trailing = true;
            } else if let Some(rank) = self.rank(d) {
                ranked.push((rank, idx, d));
            } else {
                unranked.push(d);
            }
        }
        ranked.sort();

        let mut out: Vec<String> = ranked.into_iter().map(|(_, _, d)| d.to_string()).collect();
        out.extend(unranked.into_iter().map(str::to_string));
        if trailing {
            out.push(UNCLASSIFIED_DOMAIN.to_string());
        }
        out
    }
}
