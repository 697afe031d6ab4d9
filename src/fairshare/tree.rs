//! Fairshare tree definition loader.
//!
//! Format, one node per line, `#` comments allowed:
//! ```text
//! root    -      1
//! alice   root   10
//! bob     root   5
//! ```
//! `shares` is a relative weight among siblings; `parent` of `-` marks the
//! root. Usage decay and the actual `fairshare_perc`/`fairshare_factor`
//! computation are left to the job-sort formula (§9) — this loader only
//! produces the static tree shape plus accumulated usage counters the
//! orchestrator updates at cycle end.

use crate::error::{ConfigError, ScheduleResult};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct FairshareNode {
    pub name: String,
    pub parent: Option<String>,
    pub shares: u32,
    pub usage: f64,
}

#[derive(Debug, Clone, Default)]
pub struct FairshareTree {
    nodes: HashMap<String, FairshareNode>,
}

impl FairshareTree {
    pub fn load_from_str(content: &str) -> ScheduleResult<Self> {
        let mut tree = FairshareTree::default();
        for (line_no, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let malformed = || {
                ConfigError::MalformedLine {
                    path: "<string>".to_string(),
                    line_no: line_no + 1,
                    line: line.to_string(),
                }
                .into()
            };
            let name = parts.next().ok_or_else(malformed)?.to_string();
            let parent_tok = parts.next().ok_or_else(malformed)?;
            let shares: u32 = parts.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
            let parent = if parent_tok == "-" { None } else { Some(parent_tok.to_string()) };
            tree.nodes.insert(name.clone(), FairshareNode { name, parent, shares, usage: 0.0 });
        }
        Ok(tree)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ScheduleResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::load_from_str(&content)
    }

    pub fn node(&self, name: &str) -> Option<&FairshareNode> {
        self.nodes.get(name)
    }

    pub fn record_usage(&mut self, name: &str, amount: f64) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.usage += amount;
        }
    }

    /// Usage-weighted percentage of total sibling shares the entity holds
    /// at its own level, the simplest workable definition of
    /// `fairshare_perc` (§9 Open Question resolution: ship a small fixed
    /// evaluator rather than the full decaying-tree traversal).
    pub fn fairshare_perc(&self, name: &str) -> Option<f64> {
        let node = self.nodes.get(name)?;
        let siblings_total: u32 = self
            .nodes
            .values()
            .filter(|n| n.parent == node.parent)
            .map(|n| n.shares)
            .sum();
        if siblings_total == 0 {
            return Some(0.0);
        }
        Some(node.shares as f64 / siblings_total as f64)
    }

    /// Usage-to-shares ratio; lower means more entitled to run next. A
    /// job-sort formula referencing `fairshare_factor` wants the inverse
    /// of this (§9).
    pub fn fairshare_factor(&self, name: &str) -> Option<f64> {
        let node = self.nodes.get(name)?;
        if node.shares == 0 {
            return Some(f64::INFINITY);
        }
        Some(node.usage / node.shares as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tree_and_computes_perc_among_siblings() {
        let tree = FairshareTree::load_from_str("root - 1\nalice root 10\nbob root 5\n").unwrap();
        assert_eq!(tree.fairshare_perc("alice"), Some(10.0 / 15.0));
        assert_eq!(tree.fairshare_perc("bob"), Some(5.0 / 15.0));
    }

    #[test]
    fn usage_raises_fairshare_factor() {
        let mut tree = FairshareTree::load_from_str("root - 1\nalice root 10\n").unwrap();
        tree.record_usage("alice", 100.0);
        assert_eq!(tree.fairshare_factor("alice"), Some(10.0));
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(FairshareTree::load_from_str("alice\n").is_err());
    }
}
