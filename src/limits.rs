//! Limit engine (component D, §4.D, §11 `PBS_ALL`).
//!
//! Limits come from two attribute families on the wire (legacy `max_*`
//! overall counts, and the newer `[u:name=N,g:name=N,p:name=N,o:PBS_ALL=N]`
//! grammar) but this crate normalizes both into one [`LimitSet`] keyed by
//! the four classifying axes before any fit decision consults it.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    RunCount,
    PerResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitScope {
    Server,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hardness {
    Hard,
    Soft,
}

/// `PBS_ALL` is a synthetic entity key distinct from any real user/group/
/// project name (§11).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    User(String),
    Group(String),
    Project(String),
    All,
}

impl Entity {
    pub fn label(&self) -> String {
        match self {
            Entity::User(n) => format!("u:{n}"),
            Entity::Group(n) => format!("g:{n}"),
            Entity::Project(n) => format!("p:{n}"),
            Entity::All => "o:PBS_ALL".to_string(),
        }
    }
}

/// One limit row: a cap on `resource` (empty string for run-count limits)
/// for `entity`, at `scope`, of `hardness`.
#[derive(Debug, Clone)]
pub struct LimitRule {
    pub kind: LimitKind,
    pub scope: LimitScope,
    pub hardness: Hardness,
    pub entity: Entity,
    /// Resource name for `PerResource`; ignored for `RunCount`.
    pub resource: String,
    pub cap: f64,
}

/// Decision tree keyed by (entity label, resource name) the engine builds
/// once per cycle (§4.D). Per key it tracks two running counters: jobs
/// running now, and jobs running-or-queued (used only by `has_*_limit`
/// short-circuits that must know a limit exists even before anything is
/// running against it).
#[derive(Debug, Clone, Default)]
pub struct LimitSet {
    pub rules: Vec<LimitRule>,
    running_now: HashMap<(String, String), f64>,
    running_and_queued: HashMap<(String, String), f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitViolation {
    pub scope: LimitScope,
    pub hardness: Hardness,
    pub entity: Entity,
    pub resource: String,
}

impl LimitSet {
    fn key(entity: &Entity, resource: &str) -> (String, String) {
        (entity.label(), resource.to_string())
    }

    pub fn has_limit(&self, entity: &Entity, resource: &str) -> bool {
        self.rules.iter().any(|r| &r.entity == entity && r.resource == resource)
    }

    /// Record a simulated or real run against the running counters
    /// (§4.D: "updated on every simulated run/end inside planner loops").
    /// Every run also bumps the synthetic `Entity::All` key so a
    /// `PBS_ALL` rule sees the true sum across every entity, not just the
    /// requesting one (§11).
    pub fn record_run(&mut self, entity: &Entity, resource: &str, amount: f64) {
        let key = Self::key(entity, resource);
        *self.running_now.entry(key.clone()).or_insert(0.0) += amount;
        *self.running_and_queued.entry(key).or_insert(0.0) += amount;
        if !matches!(entity, Entity::All) {
            let all_key = Self::key(&Entity::All, resource);
            *self.running_now.entry(all_key.clone()).or_insert(0.0) += amount;
            *self.running_and_queued.entry(all_key).or_insert(0.0) += amount;
        }
    }

    pub fn record_end(&mut self, entity: &Entity, resource: &str, amount: f64) {
        let key = Self::key(entity, resource);
        if let Some(v) = self.running_now.get_mut(&key) {
            *v -= amount;
        }
        if !matches!(entity, Entity::All) {
            let all_key = Self::key(&Entity::All, resource);
            if let Some(v) = self.running_now.get_mut(&all_key) {
                *v -= amount;
            }
        }
    }

    pub fn record_queued(&mut self, entity: &Entity, resource: &str, amount: f64) {
        let key = Self::key(entity, resource);
        *self.running_and_queued.entry(key).or_insert(0.0) += amount;
        if !matches!(entity, Entity::All) {
            let all_key = Self::key(&Entity::All, resource);
            *self.running_and_queued.entry(all_key).or_insert(0.0) += amount;
        }
    }

    pub fn running_now_of(&self, entity: &Entity, resource: &str) -> f64 {
        *self.running_now.get(&Self::key(entity, resource)).unwrap_or(&0.0)
    }

    /// Evaluate whether running `amount` more of `resource` for `entity`
    /// would violate any rule matching this key, at this scope. Returns
    /// the first violated rule (hard or soft; caller distinguishes).
    pub fn check(
        &self,
        scope: LimitScope,
        kind: LimitKind,
        entity: &Entity,
        resource: &str,
        amount: f64,
    ) -> Vec<LimitViolation> {
        let mut out = Vec::new();
        for rule in &self.rules {
            if rule.scope != scope || rule.kind != kind || rule.resource != resource {
                continue;
            }
            if !entity_matches(&rule.entity, entity) {
                continue;
            }
            let current = if matches!(rule.entity, Entity::All) {
                self.running_now_of(&Entity::All, resource)
            } else {
                self.running_now_of(entity, resource)
            };
            if current + amount > rule.cap {
                out.push(LimitViolation {
                    scope: rule.scope,
                    hardness: rule.hardness,
                    entity: rule.entity.clone(),
                    resource: rule.resource.clone(),
                });
            }
        }
        out
    }
}

/// `All` rules apply to every entity; otherwise entities must match
/// exactly by variant and name.
fn entity_matches(rule_entity: &Entity, job_entity: &Entity) -> bool {
    matches!(rule_entity, Entity::All) || rule_entity == job_entity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_limit_blocks_once_cap_reached() {
        let mut limits = LimitSet::default();
        limits.rules.push(LimitRule {
            kind: LimitKind::RunCount,
            scope: LimitScope::Server,
            hardness: Hardness::Hard,
            entity: Entity::User("alice".into()),
            resource: String::new(),
            cap: 2.0,
        });
        let alice = Entity::User("alice".into());
        limits.record_run(&alice, "", 1.0);
        limits.record_run(&alice, "", 1.0);
        let violations = limits.check(LimitScope::Server, LimitKind::RunCount, &alice, "", 1.0);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].hardness, Hardness::Hard);
    }

    #[test]
    fn all_entity_rule_applies_to_every_user() {
        let mut limits = LimitSet::default();
        limits.rules.push(LimitRule {
            kind: LimitKind::PerResource,
            scope: LimitScope::Queue,
            hardness: Hardness::Soft,
            entity: Entity::All,
            resource: "ncpus".into(),
            cap: 8.0,
        });
        let bob = Entity::User("bob".into());
        limits.record_run(&bob, "ncpus", 8.0);
        let violations = limits.check(LimitScope::Queue, LimitKind::PerResource, &bob, "ncpus", 1.0);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].hardness, Hardness::Soft);
    }

    #[test]
    fn all_entity_rule_aggregates_across_distinct_users() {
        let mut limits = LimitSet::default();
        limits.rules.push(LimitRule {
            kind: LimitKind::PerResource,
            scope: LimitScope::Server,
            hardness: Hardness::Hard,
            entity: Entity::All,
            resource: "ncpus".into(),
            cap: 8.0,
        });
        let alice = Entity::User("alice".into());
        let bob = Entity::User("bob".into());
        limits.record_run(&alice, "ncpus", 4.0);
        limits.record_run(&bob, "ncpus", 4.0);
        // Neither user is anywhere near the cap individually, but the two
        // together have exhausted the server-wide PBS_ALL cap.
        let violations = limits.check(LimitScope::Server, LimitKind::PerResource, &alice, "ncpus", 1.0);
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn end_releases_running_counter() {
        let mut limits = LimitSet::default();
        let alice = Entity::User("alice".into());
        limits.record_run(&alice, "ncpus", 4.0);
        limits.record_end(&alice, "ncpus", 4.0);
        assert_eq!(limits.running_now_of(&alice, "ncpus"), 0.0);
    }
}
