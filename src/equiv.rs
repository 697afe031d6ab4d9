//! Equivalence classes (component G, §3.11, §4.G, P8).
//!
//! Jobs that are identical in every input affecting runnability are
//! grouped into one class. When the class's representative is evaluated
//! and found to "never run" for a *member-independent* reason (one that
//! does not depend on which specific job in the class you pick — e.g. a
//! global resource shortage, a dedicated-time conflict), every other
//! member short-circuits to the same verdict without re-evaluation.

use std::collections::HashMap;

/// The key tuple from §3.11. `select_signature`/`place_signature` are the
/// canonical strings from [`crate::request::unparse_select`]/
/// [`crate::request::unparse_place`]; `filtered_resreq` is a signature of
/// the resreq restricted to resources policy actually checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EquivKey {
    pub queue: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub project: Option<String>,
    pub partition: Option<String>,
    pub select_signature: String,
    pub place_signature: String,
    pub filtered_resreq: String,
}

/// A cached outcome is only safe to reuse across members when it does not
/// depend on the specific job (§4.G: "outcomes that are member-specific —
/// fairshare, starving, user-specific limits — invalidate the
/// short-circuit").
#[derive(Debug, Clone, PartialEq)]
pub enum CachedOutcome {
    /// No representative evaluated yet this cycle.
    Empty,
    /// Representative could never run for a reason independent of which
    /// member you ask; this reason is safe to reuse directly.
    NeverRun(String),
    /// Representative's outcome depended on member-specific state
    /// (fairshare, starving, user limits); every member must be
    /// evaluated individually.
    MemberSpecific,
}

#[derive(Debug, Clone, Default)]
pub struct EquivClass {
    pub members: Vec<String>,
    pub outcome: Option<CachedOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct EquivClasses {
    classes: HashMap<EquivKey, EquivClass>,
}

impl EquivClasses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: EquivKey, job_name: String) {
        self.classes.entry(key).or_default().members.push(job_name);
    }

    pub fn class_for(&self, key: &EquivKey) -> Option<&EquivClass> {
        self.classes.get(key)
    }

    pub fn class_for_mut(&mut self, key: &EquivKey) -> Option<&mut EquivClass> {
        self.classes.get_mut(key)
    }

    /// Record the representative's verdict. `member_independent` callers
    /// pass `true` only for reasons enumerated as independent in §4.G
    /// (insufficient global resource, dedicated-time conflict); anything
    /// touching fairshare/starving/user limits passes `false`.
    pub fn record_outcome(&mut self, key: &EquivKey, reason: Option<String>, member_independent: bool) {
        if let Some(class) = self.classes.get_mut(key) {
            class.outcome = Some(match reason {
                Some(r) if member_independent => CachedOutcome::NeverRun(r),
                Some(_) => CachedOutcome::MemberSpecific,
                None => CachedOutcome::Empty,
            });
        }
    }

    /// P8: look up whether this key's class already has a safely-reusable
    /// verdict for any member.
    pub fn short_circuit(&self, key: &EquivKey) -> Option<&str> {
        match self.classes.get(key).and_then(|c| c.outcome.as_ref()) {
            Some(CachedOutcome::NeverRun(reason)) => Some(reason.as_str()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(select_sig: &str) -> EquivKey {
        EquivKey {
            queue: Some("workq".into()),
            user: None,
            group: None,
            project: None,
            partition: None,
            select_signature: select_sig.into(),
            place_signature: "free".into(),
            filtered_resreq: "ncpus=2".into(),
        }
    }

    #[test]
    fn member_independent_reason_short_circuits_other_members() {
        let mut classes = EquivClasses::new();
        let k = key("1:ncpus=2");
        classes.insert(k.clone(), "job1".into());
        classes.insert(k.clone(), "job2".into());

        classes.record_outcome(&k, Some("insufficient-server-resource".into()), true);

        assert_eq!(classes.short_circuit(&k), Some("insufficient-server-resource"));
    }

    #[test]
    fn member_specific_reason_does_not_short_circuit() {
        let mut classes = EquivClasses::new();
        let k = key("1:ncpus=2");
        classes.insert(k.clone(), "job1".into());

        classes.record_outcome(&k, Some("no-fairshare".into()), false);

        assert_eq!(classes.short_circuit(&k), None);
    }

    #[test]
    fn distinct_keys_form_distinct_classes() {
        let mut classes = EquivClasses::new();
        classes.insert(key("1:ncpus=2"), "job1".into());
        classes.insert(key("1:ncpus=4"), "job2".into());
        assert_eq!(classes.len(), 2);
    }
}
