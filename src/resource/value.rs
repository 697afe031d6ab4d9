//! Typed resource values and arithmetic (§3.1, §4.A).
//!
//! A value is one of the six wire kinds in [`super::def::ResourceKind`].
//! Consumable avail/assigned pairs distinguish "unset" from "zero": unset
//! non-consumable avail means infinite availability; unset consumable
//! avail/assigned means "treat as absent in sums", so `unset + x == x`
//! rather than `0 + x == x` only mattering for display, never for the
//! arithmetic identity itself — both give `x`, but unset propagates through
//! signatures differently (it is omitted, zero is not).

use super::def::{ResourceDef, ResourceKind};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriBool {
    True,
    False,
    /// Neither branch observed yet; skipped when building a signature.
    Unknown,
}

impl TriBool {
    pub fn accumulate(self, other: TriBool) -> TriBool {
        match (self, other) {
            (TriBool::Unknown, x) | (x, TriBool::Unknown) => x,
            (a, b) if a == b => a,
            _ => TriBool::True, // "true-or-false": both seen, report true (a job needing it gets no false surprise)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceValue {
    Long(i64),
    /// Bytes, base-2 (per `res_to_num`'s `kb/mb/gb/tb` and `kw/mw/gw/tw`).
    Size(i64),
    /// Seconds.
    Duration(i64),
    Float(f64),
    Str(String),
    StrArray(Vec<String>),
    Bool(TriBool),
}

impl ResourceValue {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceValue::Long(_) => ResourceKind::Long,
            ResourceValue::Size(_) => ResourceKind::Size,
            ResourceValue::Duration(_) => ResourceKind::TimeDuration,
            ResourceValue::Float(_) => ResourceKind::Float,
            ResourceValue::Str(_) => ResourceKind::String,
            ResourceValue::StrArray(_) => ResourceKind::StringArray,
            ResourceValue::Bool(_) => ResourceKind::Boolean,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ResourceValue::Long(_)
                | ResourceValue::Size(_)
                | ResourceValue::Duration(_)
                | ResourceValue::Float(_)
        )
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResourceValue::Long(v) => Some(*v as f64),
            ResourceValue::Size(v) => Some(*v as f64),
            ResourceValue::Duration(v) => Some(*v as f64),
            ResourceValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Add two values of the same kind, clamped per type. String-sets
    /// dedup their union; booleans accumulate to the three-valued lattice.
    pub fn add(&self, other: &ResourceValue) -> Option<ResourceValue> {
        match (self, other) {
            (ResourceValue::Long(a), ResourceValue::Long(b)) => Some(ResourceValue::Long(a.saturating_add(*b))),
            (ResourceValue::Size(a), ResourceValue::Size(b)) => Some(ResourceValue::Size(a.saturating_add(*b))),
            (ResourceValue::Duration(a), ResourceValue::Duration(b)) => {
                Some(ResourceValue::Duration(a.saturating_add(*b)))
            }
            (ResourceValue::Float(a), ResourceValue::Float(b)) => Some(ResourceValue::Float(a + b)),
            (ResourceValue::StrArray(a), ResourceValue::StrArray(b)) => {
                let mut out = a.clone();
                for v in b {
                    if !out.contains(v) {
                        out.push(v.clone());
                    }
                }
                Some(ResourceValue::StrArray(out))
            }
            (ResourceValue::Bool(a), ResourceValue::Bool(b)) => Some(ResourceValue::Bool(a.accumulate(*b))),
            _ => None,
        }
    }

    pub fn subtract(&self, other: &ResourceValue) -> Option<ResourceValue> {
        match (self, other) {
            (ResourceValue::Long(a), ResourceValue::Long(b)) => Some(ResourceValue::Long(a.saturating_sub(*b))),
            (ResourceValue::Size(a), ResourceValue::Size(b)) => Some(ResourceValue::Size(a.saturating_sub(*b))),
            (ResourceValue::Duration(a), ResourceValue::Duration(b)) => {
                Some(ResourceValue::Duration(a.saturating_sub(*b)))
            }
            (ResourceValue::Float(a), ResourceValue::Float(b)) => Some(ResourceValue::Float(a - b)),
            _ => None,
        }
    }

    /// Does this (node-side) value satisfy a requested value for a
    /// non-consumable resource? `StrArray` avail containing the requested
    /// `Str` (or a superset of a requested `StrArray`) counts as a match,
    /// matching `select`'s `resource=value` semantics for set-valued
    /// resources like `aoe`/`vnode`; everything else falls back to
    /// equality.
    pub fn satisfies(&self, req: &ResourceValue) -> bool {
        match (self, req) {
            (ResourceValue::StrArray(avail), ResourceValue::Str(want)) => avail.contains(want),
            (ResourceValue::StrArray(avail), ResourceValue::StrArray(want)) => {
                want.iter().all(|w| avail.contains(w))
            }
            _ => self == req,
        }
    }

    /// Canonical piece of a signature string for this value.
    pub fn signature_fragment(&self) -> Option<String> {
        match self {
            ResourceValue::Bool(TriBool::Unknown) => None,
            ResourceValue::Bool(b) => Some(format!("{:?}", b)),
            ResourceValue::Long(v) => Some(v.to_string()),
            ResourceValue::Size(v) => Some(v.to_string()),
            ResourceValue::Duration(v) => Some(v.to_string()),
            ResourceValue::Float(v) => Some(format!("{:.6}", v)),
            ResourceValue::Str(s) => Some(s.clone()),
            ResourceValue::StrArray(v) => {
                let mut sorted = v.clone();
                sorted.sort();
                Some(sorted.join(","))
            }
        }
    }
}

impl fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceValue::Long(v) => write!(f, "{v}"),
            ResourceValue::Size(v) => write!(f, "{v}b"),
            ResourceValue::Duration(v) => write!(f, "{v}"),
            ResourceValue::Float(v) => write!(f, "{v}"),
            ResourceValue::Str(v) => write!(f, "{v}"),
            ResourceValue::StrArray(v) => write!(f, "{}", v.join(",")),
            ResourceValue::Bool(TriBool::True) => write!(f, "true"),
            ResourceValue::Bool(TriBool::False) => write!(f, "false"),
            ResourceValue::Bool(TriBool::Unknown) => write!(f, "unknown"),
        }
    }
}

/// An avail/assigned pair as carried on a node, queue, or server (§3.1).
/// `None` is the sentinel: for non-consumables it means "unset = infinite
/// availability, matches any request"; for consumables it means "unset,
/// do not count toward sums until first set".
#[derive(Debug, Clone, Default)]
pub struct AvailAssigned {
    pub avail: Option<ResourceValue>,
    pub assigned: Option<ResourceValue>,
}

impl AvailAssigned {
    pub fn with_avail(v: ResourceValue) -> Self {
        Self {
            avail: Some(v),
            assigned: None,
        }
    }

    /// I-R1: assigned <= avail for consumables. Returns `false` (a
    /// violated invariant, not a type error) rather than panicking so
    /// callers can surface it as a scheduling error.
    pub fn invariant_holds(&self) -> bool {
        match (&self.avail, &self.assigned) {
            (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(av), Some(us)) => us <= av,
                _ => true,
            },
            _ => true,
        }
    }

    /// Residual capacity: avail - assigned, or "infinite" (`None`) if
    /// avail itself is unset on a non-consumable.
    pub fn residual(&self, def: &ResourceDef) -> Option<ResourceValue> {
        if !def.flags.consumable {
            return None;
        }
        match (&self.avail, &self.assigned) {
            (Some(a), Some(u)) => a.subtract(u),
            (Some(a), None) => Some(a.clone()),
            (None, _) => None,
        }
    }

    /// Does `req` fit in the residual capacity? Unset non-consumable
    /// avail always matches (infinite).
    pub fn fits(&self, def: &ResourceDef, req: &ResourceValue) -> bool {
        if !def.flags.consumable {
            return true;
        }
        match self.residual(def) {
            None => true, // unset avail on a consumable: treat as infinite until first set
            Some(residual) => match (residual.as_f64(), req.as_f64()) {
                (Some(r), Some(q)) => q <= r,
                _ => true,
            },
        }
    }

    /// Does the live value here satisfy a requested non-consumable value?
    /// Unset avail is infinite (matches anything); a set avail must
    /// `satisfy` the request per [`ResourceValue::satisfies`].
    pub fn matches_request(&self, req: &ResourceValue) -> bool {
        match &self.avail {
            None => true,
            Some(v) => v.satisfies(req),
        }
    }

    pub fn assign(&mut self, req: &ResourceValue) {
        self.assigned = Some(match &self.assigned {
            Some(cur) => cur.add(req).unwrap_or_else(|| req.clone()),
            None => req.clone(),
        });
    }

    pub fn release(&mut self, req: &ResourceValue) {
        if let Some(cur) = &self.assigned {
            self.assigned = cur.subtract(req);
        }
    }
}

/// A node resource value may be indirect: "look up this resource on
/// `other_node` each time" (§3.1). Resolved once per cycle by
/// [`crate::resource::indirect::resolve_indirect_resources`].
#[derive(Debug, Clone)]
pub enum NodeResourceSlot {
    Direct(AvailAssigned),
    Indirect(String),
}

#[derive(Debug, Clone)]
pub struct ResourceContainer {
    pub def: Arc<ResourceDef>,
    pub slot: NodeResourceSlot,
}

/// Parse a textual value into the typed value for a definition.
pub fn parse_value(def: &ResourceDef, text: &str) -> Option<ResourceValue> {
    let text = text.trim();
    match def.kind {
        ResourceKind::Long => text.parse::<i64>().ok().map(ResourceValue::Long).or_else(|| {
            res_to_num(text).map(|n| ResourceValue::Long(n as i64))
        }),
        ResourceKind::Size => res_to_num(text).map(ResourceValue::Size),
        ResourceKind::TimeDuration => parse_duration(text).map(ResourceValue::Duration),
        ResourceKind::Float => text.parse::<f64>().ok().map(ResourceValue::Float),
        ResourceKind::String => Some(ResourceValue::Str(text.to_string())),
        ResourceKind::StringArray => Some(ResourceValue::StrArray(
            text.split('+').map(|s| s.trim().to_string()).collect(),
        )),
        ResourceKind::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Some(ResourceValue::Bool(TriBool::True)),
            "false" | "f" | "0" => Some(ResourceValue::Bool(TriBool::False)),
            _ => None,
        },
    }
}

/// `res_to_num`: numeric suffixes `k,m,g,t` x `b,w` (base-2), no suffix is
/// bytes/words as-is. Falls back to plain integer parse.
pub fn res_to_num(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(n) = text.parse::<i64>() {
        return Some(n);
    }
    let lower = text.to_ascii_lowercase();
    let (mult, rest): (i64, &str) = if let Some(r) = lower.strip_suffix("kb").or_else(|| lower.strip_suffix("kw")) {
        (1024, r)
    } else if let Some(r) = lower.strip_suffix("mb").or_else(|| lower.strip_suffix("mw")) {
        (1024 * 1024, r)
    } else if let Some(r) = lower.strip_suffix("gb").or_else(|| lower.strip_suffix("gw")) {
        (1024 * 1024 * 1024, r)
    } else if let Some(r) = lower.strip_suffix("tb").or_else(|| lower.strip_suffix("tw")) {
        (1024i64 * 1024 * 1024 * 1024, r)
    } else if let Some(r) = lower.strip_suffix('b').or_else(|| lower.strip_suffix('w')) {
        (1, r)
    } else {
        return None;
    };
    let n: i64 = rest.trim().parse().ok()?;
    Some(n.saturating_mul(mult))
}

/// Time forms `[[h:]m:]s`.
pub fn parse_duration(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<i64>() {
        return Some(secs);
    }
    let parts: Vec<&str> = text.split(':').collect();
    let nums: Option<Vec<i64>> = parts.iter().map(|p| p.parse::<i64>().ok()).collect();
    let nums = nums?;
    match nums.len() {
        1 => Some(nums[0]),
        2 => Some(nums[0] * 60 + nums[1]),
        3 => Some(nums[0] * 3600 + nums[1] * 60 + nums[2]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn res_to_num_parses_suffixes() {
        assert_eq!(res_to_num("2kb"), Some(2048));
        assert_eq!(res_to_num("1mb"), Some(1024 * 1024));
        assert_eq!(res_to_num("4"), Some(4));
    }

    #[test]
    fn parse_duration_handles_all_forms() {
        assert_eq!(parse_duration("90"), Some(90));
        assert_eq!(parse_duration("1:30"), Some(90));
        assert_eq!(parse_duration("1:00:00"), Some(3600));
    }

    #[test]
    fn unset_avail_non_consumable_matches_any_request() {
        let def = ResourceDef::new(
            "arch",
            ResourceKind::String,
            super::super::def::ResourceFlags {
                consumable: false,
                ..Default::default()
            },
        );
        let aa = AvailAssigned::default();
        assert!(aa.fits(&def, &ResourceValue::Str("linux".into())));
    }

    #[test]
    fn assigned_accumulates_and_releases() {
        let def = ResourceDef::new("ncpus", ResourceKind::Long, super::super::def::ResourceFlags::default());
        let mut aa = AvailAssigned::with_avail(ResourceValue::Long(8));
        aa.assign(&ResourceValue::Long(2));
        assert!(aa.fits(&def, &ResourceValue::Long(6)));
        assert!(!aa.fits(&def, &ResourceValue::Long(7)));
        aa.release(&ResourceValue::Long(2));
        assert_eq!(aa.assigned, Some(ResourceValue::Long(0)));
    }

    #[test]
    fn bool_accumulation_is_three_valued() {
        assert_eq!(TriBool::Unknown.accumulate(TriBool::True), TriBool::True);
        assert_eq!(TriBool::True.accumulate(TriBool::True), TriBool::True);
        assert_eq!(TriBool::True.accumulate(TriBool::False), TriBool::True);
    }
}
