//! Resource definitions (§3.1, §4.A).
//!
//! A [`ResourceDef`] is shared (via `Arc`) across every value that carries
//! it; the def owns the type tag exactly once (I-R2), values only carry
//! the variant.

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Long,
    Size,
    TimeDuration,
    Float,
    String,
    StringArray,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceFlags {
    pub consumable: bool,
    pub host_level: bool,
    /// RASSN: sum-across-chunks, e.g. ncpus/mem.
    pub rassn: bool,
    pub convert_from_select: bool,
    pub read_only: bool,
}

impl Default for ResourceFlags {
    fn default() -> Self {
        Self {
            consumable: true,
            host_level: false,
            rassn: false,
            convert_from_select: true,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceDef {
    pub name: String,
    pub kind: ResourceKind,
    pub flags: ResourceFlags,
}

impl ResourceDef {
    pub fn new(name: impl Into<String>, kind: ResourceKind, flags: ResourceFlags) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            flags,
        })
    }

    /// Convenience constructors for the handful of resources every
    /// scheduler partition defines regardless of site config (ncpus, mem,
    /// walltime, host, vnode...). Sites add more via the config loader;
    /// these are the ones the core itself references by name.
    pub fn builtin_defs() -> HashMap<String, Arc<ResourceDef>> {
        let mut m = HashMap::new();
        let mut add = |name: &str, kind: ResourceKind, rassn: bool, consumable: bool| {
            m.insert(
                name.to_string(),
                ResourceDef::new(
                    name,
                    kind,
                    ResourceFlags {
                        consumable,
                        rassn,
                        ..Default::default()
                    },
                ),
            );
        };
        add("ncpus", ResourceKind::Long, true, true);
        add("mem", ResourceKind::Size, true, true);
        add("vmem", ResourceKind::Size, true, true);
        add("walltime", ResourceKind::TimeDuration, false, true);
        add("cput", ResourceKind::TimeDuration, false, true);
        add("ngpus", ResourceKind::Long, true, true);
        add("host", ResourceKind::String, false, false);
        add("vnode", ResourceKind::String, false, false);
        add("arch", ResourceKind::String, false, false);
        add("switch", ResourceKind::StringArray, false, false);
        add("aoe", ResourceKind::String, false, false);
        add("eoe", ResourceKind::String, false, false);
        m
    }
}
