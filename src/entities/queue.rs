//! Queue entity (`qinfo`, §3.6).

use crate::limits::LimitSet;
use crate::placement::PlacementSet;
use crate::resource::{AvailAssigned, ResourceValue};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Execution,
    Route,
}

/// Sub-state flags derived from naming convention and config, not from a
/// single wire attribute (§3.6: "dedicated-time queue (name prefix),
/// primetime queue, nonprimetime queue, reservation queue").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFlags {
    pub dedicated_time: bool,
    pub primetime: bool,
    pub nonprimetime: bool,
    pub reservation_queue: bool,
}

#[derive(Debug, Clone)]
pub struct Queue {
    pub name: String,
    pub priority: i32,
    pub kind: QueueKind,
    pub started: bool,
    pub partition: Option<String>,
    pub flags: QueueFlags,

    pub limits: LimitSet,
    /// Optional queue-owned node association (§3.6); `None` means the
    /// queue draws from the server's whole node pool.
    pub node_group: Option<String>,

    pub resources_available: HashMap<String, AvailAssigned>,
    pub resources_assigned: HashMap<String, ResourceValue>,

    /// Placement-set cache at queue scope (§3.9).
    pub placement_sets: Vec<PlacementSet>,

    pub do_not_span_psets: bool,
    pub only_explicit_psets: bool,
    pub backfill_depth: Option<u32>,
    pub restrict_res_to_release_on_suspend: Vec<String>,

    /// Totals (`sc`, §3.6): running/queued job counts this cycle.
    pub running_jobs: u32,
    pub queued_jobs: u32,
}

impl Queue {
    pub fn new(name: impl Into<String>, priority: i32, kind: QueueKind) -> Self {
        Self {
            name: name.into(),
            priority,
            kind,
            started: true,
            partition: None,
            flags: QueueFlags::default(),
            limits: LimitSet::default(),
            node_group: None,
            resources_available: HashMap::new(),
            resources_assigned: HashMap::new(),
            placement_sets: Vec::new(),
            do_not_span_psets: false,
            only_explicit_psets: false,
            backfill_depth: None,
            restrict_res_to_release_on_suspend: Vec::new(),
            running_jobs: 0,
            queued_jobs: 0,
        }
    }

    pub fn is_execution(&self) -> bool {
        matches!(self.kind, QueueKind::Execution)
    }

    pub fn is_usable(&self) -> bool {
        self.started && self.is_execution()
    }

    pub fn dup(&self) -> Self {
        self.clone()
    }
}
