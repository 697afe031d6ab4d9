//! Reservation entity (`resource_resv` with `is_resv`, §3.5).

use crate::entities::resresv::NodeAllocation;
use crate::request::{PlaceSpec, SelectSpec};
use crate::resource::ResourceValue;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResvState {
    Unconfirmed,
    Confirmed,
    Running,
    BeingDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResvKind {
    Standing,
    Advance,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub name: String,
    pub rank: u64,
    /// The reservation owns a queue; that queue's `resv` back-pointer
    /// identifies this reservation (§3.5, §3.6).
    pub queue: String,
    pub kind: ResvKind,
    pub state: ResvState,

    pub select: SelectSpec,
    pub place: PlaceSpec,
    pub resreq: HashMap<String, ResourceValue>,

    pub start: i64,
    pub end: i64,
    /// Pre-bound allocation. Confirmed reservations are inviolable: jobs
    /// never evict them, and their resources are counted against this
    /// reservation's queue, never against the server, to avoid
    /// double-counting (§3.5).
    pub nspec: Vec<NodeAllocation>,
}

impl Reservation {
    pub fn new(name: impl Into<String>, rank: u64, queue: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            name: name.into(),
            rank,
            queue: queue.into(),
            kind: ResvKind::Advance,
            state: ResvState::Unconfirmed,
            select: SelectSpec::default(),
            place: PlaceSpec::default(),
            resreq: HashMap::new(),
            start,
            end,
            nspec: Vec::new(),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.state, ResvState::Confirmed | ResvState::Running)
    }

    pub fn is_active_or_imminent(&self, now: i64, imminent_window: i64) -> bool {
        self.is_confirmed() && self.start <= now + imminent_window && self.end > now
    }

    pub fn dup(&self) -> Self {
        self.clone()
    }
}
