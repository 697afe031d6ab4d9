//! Execution node (`ninfo`, §3.3).

use crate::resource::{AvailAssigned, ResourceContainer, ResourceValue};
use std::collections::HashMap;

bitflags::bitflags! {
    /// Node state flags. OpenPBS tracks these as a space-separated
    /// string (`free`, `job-busy`, `down`, ...); we keep the same set as
    /// bits so multiple can be held at once (e.g. `job-busy | provisioning`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeState: u16 {
        const FREE          = 1 << 0;
        const JOB_BUSY      = 1 << 1;
        const JOB_EXCLUSIVE = 1 << 2;
        const STALE         = 1 << 3;
        const DOWN          = 1 << 4;
        const OFFLINE       = 1 << 5;
        const PROVISIONING  = 1 << 6;
        const SLEEP         = 1 << 7;
        const UNKNOWN       = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultSharing {
    Shared,
    Exclusive,
}

/// A timed event touching this node, linked back into the server
/// calendar by id (§3.8). Kept as a flat `Vec` rather than an intrusive
/// linked list — sweeping on delete is a retain, not a pointer splice,
/// which is the idiomatic trade in safe Rust for this shape (§9:
/// arena-plus-integer-index representation).
pub type NodeEventRef = u64;

#[derive(Debug, Clone)]
pub struct Node {
    pub rank: u32,
    pub name: String,
    pub host: String,
    pub queue: Option<String>,
    pub partition: Option<String>,
    pub multi_vnode: bool,
    pub state: NodeState,
    pub accepts_reservations: bool,
    pub provisioning_enabled: bool,
    pub default_sharing: DefaultSharing,

    pub res: HashMap<String, ResourceContainer>,
    pub job_arr: Vec<String>,
    pub run_resvs_arr: Vec<String>,
    pub node_events: Vec<NodeEventRef>,
    pub bucket_ind: Option<usize>,
}

impl Node {
    pub fn new(rank: u32, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            rank,
            host: name.clone(),
            name,
            queue: None,
            partition: None,
            multi_vnode: false,
            state: NodeState::FREE,
            accepts_reservations: true,
            provisioning_enabled: false,
            default_sharing: DefaultSharing::Shared,
            res: HashMap::new(),
            job_arr: Vec::new(),
            run_resvs_arr: Vec::new(),
            node_events: Vec::new(),
            bucket_ind: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.state.intersects(
            NodeState::DOWN | NodeState::OFFLINE | NodeState::STALE | NodeState::UNKNOWN,
        )
    }

    pub fn is_empty_of_jobs(&self) -> bool {
        self.job_arr.is_empty()
    }

    /// Residual capacity for a consumable resource, or `None` if the
    /// resource is not defined on this node (treated as unset/infinite
    /// for non-consumables by the caller).
    pub fn residual(&self, resname: &str) -> Option<ResourceValue> {
        match self.res.get(resname)?.slot {
            crate::resource::NodeResourceSlot::Direct(ref aa) => {
                aa.residual(&self.res[resname].def)
            }
            crate::resource::NodeResourceSlot::Indirect(_) => None,
        }
    }

    pub fn avail_assigned(&self, resname: &str) -> Option<&AvailAssigned> {
        match &self.res.get(resname)?.slot {
            crate::resource::NodeResourceSlot::Direct(aa) => Some(aa),
            crate::resource::NodeResourceSlot::Indirect(_) => None,
        }
    }

    /// Update internal node data when a job runs on this node with the
    /// given per-chunk request (§3.3 lifecycle; `update_node_on_run`).
    pub fn update_on_run(&mut self, job_name: &str, request: &HashMap<String, ResourceValue>) {
        for (resname, amount) in request {
            if let Some(container) = self.res.get_mut(resname) {
                if let crate::resource::NodeResourceSlot::Direct(aa) = &mut container.slot {
                    aa.assign(amount);
                }
            }
        }
        if !self.job_arr.iter().any(|j| j == job_name) {
            self.job_arr.push(job_name.to_string());
        }
        self.state.remove(NodeState::FREE);
        self.state.insert(NodeState::JOB_BUSY);
    }

    /// `update_node_on_end`: release the resources and drop the job from
    /// `job_arr`; if nothing else is running the node reverts to free.
    pub fn update_on_end(&mut self, job_name: &str, request: &HashMap<String, ResourceValue>) {
        for (resname, amount) in request {
            if let Some(container) = self.res.get_mut(resname) {
                if let crate::resource::NodeResourceSlot::Direct(aa) = &mut container.slot {
                    aa.release(amount);
                }
            }
        }
        self.job_arr.retain(|j| j != job_name);
        if self.job_arr.is_empty() && self.run_resvs_arr.is_empty() {
            self.state.remove(NodeState::JOB_BUSY | NodeState::JOB_EXCLUSIVE);
            self.state.insert(NodeState::FREE);
        }
    }

    /// Deep copy for simulation (§4.B `dup`). Independent of the source:
    /// mutating the dup never touches the live node.
    pub fn dup(&self) -> Self {
        self.clone()
    }
}
