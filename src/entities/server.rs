//! Server entity (`sinfo`, §3.7).
//!
//! Owns every other entity in the snapshot: queues, nodes, reservations,
//! jobs (indirectly, through queues' job lists kept at the orchestrator
//! level), the calendar, equivalence classes, placement sets and node
//! buckets. Cross-references are `(array_tag, index)`-style lookups via
//! name/rank keyed maps rather than pointers (§9).

use crate::buckets::NodeBucket;
use crate::calendar::Calendar;
use crate::entities::job::Job;
use crate::entities::node::Node;
use crate::entities::queue::Queue;
use crate::entities::reservation::Reservation;
use crate::equiv::EquivClasses;
use crate::limits::LimitSet;
use crate::placement::PlacementSet;
use crate::resource::{AvailAssigned, ResourceDef};
use std::collections::HashMap;
use std::sync::Arc;

/// Policy knobs that are process-wide config, read once at cycle start
/// (§9 "Global mutable state").
#[derive(Debug, Clone)]
pub struct Policy {
    pub allow_boundary_crossing: bool,
    pub reservation_imminent_window: i64,
    pub node_grouping_enabled: bool,
    pub eligible_time_enabled: bool,
    pub provisioning_enabled: bool,
    pub backfill_depth: u32,
    pub strict_ordering: bool,
    pub job_sort_formula_threshold: Option<f64>,
    pub sched_cycle_len: i64,
    pub max_preempt_attempts: u32,
    pub max_preempt_retries_per_job: u32,
    /// Resources released rather than the whole job, when a suspended
    /// job's soft-limit-freed resources are restricted (§3.7).
    pub restrict_resources_to_release_on_suspend: Vec<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allow_boundary_crossing: false,
            reservation_imminent_window: 300,
            node_grouping_enabled: false,
            eligible_time_enabled: false,
            provisioning_enabled: false,
            backfill_depth: 1,
            strict_ordering: false,
            job_sort_formula_threshold: None,
            sched_cycle_len: 1200,
            max_preempt_attempts: 50,
            max_preempt_retries_per_job: 3,
            restrict_resources_to_release_on_suspend: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Server {
    pub now: i64,
    pub partition: Option<String>,
    pub policy: Policy,

    pub resource_defs: HashMap<String, Arc<ResourceDef>>,
    pub resources_available: HashMap<String, AvailAssigned>,
    pub limits: LimitSet,

    pub queues: HashMap<String, Queue>,
    pub nodes: HashMap<u32, Node>,
    pub reservations: HashMap<String, Reservation>,
    /// §4.B: "the server owns its queues, nodes, reservations, jobs,
    /// calendar...". Queues reference jobs by name; they do not own them.
    pub jobs: HashMap<String, Job>,

    pub calendar: Calendar,
    pub equiv_classes: EquivClasses,
    pub placement_sets: Vec<PlacementSet>,
    pub node_buckets: Vec<NodeBucket>,

    pub preempt_counts: crate::preempt::PreemptCounts,
    pub formula: Option<String>,
    /// Server-level grouping key used as a tiebreaker when a job does not
    /// specify its own `place=group=K` (§4.E).
    pub node_group_key: Option<String>,

    /// Per-cycle "prime time" / "dedicated time" flags, computed once
    /// from the holidays file (§6.2) before the cycle starts.
    pub in_prime_time_now: bool,
    pub dedicated_windows: Vec<(i64, i64)>,
}

impl Server {
    pub fn new(now: i64) -> Self {
        Self {
            now,
            partition: None,
            policy: Policy::default(),
            resource_defs: ResourceDef::builtin_defs(),
            resources_available: HashMap::new(),
            limits: LimitSet::default(),
            queues: HashMap::new(),
            nodes: HashMap::new(),
            reservations: HashMap::new(),
            calendar: Calendar::default(),
            equiv_classes: EquivClasses::default(),
            placement_sets: Vec::new(),
            node_buckets: Vec::new(),
            preempt_counts: crate::preempt::PreemptCounts::default(),
            formula: None,
            node_group_key: None,
            in_prime_time_now: true,
            dedicated_windows: Vec::new(),
        }
    }

    pub fn in_dedicated_time(&self) -> bool {
        self.dedicated_windows.iter().any(|(s, e)| *s <= self.now && self.now < *e)
    }

    pub fn in_prime_time(&self) -> bool {
        self.in_prime_time_now
    }

    pub fn crosses_boundary(&self, start: i64, end: i64) -> bool {
        self.dedicated_windows.iter().any(|(s, e)| start < *s && end > *s || (start < *e && end > *e))
    }

    pub fn nodes_by_rank(&self) -> HashMap<u32, &Node> {
        self.nodes.iter().map(|(r, n)| (*r, n)).collect()
    }

    /// Build the node-bucket index and placement sets from current node
    /// state (§4.F, §4.E). Called once at cycle start and after any
    /// mutation that could change node signatures or exclusivity.
    pub fn rebuild_indexes(&mut self) {
        let nodes: Vec<&Node> = self.nodes.values().collect();
        self.node_buckets = crate::buckets::build_buckets(&nodes, &self.resource_defs);
        if self.policy.node_grouping_enabled {
            if let Some(key) = self.node_group_key.clone() {
                self.placement_sets = crate::placement::partition_by_key(&nodes, &key, &self.resource_defs);
            }
        }
    }

    /// Deep copy of the whole universe for simulation (§4.B `dup`, §9:
    /// "dup of the universe becomes a reindex rather than pointer
    /// rewriting" — since everything here is keyed by name/rank in owned
    /// maps, `Clone` already gives us that property for free).
    pub fn dup(&self) -> Self {
        self.clone()
    }

    #[cfg(test)]
    pub fn new_test() -> Self {
        Self::new(1_700_000_000)
    }

    #[cfg(test)]
    pub fn add_simple_node(&mut self, rank: u32, name: &str, ncpus: i64, mem_bytes: i64) {
        use crate::resource::value::{AvailAssigned as AA, NodeResourceSlot, ResourceContainer};
        use crate::resource::ResourceValue;

        let mut node = Node::new(rank, name);
        let ncpus_def = self.resource_defs["ncpus"].clone();
        node.res.insert(
            "ncpus".to_string(),
            ResourceContainer {
                def: ncpus_def,
                slot: NodeResourceSlot::Direct(AA::with_avail(ResourceValue::Long(ncpus))),
            },
        );
        let mem_def = self.resource_defs["mem"].clone();
        node.res.insert(
            "mem".to_string(),
            ResourceContainer {
                def: mem_def,
                slot: NodeResourceSlot::Direct(AA::with_avail(ResourceValue::Size(mem_bytes))),
            },
        );
        self.nodes.insert(rank, node);
    }
}
