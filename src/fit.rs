//! Resource-fit evaluator (component H, `is_ok_to_run`, §4.H).
//!
//! "Cannot run" is an expected outcome, never an exception (§7, §9): the
//! evaluator returns [`RunOutcome`], not a `Result` — a
//! [`crate::error::ScheduleError`] is reserved for the two truly
//! exceptional conditions named in §7.

use crate::entities::job::JobState;
use crate::entities::node::{Node, NodeState};
use crate::entities::queue::Queue;
use crate::entities::resresv::{NodeAllocation, ResResvView};
use crate::entities::server::Server;
use crate::limits::{Entity, Hardness, LimitKind, LimitScope};
use crate::request::Grouping;
use std::collections::HashMap;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FitFlags: u8 {
        /// Enumerate every failure reason instead of stopping at the
        /// first (used by the preemption planner, §4.J step 1).
        const RETURN_ALL_ERR = 1 << 0;
        /// Skip the global (`allpart`) pool intersection check.
        const NO_ALLPART = 1 << 1;
    }
}

/// §7's error-kind catalog (not exhaustive — the subset the evaluator
/// itself raises; provisioning/preemption-specific kinds live in their
/// owning modules).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotQueued,
    QueueNotStarted,
    QueueNotExec,
    DedicatedTime,
    CrossDedicated,
    PrimeOnly,
    NonprimeOnly,
    CrossPrimeBoundary,
    InsufficientServerResource,
    InsufficientQueueResource,
    InsufficientResourceOnNode,
    NoFreeNodes,
    NotEnoughNodes,
    CannotSpanPlacementSet,
    SetTooSmall,
    LimitExceeded,
    InvalidNodeState,
    NodeNotExclusive,
    NodeMultiJobNotAllowed,
    ReservationConflict,
    ReservationInterference,
    NodeNotResvEligible,
    ProvDisabledServer,
    ProvDisabledNode,
    SchedError,
}

/// §7: status carried alongside a kind — `never-run` causes the
/// orchestrator to mark the job `can_not_run` for the rest of the cycle;
/// `run` means the check passed; `scheduling-error` is an internal
/// inconsistency that should still be recoverable by skipping the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrStatus {
    NeverRun,
    Recoverable,
    SchedulingError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedStatus {
    pub kind: ErrorKind,
    pub status: ErrStatus,
    pub args: Vec<String>,
    pub resource: Option<String>,
}

impl SchedStatus {
    pub fn new(kind: ErrorKind, status: ErrStatus) -> Self {
        Self { kind, status, args: Vec::new(), resource: None }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_resource(mut self, res: impl Into<String>) -> Self {
        self.resource = Some(res.into());
        self
    }

    /// Unrecoverable-by-preemption conditions per §4.J step 2: no amount
    /// of ending other jobs changes these.
    pub fn unrecoverable_by_preemption(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::DedicatedTime
                | ErrorKind::CrossDedicated
                | ErrorKind::PrimeOnly
                | ErrorKind::NonprimeOnly
                | ErrorKind::CrossPrimeBoundary
                | ErrorKind::ProvDisabledServer
                | ErrorKind::ProvDisabledNode
                | ErrorKind::CannotSpanPlacementSet
                | ErrorKind::NotQueued
                | ErrorKind::QueueNotStarted
                | ErrorKind::QueueNotExec
        )
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    CanRun(Vec<NodeAllocation>),
    CannotRun(Vec<SchedStatus>),
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, RunOutcome::CanRun(_))
    }

    pub fn first_reason(&self) -> Option<&SchedStatus> {
        match self {
            RunOutcome::CannotRun(v) => v.first(),
            _ => None,
        }
    }
}

/// `is_ok_to_run`: the ordered check chain of §4.H.1. `queue` is `None`
/// for reservations (§4.H inputs).
pub fn is_ok_to_run(
    server: &Server,
    queue: Option<&Queue>,
    resresv: ResResvView<'_>,
    flags: FitFlags,
) -> RunOutcome {
    let mut errs: Vec<SchedStatus> = Vec::new();
    macro_rules! fail {
        ($status:expr) => {{
            errs.push($status);
            if !flags.contains(FitFlags::RETURN_ALL_ERR) {
                return RunOutcome::CannotRun(errs);
            }
        }};
    }

    // 1. State/admissibility.
    if let ResResvView::Job(job) = &resresv {
        if !matches!(job.state, JobState::Queued) {
            fail!(SchedStatus::new(ErrorKind::NotQueued, ErrStatus::NeverRun).with_arg(job.name.clone()));
        }
    }
    if let Some(q) = queue {
        if !q.started {
            fail!(SchedStatus::new(ErrorKind::QueueNotStarted, ErrStatus::NeverRun).with_arg(q.name.clone()));
        }
        if !q.is_execution() {
            fail!(SchedStatus::new(ErrorKind::QueueNotExec, ErrStatus::NeverRun).with_arg(q.name.clone()));
        }
        if server.in_dedicated_time() && !q.flags.dedicated_time {
            fail!(SchedStatus::new(ErrorKind::DedicatedTime, ErrStatus::Recoverable));
        }
        if server.in_prime_time() && q.flags.nonprimetime {
            fail!(SchedStatus::new(ErrorKind::PrimeOnly, ErrStatus::Recoverable));
        }
        if !server.in_prime_time() && q.flags.primetime {
            fail!(SchedStatus::new(ErrorKind::NonprimeOnly, ErrStatus::Recoverable));
        }
    }

    // 2. Crossing-boundary: duration must not cross a prime/dedicated
    // boundary unless policy allows it.
    if !server.policy.allow_boundary_crossing {
        let end = server.now + resresv.duration();
        if server.crosses_boundary(server.now, end) {
            fail!(SchedStatus::new(ErrorKind::CrossPrimeBoundary, ErrStatus::Recoverable));
        }
    }

    // 3. Hard limits.
    if let ResResvView::Job(job) = &resresv {
        let user = Entity::User(job.user.clone());
        let amount = resreq_amount(&resresv, "run_count").unwrap_or(1.0);
        let mut violations = server.limits.check(LimitScope::Server, LimitKind::RunCount, &user, "", amount);
        if let Some(q) = queue {
            violations.extend(q.limits.check(LimitScope::Queue, LimitKind::RunCount, &user, "", amount));
        }
        for v in violations {
            if v.hardness == Hardness::Hard {
                fail!(SchedStatus::new(ErrorKind::LimitExceeded, ErrStatus::Recoverable)
                    .with_arg(v.entity.label())
                    .with_resource(v.resource.clone()));
            }
        }
    }

    // 3b. Subjob concurrency: a subjob may not start if its array parent's
    // `max_run_subjobs` is already saturated by siblings materialized
    // earlier this (or a prior) cycle (§11 subjob accounting).
    if let ResResvView::Job(job) = &resresv {
        if let Some(parent_name) = &job.array_parent {
            if let Some(parent) = server.jobs.get(parent_name) {
                if let Some(cap) = parent.max_run_subjobs {
                    if parent.running_subjobs >= cap {
                        fail!(SchedStatus::new(ErrorKind::LimitExceeded, ErrStatus::Recoverable).with_arg(parent_name.clone()));
                    }
                }
            }
        }
    }

    // 4. Server/queue pool: RASSN resources must fit in residual capacity.
    for (resname, amount) in resresv.resreq() {
        let Some(def) = server.resource_defs.get(resname) else { continue };
        if !def.flags.rassn {
            continue;
        }
        if !flags.contains(FitFlags::NO_ALLPART) {
            if let Some(aa) = server.resources_available.get(resname) {
                if !aa.fits(def, amount) {
                    fail!(SchedStatus::new(ErrorKind::InsufficientServerResource, ErrStatus::Recoverable)
                        .with_resource(resname.clone()));
                }
            }
        }
        if let Some(q) = queue {
            if let Some(aa) = q.resources_available.get(resname) {
                if !aa.fits(def, amount) {
                    fail!(SchedStatus::new(ErrorKind::InsufficientQueueResource, ErrStatus::Recoverable)
                        .with_resource(resname.clone()));
                }
            }
        }
    }

    // 5. Reservation protection: filter candidate nodes to those not
    // exclusively held by an active/imminent reservation (non-resv work
    // only).
    let imminent_window = server.policy.reservation_imminent_window;
    let reserved_ranks: std::collections::HashSet<u32> = if resresv.is_job() {
        server
            .reservations
            .values()
            .filter(|r| r.is_active_or_imminent(server.now, imminent_window))
            .flat_map(|r| r.nspec.iter().map(|n| n.node_rank))
            .collect()
    } else {
        Default::default()
    };

    // 6/7. Placement + allocation.
    let candidate_nodes: Vec<&Node> = server
        .nodes
        .values()
        .filter(|n| n.is_usable() && !reserved_ranks.contains(&n.rank))
        .filter(|n| queue.and_then(|q| q.node_group.as_ref()).map_or(true, |g| n.queue.as_deref() == Some(g)))
        .collect();

    if candidate_nodes.is_empty() {
        fail!(SchedStatus::new(ErrorKind::NoFreeNodes, ErrStatus::Recoverable));
        return RunOutcome::CannotRun(errs);
    }

    let grouped_nodes: Vec<&Node> = match &resresv.place().grouping {
        Grouping::ByResource(key) => {
            let sets = crate::placement::partition_by_key(&candidate_nodes, key, &server.resource_defs);
            let reduced = reduced_request(&resresv, &server.resource_defs);
            match sets.iter().find(|s| s.fits(&server.resource_defs, &reduced)) {
                Some(set) => candidate_nodes
                    .iter()
                    .filter(|n| set.node_ranks.contains(&n.rank))
                    .copied()
                    .collect(),
                None => {
                    fail!(SchedStatus::new(ErrorKind::CannotSpanPlacementSet, ErrStatus::Recoverable));
                    return RunOutcome::CannotRun(errs);
                }
            }
        }
        Grouping::None => candidate_nodes,
    };

    // 9 (provisioning) omitted from the per-chunk path here: no candidate
    // node in this crate's model requires an AOE/EOE switch unless the
    // node's `aoe`/`eoe` resource is explicitly requested and differs
    // from the node's current value; that check is folded into the
    // non-consumable match inside `satisfy_select` since it is just
    // another equality/membership comparison from the evaluator's point
    // of view.
    let result = match bucket_fast_path(server, &resresv, &grouped_nodes) {
        Some(alloc) => Ok(alloc),
        None => satisfy_select(&resresv, &grouped_nodes, &server.resource_defs),
    };

    match result {
        Ok(alloc) => {
            if errs.is_empty() {
                RunOutcome::CanRun(alloc)
            } else {
                RunOutcome::CannotRun(errs)
            }
        }
        Err(reason) => {
            errs.push(reason);
            RunOutcome::CannotRun(errs)
        }
    }
}

/// §4.H.7 fast path: a "simple" chunk request (single chunk, no
/// placement-set grouping) can often be answered by scanning only the
/// node-bucket (component F) whose signature/queue/exclusivity already
/// matches the request, instead of the full candidate set. `bucket.pool`
/// and `bucket.free` are a point-in-time snapshot from the last
/// `rebuild_indexes` and may be stale inside a duplicated/simulated
/// universe (`calc_run_time` mutates nodes directly, never buckets); they
/// are used here only to pick which bucket to examine and as a cheap
/// reject, never as the allocation's source of truth — every node this
/// function returns is re-checked against its live state in
/// `grouped_nodes`. A bucket that doesn't pan out falls through to the
/// next, and an empty result here falls through to `satisfy_select`'s
/// full per-node walk, so staleness can only cost a missed fast path,
/// never a wrong answer.
fn bucket_fast_path(server: &Server, resresv: &ResResvView<'_>, grouped_nodes: &[&Node]) -> Option<Vec<NodeAllocation>> {
    if resresv.select().chunks.len() != 1 || !matches!(resresv.place().grouping, Grouping::None) {
        return None;
    }
    let place = resresv.place();
    let chunk = &resresv.select().chunks[0];
    let reduced: HashMap<String, crate::resource::ResourceValue> = chunk
        .requests
        .iter()
        .filter_map(|(name, text)| {
            let def = server.resource_defs.get(name)?;
            crate::resource::parse_value(def, text).map(|v| (name.clone(), v))
        })
        .collect();
    let allowed: HashMap<u32, &Node> = grouped_nodes.iter().map(|n| (n.rank, *n)).collect();

    for bucket in &server.node_buckets {
        let Some(rep) = allowed.get(&bucket.representative).copied().or_else(|| server.nodes.get(&bucket.representative)) else {
            continue;
        };
        let non_consumable_matches = reduced.iter().all(|(name, amount)| {
            server.resource_defs.get(name).map_or(true, |def| {
                if def.flags.consumable {
                    return true;
                }
                match rep.res.get(name) {
                    Some(crate::resource::ResourceContainer {
                        slot: crate::resource::NodeResourceSlot::Direct(aa),
                        ..
                    }) => aa.matches_request(amount),
                    _ => true,
                }
            })
        });
        if !non_consumable_matches || !bucket.admits(&reduced, chunk.multiplicity) {
            continue;
        }

        let mut chosen: Vec<u32> = Vec::new();
        for &rank in &bucket.all_ranks {
            if chosen.len() as u32 >= chunk.multiplicity {
                break;
            }
            let Some(node) = allowed.get(&rank).copied() else { continue };
            if place.sharing == crate::request::Sharing::Excl && !node.is_empty_of_jobs() {
                continue;
            }
            let fits = reduced.iter().all(|(name, amount)| {
                server.resource_defs.get(name).map_or(true, |def| match node.res.get(name) {
                    Some(crate::resource::ResourceContainer {
                        slot: crate::resource::NodeResourceSlot::Direct(aa),
                        ..
                    }) => {
                        if def.flags.consumable {
                            aa.fits(def, amount)
                        } else {
                            aa.matches_request(amount)
                        }
                    }
                    _ => true,
                })
            });
            if fits {
                chosen.push(rank);
            }
        }

        if chosen.len() as u32 == chunk.multiplicity {
            let alloc = chosen
                .into_iter()
                .map(|rank| NodeAllocation {
                    node_rank: rank,
                    node_name: allowed.get(&rank).map(|n| n.name.clone()).unwrap_or_default(),
                    chunk_index: 0,
                    request: reduced.clone(),
                    exclusive: place.sharing != crate::request::Sharing::Share,
                })
                .collect();
            return Some(alloc);
        }
    }
    None
}

fn resreq_amount(resresv: &ResResvView<'_>, key: &str) -> Option<f64> {
    resresv.resreq().get(key).and_then(|v| v.as_f64())
}

/// §4.H.2: "reduced request" = chunk request minus resources unknown to
/// policy.
fn reduced_request(
    resresv: &ResResvView<'_>,
    defs: &HashMap<String, std::sync::Arc<crate::resource::ResourceDef>>,
) -> HashMap<String, crate::resource::ResourceValue> {
    resresv
        .resreq()
        .iter()
        .filter(|(k, _)| defs.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// §4.H.2 chunk satisfy, extended to the whole select (multiple chunks).
fn satisfy_select(
    resresv: &ResResvView<'_>,
    nodes: &[&Node],
    defs: &HashMap<String, std::sync::Arc<crate::resource::ResourceDef>>,
) -> Result<Vec<NodeAllocation>, SchedStatus> {
    let place = resresv.place();
    let mut working: HashMap<u32, HashMap<String, crate::resource::ResourceValue>> = nodes
        .iter()
        .map(|n| {
            (
                n.rank,
                n.res
                    .iter()
                    .filter_map(|(name, c)| match &c.slot {
                        crate::resource::NodeResourceSlot::Direct(aa) => {
                            aa.residual(&c.def).map(|r| (name.clone(), r))
                        }
                        _ => None,
                    })
                    .collect(),
            )
        })
        .collect();
    // §4.H.3 tie-breaks (policy node-sort keys, then rank) are applied by
    // the caller when it builds `nodes`; here we walk in that given order.
    let order: Vec<u32> = nodes.iter().map(|n| n.rank).collect();

    let mut alloc = Vec::new();
    for chunk in &resresv.select().chunks {
        let reduced: HashMap<String, crate::resource::ResourceValue> = chunk
            .requests
            .iter()
            .filter_map(|(name, text)| {
                let def = defs.get(name)?;
                crate::resource::parse_value(def, text).map(|v| (name.clone(), v))
            })
            .collect();
        let mut remaining = chunk.multiplicity;
        for &rank in &order {
            if remaining == 0 {
                break;
            }
            let Some(node) = nodes.iter().find(|n| n.rank == rank) else { continue };
            if place.sharing == crate::request::Sharing::Excl && !node.is_empty_of_jobs() {
                continue;
            }
            let pool = working.get(&rank).cloned().unwrap_or_default();
            let fits = reduced.iter().all(|(name, amount)| {
                defs.get(name).map_or(true, |def| {
                    if def.flags.consumable {
                        pool.get(name).and_then(|p| p.as_f64()).unwrap_or(f64::INFINITY)
                            >= amount.as_f64().unwrap_or(0.0)
                    } else {
                        match node.res.get(name) {
                            Some(crate::resource::ResourceContainer {
                                slot: crate::resource::NodeResourceSlot::Direct(aa),
                                ..
                            }) => aa.matches_request(amount),
                            _ => true,
                        }
                    }
                })
            });
            if !fits {
                continue;
            }
            if let Some(entry) = working.get_mut(&rank) {
                for (name, amount) in &reduced {
                    if let Some(p) = entry.get_mut(name) {
                        if let Some(sub) = p.subtract(amount) {
                            *p = sub;
                        }
                    }
                }
            }
            alloc.push(NodeAllocation {
                node_rank: rank,
                node_name: node.name.clone(),
                chunk_index: alloc.len(),
                request: reduced.clone(),
                exclusive: place.sharing != crate::request::Sharing::Share,
            });
            remaining -= 1;
        }
        if remaining > 0 {
            return Err(SchedStatus::new(ErrorKind::NotEnoughNodes, ErrStatus::Recoverable));
        }
    }
    Ok(alloc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::server::Server;

    #[test]
    fn single_node_fit_allocates_requested_amount() {
        let mut server = Server::new_test();
        server.add_simple_node(1, "n1", 4, 8 * 1024 * 1024 * 1024);
        let job = crate::entities::job::Job::new("1.host", 1, "workq");
        let resresv = crate::entities::resresv::ResResvView::Job(&job);
        let mut job2 = job.clone();
        job2.select = crate::request::parse_select("1:ncpus=2:mem=2gb").unwrap();
        job2.place = crate::request::parse_place("free").unwrap();
        job2.resreq = crate::request::resolve_chunk_requests(&job2.select.chunks[0], &server.resource_defs);
        let resresv2 = crate::entities::resresv::ResResvView::Job(&job2);
        let _ = resresv;
        let outcome = is_ok_to_run(&server, None, resresv2, FitFlags::empty());
        assert!(outcome.is_ok(), "{:?}", outcome);
    }
}
