//! Snapshot ingestion (§4.B's "query" lifecycle operation; §4.L step 1;
//! §5's "bounded worker pool parses batches of job and node records off
//! the wire").
//!
//! The connector hands back `batch_status` lists — flat name/attribute
//! tuples (§6.1). This module turns those into the typed entities
//! `Server` operates on. Parsing one node or job record is pure CPU work
//! with no shared mutable state, so job and node batches are parsed
//! with a `rayon` scoped pool and concatenated by the caller after the
//! barrier, matching §5's "its only shared state is per-worker output
//! buffers that the coordinator concatenates after the barrier" exactly.

use crate::connector::BatchStatus;
use crate::entities::job::{AccrueType, Job, JobFlags, JobState, JobSubstate};
use crate::entities::node::{DefaultSharing, Node, NodeState};
use crate::entities::queue::{Queue, QueueFlags, QueueKind};
use crate::entities::reservation::{Reservation, ResvKind, ResvState};
use crate::entities::server::Server;
use crate::request::{parse_place, parse_select, resolve_chunk_requests};
use crate::resource::value::NodeResourceSlot;
use crate::resource::{AvailAssigned, ResourceContainer, ResourceDef, ResourceValue};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Parse every node batch-status into a [`Node`], in parallel, then
/// return them keyed by rank for the caller to install on [`Server`].
pub fn ingest_nodes(batches: &[BatchStatus], defs: &HashMap<String, Arc<ResourceDef>>, next_rank: &mut u32) -> Vec<Node> {
    // Ranks must be assigned deterministically (stable across a cycle,
    // §3.3), so we hand out ranks here, before fanning out, rather than
    // racing workers over a shared counter.
    let numbered: Vec<(u32, &BatchStatus)> = batches
        .iter()
        .map(|b| {
            let rank = *next_rank;
            *next_rank += 1;
            (rank, b)
        })
        .collect();

    numbered.into_par_iter().map(|(rank, b)| parse_node(rank, b, defs)).collect()
}

fn parse_node(rank: u32, b: &BatchStatus, defs: &HashMap<String, Arc<ResourceDef>>) -> Node {
    let mut node = Node::new(rank, b.name.clone());
    node.host = b.get("Mom").map(str::to_string).unwrap_or_else(|| b.name.clone());
    node.queue = b.get("queue").map(str::to_string);
    node.partition = b.get("partition").map(str::to_string);
    node.multi_vnode = b.get("is_multi_vnode").map(|v| v == "True" || v == "1").unwrap_or(false);
    node.accepts_reservations = b.get("resv_enable").map(|v| v != "False" && v != "0").unwrap_or(true);
    node.provisioning_enabled = b.get("provision_enable").map(|v| v == "True" || v == "1").unwrap_or(false);
    node.default_sharing = match b.get("sharing") {
        Some(s) if s.starts_with("force_excl") || s.starts_with("default_excl") => DefaultSharing::Exclusive,
        _ => DefaultSharing::Shared,
    };
    node.state = parse_node_state(b.get("state").unwrap_or("free"));

    for attrib in &b.attribs {
        let Some(resname) = &attrib.resource else { continue };
        let is_available = attrib.name == "resources_available";
        let is_assigned = attrib.name == "resources_assigned";
        if !is_available && !is_assigned {
            continue;
        }
        let Some(def) = defs.get(resname) else { continue };
        if let Some(stripped) = attrib.value.strip_prefix('@') {
            if is_available {
                node.res.insert(
                    resname.clone(),
                    ResourceContainer { def: def.clone(), slot: NodeResourceSlot::Indirect(stripped.to_string()) },
                );
            }
            continue;
        }
        let Some(value) = crate::resource::value::parse_value(def, &attrib.value) else { continue };
        let entry = node
            .res
            .entry(resname.clone())
            .or_insert_with(|| ResourceContainer { def: def.clone(), slot: NodeResourceSlot::Direct(AvailAssigned::default()) });
        if let NodeResourceSlot::Direct(aa) = &mut entry.slot {
            if is_available {
                aa.avail = Some(value);
            } else {
                aa.assigned = Some(value);
            }
        }
    }
    node
}

fn parse_node_state(text: &str) -> NodeState {
    let mut state = NodeState::empty();
    for token in text.split(',') {
        state |= match token.trim() {
            "free" => NodeState::FREE,
            "job-busy" => NodeState::JOB_BUSY,
            "job-exclusive" => NodeState::JOB_EXCLUSIVE,
            "stale" => NodeState::STALE,
            "down" => NodeState::DOWN,
            "offline" => NodeState::OFFLINE,
            "provisioning" => NodeState::PROVISIONING,
            "sleep" => NodeState::SLEEP,
            _ => NodeState::UNKNOWN,
        };
    }
    if state.is_empty() {
        state = NodeState::FREE;
    }
    state
}

/// Parse every job batch-status into a [`Job`], in parallel (§5).
///
/// §11 subjob accounting: each parent array job's `running_subjobs` is
/// re-derived from this same snapshot (a count of its children currently
/// `Running`) rather than carried over — the snapshot is the ground truth
/// for the live universe; incremental event-driven updates only apply
/// inside a duplicated/simulated universe (`simulate::apply_event`).
pub fn ingest_jobs(batches: &[BatchStatus], defs: &HashMap<String, Arc<ResourceDef>>, rank_base: u64) -> Vec<Job> {
    let mut jobs: Vec<Job> = batches
        .par_iter()
        .enumerate()
        .map(|(i, b)| parse_job(rank_base + i as u64, b, defs))
        .collect();

    let mut running_by_parent: HashMap<String, u32> = HashMap::new();
    for job in &jobs {
        if job.is_running() {
            if let Some(parent) = &job.array_parent {
                *running_by_parent.entry(parent.clone()).or_insert(0) += 1;
            }
        }
    }
    for job in &mut jobs {
        if let Some(count) = running_by_parent.get(&job.name) {
            job.running_subjobs = *count;
        }
    }
    jobs
}

fn parse_job(rank: u64, b: &BatchStatus, defs: &HashMap<String, Arc<ResourceDef>>) -> Job {
    let queue = b.get("queue").unwrap_or_default();
    let mut job = Job::new(b.name.clone(), rank, queue);
    job.user = b.get("Job_Owner").map(|s| s.split('@').next().unwrap_or(s).to_string()).unwrap_or_default();
    job.group = b.get("group_list").map(str::to_string);
    job.project = b.get("project").map(str::to_string);
    job.partition = b.get("partition").map(str::to_string);

    if let Some(sel) = b.get("schedselect").or_else(|| b.get("Resource_List.select")) {
        if let Ok(spec) = parse_select(sel) {
            job.select = spec;
        }
    }
    if let Some(pl) = b.get("place") {
        if let Ok(spec) = parse_place(pl) {
            job.place = spec;
        }
    }
    for chunk in &job.select.chunks {
        for (k, v) in resolve_chunk_requests(chunk, defs) {
            let scaled = if let Some(existing) = job.resreq.get(&k) {
                existing.add(&v).unwrap_or(v)
            } else {
                v
            };
            job.resreq.insert(k, scaled);
        }
    }

    job.state = match b.get("job_state").unwrap_or("Q") {
        "R" => JobState::Running,
        "S" => JobState::SuspendedByScheduler,
        "H" => JobState::Held,
        "E" => JobState::Exiting,
        "X" => JobState::Expired,
        _ => JobState::Queued,
    };
    job.qtime = b.get("qtime").and_then(|v| v.parse().ok()).unwrap_or(0);
    job.etime = b.get("etime").and_then(|v| v.parse().ok()).unwrap_or(job.qtime);
    job.eligible_time = b.get("eligible_time").and_then(|v| v.parse().ok()).unwrap_or(0);
    job.stime = b.get("stime").and_then(|v| v.parse().ok());
    job.duration = b
        .get_resource("Resource_List", "walltime")
        .and_then(crate::resource::value::parse_duration)
        .unwrap_or(0);
    job.hard_duration = job.duration;
    job.fairshare_entity = b.get("fairshare_tree_node").map(str::to_string);
    job.flags = JobFlags {
        provisioning: b.get("substate").map(|s| s == "71" || s == "72").unwrap_or(false),
        array_parent: b.get("array").map(|v| v == "True").unwrap_or(false),
        subjob: job.name.contains('['),
        checkpointed: b.get("checkpoint").map(|v| v != "n").unwrap_or(false),
        ..JobFlags::default()
    };
    job.substate = if job.flags.provisioning { JobSubstate::ProvisioningWait } else { JobSubstate::None };
    job.accrue_type = match b.get("accrue_type") {
        Some("2") => AccrueType::Eligible,
        Some("3") => AccrueType::Running,
        _ => AccrueType::Ineligible,
    };
    job.max_run_subjobs = b.get("max_run_subjobs").and_then(|v| v.parse().ok());
    job.array_parent = array_parent_name(&job.name);
    job
}

/// A subjob's name carries its array index in brackets (`123[5].host`);
/// its parent array job's name is the same string with the index
/// stripped (`123[].host`). Not a subjob if there's no bracketed index.
fn array_parent_name(name: &str) -> Option<String> {
    let open = name.find('[')?;
    let close = name.find(']')?;
    if close <= open || !name[open + 1..close].chars().all(|c| c.is_ascii_digit()) || name[open + 1..close].is_empty() {
        return None;
    }
    Some(format!("{}[]{}", &name[..open], &name[close + 1..]))
}

/// Parse every queue batch-status into a [`Queue`] (small batches;
/// sequential is clear enough and queues rarely number in the thousands
/// the way nodes/jobs do).
pub fn ingest_queues(batches: &[BatchStatus]) -> Vec<Queue> {
    batches.iter().map(parse_queue).collect()
}

fn parse_queue(b: &BatchStatus) -> Queue {
    let priority = b.get("Priority").and_then(|v| v.parse().ok()).unwrap_or(0);
    let kind = match b.get("queue_type") {
        Some("Route") | Some("route") => QueueKind::Route,
        _ => QueueKind::Execution,
    };
    let mut queue = Queue::new(b.name.clone(), priority, kind);
    queue.started = b.get("started").map(|v| v != "False").unwrap_or(true);
    queue.partition = b.get("partition").map(str::to_string);
    queue.flags = QueueFlags {
        dedicated_time: b.name.starts_with("ded"),
        primetime: b.get("primetime_queue").map(|v| v == "True").unwrap_or(false),
        nonprimetime: b.get("nonprimetime_queue").map(|v| v == "True").unwrap_or(false),
        reservation_queue: b.name.starts_with('R') || b.name.starts_with('S'),
    };
    queue.do_not_span_psets = b.get("do_not_span_psets").map(|v| v == "True").unwrap_or(false);
    queue.only_explicit_psets = b.get("only_explicit_psets").map(|v| v == "True").unwrap_or(false);
    queue.backfill_depth = b.get("backfill_depth").and_then(|v| v.parse().ok());
    queue
}

/// Parse every reservation batch-status into a [`Reservation`].
pub fn ingest_reservations(batches: &[BatchStatus], rank_base: u64) -> Vec<Reservation> {
    batches
        .iter()
        .enumerate()
        .map(|(i, b)| {
            let start = b.get("reserve_start").and_then(|v| v.parse().ok()).unwrap_or(0);
            let end = b.get("reserve_end").and_then(|v| v.parse().ok()).unwrap_or(0);
            let queue = b.get("queue").unwrap_or(&b.name);
            let mut resv = Reservation::new(b.name.clone(), rank_base + i as u64, queue.clone(), start, end);
            resv.kind = if b.get("reserve_type").map(|v| v == "STANDING").unwrap_or(false) {
                ResvKind::Standing
            } else {
                ResvKind::Advance
            };
            resv.state = match b.get("reserve_state") {
                Some("RESV_CONFIRMED") => ResvState::Confirmed,
                Some("RESV_RUNNING") => ResvState::Running,
                Some("RESV_BEING_DELETED") => ResvState::BeingDeleted,
                _ => ResvState::Unconfirmed,
            };
            if let Some(sel) = b.get("Resource_List.select") {
                if let Ok(spec) = parse_select(sel) {
                    resv.select = spec;
                }
            }
            resv
        })
        .collect()
}

/// Assemble a fresh [`Server`] from one cycle's connector batches (§4.L
/// step 1). `now` is the cycle's start time, taken once.
pub fn build_server(
    now: i64,
    server_status: &BatchStatus,
    queues: &[BatchStatus],
    nodes: &[BatchStatus],
    resvs: &[BatchStatus],
    jobs: &[BatchStatus],
) -> Server {
    let mut server = Server::new(now);
    server.partition = server_status.get("partition").map(str::to_string);
    server.node_group_key = server_status.get("node_group_key").map(str::to_string);
    server.policy.node_grouping_enabled = server_status.get("node_group_enable").map(|v| v == "True").unwrap_or(false);
    server.policy.eligible_time_enabled = server_status.get("eligible_time_enable").map(|v| v == "True").unwrap_or(false);
    server.policy.backfill_depth = server_status.get("backfill_depth").and_then(|v| v.parse().ok()).unwrap_or(1);

    let mut next_rank = 0u32;
    for n in ingest_nodes(nodes, &server.resource_defs, &mut next_rank) {
        server.nodes.insert(n.rank, n);
    }
    for q in ingest_queues(queues) {
        server.queues.insert(q.name.clone(), q);
    }
    for r in ingest_reservations(resvs, 1_000_000) {
        server.reservations.insert(r.name.clone(), r);
    }
    for j in ingest_jobs(jobs, &server.resource_defs, 2_000_000) {
        server.jobs.insert(j.name.clone(), j);
    }
    server
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{AttribOp, BatchAttrib};

    fn attrib(name: &str, resource: Option<&str>, value: &str) -> BatchAttrib {
        BatchAttrib { name: name.to_string(), resource: resource.map(str::to_string), value: value.to_string(), op: AttribOp::Set }
    }

    #[test]
    fn ingest_nodes_parses_resources_and_state() {
        let defs = ResourceDef::builtin_defs();
        let batch = BatchStatus {
            name: "n1".to_string(),
            attribs: vec![
                attrib("state", None, "free"),
                attrib("resources_available", Some("ncpus"), "8"),
                attrib("resources_available", Some("mem"), "16gb"),
                attrib("resources_assigned", Some("ncpus"), "2"),
            ],
        };
        let mut next_rank = 0;
        let nodes = ingest_nodes(std::slice::from_ref(&batch), &defs, &mut next_rank);
        assert_eq!(nodes.len(), 1);
        let n = &nodes[0];
        assert_eq!(n.rank, 0);
        assert!(n.state.contains(NodeState::FREE));
        let residual = n.residual("ncpus").unwrap();
        assert_eq!(residual, ResourceValue::Long(6));
    }

    #[test]
    fn ingest_nodes_assigns_sequential_ranks_in_order() {
        let defs = ResourceDef::builtin_defs();
        let batches: Vec<BatchStatus> = (0..5)
            .map(|i| BatchStatus { name: format!("n{i}"), attribs: vec![] })
            .collect();
        let mut next_rank = 10;
        let nodes = ingest_nodes(&batches, &defs, &mut next_rank);
        let mut ranks: Vec<u32> = nodes.iter().map(|n| n.rank).collect();
        ranks.sort();
        assert_eq!(ranks, vec![10, 11, 12, 13, 14]);
        assert_eq!(next_rank, 15);
    }

    #[test]
    fn ingest_jobs_parses_select_and_sums_resreq() {
        let defs = ResourceDef::builtin_defs();
        let batch = BatchStatus {
            name: "42.host".to_string(),
            attribs: vec![
                attrib("queue", None, "workq"),
                attrib("job_state", None, "Q"),
                attrib("schedselect", None, "2:ncpus=2:mem=1gb"),
                attrib("place", None, "free"),
                attrib("Resource_List", Some("walltime"), "1:00:00"),
            ],
        };
        let jobs = ingest_jobs(std::slice::from_ref(&batch), &defs, 5);
        assert_eq!(jobs.len(), 1);
        let j = &jobs[0];
        assert_eq!(j.rank, 5);
        assert_eq!(j.queue, "workq");
        assert!(j.is_queued());
        assert_eq!(j.duration, 3600);
        assert_eq!(j.resreq.get("ncpus"), Some(&ResourceValue::Long(4)));
    }

    #[test]
    fn ingest_queues_reads_priority_and_started() {
        let batch = BatchStatus {
            name: "workq".to_string(),
            attribs: vec![attrib("Priority", None, "150"), attrib("started", None, "True")],
        };
        let queues = ingest_queues(std::slice::from_ref(&batch));
        assert_eq!(queues[0].priority, 150);
        assert!(queues[0].started);
        assert!(queues[0].is_execution());
    }

    #[test]
    fn build_server_wires_everything_together() {
        let server_status = BatchStatus { name: "server".into(), attribs: vec![attrib("node_group_enable", None, "True")] };
        let queue = BatchStatus { name: "workq".into(), attribs: vec![attrib("Priority", None, "100")] };
        let node = BatchStatus {
            name: "n1".into(),
            attribs: vec![attrib("resources_available", Some("ncpus"), "4")],
        };
        let job = BatchStatus {
            name: "1.host".into(),
            attribs: vec![attrib("queue", None, "workq"), attrib("schedselect", None, "1:ncpus=1")],
        };
        let server = build_server(1_700_000_000, &server_status, &[queue], &[node], &[], &[job]);
        assert!(server.policy.node_grouping_enabled);
        assert_eq!(server.queues.len(), 1);
        assert_eq!(server.nodes.len(), 1);
        assert_eq!(server.jobs.len(), 1);
    }
}
