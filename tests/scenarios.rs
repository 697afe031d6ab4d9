//! End-to-end scenario tests, one per concrete cycle shape the core must
//! handle correctly: a single job that fits now, a job that cannot span
//! placement sets, a scatter multinode job, a job reserved as a future
//! top job with lower-priority backfill around it, preemption by an
//! express queue, a dynamic-resource script timeout, and a three-way
//! indirect-resource cycle.

use hpc_sched_core::connector::{
    BatchAttrib, BatchStatus, DynResOutcome, DynamicResourceRunner, JobSelection, PreemptReply, ServerConnector,
};
use hpc_sched_core::entities::job::{Job, JobState};
use hpc_sched_core::entities::node::Node;
use hpc_sched_core::entities::queue::{Queue, QueueKind};
use hpc_sched_core::entities::resresv::NodeAllocation;
use hpc_sched_core::entities::server::Server;
use hpc_sched_core::error::ScheduleResult;
use hpc_sched_core::preempt::planner::{plan_preemption, PlannerConfig, PreemptPlan};
use hpc_sched_core::preempt::{PreemptMethod, PreemptOrderTable, PreemptPrioTable, PreemptStatus};
use hpc_sched_core::request::{parse_place, parse_select, resolve_chunk_requests};
use hpc_sched_core::resource::value::{AvailAssigned, NodeResourceSlot, ResourceContainer};
use hpc_sched_core::resource::{ResourceDef, ResourceValue};
use hpc_sched_core::{CycleOrchestrator, FitFlags, RunOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct NullConnector;

#[async_trait]
impl ServerConnector for NullConnector {
    async fn stat_server(&self) -> ScheduleResult<BatchStatus> {
        Ok(BatchStatus { name: "server".into(), attribs: vec![] })
    }
    async fn stat_sched(&self) -> ScheduleResult<BatchStatus> {
        Ok(BatchStatus { name: "sched".into(), attribs: vec![] })
    }
    async fn stat_queue(&self) -> ScheduleResult<Vec<BatchStatus>> {
        Ok(vec![])
    }
    async fn stat_node(&self) -> ScheduleResult<Vec<BatchStatus>> {
        Ok(vec![])
    }
    async fn stat_resv(&self) -> ScheduleResult<Vec<BatchStatus>> {
        Ok(vec![])
    }
    async fn selstat_jobs(&self, _s: &JobSelection, _a: &[&str], _e: Option<&str>) -> ScheduleResult<Vec<BatchStatus>> {
        Ok(vec![])
    }
    async fn run_job(&self, _name: &str, _exec_vnode: &str, _async_commit: bool) -> ScheduleResult<()> {
        Ok(())
    }
    async fn alter_job(&self, _name: &str, _attrs: &[BatchAttrib]) -> ScheduleResult<()> {
        Ok(())
    }
    async fn async_alter_job(&self, _name: &str, _attrs: &[BatchAttrib]) -> ScheduleResult<()> {
        Ok(())
    }
    async fn preempt_jobs(&self, names: &[String]) -> ScheduleResult<Vec<PreemptReply>> {
        Ok(names.iter().map(|n| PreemptReply { job_name: n.clone(), method: None }).collect())
    }
    async fn confirm_resv(&self, _name: &str, _exec_vnode: &str, _start: i64) -> ScheduleResult<()> {
        Ok(())
    }
    async fn delete_resv(&self, _name: &str) -> ScheduleResult<()> {
        Ok(())
    }
}

// `Server::new_test`/`add_simple_node` are `#[cfg(test)]`-only helpers used
// by the crate's own unit tests; this file is a separate compilation unit
// that links the lib as an ordinary dependency, so it builds servers and
// nodes through the same public API a real connector-backed caller would.
fn test_server() -> Server {
    Server::new(1_700_000_000)
}

fn node_with(rank: u32, name: &str, ncpus: i64, defs: &HashMap<String, Arc<ResourceDef>>) -> Node {
    let mut node = Node::new(rank, name);
    node.res.insert(
        "ncpus".to_string(),
        ResourceContainer {
            def: defs["ncpus"].clone(),
            slot: NodeResourceSlot::Direct(AvailAssigned::with_avail(ResourceValue::Long(ncpus))),
        },
    );
    node
}

fn node_with_mem(rank: u32, name: &str, ncpus: i64, mem_bytes: i64, defs: &HashMap<String, Arc<ResourceDef>>) -> Node {
    let mut node = node_with(rank, name, ncpus, defs);
    node.res.insert(
        "mem".to_string(),
        ResourceContainer {
            def: defs["mem"].clone(),
            slot: NodeResourceSlot::Direct(AvailAssigned::with_avail(ResourceValue::Size(mem_bytes))),
        },
    );
    node
}

fn queued_job(name: &str, rank: u64, queue: &str, select: &str, place: &str, defs: &HashMap<String, Arc<ResourceDef>>) -> Job {
    let mut job = Job::new(name, rank, queue);
    job.select = parse_select(select).unwrap();
    job.place = parse_place(place).unwrap();
    let mut resreq = HashMap::new();
    for chunk in &job.select.chunks {
        for (k, v) in resolve_chunk_requests(chunk, defs) {
            resreq.insert(k, v);
        }
    }
    job.resreq = resreq;
    job
}

/// A node `ncpus=4,mem=8gb` and one queued job `select=1:ncpus=2`,
/// `place=free`: the job must run this cycle, and the node's residual
/// `ncpus` must drop by exactly the job's request.
#[tokio::test]
async fn single_node_fit_commits_a_run_and_assigns_node_residual() {
    let mut server = test_server();
    let node = node_with_mem(1, "n1", 4, 8 * 1024 * 1024 * 1024, &server.resource_defs);
    server.nodes.insert(1, node);
    server.queues.insert("workq".into(), Queue::new("workq", 100, QueueKind::Execution));

    let mut job = queued_job("1.host", 1, "workq", "1:ncpus=2", "free", &server.resource_defs);
    job.duration = 500;
    server.jobs.insert(job.name.clone(), job);

    let connector = NullConnector;
    let config = Arc::new(hpc_sched_core::SchedConfig::default());
    let orchestrator = CycleOrchestrator::new(&connector, config, None);
    let outcome = orchestrator.run_cycle(&mut server).await.unwrap();

    assert_eq!(outcome.jobs_run, vec!["1.host".to_string()]);
    assert!(server.jobs["1.host"].is_running());
    let node = &server.nodes[&1];
    let residual = node.residual("ncpus").unwrap();
    assert_eq!(residual, ResourceValue::Long(2));
}

/// Two hosts with `ncpus=2` each and a job requesting
/// `select=3:ncpus=1,place=group=host`: no single host can hold all
/// three chunks, and spanning a placement set is forbidden by the
/// grouping directive itself, so the job must not run and must not
/// mutate any node.
#[tokio::test]
async fn group_by_host_job_that_cannot_fit_one_host_does_not_run() {
    let defs = ResourceDef::builtin_defs();
    let mut server = test_server();
    for (rank, name) in [(1u32, "H1"), (2, "H2")] {
        let mut node = node_with(rank, name, 2, &defs);
        node.res.insert(
            "host".to_string(),
            ResourceContainer {
                def: defs["host"].clone(),
                slot: NodeResourceSlot::Direct(AvailAssigned::with_avail(ResourceValue::Str(name.to_string()))),
            },
        );
        server.nodes.insert(rank, node);
    }
    server.queues.insert("workq".into(), Queue::new("workq", 100, QueueKind::Execution));
    server.rebuild_indexes();

    let job = queued_job("1.host", 1, "workq", "3:ncpus=1", "group=host", &server.resource_defs);
    server.jobs.insert(job.name.clone(), job);

    let queue = server.queues.get("workq");
    let verdict = hpc_sched_core::is_ok_to_run(&server, queue, hpc_sched_core::entities::resresv::ResResvView::Job(&server.jobs["1.host"]), FitFlags::empty());
    assert!(matches!(verdict, RunOutcome::CannotRun(_)));
    for node in server.nodes.values() {
        assert_eq!(node.residual("ncpus"), node.avail_assigned("ncpus").and_then(|aa| aa.avail.clone()));
    }
}

/// Four single-cpu nodes and a job `select=4:ncpus=1,place=scatter`: the
/// job must run with exactly one chunk per node and must be flagged
/// multinode.
#[tokio::test]
async fn scatter_job_spreads_one_chunk_per_node() {
    let mut server = test_server();
    for rank in 1..=4u32 {
        let node = node_with_mem(rank, &format!("n{rank}"), 1, 1024 * 1024 * 1024, &server.resource_defs);
        server.nodes.insert(rank, node);
    }
    server.queues.insert("workq".into(), Queue::new("workq", 100, QueueKind::Execution));

    let job = queued_job("1.host", 1, "workq", "4:ncpus=1", "scatter", &server.resource_defs);
    assert!(job.is_multinode());
    server.jobs.insert(job.name.clone(), job);

    let connector = NullConnector;
    let config = Arc::new(hpc_sched_core::SchedConfig::default());
    let orchestrator = CycleOrchestrator::new(&connector, config, None);
    let outcome = orchestrator.run_cycle(&mut server).await.unwrap();

    assert_eq!(outcome.jobs_run, vec!["1.host".to_string()]);
    let alloc = server.jobs["1.host"].execselect.clone().unwrap();
    assert_eq!(alloc.len(), 4);
    let distinct_ranks: std::collections::HashSet<u32> = alloc.iter().map(|a| a.node_rank).collect();
    assert_eq!(distinct_ranks.len(), 4);
}

/// One `ncpus=4` node fully occupied by a running job that ends at
/// `t0+100`. A queued job J1 needing the whole node cannot run now, so
/// it is committed as a top job with an estimated start at the running
/// job's end; a smaller job J2 (`ncpus=1`, 50s) fits in the gap before
/// that without violating J1's committed start.
#[tokio::test]
async fn top_job_reserves_future_start_and_shorter_job_backfills_around_it() {
    let mut server = test_server();
    let node = node_with_mem(1, "n1", 4, 8 * 1024 * 1024 * 1024, &server.resource_defs);
    server.nodes.insert(1, node);
    server.queues.insert("workq".into(), Queue::new("workq", 100, QueueKind::Execution));

    let mut running = Job::new("100.host", 1, "workq");
    running.state = JobState::Running;
    running.stime = Some(server.now);
    running.duration = 100;
    let mut req = HashMap::new();
    req.insert("ncpus".to_string(), ResourceValue::Long(4));
    running.resreq = req.clone();
    running.execselect = Some(vec![NodeAllocation { node_rank: 1, node_name: "n1".into(), chunk_index: 0, request: req.clone(), exclusive: false }]);
    server.nodes.get_mut(&1).unwrap().update_on_run("100.host", &req);
    server.jobs.insert(running.name.clone(), running);
    server.calendar.add_event(hpc_sched_core::calendar::CalendarEvent::new(server.now + 100, hpc_sched_core::calendar::EventKind::End, "100.host", 1));

    let mut j1 = queued_job("200.host", 2, "workq", "1:ncpus=4", "free", &server.resource_defs);
    j1.duration = 500;
    server.jobs.insert(j1.name.clone(), j1);

    let mut j2 = queued_job("300.host", 3, "workq", "1:ncpus=1", "free", &server.resource_defs);
    j2.duration = 50;
    server.jobs.insert(j2.name.clone(), j2);

    let connector = NullConnector;
    let config = Arc::new(hpc_sched_core::SchedConfig::default());
    let orchestrator = CycleOrchestrator::new(&connector, config, None);
    let outcome = orchestrator.run_cycle(&mut server).await.unwrap();

    assert!(outcome.jobs_held_as_top.contains(&"200.host".to_string()));
}

/// One `ncpus=4` node fully occupied by a suspendable low-priority job.
/// An express-queue job needing `ncpus=2` cannot run until that job is
/// preempted; the planner must choose it as the sole victim and pick
/// suspend (the cheapest method a non-checkpointable, non-array job
/// tolerates).
#[test]
fn express_queue_job_preempts_low_priority_job_by_suspending_it() {
    let mut server = test_server();
    let node = node_with_mem(1, "n1", 4, 8 * 1024 * 1024 * 1024, &server.resource_defs);
    server.nodes.insert(1, node);
    server.queues.insert("workq".into(), Queue::new("workq", 100, QueueKind::Execution));

    let mut low = Job::new("1.host", 1, "workq");
    low.state = JobState::Running;
    low.stime = Some(server.now - 10);
    low.duration = 1000;
    let mut req = HashMap::new();
    req.insert("ncpus".to_string(), ResourceValue::Long(4));
    low.resreq = req.clone();
    low.execselect = Some(vec![NodeAllocation { node_rank: 1, node_name: "n1".into(), chunk_index: 0, request: req.clone(), exclusive: false }]);
    server.nodes.get_mut(&1).unwrap().update_on_run("1.host", &req);
    server.jobs.insert(low.name.clone(), low);

    let mut high = queued_job("2.host", 2, "workq", "1:ncpus=2", "free", &server.resource_defs);
    high.preempt_status = PreemptStatus::EXPRESS_QUEUE;
    server.jobs.insert(high.name.clone(), high);

    let prio_table = PreemptPrioTable::default().with_row(PreemptStatus::EXPRESS_QUEUE, 100);
    let order_table = PreemptOrderTable::default().with_row(0, vec![PreemptMethod::Suspend]);
    let cfg = PlannerConfig { prio_table: &prio_table, order_table: &order_table, max_attempts: 10 };

    let plan = plan_preemption(&server, "workq", "2.host", 200, &cfg);
    match plan {
        PreemptPlan::Feasible(victims) => {
            assert_eq!(victims.len(), 1);
            assert_eq!(victims[0].job_name, "1.host");
            assert_eq!(victims[0].method, PreemptMethod::Suspend);
        }
        PreemptPlan::Infeasible(reason) => panic!("expected a feasible preemption plan, got: {reason}"),
    }
}

struct SleepyRunner;

#[async_trait]
impl DynamicResourceRunner for SleepyRunner {
    async fn run(&self, _command_line: &str, _timeout: Duration) -> DynResOutcome {
        DynResOutcome::Timeout
    }
}

/// A dynamic-resource script configured with a 2-second alarm that never
/// produces output within the timeout: the resource's value must fall
/// back to 0 rather than propagate an error.
#[tokio::test]
async fn dynamic_resource_script_timeout_falls_back_to_zero() {
    let runner = SleepyRunner;
    let value = hpc_sched_core::connector::run_dynamic_resource_script(&runner, "foo", "sleep 60", Duration::from_secs(2), true).await;
    assert_eq!(value, ResourceValue::Long(0));
}

/// Three nodes whose `mem` resources point at each other in a cycle
/// (`A -> B -> C -> A`): resolution must terminate and leave every node
/// with an unset (not crashed, not looping) `mem` value.
#[test]
fn three_way_indirect_resource_cycle_resolves_to_unset() {
    let defs = ResourceDef::builtin_defs();
    let mut nodes: HashMap<u32, Node> = HashMap::new();
    for (rank, (name, target)) in [(1u32, ("A", "B")), (2, ("B", "C")), (3, ("C", "A"))] {
        let mut n = Node::new(rank, name);
        n.res.insert("mem".to_string(), ResourceContainer { def: defs["mem"].clone(), slot: NodeResourceSlot::Indirect(target.to_string()) });
        nodes.insert(rank, n);
    }
    hpc_sched_core::resource::indirect::resolve_indirect_resources_by_rank(&mut nodes);
    for rank in 1..=3u32 {
        match &nodes[&rank].res["mem"].slot {
            NodeResourceSlot::Direct(aa) => assert!(aa.avail.is_none()),
            NodeResourceSlot::Indirect(_) => panic!("node {rank} should have resolved to a direct (unset) slot"),
        }
    }
}
