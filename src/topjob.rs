//! Top-job / backfill planner (component K, §4.K, P3).
//!
//! A "top job" is a head-of-line job that cannot run now but has been
//! promised the next feasible start, recorded as a `run`/`end` event pair
//! on the calendar. Lower-priority jobs may still run now ("backfill")
//! provided doing so cannot push any top job's committed start later.

use crate::calendar::{CalendarEvent, EventKind};
use crate::entities::resresv::{NodeAllocation, ResResvView};
use crate::entities::server::Server;
use crate::fit::FitFlags;
use crate::simulate::calc_run_time;

#[derive(Debug, Clone)]
pub struct TopJob {
    pub job_name: String,
    pub queue: String,
    pub start: i64,
    pub end: i64,
    pub alloc: Vec<NodeAllocation>,
}

/// Per-queue count of concurrently committed top jobs, capped by
/// `backfill_depth` (§4.K).
#[derive(Debug, Clone, Default)]
pub struct BackfillState {
    pub top_jobs: Vec<TopJob>,
}

impl BackfillState {
    pub fn count_for_queue(&self, queue: &str) -> u32 {
        self.top_jobs.iter().filter(|t| t.queue == queue).count() as u32
    }

    /// §3.6/§4.K: queue-level `backfill_depth` overrides the server
    /// default when set.
    pub fn queue_depth(queue: &crate::entities::queue::Queue, server_default: u32) -> u32 {
        queue.backfill_depth.unwrap_or(server_default)
    }
}

/// Try to place `job_name` as a top job: find its earliest feasible
/// start via [`calc_run_time`], then commit a `run`/`end` event pair to
/// `server`'s calendar. Returns `None` if `strict_ordering` forbids
/// backfill entirely, the queue is already at its backfill depth, the
/// job's formula value is below `job_sort_formula_threshold` (§4.K), or
/// no future start is found within the horizon.
pub fn try_mark_top_job(
    server: &mut Server,
    backfill: &mut BackfillState,
    job_name: &str,
    horizon: i64,
    formula_value: Option<f64>,
) -> Option<TopJob> {
    if server.policy.strict_ordering {
        return None;
    }
    let job = server.jobs.get(job_name)?;
    let queue_name = job.queue.clone();
    let queue = server.queues.get(&queue_name)?;
    if let (Some(threshold), Some(value)) = (server.policy.job_sort_formula_threshold, formula_value) {
        if value < threshold {
            return None;
        }
    }
    if backfill.count_for_queue(&queue_name) >= BackfillState::queue_depth(queue, server.policy.backfill_depth) {
        return None;
    }

    let start = calc_run_time(server, job_name, horizon, FitFlags::empty())?;
    let duration = ResResvView::Job(job).duration();
    let end = start + duration;

    // Evaluate the allocation at the found start by simulating to that
    // point and re-running the evaluator once more to capture `nspec`.
    let mut sim = server.dup();
    crate::simulate::simulate_events(&mut sim, start);
    let sim_job = sim.jobs.get(job_name)?;
    let sim_queue = sim.queues.get(&queue_name);
    let alloc = match crate::fit::is_ok_to_run(&sim, sim_queue, ResResvView::Job(sim_job), FitFlags::empty()) {
        crate::fit::RunOutcome::CanRun(alloc) => alloc,
        crate::fit::RunOutcome::CannotRun(_) => return None,
    };

    // A prior cycle may already have committed this exact job/window to
    // the calendar; don't double-book it.
    if !server.calendar.exists_run_event(job_name, start, start) {
        server.calendar.add_event(CalendarEvent::new(start, EventKind::Run, job_name, job.rank));
        server.calendar.add_event(CalendarEvent::new(end, EventKind::End, job_name, job.rank));
    }

    if let Some(job) = server.jobs.get_mut(job_name) {
        job.execselect = Some(alloc.clone());
        job.estimated_start = Some(start);
        job.comment = Some(format!("Not Running: Top job, estimated start {start}"));
    }

    let top = TopJob { job_name: job_name.to_string(), queue: queue_name, start, end, alloc };
    backfill.top_jobs.push(top.clone());
    Some(top)
}

/// P3: would starting `candidate_alloc` now for a job that would end at
/// `candidate_end` push any top job's committed start later? True iff it
/// is safe to backfill (the condition holds: `end(J) <= s_T` for every
/// top job T, or the allocations don't overlap).
pub fn backfill_is_safe(backfill: &BackfillState, candidate_end: i64, candidate_alloc: &[NodeAllocation]) -> bool {
    backfill.top_jobs.iter().all(|t| {
        candidate_end <= t.start
            || !candidate_alloc.iter().any(|a| t.alloc.iter().any(|ta| ta.node_rank == a.node_rank))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{CalendarEvent, EventKind};
    use crate::entities::job::{Job, JobState};
    use crate::entities::queue::{Queue, QueueKind};
    use crate::entities::resresv::NodeAllocation;
    use crate::request::{parse_place, parse_select};
    use std::collections::HashMap;

    #[test]
    fn top_job_reserves_future_start_after_running_job_ends() {
        let mut server = Server::new_test();
        server.add_simple_node(1, "n1", 4, 8 * 1024 * 1024 * 1024);
        server.queues.insert("workq".into(), Queue::new("workq", 100, QueueKind::Execution));

        let mut running = Job::new("1.host", 1, "workq");
        running.state = JobState::Running;
        running.stime = Some(server.now);
        running.duration = 100;
        let mut req = HashMap::new();
        req.insert("ncpus".to_string(), crate::resource::ResourceValue::Long(4));
        running.resreq = req.clone();
        running.execselect = Some(vec![NodeAllocation {
            node_rank: 1,
            node_name: "n1".into(),
            chunk_index: 0,
            request: req.clone(),
            exclusive: false,
        }]);
        if let Some(node) = server.nodes.get_mut(&1) {
            node.update_on_run("1.host", &req);
        }
        server.jobs.insert(running.name.clone(), running);
        server.calendar.add_event(CalendarEvent::new(server.now + 100, EventKind::End, "1.host", 1));

        let mut j1 = Job::new("2.host", 2, "workq");
        j1.select = parse_select("1:ncpus=4").unwrap();
        j1.place = parse_place("free").unwrap();
        j1.resreq = crate::request::resolve_chunk_requests(&j1.select.chunks[0], &server.resource_defs);
        server.jobs.insert(j1.name.clone(), j1);

        let mut backfill = BackfillState::default();
        let top = try_mark_top_job(&mut server, &mut backfill, "2.host", server.now + 10_000, None).unwrap();

        assert_eq!(top.start, server.now + 100);
        assert_eq!(backfill.count_for_queue("workq"), 1);
    }

    #[test]
    fn strict_ordering_disables_backfill_entirely() {
        let mut server = Server::new_test();
        server.policy.strict_ordering = true;
        server.queues.insert("workq".into(), Queue::new("workq", 100, QueueKind::Execution));
        let j = Job::new("1.host", 1, "workq");
        server.jobs.insert(j.name.clone(), j);
        let mut backfill = BackfillState::default();
        assert!(try_mark_top_job(&mut server, &mut backfill, "1.host", server.now + 100, None).is_none());
    }
}
