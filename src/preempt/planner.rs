//! Preemption planner algorithm (§4.J steps 1-7, P4, P5).
//!
//! Operates on a *duplicated* universe (§5: "the preemption planner ...
//! never operates on the live one"); the caller commits the chosen
//! victims to the real server only after [`plan_preemption`] returns.

use super::{PreemptCapabilities, PreemptMethod, PreemptOrderTable, PreemptPrioTable, PreemptStatus};
use crate::entities::job::JobState;
use crate::entities::resresv::ResResvView;
use crate::entities::server::Server;
use crate::fit::{is_ok_to_run, ErrorKind, FitFlags, RunOutcome, SchedStatus};

#[derive(Debug, Clone)]
pub struct Victim {
    pub job_name: String,
    pub method: PreemptMethod,
}

#[derive(Debug, Clone)]
pub enum PreemptPlan {
    /// Preempting this set of victims, in commit order, lets H run.
    Feasible(Vec<Victim>),
    /// H's failure reasons are not recoverable by preempting anything
    /// (§4.J step 2), or the candidate pool was exhausted / the retry cap
    /// was hit before H fit.
    Infeasible(&'static str),
}

pub struct PlannerConfig<'a> {
    pub prio_table: &'a PreemptPrioTable,
    pub order_table: &'a PreemptOrderTable,
    pub max_attempts: u32,
}

/// Numeric preempt level of a running job, by the site table and the
/// job's preempt-status bitmask (§4.J).
fn preempt_level(job: &crate::entities::job::Job, table: &PreemptPrioTable, queue_priority: i32) -> i32 {
    let express = job.preempt_status.contains(PreemptStatus::EXPRESS_QUEUE);
    table.priority_for(job.preempt_status, if express { queue_priority } else { 0 })
}

fn capabilities_of(job: &crate::entities::job::Job) -> PreemptCapabilities {
    PreemptCapabilities {
        checkpoint: job.capable_of_checkpoint(),
        requeue: job.capable_of_requeue(),
        suspend: job.capable_of_suspend(),
    }
}

fn elapsed_pct(job: &crate::entities::job::Job, now: i64) -> u8 {
    if job.duration <= 0 {
        return 100;
    }
    let Some(stime) = job.stime else { return 0 };
    let elapsed = (now - stime).max(0);
    ((elapsed as f64 / job.duration as f64) * 100.0).clamp(0.0, 100.0) as u8
}

/// Does this running job's resource usage plausibly address any of H's
/// failure reasons (§4.J step 3: "filtered by similarity to failure
/// reasons, e.g. for a server-user-limit failure, only that user's jobs
/// are candidates")?
fn is_similar_candidate(job: &crate::entities::job::Job, reasons: &[SchedStatus]) -> bool {
    reasons.iter().any(|r| match r.kind {
        ErrorKind::LimitExceeded => r.args.first().map_or(true, |entity_label| {
            entity_label == &format!("u:{}", job.user)
                || job.group.as_deref().map_or(false, |g| entity_label == &format!("g:{g}"))
                || job.project.as_deref().map_or(false, |p| entity_label == &format!("p:{p}"))
        }),
        ErrorKind::InsufficientServerResource | ErrorKind::InsufficientQueueResource => {
            r.resource.as_deref().map_or(true, |res| job.resreq.contains_key(res))
        }
        ErrorKind::NoFreeNodes | ErrorKind::NotEnoughNodes | ErrorKind::InsufficientResourceOnNode => true,
        _ => true,
    })
}

/// §4.J: run H's fit evaluator, decide whether preemption can possibly
/// help, build a candidate pool, then iteratively tentatively end
/// candidates in a duplicated universe until H fits or the pool/retry cap
/// is exhausted, then minimize the chosen set by reverse walk.
pub fn plan_preemption(
    server: &Server,
    h_queue_name: &str,
    h_job_name: &str,
    h_preempt_level: i32,
    cfg: &PlannerConfig<'_>,
) -> PreemptPlan {
    let Some(h_job) = server.jobs.get(h_job_name) else {
        return PreemptPlan::Infeasible("job not found");
    };
    let queue = server.queues.get(h_queue_name);

    let reasons = match is_ok_to_run(server, queue, ResResvView::Job(h_job), FitFlags::RETURN_ALL_ERR) {
        RunOutcome::CanRun(_) => return PreemptPlan::Infeasible("job already fits, nothing to preempt"),
        RunOutcome::CannotRun(reasons) => reasons,
    };
    if reasons.iter().any(SchedStatus::unrecoverable_by_preemption) {
        return PreemptPlan::Infeasible("failure reason is unrecoverable by preemption");
    }

    // Step 3: candidate pool = running jobs strictly below H's level,
    // filtered by similarity to the failure reasons.
    let mut candidates: Vec<String> = server
        .jobs
        .values()
        .filter(|j| j.is_running())
        .filter(|j| {
            let qprio = server.queues.get(&j.queue).map_or(0, |q| q.priority);
            preempt_level(j, cfg.prio_table, qprio) < h_preempt_level
        })
        .filter(|j| is_similar_candidate(j, &reasons))
        .map(|j| j.name.clone())
        .collect();

    // Step 4: duplicate the universe; all tentative ends happen here.
    let mut sim = server.dup();
    let mut chosen: Vec<String> = Vec::new();
    let mut attempts = 0u32;

    // Step 5.
    while attempts < cfg.max_attempts && !candidates.is_empty() {
        attempts += 1;

        candidates.sort_by(|a, b| {
            let ja = &sim.jobs[a];
            let jb = &sim.jobs[b];
            let pa = preempt_level(ja, cfg.prio_table, sim.queues.get(&ja.queue).map_or(0, |q| q.priority));
            let pb = preempt_level(jb, cfg.prio_table, sim.queues.get(&jb.queue).map_or(0, |q| q.priority));
            pa.cmp(&pb).then(ja.stime.cmp(&jb.stime))
        });
        let victim_name = candidates.remove(0);

        tentatively_end(&mut sim, &victim_name);
        // §4.J step 5: an ended job's own priority is re-derived from its
        // (now possibly changed) preempt status; if it would rise above
        // H's it means ending it is counterproductive and it is skipped
        // rather than committed.
        let victim_level_after = {
            let v = &sim.jobs[&victim_name];
            preempt_level(v, cfg.prio_table, sim.queues.get(&v.queue).map_or(0, |q| q.priority))
        };
        if victim_level_after > h_preempt_level {
            continue;
        }
        chosen.push(victim_name);

        match is_ok_to_run(&sim, sim.queues.get(h_queue_name), ResResvView::Job(&sim.jobs[h_job_name]), FitFlags::empty()) {
            RunOutcome::CanRun(_) => break,
            RunOutcome::CannotRun(_) => continue,
        }
    }

    let fits = matches!(
        is_ok_to_run(&sim, sim.queues.get(h_queue_name), ResResvView::Job(&sim.jobs[h_job_name]), FitFlags::empty()),
        RunOutcome::CanRun(_)
    );
    if !fits {
        return PreemptPlan::Infeasible("candidate pool exhausted or retry cap reached before job fit");
    }

    // Step 6: reverse-walk, drop any victim H still fits without.
    let mut minimal: Vec<String> = Vec::new();
    let mut replay = server.dup();
    for name in chosen.iter().rev() {
        tentatively_end(&mut replay, name);
    }
    for name in &chosen {
        tentatively_restore(&mut replay, server, name);
        let still_fits = matches!(
            is_ok_to_run(&replay, replay.queues.get(h_queue_name), ResResvView::Job(&replay.jobs[h_job_name]), FitFlags::empty()),
            RunOutcome::CanRun(_)
        );
        if still_fits {
            continue; // this victim was not necessary; leave it restored
        }
        tentatively_end(&mut replay, name);
        minimal.push(name.clone());
    }
    minimal.reverse();

    // Step 2 (method selection per §4.J's `preempt_order`): choose the
    // first tolerable method for each surviving victim.
    let victims = minimal
        .into_iter()
        .filter_map(|name| {
            let job = server.jobs.get(&name)?;
            let pct = elapsed_pct(job, server.now);
            let order = cfg.order_table.order_for(pct);
            let tolerable = super::filter_tolerable(&order, capabilities_of(job));
            tolerable.first().copied().map(|method| Victim { job_name: name, method })
        })
        .collect();

    PreemptPlan::Feasible(victims)
}

/// Tentatively end a job in the duplicated universe: release its nodes,
/// mark it no longer running. Mirrors [`crate::calendar`]'s simulated-end
/// path but scoped to a single job rather than replaying the calendar.
///
/// Also retires the job from the limit counters so a later `is_ok_to_run`
/// call against this same `sim` sees the freed-up run-count/resource room
/// (§4.D: limit counters are updated on every simulated run/end).
fn tentatively_end(sim: &mut Server, job_name: &str) {
    let Some(job) = sim.jobs.get(job_name) else { return };
    let Some(alloc) = job.execselect.clone() else { return };
    for a in &alloc {
        if let Some(node) = sim.nodes.get_mut(&a.node_rank) {
            node.update_on_end(job_name, &a.request);
        }
    }
    let entity = crate::limits::Entity::User(job.user.clone());
    sim.limits.record_end(&entity, "", 1.0);
    if let Some(job) = sim.jobs.get_mut(job_name) {
        job.state = JobState::Queued;
        job.stime = None;
    }
}

/// Reverse of [`tentatively_end`]: re-run the job onto the same nodes it
/// held in the live (pre-preemption) universe, used only during the
/// reverse-drop minimization pass.
fn tentatively_restore(sim: &mut Server, live: &Server, job_name: &str) {
    let Some(live_job) = live.jobs.get(job_name) else { return };
    let Some(alloc) = live_job.execselect.clone() else { return };
    for a in &alloc {
        if let Some(node) = sim.nodes.get_mut(&a.node_rank) {
            node.update_on_run(job_name, &a.request);
        }
    }
    let entity = crate::limits::Entity::User(live_job.user.clone());
    sim.limits.record_run(&entity, "", 1.0);
    if let Some(job) = sim.jobs.get_mut(job_name) {
        job.state = JobState::Running;
        job.stime = live_job.stime;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::job::Job;
    use crate::entities::queue::{Queue, QueueKind};
    use crate::entities::resresv::NodeAllocation;
    use crate::request::{parse_place, parse_select};
    use crate::resource::ResourceValue;
    use std::collections::HashMap;

    fn server_with_one_node(ncpus: i64) -> Server {
        let mut server = Server::new_test();
        server.add_simple_node(1, "n1", ncpus, 8 * 1024 * 1024 * 1024);
        server.queues.insert("workq".into(), Queue::new("workq", 100, QueueKind::Execution));
        server
    }

    #[test]
    fn low_priority_running_job_is_chosen_to_free_room_for_high_priority() {
        let mut server = server_with_one_node(4);

        let mut low = Job::new("100.host", 1, "workq");
        low.user = "low".into();
        low.state = JobState::Running;
        low.stime = Some(server.now - 10);
        low.duration = 1000;
        let mut req = HashMap::new();
        req.insert("ncpus".to_string(), ResourceValue::Long(4));
        low.resreq = req.clone();
        low.execselect = Some(vec![NodeAllocation {
            node_rank: 1,
            node_name: "n1".into(),
            chunk_index: 0,
            request: req,
            exclusive: false,
        }]);
        if let Some(node) = server.nodes.get_mut(&1) {
            node.update_on_run("100.host", &low.resreq);
        }
        server.jobs.insert(low.name.clone(), low);

        let mut high = Job::new("200.host", 2, "workq");
        high.user = "high".into();
        high.select = parse_select("1:ncpus=2").unwrap();
        high.place = parse_place("free").unwrap();
        high.resreq = crate::request::resolve_chunk_requests(&high.select.chunks[0], &server.resource_defs);
        high.preempt_status = PreemptStatus::EXPRESS_QUEUE;
        server.jobs.insert(high.name.clone(), high);

        let prio_table = PreemptPrioTable::default().with_row(PreemptStatus::EXPRESS_QUEUE, 100);
        let order_table = PreemptOrderTable::default().with_row(0, vec![PreemptMethod::Suspend]);
        let cfg = PlannerConfig { prio_table: &prio_table, order_table: &order_table, max_attempts: 10 };

        let plan = plan_preemption(&server, "workq", "200.host", 100, &cfg);
        match plan {
            PreemptPlan::Feasible(victims) => {
                assert_eq!(victims.len(), 1);
                assert_eq!(victims[0].job_name, "100.host");
                assert_eq!(victims[0].method, PreemptMethod::Suspend);
            }
            PreemptPlan::Infeasible(reason) => panic!("expected feasible plan, got: {reason}"),
        }
    }

    #[test]
    fn unrecoverable_reason_aborts_without_picking_victims() {
        let mut server = server_with_one_node(4);
        server.dedicated_windows.push((server.now - 10, server.now + 1000));
        if let Some(q) = server.queues.get_mut("workq") {
            q.flags.dedicated_time = false;
        }

        let mut high = Job::new("200.host", 1, "workq");
        high.select = parse_select("1:ncpus=2").unwrap();
        high.place = parse_place("free").unwrap();
        high.resreq = crate::request::resolve_chunk_requests(&high.select.chunks[0], &server.resource_defs);
        server.jobs.insert(high.name.clone(), high);

        let prio_table = PreemptPrioTable::default();
        let order_table = PreemptOrderTable::default();
        let cfg = PlannerConfig { prio_table: &prio_table, order_table: &order_table, max_attempts: 10 };

        let plan = plan_preemption(&server, "workq", "200.host", 100, &cfg);
        assert!(matches!(plan, PreemptPlan::Infeasible(_)));
    }
}
