//! Forward simulator over a duplicated universe (component I, §4.I).
//!
//! `simulate_events` and `calc_run_time` are the two simulator entry
//! points named in §4.I; both operate on a universe the caller has
//! already `dup`'d (§5: the top-job and preemption planners "never
//! operate on the live one").

use crate::calendar::{generic_sim, CalendarEvent, EventKind, SimControl};
use crate::entities::resresv::ResResvView;
use crate::entities::server::Server;
use crate::fit::{is_ok_to_run, FitFlags, RunOutcome};

/// Apply one calendar event's effect to `server` in place. `Run` events
/// allocate the job/reservation's bound `nspec` onto its nodes and flip
/// it to running; `End` releases those nodes; `PolicyChange` flips the
/// prime/non-prime flag; `ProvisioningComplete` clears the node's
/// provisioning state.
pub fn apply_event(server: &mut Server, event: &CalendarEvent) {
    server.now = server.now.max(event.time);
    match event.kind {
        EventKind::Run => {
            if let Some(job) = server.jobs.get(&event.target).cloned() {
                if let Some(alloc) = &job.execselect {
                    for a in alloc {
                        if let Some(node) = server.nodes.get_mut(&a.node_rank) {
                            node.update_on_run(&job.name, &a.request);
                        }
                    }
                }
                if let Some(j) = server.jobs.get_mut(&event.target) {
                    j.state = crate::entities::job::JobState::Running;
                    j.stime = Some(event.time);
                }
                // §11 subjob accounting: a subjob materializes into
                // `running_subjobs` on its array parent only here, at the
                // point it actually starts running.
                if let Some(parent_name) = job.array_parent.clone() {
                    if let Some(parent) = server.jobs.get_mut(&parent_name) {
                        parent.running_subjobs += 1;
                    }
                }
            } else if let Some(resv) = server.reservations.get(&event.target).cloned() {
                for a in &resv.nspec {
                    if let Some(node) = server.nodes.get_mut(&a.node_rank) {
                        node.update_on_run(&resv.name, &a.request);
                    }
                }
                if let Some(r) = server.reservations.get_mut(&event.target) {
                    r.state = crate::entities::reservation::ResvState::Running;
                }
            }
        }
        EventKind::End => {
            if let Some(job) = server.jobs.get(&event.target).cloned() {
                if let Some(alloc) = &job.execselect {
                    for a in alloc {
                        if let Some(node) = server.nodes.get_mut(&a.node_rank) {
                            node.update_on_end(&job.name, &a.request);
                        }
                    }
                }
                if let Some(j) = server.jobs.get_mut(&event.target) {
                    j.state = crate::entities::job::JobState::Exiting;
                    j.end = Some(event.time);
                }
                if let Some(parent_name) = job.array_parent.clone() {
                    if let Some(parent) = server.jobs.get_mut(&parent_name) {
                        parent.running_subjobs = parent.running_subjobs.saturating_sub(1);
                    }
                }
            } else if let Some(resv) = server.reservations.get(&event.target).cloned() {
                for a in &resv.nspec {
                    if let Some(node) = server.nodes.get_mut(&a.node_rank) {
                        node.update_on_end(&resv.name, &a.request);
                    }
                }
            }
        }
        EventKind::ProvisioningComplete => {
            if let Ok(rank) = event.target.parse::<u32>() {
                if let Some(node) = server.nodes.get_mut(&rank) {
                    node.state.remove(crate::entities::node::NodeState::PROVISIONING);
                }
            }
        }
        EventKind::PolicyChange => {
            server.in_prime_time_now = !server.in_prime_time_now;
        }
    }
}

/// Fast-forward `server`'s calendar through every event up to
/// `end_time`, applying each in order. Mutates `server` (it must already
/// be a duplicated universe — callers never pass the live one). Built on
/// `generic_sim` rather than its own event loop, matching `calc_run_time`
/// in spirit.
pub fn simulate_events(server: &mut Server, end_time: i64) {
    let mut calendar = std::mem::take(&mut server.calendar);
    generic_sim(&mut calendar, end_time, |event| {
        apply_event(server, event);
        SimControl::Continue
    });
    server.calendar = calendar;
}

/// `calc_run_time`: the earliest future time `job_name` can run, found by
/// replaying the calendar on a duplicated universe, tentatively applying
/// each event (which, for `End` events, returns resources to the pool)
/// and re-testing fit after every step. Returns `None` if the job still
/// does not fit by `horizon`.
pub fn calc_run_time(server: &Server, job_name: &str, horizon: i64, flags: FitFlags) -> Option<i64> {
    let mut sim = server.dup();

    let fits_now = {
        let Some(job) = sim.jobs.get(job_name) else { return None };
        let queue = sim.queues.get(&job.queue);
        matches!(is_ok_to_run(&sim, queue, ResResvView::Job(job), flags), RunOutcome::CanRun(_))
    };
    if fits_now {
        return Some(sim.now);
    }

    loop {
        let Some(event) = sim.calendar.next_event(true) else { return None };
        if event.time > horizon {
            return None;
        }
        apply_event(&mut sim, &event);

        let Some(job) = sim.jobs.get(job_name) else { return None };
        let queue = sim.queues.get(&job.queue);
        if matches!(is_ok_to_run(&sim, queue, ResResvView::Job(job), flags), RunOutcome::CanRun(_)) {
            return Some(sim.now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarEvent;
    use crate::entities::job::{Job, JobState};
    use crate::entities::queue::{Queue, QueueKind};
    use crate::entities::resresv::NodeAllocation;
    use crate::request::{parse_place, parse_select};
    use std::collections::HashMap;

    #[test]
    fn calc_run_time_finds_earliest_slot_after_a_running_job_ends() {
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
        server.calendar.add_event(CalendarEvent::new(server.now + 100, crate::calendar::EventKind::End, "1.host", 1));

        let mut waiting = Job::new("2.host", 2, "workq");
        waiting.select = parse_select("1:ncpus=4").unwrap();
        waiting.place = parse_place("free").unwrap();
        waiting.resreq = crate::request::resolve_chunk_requests(&waiting.select.chunks[0], &server.resource_defs);
        server.jobs.insert(waiting.name.clone(), waiting);

        let start = calc_run_time(&server, "2.host", server.now + 1000, FitFlags::empty());
        assert_eq!(start, Some(server.now + 100));
    }
}
