//! Cycle orchestrator (component L, §4.L, §5).
//!
//! Owns the top-level scheduling cycle: ingest a snapshot, rebuild the
//! derived indexes (buckets, placement sets, equivalence classes,
//! indirect resources), walk queues/candidates in priority order
//! dispatching each to the fit evaluator, and commit whatever it decides
//! (run, hold as a top job, or preempt victims) back through the
//! connector. Blocking I/O is confined to the connector boundary and the
//! dynamic-resource script runner (§5); everything else here is pure
//! computation over the in-memory `Server`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SchedConfig;
use crate::connector::{BatchAttrib, AttribOp, DynamicResourceRunner, ServerConnector};
use crate::entities::job::JobState;
use crate::entities::resresv::ResResvView;
use crate::entities::server::Server;
use crate::equiv::EquivKey;
use crate::error::ScheduleResult;
use crate::fairshare::FairshareTree;
use crate::fit::{is_ok_to_run, FitFlags, RunOutcome};
use crate::formula::{self, FormulaContext};
use crate::limits::Entity;
use crate::preempt::planner::{plan_preemption, PlannerConfig, PreemptPlan};
use crate::preempt::PreemptStatus;
use crate::request::{unparse_place, unparse_select};
use crate::topjob::{try_mark_top_job, BackfillState};

/// What happened this cycle, surfaced for logging/metrics rather than
/// consumed by anything inside the crate.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub jobs_run: Vec<String>,
    pub jobs_held_as_top: Vec<String>,
    pub jobs_preempted: Vec<String>,
    pub cycle_duration: Duration,
    pub ended_early: bool,
}

pub struct CycleOrchestrator<'a> {
    connector: &'a dyn ServerConnector,
    config: Arc<SchedConfig>,
    fairshare: Option<FairshareTree>,
    /// §6.3: runner for configured `server_dyn_res` scripts. `None` skips
    /// the refresh entirely (no scripts configured, or the site doesn't
    /// wire one in for a given deployment).
    dyn_res_runner: Option<&'a dyn DynamicResourceRunner>,
}

impl<'a> CycleOrchestrator<'a> {
    pub fn new(connector: &'a dyn ServerConnector, config: Arc<SchedConfig>, fairshare: Option<FairshareTree>) -> Self {
        Self { connector, config, fairshare, dyn_res_runner: None }
    }

    /// Attach a dynamic-resource script runner (§6.3); scripts configured
    /// via `server_dyn_res.*` are refreshed at the start of every cycle.
    pub fn with_dyn_res_runner(mut self, runner: &'a dyn DynamicResourceRunner) -> Self {
        self.dyn_res_runner = Some(runner);
        self
    }

    /// Run one full scheduling cycle against `server`, mutating it in
    /// place to reflect every decision committed this cycle.
    #[tracing::instrument(skip(self, server), fields(partition = ?server.partition))]
    pub async fn run_cycle(&self, server: &mut Server) -> ScheduleResult<CycleOutcome> {
        let cycle_start = Instant::now();
        let budget = Duration::from_secs(self.config.policy.sched_cycle_len.max(0) as u64);
        let mut outcome = CycleOutcome::default();

        self.refresh_dynamic_resources(server).await;
        server.rebuild_indexes();
        crate::resource::indirect::resolve_indirect_resources_by_rank(&mut server.nodes);
        self.build_equivalence_classes(server);

        let mut backfill = BackfillState::default();
        let prio_table = self.config.preempt_prio.clone();
        let order_table = self.config.preempt_order.clone();
        let planner_cfg = PlannerConfig {
            prio_table: &prio_table,
            order_table: &order_table,
            max_attempts: self.config.policy.max_preempt_attempts,
        };

        let mut queue_names: Vec<String> = server.queues.keys().cloned().collect();
        queue_names.sort_by_key(|q| std::cmp::Reverse(server.queues[q].priority));

        'queues: for queue_name in queue_names {
            if cycle_start.elapsed() > budget {
                tracing::warn!(elapsed_ms = cycle_start.elapsed().as_millis() as u64, "sched_cycle_len exceeded, ending cycle early");
                outcome.ended_early = true;
                break 'queues;
            }
            if !server.queues.get(&queue_name).map_or(false, |q| q.is_usable()) {
                continue;
            }

            let mut job_names: Vec<String> = server
                .jobs
                .values()
                .filter(|j| j.queue == queue_name && j.is_queued())
                .map(|j| j.name.clone())
                .collect();
            self.sort_candidates(server, &mut job_names);

            for job_name in job_names {
                if cycle_start.elapsed() > budget {
                    tracing::warn!("sched_cycle_len exceeded mid-queue, ending cycle early");
                    outcome.ended_early = true;
                    break 'queues;
                }

                let key = self.equiv_key_for(server, &job_name);
                if let Some(reason) = key.as_ref().and_then(|k| server.equiv_classes.short_circuit(k)) {
                    tracing::debug!(job = %job_name, reason, "short-circuited via equivalence class");
                    continue;
                }

                let Some(job) = server.jobs.get(&job_name) else { continue };
                let queue = server.queues.get(&queue_name);
                let verdict = is_ok_to_run(server, queue, ResResvView::Job(job), FitFlags::empty());

                match verdict {
                    RunOutcome::CanRun(alloc) => {
                        let candidate_end = server.now + ResResvView::Job(job).duration();
                        if crate::topjob::backfill_is_safe(&backfill, candidate_end, &alloc) {
                            self.commit_run(server, &job_name, alloc).await?;
                            outcome.jobs_run.push(job_name);
                        } else {
                            tracing::debug!(job = %job_name, "fits now but would push a top job's start later, deferring");
                        }
                    }
                    RunOutcome::CannotRun(reasons) => {
                        let member_independent = reasons.iter().all(|r| {
                            matches!(
                                r.kind,
                                crate::fit::ErrorKind::InsufficientServerResource
                                    | crate::fit::ErrorKind::InsufficientQueueResource
                                    | crate::fit::ErrorKind::DedicatedTime
                                    | crate::fit::ErrorKind::NoFreeNodes
                            )
                        });
                        if let Some(k) = &key {
                            let reason_label = reasons.first().map(|r| format!("{:?}", r.kind));
                            server.equiv_classes.record_outcome(k, reason_label, member_independent);
                        }

                        // Look a full day of cycles ahead for a backfill slot; a
                        // job that does not fit even that far out stays an
                        // ordinary queued candidate rather than a top job.
                        let horizon = server.now + 24 * 60 * 60;
                        let formula_value = self.formula_value(server, &job_name);
                        if try_mark_top_job(server, &mut backfill, &job_name, horizon, formula_value).is_some() {
                            outcome.jobs_held_as_top.push(job_name);
                            continue;
                        }

                        if self.should_attempt_preempt(server, &job_name) {
                            let qprio = queue.map_or(0, |q| q.priority);
                            let h_level = self.preempt_level(server, &job_name, qprio);
                            match plan_preemption(server, &queue_name, &job_name, h_level, &planner_cfg) {
                                PreemptPlan::Feasible(victims) if !victims.is_empty() => {
                                    for v in &victims {
                                        self.commit_preempt(server, v).await?;
                                        outcome.jobs_preempted.push(v.job_name.clone());
                                    }
                                    let Some(job) = server.jobs.get(&job_name) else { continue };
                                    if let RunOutcome::CanRun(alloc) =
                                        is_ok_to_run(server, server.queues.get(&queue_name), ResResvView::Job(job), FitFlags::empty())
                                    {
                                        let candidate_end = server.now + ResResvView::Job(job).duration();
                                        if crate::topjob::backfill_is_safe(&backfill, candidate_end, &alloc) {
                                            self.commit_run(server, &job_name, alloc).await?;
                                            outcome.jobs_run.push(job_name);
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
        }

        // 6. Flush asynchronous job-attribute updates: accrue type first
        // (it depends on final per-job state this cycle), then push
        // comment/estimated-start/accrue-type out to the server for every
        // job whose state or estimate could have moved.
        self.accrue(server);
        let mut touched: Vec<String> = server
            .jobs
            .values()
            .filter(|j| j.is_queued() || j.is_running() || j.is_suspended())
            .map(|j| j.name.clone())
            .collect();
        touched.sort();
        touched.dedup();
        self.flush_attribute_updates(server, &touched).await?;

        outcome.cycle_duration = cycle_start.elapsed();
        let state_count = crate::state_count::StateCount::count(server.jobs.values());
        tracing::info!(
            run = outcome.jobs_run.len(),
            top = outcome.jobs_held_as_top.len(),
            preempted = outcome.jobs_preempted.len(),
            duration_ms = outcome.cycle_duration.as_millis() as u64,
            queued = state_count.queued,
            running = state_count.running,
            suspended = state_count.suspended,
            held = state_count.held,
            "sched_cycle complete"
        );
        Ok(outcome)
    }

    /// §6.3: refresh every configured `server_dyn_res` script into
    /// `server.resources_available`. A no-op when no runner is attached or
    /// no scripts are configured, so sites that don't use dynamic
    /// resources pay nothing for this step.
    async fn refresh_dynamic_resources(&self, server: &mut Server) {
        let Some(runner) = self.dyn_res_runner else { return };
        if self.config.server_dyn_res.is_empty() {
            return;
        }
        let alarm = Duration::from_secs(self.config.server_dyn_res_alarm);
        let resolved = crate::connector::refresh_dynamic_resources(
            runner,
            &self.config.server_dyn_res,
            alarm,
            &server.resource_defs,
        )
        .await;
        for (name, value) in resolved {
            server.resources_available.entry(name).or_default().avail = Some(value);
        }
    }

    /// §11 "accrue_type": recompute each job's eligibility classification
    /// for this cycle's end-of-cycle flush, grounded in `job_info.c`'s
    /// eligible-time accounting — running jobs accrue running time, held
    /// or non-queued jobs accrue nothing, and an ordinary queued job
    /// accrues eligible time once it clears the queue/dedicated-time gates
    /// `is_ok_to_run` checks first (state/admissibility, §4.H.1).
    fn accrue(&self, server: &mut Server) {
        use crate::entities::job::AccrueType;
        let names: Vec<String> = server.jobs.keys().cloned().collect();
        for name in names {
            let Some(job) = server.jobs.get(&name) else { continue };
            let accrue = if job.is_running() || job.is_suspended() {
                AccrueType::Running
            } else if job.is_queued() {
                let queue = server.queues.get(&job.queue);
                let gate = is_ok_to_run(server, queue, ResResvView::Job(job), FitFlags::RETURN_ALL_ERR);
                let gated_out = gate.first_reason().map_or(false, |r| r.unrecoverable_by_preemption());
                if gated_out {
                    AccrueType::Ineligible
                } else {
                    AccrueType::Eligible
                }
            } else {
                AccrueType::Ineligible
            };
            if let Some(job) = server.jobs.get_mut(&name) {
                job.accrue_type = accrue;
            }
        }
    }

    /// §4.L step 6: push `comment`/`estimated.start_time`/`accrue_type`
    /// out for each touched job via `async_alter_job`.
    async fn flush_attribute_updates(&self, server: &Server, touched: &[String]) -> ScheduleResult<()> {
        for name in touched {
            let Some(job) = server.jobs.get(name) else { continue };
            let mut attrs = vec![BatchAttrib {
                name: "accrue_type".to_string(),
                resource: None,
                value: format!("{:?}", job.accrue_type),
                op: AttribOp::Set,
            }];
            if let Some(start) = job.estimated_start {
                attrs.push(BatchAttrib {
                    name: "estimated.start_time".to_string(),
                    resource: None,
                    value: start.to_string(),
                    op: AttribOp::Set,
                });
            }
            if let Some(comment) = &job.comment {
                attrs.push(BatchAttrib {
                    name: "comment".to_string(),
                    resource: None,
                    value: comment.clone(),
                    op: AttribOp::Set,
                });
            }
            self.connector.async_alter_job(name, &attrs).await?;
        }
        Ok(())
    }

    fn build_equivalence_classes(&self, server: &mut Server) {
        server.equiv_classes = crate::equiv::EquivClasses::new();
        let job_names: Vec<String> = server.jobs.values().filter(|j| j.is_queued()).map(|j| j.name.clone()).collect();
        for name in job_names {
            if let Some(key) = self.equiv_key_for(server, &name) {
                server.equiv_classes.insert(key, name);
            }
        }
    }

    fn equiv_key_for(&self, server: &Server, job_name: &str) -> Option<EquivKey> {
        let job = server.jobs.get(job_name)?;
        let mut filtered: Vec<(String, String)> = job
            .resreq
            .iter()
            .filter(|(k, _)| self.config.resources_to_check.iter().any(|r| r == *k))
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        filtered.sort();
        let filtered_resreq = filtered.into_iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(";");
        Some(EquivKey {
            queue: Some(job.queue.clone()),
            user: Some(job.user.clone()),
            group: job.group.clone(),
            project: job.project.clone(),
            partition: job.partition.clone(),
            select_signature: unparse_select(&job.select),
            place_signature: unparse_place(&job.place),
            filtered_resreq,
        })
    }

    fn sort_candidates(&self, server: &Server, job_names: &mut [String]) {
        let ctx_for = |name: &str| -> FormulaContext {
            let qprio = server
                .jobs
                .get(name)
                .and_then(|j| server.queues.get(&j.queue))
                .map_or(0, |q| q.priority) as f64;
            let (perc, factor) = server
                .jobs
                .get(name)
                .and_then(|j| j.fairshare_entity.as_deref())
                .and_then(|e| self.fairshare.as_ref().map(|t| (t.fairshare_perc(e).unwrap_or(0.0), t.fairshare_factor(e).unwrap_or(0.0))))
                .unwrap_or((0.0, 0.0));
            FormulaContext { queue_priority: qprio, fairshare_perc: perc, fairshare_factor: factor }
        };

        if let Some(formula_src) = self.config.job_sort_formula.as_ref() {
            job_names.sort_by(|a, b| {
                let (Some(ja), Some(jb)) = (server.jobs.get(a), server.jobs.get(b)) else { return std::cmp::Ordering::Equal };
                let va = formula::evaluate(formula_src, ja, &ctx_for(a)).unwrap_or(f64::NEG_INFINITY);
                let vb = formula::evaluate(formula_src, jb, &ctx_for(b)).unwrap_or(f64::NEG_INFINITY);
                vb.partial_cmp(&va).unwrap_or(std::cmp::Ordering::Equal)
            });
        } else {
            job_names.sort_by_key(|name| {
                server.jobs.get(name).map(|j| formula::sort_key(j, &ctx_for(name))).unwrap_or_default()
            });
        }
    }

    fn formula_value(&self, server: &Server, job_name: &str) -> Option<f64> {
        let job = server.jobs.get(job_name)?;
        let ctx = FormulaContext::default();
        self.config.job_sort_formula.as_ref().and_then(|f| formula::evaluate(f, job, &ctx).ok())
    }

    fn should_attempt_preempt(&self, server: &Server, job_name: &str) -> bool {
        server
            .jobs
            .get(job_name)
            .map_or(false, |j| !j.preempt_status.is_empty() && j.preempt_status != PreemptStatus::NORMAL)
    }

    fn preempt_level(&self, server: &Server, job_name: &str, queue_priority: i32) -> i32 {
        let Some(job) = server.jobs.get(job_name) else { return 0 };
        let express = job.preempt_status.contains(PreemptStatus::EXPRESS_QUEUE);
        self.config.preempt_prio.priority_for(job.preempt_status, if express { queue_priority } else { 0 })
    }

    async fn commit_run(&self, server: &mut Server, job_name: &str, alloc: Vec<crate::entities::resresv::NodeAllocation>) -> ScheduleResult<()> {
        for a in &alloc {
            if let Some(node) = server.nodes.get_mut(&a.node_rank) {
                node.update_on_run(job_name, &a.request);
            }
        }
        let exec_vnode = alloc
            .iter()
            .map(|a| format!("({}:{})", a.node_name, render_request(&a.request)))
            .collect::<Vec<_>>()
            .join("+");

        if let Some(job) = server.jobs.get_mut(job_name) {
            job.state = JobState::Running;
            job.stime = Some(server.now);
            job.execselect = Some(alloc);
            let entity = Entity::User(job.user.clone());
            server.limits.record_run(&entity, "", 1.0);
            server.calendar.add_event(crate::calendar::CalendarEvent::new(
                server.now + job.duration,
                crate::calendar::EventKind::End,
                job_name,
                job.rank,
            ));
        }

        self.connector.run_job(job_name, &exec_vnode, false).await
    }

    async fn commit_preempt(&self, server: &mut Server, victim: &crate::preempt::planner::Victim) -> ScheduleResult<()> {
        let Some(job) = server.jobs.get(&victim.job_name).cloned() else { return Ok(()) };
        if let Some(alloc) = &job.execselect {
            for a in alloc {
                if let Some(node) = server.nodes.get_mut(&a.node_rank) {
                    node.update_on_end(&victim.job_name, &a.request);
                }
            }
        }
        let entity = Entity::User(job.user.clone());
        server.limits.record_end(&entity, "", 1.0);
        if let Some(j) = server.jobs.get_mut(&victim.job_name) {
            j.state = match victim.method {
                crate::preempt::PreemptMethod::Suspend => JobState::SuspendedByScheduler,
                crate::preempt::PreemptMethod::Checkpoint | crate::preempt::PreemptMethod::Requeue => JobState::Queued,
                crate::preempt::PreemptMethod::Delete => JobState::Exiting,
            };
            j.flags.preempted = true;
        }
        let attrib = BatchAttrib {
            name: "sched_preempted".to_string(),
            resource: None,
            value: victim.method.wire_code().to_string(),
            op: AttribOp::Set,
        };
        self.connector.alter_job(&victim.job_name, std::slice::from_ref(&attrib)).await
    }
}

fn render_request(req: &std::collections::HashMap<String, crate::resource::ResourceValue>) -> String {
    let mut parts: Vec<String> = req.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.sort();
    parts.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{BatchStatus, DynResOutcome, JobSelection, PreemptReply};
    use crate::entities::job::Job;
    use crate::entities::queue::{Queue, QueueKind};
    use crate::request::{parse_place, parse_select};
    use async_trait::async_trait;

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

    #[tokio::test]
    async fn cycle_runs_a_fitting_job_and_marks_it_running() {
        let mut server = Server::new_test();
        server.add_simple_node(1, "n1", 4, 8 * 1024 * 1024 * 1024);
        server.queues.insert("workq".into(), Queue::new("workq", 100, QueueKind::Execution));

        let mut job = Job::new("1.host", 1, "workq");
        job.select = parse_select("1:ncpus=2").unwrap();
        job.place = parse_place("free").unwrap();
        job.resreq = crate::request::resolve_chunk_requests(&job.select.chunks[0], &server.resource_defs);
        job.duration = 500;
        server.jobs.insert(job.name.clone(), job);

        let connector = NullConnector;
        let config = Arc::new(SchedConfig::default());
        let orchestrator = CycleOrchestrator::new(&connector, config, None);
        let outcome = orchestrator.run_cycle(&mut server).await.unwrap();

        assert_eq!(outcome.jobs_run, vec!["1.host".to_string()]);
        assert!(server.jobs["1.host"].is_running());
    }

    #[tokio::test]
    async fn cycle_holds_job_as_top_when_it_cannot_run_now() {
        let mut server = Server::new_test();
        server.add_simple_node(1, "n1", 4, 8 * 1024 * 1024 * 1024);
        server.queues.insert("workq".into(), Queue::new("workq", 100, QueueKind::Execution));

        let mut running = Job::new("1.host", 1, "workq");
        running.state = JobState::Running;
        running.stime = Some(server.now);
        running.duration = 1000;
        let mut req = std::collections::HashMap::new();
        req.insert("ncpus".to_string(), crate::resource::ResourceValue::Long(4));
        running.resreq = req.clone();
        running.execselect = Some(vec![crate::entities::resresv::NodeAllocation {
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
        server.calendar.add_event(crate::calendar::CalendarEvent::new(
            server.now + 1000,
            crate::calendar::EventKind::End,
            "1.host",
            1,
        ));

        let mut waiting = Job::new("2.host", 2, "workq");
        waiting.select = parse_select("1:ncpus=4").unwrap();
        waiting.place = parse_place("free").unwrap();
        waiting.resreq = crate::request::resolve_chunk_requests(&waiting.select.chunks[0], &server.resource_defs);
        server.jobs.insert(waiting.name.clone(), waiting);

        let connector = NullConnector;
        let config = Arc::new(SchedConfig::default());
        let orchestrator = CycleOrchestrator::new(&connector, config, None);
        let outcome = orchestrator.run_cycle(&mut server).await.unwrap();

        assert!(outcome.jobs_held_as_top.contains(&"2.host".to_string()));
    }
}
