//! Job entity (`resource_resv` with `is_job`, §3.4).

use crate::entities::resresv::NodeAllocation;
use crate::preempt::PreemptStatus;
use crate::request::{PlaceSpec, SelectSpec};
use crate::resource::ResourceValue;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    SuspendedByScheduler,
    Held,
    Exiting,
    Expired,
}

/// Orthogonal to [`JobState`]: a job can be queued *and* provisioning,
/// running *and* checkpointed-in-flight, etc. (§11: substate tracking
/// beyond the coarse state enum, grounded in `job_info.c`'s `substate`.)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags {
    pub provisioning: bool,
    pub preempted: bool,
    pub starving: bool,
    pub array_parent: bool,
    pub subjob: bool,
    pub checkpointed: bool,
}

/// A numeric substate, orthogonal to [`JobState`] (§11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSubstate {
    None,
    ProvisioningWait,
    ProvisioningComplete,
    Staging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccrueType {
    Ineligible,
    Eligible,
    Running,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub rank: u64,
    pub queue: String,
    pub user: String,
    pub group: Option<String>,
    pub project: Option<String>,
    pub partition: Option<String>,

    pub select: SelectSpec,
    pub place: PlaceSpec,
    pub resreq: HashMap<String, ResourceValue>,
    /// The allocation the job is currently running/suspended on, used to
    /// rebind it without re-evaluating fit (§3.4).
    pub execselect: Option<Vec<NodeAllocation>>,

    pub state: JobState,
    pub flags: JobFlags,
    pub substate: JobSubstate,
    pub accrue_type: AccrueType,

    pub qtime: i64,
    pub etime: i64,
    pub eligible_time: i64,
    pub stime: Option<i64>,
    pub duration: i64,
    pub hard_duration: i64,
    /// Shrink-to-fit bound: the scheduler may shorten `duration` down to
    /// this floor to fit a gap, never below it.
    pub min_duration: Option<i64>,
    pub end: Option<i64>,

    pub preempt_status: PreemptStatus,
    pub preempt: i32,

    pub fairshare_entity: Option<String>,
    pub array_parent: Option<String>,
    pub runone_group: Option<String>,

    /// §9/§11: subjob accounting updated only at materialization/end.
    pub running_subjobs: u32,
    pub max_run_subjobs: Option<u32>,

    /// §4.L step 6: the committed start time from a top-job promise,
    /// flushed to the server as `estimated.start_time`.
    pub estimated_start: Option<i64>,
    /// Operator-facing comment flushed alongside `estimated.start_time`.
    pub comment: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, rank: u64, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rank,
            queue: queue.into(),
            user: String::new(),
            group: None,
            project: None,
            partition: None,
            select: SelectSpec::default(),
            place: PlaceSpec::default(),
            resreq: HashMap::new(),
            execselect: None,
            state: JobState::Queued,
            flags: JobFlags::default(),
            substate: JobSubstate::None,
            accrue_type: AccrueType::Ineligible,
            qtime: 0,
            etime: 0,
            eligible_time: 0,
            stime: None,
            duration: 0,
            hard_duration: 0,
            min_duration: None,
            end: None,
            preempt_status: PreemptStatus::empty(),
            preempt: 0,
            fairshare_entity: None,
            array_parent: None,
            runone_group: None,
            running_subjobs: 0,
            max_run_subjobs: None,
            estimated_start: None,
            comment: None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, JobState::Running)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.state, JobState::SuspendedByScheduler)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.state, JobState::Queued)
    }

    pub fn is_multinode(&self) -> bool {
        self.select.total_chunks() > 1 && matches!(self.place.arrangement, crate::request::Arrangement::Scatter)
    }

    /// Tolerances used by the preemption planner's method ordering (§4.J).
    pub fn capable_of_checkpoint(&self) -> bool {
        !self.flags.checkpointed && self.resreq.contains_key("ckpt_ok")
    }

    pub fn capable_of_requeue(&self) -> bool {
        !self.flags.array_parent
    }

    pub fn capable_of_suspend(&self) -> bool {
        true
    }

    pub fn dup(&self) -> Self {
        self.clone()
    }
}
