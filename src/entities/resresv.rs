//! Shared request-side shape for jobs and reservations (§9).
//!
//! Jobs and reservations share the request side (`select`, `place`,
//! `resreq`, `duration`, `nspec` allocation) but diverge in lifecycle.
//! Rather than inheritance, the discriminated [`ResResv`] record carries a
//! `kind` tag and the evaluator (component H) only ever reads through the
//! small [`ResResvView`] trait — it never needs to know which variant it
//! has.

use crate::entities::job::Job;
use crate::entities::reservation::Reservation;
use crate::request::{PlaceSpec, SelectSpec};
use crate::resource::ResourceValue;
use std::collections::HashMap;

/// One node's share of a job/reservation's allocation (`nspec`).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAllocation {
    pub node_rank: u32,
    pub node_name: String,
    pub chunk_index: usize,
    pub request: HashMap<String, ResourceValue>,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResResvKind {
    Job,
    Resv,
}

#[derive(Debug, Clone)]
pub struct ResResv {
    pub kind: ResResvKind,
    pub job: Option<Job>,
    pub resv: Option<Reservation>,
}

impl ResResv {
    pub fn from_job(job: Job) -> Self {
        Self {
            kind: ResResvKind::Job,
            job: Some(job),
            resv: None,
        }
    }

    pub fn from_resv(resv: Reservation) -> Self {
        Self {
            kind: ResResvKind::Resv,
            job: None,
            resv: Some(resv),
        }
    }

    pub fn view(&self) -> ResResvView<'_> {
        match self.kind {
            ResResvKind::Job => ResResvView::Job(self.job.as_ref().expect("job-kind resresv missing job data")),
            ResResvKind::Resv => ResResvView::Resv(self.resv.as_ref().expect("resv-kind resresv missing resv data")),
        }
    }
}

/// The read-only capability set the fit evaluator needs:
/// `{select, place, resreq, duration, nspec_alloc}` (§9), abstracted
/// behind an enum-dispatch view rather than a trait object so there is no
/// vtable indirection on the evaluator's hot path.
pub enum ResResvView<'a> {
    Job(&'a Job),
    Resv(&'a Reservation),
}

impl<'a> ResResvView<'a> {
    pub fn name(&self) -> &str {
        match self {
            ResResvView::Job(j) => &j.name,
            ResResvView::Resv(r) => &r.name,
        }
    }

    pub fn select(&self) -> &SelectSpec {
        match self {
            ResResvView::Job(j) => &j.select,
            ResResvView::Resv(r) => &r.select,
        }
    }

    pub fn place(&self) -> &PlaceSpec {
        match self {
            ResResvView::Job(j) => &j.place,
            ResResvView::Resv(r) => &r.place,
        }
    }

    pub fn resreq(&self) -> &HashMap<String, ResourceValue> {
        match self {
            ResResvView::Job(j) => &j.resreq,
            ResResvView::Resv(r) => &r.resreq,
        }
    }

    pub fn duration(&self) -> i64 {
        match self {
            ResResvView::Job(j) => j.duration,
            ResResvView::Resv(r) => r.end - r.start,
        }
    }

    pub fn nspec_alloc(&self) -> Option<&Vec<NodeAllocation>> {
        match self {
            ResResvView::Job(j) => j.execselect.as_ref(),
            ResResvView::Resv(r) => Some(&r.nspec),
        }
    }

    pub fn is_job(&self) -> bool {
        matches!(self, ResResvView::Job(_))
    }

    pub fn queue_name(&self) -> &str {
        match self {
            ResResvView::Job(j) => &j.queue,
            ResResvView::Resv(r) => &r.queue,
        }
    }
}
