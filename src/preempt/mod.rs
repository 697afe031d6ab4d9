//! Preemption planner (component J, §4.J, P4, P5).

pub mod planner;

use std::collections::HashMap;

bitflags::bitflags! {
    /// Categories a job's preempt level is derived from (§4.J).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PreemptStatus: u32 {
        const QRUN_TARGET              = 1 << 0;
        const EXPRESS_QUEUE            = 1 << 1;
        const FAIRSHARE_OVER           = 1 << 2;
        const STARVING                 = 1 << 3;
        const SOFT_LIMIT_SERVER_USER   = 1 << 4;
        const SOFT_LIMIT_QUEUE_USER    = 1 << 5;
        const SOFT_LIMIT_SERVER_GROUP  = 1 << 6;
        const SOFT_LIMIT_QUEUE_GROUP   = 1 << 7;
        const SOFT_LIMIT_SERVER_PROJECT = 1 << 8;
        const SOFT_LIMIT_QUEUE_PROJECT = 1 << 9;
        const SOFT_LIMIT_SERVER_ALL    = 1 << 10;
        const SOFT_LIMIT_QUEUE_ALL     = 1 << 11;
        const NORMAL                   = 1 << 12;
    }
}

/// Site-provided table: bitmask -> numeric priority. Express-queue
/// additions inherit the queue's own priority (added to the base) so
/// multiple express queues remain distinguishable from one another
/// (§4.J).
#[derive(Debug, Clone, Default)]
pub struct PreemptPrioTable {
    rows: Vec<(PreemptStatus, i32)>,
}

impl PreemptPrioTable {
    pub fn with_row(mut self, mask: PreemptStatus, prio: i32) -> Self {
        self.rows.push((mask, prio));
        self
    }

    /// Highest-priority matching row wins; `express_queue_priority` is
    /// added when [`PreemptStatus::EXPRESS_QUEUE`] is set, so two express
    /// queues of different priority still sort apart.
    pub fn priority_for(&self, status: PreemptStatus, express_queue_priority: i32) -> i32 {
        let mut best = 0;
        for (mask, prio) in &self.rows {
            if status.contains(*mask) && *prio > best {
                best = *prio;
            }
        }
        if status.contains(PreemptStatus::EXPRESS_QUEUE) {
            best += express_queue_priority;
        }
        best
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptMethod {
    Suspend,
    Checkpoint,
    Requeue,
    Delete,
}

impl PreemptMethod {
    pub fn wire_code(self) -> char {
        match self {
            PreemptMethod::Suspend => 'S',
            PreemptMethod::Checkpoint => 'C',
            PreemptMethod::Requeue => 'Q',
            PreemptMethod::Delete => 'D',
        }
    }

    pub fn from_wire_code(c: char) -> Option<Self> {
        match c {
            'S' => Some(PreemptMethod::Suspend),
            'C' => Some(PreemptMethod::Checkpoint),
            'Q' => Some(PreemptMethod::Requeue),
            'D' => Some(PreemptMethod::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ElapsedBucket {
    /// Percentage-of-elapsed-time buckets the site table is keyed by
    /// (walltime, soft-walltime, or cput — whichever the site configures).
    Pct(u8),
}

/// `preempt_order`: percentage-of-elapsed-time -> ordered method sequence
/// to attempt, filtered down to what the target job can actually tolerate
/// (§4.J).
#[derive(Debug, Clone, Default)]
pub struct PreemptOrderTable {
    rows: Vec<(u8, Vec<PreemptMethod>)>,
}

impl PreemptOrderTable {
    pub fn with_row(mut self, pct_floor: u8, methods: Vec<PreemptMethod>) -> Self {
        self.rows.push((pct_floor, methods));
        self
    }

    /// Pick the row whose `pct_floor` is the largest one <= `elapsed_pct`.
    pub fn order_for(&self, elapsed_pct: u8) -> Vec<PreemptMethod> {
        self.rows
            .iter()
            .filter(|(floor, _)| *floor <= elapsed_pct)
            .max_by_key(|(floor, _)| *floor)
            .map(|(_, methods)| methods.clone())
            .unwrap_or_default()
    }
}

/// Capability flags a candidate job's tolerances are checked against
/// before a method is attempted (§4.J).
#[derive(Debug, Clone, Copy, Default)]
pub struct PreemptCapabilities {
    pub checkpoint: bool,
    pub requeue: bool,
    pub suspend: bool,
}

/// Filter a method sequence down to what the job can actually tolerate,
/// preserving order.
pub fn filter_tolerable(order: &[PreemptMethod], caps: PreemptCapabilities) -> Vec<PreemptMethod> {
    order
        .iter()
        .copied()
        .filter(|m| match m {
            PreemptMethod::Suspend => caps.suspend,
            PreemptMethod::Checkpoint => caps.checkpoint,
            PreemptMethod::Requeue => caps.requeue,
            PreemptMethod::Delete => true,
        })
        .collect()
}

/// Running counts by preempt level (§3.7: "preemption counts by level").
#[derive(Debug, Clone, Default)]
pub struct PreemptCounts {
    pub by_level: HashMap<i32, u32>,
}

impl PreemptCounts {
    pub fn record(&mut self, level: i32) {
        *self.by_level.entry(level).or_insert(0) += 1;
    }

    pub fn total(&self) -> u32 {
        self.by_level.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn express_queue_adds_queue_priority_to_base_row() {
        let table = PreemptPrioTable::default().with_row(PreemptStatus::EXPRESS_QUEUE, 100);
        let prio = table.priority_for(PreemptStatus::EXPRESS_QUEUE, 5);
        assert_eq!(prio, 105);
    }

    #[test]
    fn highest_matching_row_wins() {
        let table = PreemptPrioTable::default()
            .with_row(PreemptStatus::STARVING, 50)
            .with_row(PreemptStatus::FAIRSHARE_OVER, 80);
        let status = PreemptStatus::STARVING | PreemptStatus::FAIRSHARE_OVER;
        assert_eq!(table.priority_for(status, 0), 80);
    }

    #[test]
    fn order_table_picks_highest_floor_leq_elapsed() {
        let table = PreemptOrderTable::default()
            .with_row(0, vec![PreemptMethod::Suspend])
            .with_row(50, vec![PreemptMethod::Checkpoint, PreemptMethod::Delete]);
        assert_eq!(table.order_for(10), vec![PreemptMethod::Suspend]);
        assert_eq!(table.order_for(75), vec![PreemptMethod::Checkpoint, PreemptMethod::Delete]);
    }

    #[test]
    fn filter_tolerable_drops_unsupported_methods() {
        let order = vec![PreemptMethod::Checkpoint, PreemptMethod::Suspend, PreemptMethod::Delete];
        let caps = PreemptCapabilities { checkpoint: false, requeue: false, suspend: true };
        assert_eq!(filter_tolerable(&order, caps), vec![PreemptMethod::Suspend, PreemptMethod::Delete]);
    }
}
