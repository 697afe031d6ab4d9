//! Node-bucket index (component F, §3.10, §4.F).
//!
//! Nodes sharing an identical non-consumable signature, queue association
//! and job-exclusivity state are slotted into one bucket at cycle start
//! (and after any mutation that could change a node's signature or
//! exclusivity). Buckets accelerate "simple" chunk fit: instead of
//! scanning every node, the evaluator scans buckets and flips bits from
//! `free` to `busy` to reserve `N` nodes atomically.

use crate::entities::node::{Node, NodeState};
use crate::resource::{build_signature, ResourceDef, ResourceValue};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Bitmap over node-index space, backed by a sorted set rather than a
/// packed bitvec — at scheduler-partition scale (thousands, not billions,
/// of nodes) the allocation churn of a real bitvec buys nothing `BTreeSet`
/// doesn't already give for free (§3.10: "bitmaps over node-index space").
pub type IndexBitmap = BTreeSet<usize>;

#[derive(Debug, Clone)]
pub struct NodeBucket {
    pub signature: String,
    pub queue: Option<String>,
    pub job_exclusive: bool,
    /// Representative node rank, used to read aggregate resource defs.
    pub representative: u32,
    /// Index space is the position within `all_ranks`, not the node rank
    /// itself, so bitmaps stay dense regardless of rank sparsity.
    pub all_ranks: Vec<u32>,
    pub free: IndexBitmap,
    pub busy: IndexBitmap,
    /// Aggregated consumable pool across every node in the bucket,
    /// refreshed whenever membership or assignment changes.
    pub pool: HashMap<String, ResourceValue>,
}

impl NodeBucket {
    /// I-B1: `free ∪ busy == all`, `free ∩ busy == ∅`.
    pub fn invariant_holds(&self) -> bool {
        let union: BTreeSet<usize> = self.free.union(&self.busy).copied().collect();
        let intersect_empty = self.free.intersection(&self.busy).next().is_none();
        union.len() == self.all_ranks.len() && intersect_empty
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Rebuild `pool` by summing the consumable resources of every
    /// currently-free node in the bucket.
    pub fn refresh_pool(&mut self, nodes: &HashMap<u32, &Node>) {
        self.pool.clear();
        for idx in self.free.iter() {
            let rank = self.all_ranks[idx];
            let Some(node) = nodes.get(&rank) else { continue };
            for (name, container) in &node.res {
                if let crate::resource::NodeResourceSlot::Direct(aa) = &container.slot {
                    if let Some(avail) = aa.residual(&container.def) {
                        let entry = self.pool.entry(name.clone()).or_insert_with(|| match avail {
                            ResourceValue::Long(_) => ResourceValue::Long(0),
                            ResourceValue::Size(_) => ResourceValue::Size(0),
                            ResourceValue::Duration(_) => ResourceValue::Duration(0),
                            ResourceValue::Float(_) => ResourceValue::Float(0.0),
                            other => other.clone(),
                        });
                        if let Some(sum) = entry.add(&avail) {
                            *entry = sum;
                        }
                    }
                }
            }
        }
    }

    /// Does the pool admit `n` copies of `req`?
    pub fn admits(&self, req: &HashMap<String, ResourceValue>, n: u32) -> bool {
        for (name, amount) in req {
            let Some(have) = self.pool.get(name) else { continue };
            let (Some(h), Some(a)) = (have.as_f64(), amount.as_f64()) else { continue };
            if h < a * n as f64 {
                return false;
            }
        }
        true
    }

    /// Atomically reserve `n` free nodes by flipping bits to `busy`.
    /// Returns the node ranks reserved, or `None` if fewer than `n` are
    /// free (no partial reservation happens on failure).
    pub fn reserve(&mut self, n: u32) -> Option<Vec<u32>> {
        if self.free.len() < n as usize {
            return None;
        }
        let chosen: Vec<usize> = self.free.iter().take(n as usize).copied().collect();
        for idx in &chosen {
            self.free.remove(idx);
            self.busy.insert(*idx);
        }
        Some(chosen.into_iter().map(|idx| self.all_ranks[idx]).collect())
    }

    pub fn release(&mut self, rank: u32) {
        if let Some(idx) = self.all_ranks.iter().position(|r| *r == rank) {
            self.busy.remove(&idx);
            self.free.insert(idx);
        }
    }
}

/// Build the bucket index from the current node set (§4.F). Buckets are
/// keyed by (signature, queue, excl-state); the signature is the
/// non-consumable portion only (consumables live in `pool`, not the key).
pub fn build_buckets(
    nodes: &[&Node],
    defs: &HashMap<String, Arc<ResourceDef>>,
) -> Vec<NodeBucket> {
    let mut groups: HashMap<(String, Option<String>, bool), Vec<&Node>> = HashMap::new();
    for node in nodes {
        let non_consumable_values: Vec<_> = node
            .res
            .iter()
            .filter_map(|(name, container)| {
                let def = defs.get(name)?;
                if def.flags.consumable {
                    return None;
                }
                match &container.slot {
                    crate::resource::NodeResourceSlot::Direct(aa) => {
                        aa.avail.as_ref().map(|v| (&container.def, v.clone()))
                    }
                    _ => None,
                }
            })
            .collect();
        let owned: Vec<(&Arc<ResourceDef>, ResourceValue)> = non_consumable_values;
        let sig = build_signature(owned.iter().map(|(d, v)| (*d, v)));
        let job_excl = node.state.contains(NodeState::JOB_EXCLUSIVE);
        groups.entry((sig, node.queue.clone(), job_excl)).or_default().push(node);
    }

    let mut buckets: Vec<NodeBucket> = groups
        .into_iter()
        .map(|((signature, queue, job_exclusive), members)| {
            let all_ranks: Vec<u32> = members.iter().map(|n| n.rank).collect();
            let mut free: IndexBitmap = BTreeSet::new();
            let mut busy: IndexBitmap = BTreeSet::new();
            for (idx, node) in members.iter().enumerate() {
                if node.state.contains(NodeState::FREE) && node.is_usable() {
                    free.insert(idx);
                } else {
                    busy.insert(idx);
                }
            }
            let representative = all_ranks.first().copied().unwrap_or(0);
            let mut bucket = NodeBucket {
                signature,
                queue,
                job_exclusive,
                representative,
                all_ranks,
                free,
                busy,
                pool: HashMap::new(),
            };
            let by_rank: HashMap<u32, &Node> = members.iter().map(|n| (n.rank, *n)).collect();
            bucket.refresh_pool(&by_rank);
            bucket
        })
        .collect();

    // Priority ordering: most free capacity first, so the evaluator
    // consumes buckets in the order policy would consume nodes (§4.F).
    buckets.sort_by(|a, b| b.free_count().cmp(&a.free_count()));
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::def::{ResourceFlags, ResourceKind};
    use crate::resource::value::{AvailAssigned, NodeResourceSlot, ResourceContainer};

    fn node(rank: u32, ncpus: i64, free: bool) -> Node {
        let mut n = Node::new(rank, format!("n{rank}"));
        if !free {
            n.state.remove(NodeState::FREE);
            n.state.insert(NodeState::JOB_BUSY);
        }
        let def = ResourceDef::new("ncpus", ResourceKind::Long, ResourceFlags::default());
        n.res.insert(
            "ncpus".into(),
            ResourceContainer {
                def,
                slot: NodeResourceSlot::Direct(AvailAssigned::with_avail(ResourceValue::Long(ncpus))),
            },
        );
        n
    }

    #[test]
    fn identical_nodes_share_one_bucket() {
        let n1 = node(1, 4, true);
        let n2 = node(2, 4, true);
        let defs: HashMap<String, Arc<ResourceDef>> =
            [("ncpus".to_string(), ResourceDef::new("ncpus", ResourceKind::Long, ResourceFlags::default()))]
                .into_iter()
                .collect();
        let buckets = build_buckets(&[&n1, &n2], &defs);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].free_count(), 2);
        assert!(buckets[0].invariant_holds());
    }

    #[test]
    fn reserve_flips_free_to_busy_and_admits_checks_pool() {
        let n1 = node(1, 4, true);
        let n2 = node(2, 4, true);
        let defs: HashMap<String, Arc<ResourceDef>> =
            [("ncpus".to_string(), ResourceDef::new("ncpus", ResourceKind::Long, ResourceFlags::default()))]
                .into_iter()
                .collect();
        let mut buckets = build_buckets(&[&n1, &n2], &defs);
        let req: HashMap<String, ResourceValue> = [("ncpus".to_string(), ResourceValue::Long(4))].into_iter().collect();
        assert!(buckets[0].admits(&req, 2));
        let reserved = buckets[0].reserve(1).unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(buckets[0].free_count(), 1);
        assert!(buckets[0].invariant_holds());
    }
}
