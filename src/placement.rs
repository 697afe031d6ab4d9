//! Placement-set engine (component E, §3.9, §4.E).
//!
//! A placement set groups nodes sharing a grouping-key value (e.g. a
//! `host`, `switch`, or `rack` resource) and caches the set's aggregate
//! capacity so the fit evaluator can pick the smallest fitting set
//! without re-summing nodes on every candidate job.

use crate::entities::node::Node;
use crate::resource::{AvailAssigned, ResourceDef, ResourceValue};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PlacementSet {
    /// The grouping key's value identifying this set (e.g. `switch=sw0`).
    pub key_value: String,
    pub node_ranks: Vec<u32>,
    /// Cached aggregate: consumables summed, non-consumables unioned.
    pub res: HashMap<String, AvailAssigned>,
    pub free_nodes: u32,
}

impl PlacementSet {
    /// Build one set's aggregate from its member nodes (§3.9: "cached
    /// aggregate resources, computed by summing consumables and unioning
    /// non-consumables").
    pub fn build(key_value: String, nodes: &[&Node], defs: &HashMap<String, Arc<ResourceDef>>) -> Self {
        let mut res: HashMap<String, AvailAssigned> = HashMap::new();
        let mut free_nodes = 0u32;
        for node in nodes {
            if node.state.contains(crate::entities::node::NodeState::FREE) {
                free_nodes += 1;
            }
            for (name, container) in &node.res {
                let Some(def) = defs.get(name) else { continue };
                let crate::resource::NodeResourceSlot::Direct(aa) = &container.slot else {
                    continue;
                };
                let entry = res.entry(name.clone()).or_default();
                if def.flags.consumable {
                    if let Some(avail) = &aa.avail {
                        entry.avail = Some(match &entry.avail {
                            Some(cur) => cur.add(avail).unwrap_or_else(|| avail.clone()),
                            None => avail.clone(),
                        });
                    }
                    if let Some(assigned) = &aa.assigned {
                        entry.assigned = Some(match &entry.assigned {
                            Some(cur) => cur.add(assigned).unwrap_or_else(|| assigned.clone()),
                            None => assigned.clone(),
                        });
                    }
                } else if let Some(avail) = &aa.avail {
                    entry.avail = Some(match &entry.avail {
                        Some(cur) => cur.add(avail).unwrap_or_else(|| avail.clone()),
                        None => avail.clone(),
                    });
                }
            }
        }
        Self {
            key_value,
            node_ranks: nodes.iter().map(|n| n.rank).collect(),
            res,
            free_nodes,
        }
    }

    pub fn fits(&self, defs: &HashMap<String, Arc<ResourceDef>>, req: &HashMap<String, ResourceValue>) -> bool {
        for (name, amount) in req {
            let Some(def) = defs.get(name) else { continue };
            if !def.flags.consumable {
                continue;
            }
            match self.res.get(name) {
                Some(aa) if aa.fits(def, amount) => {}
                Some(_) => return false,
                None => return false,
            }
        }
        true
    }

    /// "Smallest fitting" metric used to sort sets so the smallest-capacity
    /// set that fits is tried first (§4.E), keyed on total free nodes then
    /// on summed numeric residual to break ties deterministically.
    pub fn size_metric(&self) -> (u32, i64) {
        let residual: i64 = self
            .res
            .values()
            .filter_map(|aa| aa.avail.as_ref().and_then(|v| v.as_f64()))
            .map(|v| v as i64)
            .sum();
        (self.free_nodes, residual)
    }
}

/// Partition `nodes` by the value of resource `key` into placement sets
/// (§4.E). Nodes missing the key resource are grouped under a sentinel
/// `""` key-value bucket representing "no group".
pub fn partition_by_key(
    nodes: &[&Node],
    key: &str,
    defs: &HashMap<String, Arc<ResourceDef>>,
) -> Vec<PlacementSet> {
    let mut groups: HashMap<String, Vec<&Node>> = HashMap::new();
    for node in nodes {
        let value = match node.res.get(key).map(|c| &c.slot) {
            Some(crate::resource::NodeResourceSlot::Direct(aa)) => {
                aa.avail.as_ref().map(|v| v.to_string()).unwrap_or_default()
            }
            _ => String::new(),
        };
        groups.entry(value).or_default().push(node);
    }
    let mut sets: Vec<PlacementSet> = groups
        .into_iter()
        .map(|(value, members)| PlacementSet::build(value, &members, defs))
        .collect();
    sets.sort_by_key(|s| s.size_metric());
    sets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::node::Node;
    use crate::resource::{def::ResourceFlags, def::ResourceKind, value::NodeResourceSlot, ResourceContainer};

    fn node_with(rank: u32, name: &str, switch: &str, ncpus: i64) -> Node {
        let mut n = Node::new(rank, name);
        let switch_def = ResourceDef::new(
            "switch",
            ResourceKind::String,
            ResourceFlags { consumable: false, ..Default::default() },
        );
        n.res.insert(
            "switch".into(),
            ResourceContainer {
                def: switch_def,
                slot: NodeResourceSlot::Direct(AvailAssigned::with_avail(ResourceValue::Str(switch.into()))),
            },
        );
        let ncpus_def = ResourceDef::new("ncpus", ResourceKind::Long, ResourceFlags::default());
        n.res.insert(
            "ncpus".into(),
            ResourceContainer {
                def: ncpus_def,
                slot: NodeResourceSlot::Direct(AvailAssigned::with_avail(ResourceValue::Long(ncpus))),
            },
        );
        n
    }

    #[test]
    fn partitions_by_switch_and_sums_consumables() {
        let mut defs = HashMap::new();
        defs.insert(
            "switch".to_string(),
            ResourceDef::new("switch", ResourceKind::String, ResourceFlags { consumable: false, ..Default::default() }),
        );
        defs.insert("ncpus".to_string(), ResourceDef::new("ncpus", ResourceKind::Long, ResourceFlags::default()));

        let n1 = node_with(1, "n1", "sw0", 4);
        let n2 = node_with(2, "n2", "sw0", 4);
        let n3 = node_with(3, "n3", "sw1", 2);
        let nodes = vec![&n1, &n2, &n3];

        let sets = partition_by_key(&nodes, "switch", &defs);
        assert_eq!(sets.len(), 2);
        let sw0 = sets.iter().find(|s| s.key_value == "sw0").unwrap();
        assert_eq!(sw0.res["ncpus"].avail, Some(ResourceValue::Long(8)));
    }
}
