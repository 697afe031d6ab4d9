//! Indirect resource resolution (§3.1, P7).
//!
//! A node value may read `@othernode`, meaning "look up this resource on
//! that node each time". Resolved once per cycle, after all nodes are
//! loaded; cycles are detected and treated as errors (limit 10 hops).

use crate::entities::node::Node;
use crate::resource::value::NodeResourceSlot;
use std::collections::HashMap;

pub const MAX_INDIRECT_HOPS: u32 = 10;

/// Resolve every indirect resource on every node in `nodes`, in place.
/// A node resource that targets `@other`, directly or transitively,
/// resolves to the first `Direct` slot found, or is marked failed (and
/// thereafter treated as unset, per S7) if resolution does not terminate
/// within [`MAX_INDIRECT_HOPS`] or the target node/resource does not
/// exist.
pub fn resolve_indirect_resources(nodes: &mut HashMap<String, Node>) {
    let node_names: Vec<String> = nodes.keys().cloned().collect();
    for node_name in node_names {
        let res_names: Vec<String> = nodes[&node_name].res.keys().cloned().collect();
        for res_name in res_names {
            resolve_one(nodes, &node_name, &res_name);
        }
    }
}

/// [`Server::nodes`](crate::entities::server::Server) is keyed by rank,
/// not name, since ranks are what jobs' `execselect` and the calendar
/// reference; indirect targets on the wire are node names, so this
/// reindexes into a name-keyed map for the duration of resolution and
/// writes the resolved slots back by rank.
pub fn resolve_indirect_resources_by_rank(nodes: &mut HashMap<u32, Node>) {
    let mut by_name: HashMap<String, Node> =
        nodes.iter().map(|(_, n)| (n.name.clone(), n.clone())).collect();
    resolve_indirect_resources(&mut by_name);
    for node in nodes.values_mut() {
        if let Some(resolved) = by_name.remove(&node.name) {
            node.res = resolved.res;
        }
    }
}

fn resolve_one(nodes: &mut HashMap<String, Node>, start_node: &str, res_name: &str) {
    let mut visited = std::collections::HashSet::new();
    let mut cur_node = start_node.to_string();
    let mut hops = 0u32;

    let resolved = loop {
        if !visited.insert(cur_node.clone()) || hops > MAX_INDIRECT_HOPS {
            break None;
        }
        let target = match nodes.get(&cur_node).and_then(|n| n.res.get(res_name)) {
            Some(c) => match &c.slot {
                NodeResourceSlot::Direct(aa) => break Some(aa.clone()),
                NodeResourceSlot::Indirect(target) => target.clone(),
            },
            None => break None,
        };
        cur_node = target;
        hops += 1;
    };

    if let Some(node) = nodes.get_mut(start_node) {
        if let Some(container) = node.res.get_mut(res_name) {
            match resolved {
                Some(aa) => container.slot = NodeResourceSlot::Direct(aa),
                None => {
                    // Resolution failed or cycled: treat as unset (S7), never crash.
                    container.slot = NodeResourceSlot::Direct(Default::default());
                }
            }
        }
    }
}
