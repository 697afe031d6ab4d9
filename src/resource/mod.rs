//! Resource algebra (component A, §3.1, §4.A).

pub mod def;
pub mod indirect;
pub mod value;

pub use def::{ResourceDef, ResourceFlags, ResourceKind};
pub use value::{parse_value, res_to_num, AvailAssigned, NodeResourceSlot, ResourceContainer, ResourceValue, TriBool};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Canonical signature string built from a sorted definition list and
/// their values — used as a node-bucket and equivalence-class key. Two
/// inputs with the same set of (def, fragment) pairs produce the same
/// signature; a resource whose fragment is `None` (unset non-consumable,
/// or an `Unknown` boolean) is simply omitted, not encoded as empty.
pub fn build_signature<'a>(values: impl IntoIterator<Item = (&'a Arc<ResourceDef>, &'a ResourceValue)>) -> String {
    let mut ordered: BTreeMap<&str, String> = BTreeMap::new();
    for (def, value) in values {
        if let Some(frag) = value.signature_fragment() {
            ordered.insert(def.name.as_str(), frag);
        }
    }
    ordered
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}
