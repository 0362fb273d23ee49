//! Generic payload merge under declarative options.
//!
//! A source payload is a sparse tree: fields present on the source overwrite
//! the corresponding fields on the destination. Lists and maps follow the
//! policy declared in [`MergeOptions`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Map entries whose value carries `"removed": true` are deleted from the
/// destination when `should_check_removable_map_field` is set.
pub const REMOVED_MARKER: &str = "removed";

/// Declarative policy for how a source payload updates a destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    /// Repeated fields in the source replace the destination list instead of
    /// appending to it.
    pub should_replace_list: bool,
    /// Cap on list length after the merge. 0 means unbounded.
    pub list_size_limit: u32,
    /// When trimming to `list_size_limit`, drop from the head (oldest)
    /// rather than the tail.
    pub truncate_top: bool,
    /// Honor the `removed` marker on map entry values.
    pub should_check_removable_map_field: bool,
}

/// Merge `src` into `dst` under `options`.
///
/// Deterministic: object keys merge in sorted order and no step depends on
/// iteration randomness. A `null` source entry carries no data and leaves
/// the destination value untouched.
pub fn merge_values(dst: &mut Value, src: &Value, options: &MergeOptions) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, src_val) in src_map {
                if src_val.is_null() {
                    continue;
                }
                if options.should_check_removable_map_field && is_removed(src_val) {
                    dst_map.remove(key);
                    continue;
                }
                match dst_map.get_mut(key) {
                    Some(dst_val) => merge_values(dst_val, src_val, options),
                    None => {
                        dst_map.insert(key.clone(), src_val.clone());
                    }
                }
            }
        }
        (Value::Array(dst_list), Value::Array(src_list)) => {
            if options.should_replace_list {
                *dst_list = src_list.clone();
            } else {
                dst_list.extend(src_list.iter().cloned());
            }
            let limit = options.list_size_limit as usize;
            if limit > 0 && dst_list.len() > limit {
                if options.truncate_top {
                    let excess = dst_list.len() - limit;
                    dst_list.drain(..excess);
                } else {
                    dst_list.truncate(limit);
                }
            }
        }
        // Scalars, and nodes whose category changed, overwrite wholesale.
        (dst_slot, src_val) => *dst_slot = src_val.clone(),
    }
}

fn is_removed(value: &Value) -> bool {
    value
        .get(REMOVED_MARKER)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
