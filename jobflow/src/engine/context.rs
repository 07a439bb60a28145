// Job context: the map from step id to executed action threaded through one run

use crate::models::Action;
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Key of the triggering action
pub const ACTION_KEY: &str = "action";
/// Key of the current step's action during mutations and postconditions
pub const CURRENT_ACTION_KEY: &str = "$action";
/// Separator joining child ids into a parallel group id
pub const GROUP_ID_SEPARATOR: &str = ":";

/// Step id to executed action, in insertion order
pub type ContextMap = IndexMap<String, Action>;

/// Step ids may not shadow the reserved keys or look like a group id
pub fn is_reserved_step_id(id: &str) -> bool {
    id == ACTION_KEY || id == CURRENT_ACTION_KEY || id.contains(GROUP_ID_SEPARATOR)
}

pub fn group_id<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    ids.into_iter().collect::<Vec<_>>().join(GROUP_ID_SEPARATOR)
}

/// Render the context as JSON, with `current` under the current action key
pub fn context_to_value(context: &ContextMap, current: Option<&Action>) -> Value {
    let mut map: Map<String, Value> = context
        .iter()
        .map(|(key, action)| (key.clone(), action.to_value()))
        .collect();

    if let Some(action) = current {
        map.insert(CURRENT_ACTION_KEY.to_string(), action.to_value());
    }

    Value::Object(map)
}

/// A copy of `context` with `extra` entries added
pub fn extend_context(context: &ContextMap, extra: &ContextMap) -> ContextMap {
    let mut extended = context.clone();
    extended.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    extended
}
