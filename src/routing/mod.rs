pub mod debounce;
pub mod dijkstra_static;
pub mod dvr;
pub mod lsr;
pub mod spf;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

/// Parses an `Info` payload as a link/vector view. Accepts a flat
/// `{neighbor: cost}` map, a `{"neighbors": {...}}` wrapper, or a
/// JSON-encoded string carrying either of those shapes.
pub fn parse_link_view(payload: &Value) -> BTreeMap<String, f64> {
    let value = match payload {
        Value::String(text) => serde_json::from_str(text).unwrap_or(Value::Null),
        other => other.clone(),
    };
    let object = match &value {
        Value::Object(obj) => {
            if let Some(Value::Object(inner)) = obj.get("neighbors") {
                inner
            } else {
                obj
            }
        }
        _ => return BTreeMap::new(),
    };
    object
        .iter()
        .filter_map(|(key, val)| val.as_f64().map(|cost| (key.clone(), cost)))
        .collect()
}

/// A routing discipline: at most one of these is active per node. Flooding
/// mode runs none at all, so the orchestrator treats `Option<Arc<dyn
/// RoutingService>>` as the wiring point. `start` takes `Arc<Self>` so
/// implementations can hand clones of themselves to background threads.
pub trait RoutingService: Send + Sync {
    fn start(self: Arc<Self>);
    fn stop(&self);
    fn on_info(self: Arc<Self>, origin: String, payload: Value);
}
