use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::routing::{spf, RoutingService};
use crate::state::State;

/// Computes one shortest-path table from a static, unit-cost topology and
/// never listens to the network again. `topo` maps each node to the list
/// of nodes it has a direct edge to (weights are not used here — every
/// edge costs 1.0).
pub struct DijkstraStaticService {
    state: Arc<State>,
    my_id: String,
    topo: BTreeMap<String, Vec<String>>,
}

impl DijkstraStaticService {
    pub fn new(state: Arc<State>, my_id: impl Into<String>, topo: BTreeMap<String, Vec<String>>) -> Arc<Self> {
        Arc::new(Self {
            state,
            my_id: my_id.into(),
            topo,
        })
    }

    fn compute_routes(&self) {
        let mut links: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (node, neighbors) in &self.topo {
            let row = links.entry(node.clone()).or_default();
            for neighbor in neighbors {
                row.insert(neighbor.clone(), 1.0);
            }
        }
        let graph = spf::undirected_closure(&links);
        let (next_hop, cost) = spf::dijkstra(&graph, &self.my_id);
        let entries = next_hop
            .into_iter()
            .map(|(dest, nh)| {
                let c = cost.get(&dest).copied().unwrap_or(f64::INFINITY);
                (dest, nh, c)
            })
            .collect();
        self.state.set_routes(entries);
    }
}

impl RoutingService for DijkstraStaticService {
    fn start(self: Arc<Self>) {
        self.compute_routes();
    }

    fn stop(&self) {}

    fn on_info(self: Arc<Self>, _origin: String, _payload: Value) {}
}
