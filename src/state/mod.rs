use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::routing::spf;

#[derive(Debug, Clone, Copy)]
pub struct NeighborEntry {
    pub cost: f64,
    pub last_hello_at: Option<f64>,
}

#[derive(Debug, Default)]
struct Inner {
    neighbors: BTreeMap<String, NeighborEntry>,
    lsdb: BTreeMap<String, BTreeMap<String, f64>>,
    lsdb_learned_at: BTreeMap<String, f64>,
    routing_table: BTreeMap<String, String>,
    last_costs: BTreeMap<String, f64>,
    seen: BTreeMap<String, f64>,
}

/// The single source of mutable truth for a node: neighbors, link-state
/// database, routing table, and the dedup cache, all behind one mutex.
/// No operation here re-enters the lock.
pub struct State {
    node_id: String,
    inner: Mutex<Inner>,
}

impl State {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // ---- neighbors -----------------------------------------------------

    pub fn set_neighbors(&self, neighbors: Vec<(String, f64)>) {
        let mut inner = self.inner.lock().unwrap();
        inner.neighbors = neighbors
            .into_iter()
            .map(|(id, cost)| {
                (
                    id,
                    NeighborEntry {
                        cost,
                        last_hello_at: None,
                    },
                )
            })
            .collect();
        Self::sync_self_lsdb_row(&mut inner, &self.node_id);
    }

    pub fn add_neighbor(&self, id: impl Into<String>, cost: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.neighbors.insert(
            id.into(),
            NeighborEntry {
                cost,
                last_hello_at: None,
            },
        );
        Self::sync_self_lsdb_row(&mut inner, &self.node_id);
    }

    pub fn remove_neighbor(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.neighbors.remove(id);
        Self::sync_self_lsdb_row(&mut inner, &self.node_id);
    }

    /// Keeps `LSDB[self]` in lockstep with the neighbor table: a node's own
    /// direct links must appear in its own LSDB row, or `build_graph`'s
    /// Dijkstra has no edges to start from.
    fn sync_self_lsdb_row(inner: &mut Inner, node_id: &str) {
        let row: BTreeMap<String, f64> = inner
            .neighbors
            .iter()
            .map(|(id, entry)| (id.clone(), entry.cost))
            .collect();
        inner.lsdb.insert(node_id.to_string(), row);
    }

    pub fn get_neighbors(&self) -> Vec<(String, f64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .neighbors
            .iter()
            .map(|(id, entry)| (id.clone(), entry.cost))
            .collect()
    }

    pub fn neighbor_cost(&self, id: &str) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        inner.neighbors.get(id).map(|entry| entry.cost)
    }

    pub fn touch_hello(&self, id: &str, now: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.neighbors.get_mut(id) {
            entry.last_hello_at = Some(now);
        }
    }

    pub fn dead_neighbors(&self, hello_timeout_sec: f64, now: f64) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .neighbors
            .iter()
            .filter(|(_, entry)| match entry.last_hello_at {
                None => true,
                Some(last) => now - last > hello_timeout_sec,
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn is_alive_neighbor(inner: &Inner, id: &str, hello_timeout_sec: f64, now: f64) -> bool {
        match inner.neighbors.get(id) {
            None => false,
            Some(entry) => match entry.last_hello_at {
                None => false,
                Some(last) => now - last <= hello_timeout_sec,
            },
        }
    }

    // ---- link-state database -------------------------------------------

    pub fn update_link_cost(&self, a: &str, b: &str, cost: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .lsdb
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string(), cost);
    }

    pub fn update_lsdb(&self, origin: String, links: BTreeMap<String, f64>, now: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.lsdb_learned_at.insert(origin.clone(), now);
        inner.lsdb.insert(origin, links);
    }

    pub fn purge_stale_lsdb(&self, max_age_sec: f64, now: f64) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let my_id = self.node_id.clone();
        let stale: Vec<String> = inner
            .lsdb_learned_at
            .iter()
            .filter(|(origin, &learned_at)| origin.as_str() != my_id && now - learned_at > max_age_sec)
            .map(|(origin, _)| origin.clone())
            .collect();
        for origin in &stale {
            inner.lsdb.remove(origin);
            inner.lsdb_learned_at.remove(origin);
        }
        stale
    }

    pub fn get_lsdb_snapshot(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        let inner = self.inner.lock().unwrap();
        inner.lsdb.clone()
    }

    pub fn build_graph(&self, hello_timeout_sec: Option<f64>, now: f64) -> spf::Graph {
        let inner = self.inner.lock().unwrap();
        let graph = spf::undirected_closure(&inner.lsdb);
        let Some(timeout) = hello_timeout_sec else {
            return graph;
        };
        graph
            .into_iter()
            .filter_map(|(u, neighbors)| {
                let filtered: BTreeMap<String, f64> = neighbors
                    .into_iter()
                    .filter(|(v, _)| {
                        u == self.node_id
                            || v == &self.node_id
                            || (Self::is_alive_neighbor(&inner, &u, timeout, now)
                                && Self::is_alive_neighbor(&inner, v, timeout, now))
                    })
                    .collect();
                if filtered.is_empty() {
                    None
                } else {
                    Some((u, filtered))
                }
            })
            .collect()
    }

    pub fn get_alive_links(&self, hello_timeout_sec: f64, now: f64) -> BTreeMap<String, f64> {
        let inner = self.inner.lock().unwrap();
        inner
            .neighbors
            .iter()
            .filter(|(id, _)| Self::is_alive_neighbor(&inner, id, hello_timeout_sec, now))
            .map(|(id, entry)| (id.clone(), entry.cost))
            .collect()
    }

    // ---- routing table ---------------------------------------------------

    pub fn set_routing_table(&self, table: BTreeMap<String, String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.routing_table = table;
    }

    pub fn set_last_costs(&self, costs: BTreeMap<String, f64>) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_costs = costs;
    }

    pub fn set_routes(&self, entries: Vec<(String, String, f64)>) {
        let mut inner = self.inner.lock().unwrap();
        inner.routing_table = entries
            .iter()
            .map(|(dest, next_hop, _)| (dest.clone(), next_hop.clone()))
            .collect();
        inner.last_costs = entries
            .into_iter()
            .map(|(dest, _, cost)| (dest, cost))
            .collect();
    }

    pub fn get_next_hop(&self, dest: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.routing_table.get(dest).cloned()
    }

    pub fn get_routing_snapshot(&self) -> BTreeMap<String, (String, f64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .routing_table
            .iter()
            .map(|(dest, next_hop)| {
                let cost = inner.last_costs.get(dest).copied().unwrap_or(f64::INFINITY);
                (dest.clone(), (next_hop.clone(), cost))
            })
            .collect()
    }

    /// Recomputes a routing table from the current graph as a convenience
    /// read. Unreachable destinations fall back to whatever was last
    /// installed rather than being dropped, so one bad recompute cycle
    /// doesn't flap a route to "no route".
    pub fn get_routing_table(&self) -> (BTreeMap<String, String>, BTreeMap<String, f64>) {
        let inner = self.inner.lock().unwrap();
        let graph = spf::undirected_closure(&inner.lsdb);
        let (mut next_hop, mut cost) = spf::dijkstra(&graph, &self.node_id);
        for (dest, prev_cost) in &inner.last_costs {
            if !cost.contains_key(dest) {
                if let Some(prev_hop) = inner.routing_table.get(dest) {
                    next_hop.insert(dest.clone(), prev_hop.clone());
                    cost.insert(dest.clone(), *prev_cost);
                }
            }
        }
        (next_hop, cost)
    }

    pub fn dump_routes(&self) -> BTreeMap<String, (String, f64)> {
        self.get_routing_snapshot()
    }

    // ---- seen cache --------------------------------------------------------

    pub fn mark_seen(&self, msg_id: &str, now: f64, ttl_sec: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.seen.insert(msg_id.to_string(), now + ttl_sec);
    }

    pub fn is_seen(&self, msg_id: &str, now: f64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.seen.get(msg_id) {
            Some(&expires_at) if expires_at > now => true,
            Some(_) => {
                inner.seen.remove(msg_id);
                false
            }
            None => false,
        }
    }

    pub fn purge_seen(&self, now: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.seen.retain(|_, &mut expires_at| expires_at > now);
    }
}
