use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::model::packet::Packet;
use crate::routing::RoutingService;
use crate::state::State;
use crate::transport::Transport;

pub const INF: f64 = 1e9;

#[derive(Debug, Clone, Copy)]
pub struct DvrConfig {
    pub advertise_interval_sec: f64,
    pub entry_timeout_sec: f64,
    pub split_horizon_poison: bool,
}

impl Default for DvrConfig {
    fn default() -> Self {
        Self {
            advertise_interval_sec: 5.0,
            entry_timeout_sec: 30.0,
            split_horizon_poison: true,
        }
    }
}

#[derive(Default)]
struct Vector {
    entries: BTreeMap<String, (f64, Option<String>)>,
    last_seen_from: BTreeMap<String, f64>,
}

pub struct DvrService {
    state: Arc<State>,
    transport: Arc<dyn Transport>,
    my_id: String,
    neighbor_map: BTreeMap<String, String>,
    cfg: DvrConfig,
    vector: Mutex<Vector>,
    running: AtomicBool,
}

#[derive(Serialize)]
struct DvPayload<'a> {
    dv: &'a BTreeMap<String, f64>,
}

impl DvrService {
    pub fn new(
        state: Arc<State>,
        transport: Arc<dyn Transport>,
        my_id: impl Into<String>,
        neighbor_map: BTreeMap<String, String>,
        cfg: DvrConfig,
    ) -> Arc<Self> {
        let my_id = my_id.into();
        let mut entries = BTreeMap::new();
        entries.insert(my_id.clone(), (0.0, None));
        for (neighbor, cost) in state.get_neighbors() {
            entries.insert(neighbor.clone(), (cost, Some(neighbor)));
        }
        Arc::new(Self {
            state,
            transport,
            my_id,
            neighbor_map,
            cfg,
            vector: Mutex::new(Vector {
                entries,
                last_seen_from: BTreeMap::new(),
            }),
            running: AtomicBool::new(true),
        })
    }

    fn now(&self) -> f64 {
        crate::clock::now()
    }

    fn cost_to_neighbor(&self, id: &str) -> Option<f64> {
        self.state.neighbor_cost(id)
    }

    fn install_into_state(&self, vector: &Vector) {
        let entries: Vec<(String, String, f64)> = vector
            .entries
            .iter()
            .filter(|(dest, (cost, next_hop))| {
                *dest != self.my_id && *cost < INF && next_hop.is_some()
            })
            .map(|(dest, (cost, next_hop))| (dest.clone(), next_hop.clone().unwrap(), *cost))
            .collect();
        self.state.set_routes(entries);
    }

    fn advertise_all(&self) {
        let vector = self.vector.lock().unwrap();
        let mut base: BTreeMap<String, f64> = vector
            .entries
            .iter()
            .map(|(dest, (cost, _))| (dest.clone(), *cost))
            .collect();
        base.insert(self.my_id.clone(), 0.0);

        for (neighbor_id, channel) in &self.neighbor_map {
            let mut outgoing = base.clone();
            if self.cfg.split_horizon_poison {
                for (dest, (_, next_hop)) in &vector.entries {
                    if next_hop.as_deref() == Some(neighbor_id.as_str()) {
                        outgoing.insert(dest.clone(), INF);
                    }
                }
            }
            let packet = Packet::new_info(self.my_id.clone(), DvPayload { dv: &outgoing });
            if let Ok(bytes) = crate::model::packet::PacketFactory::encode(&packet) {
                let _ = self.transport.publish(channel, &bytes);
            }
        }
    }

    fn expire_old(&self) {
        let now = self.now();
        let mut vector = self.vector.lock().unwrap();
        let expired: Vec<String> = vector
            .last_seen_from
            .iter()
            .filter(|(_, &last)| now - last > self.cfg.entry_timeout_sec)
            .map(|(origin, _)| origin.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for (_, (cost, next_hop)) in vector.entries.iter_mut() {
            if let Some(nh) = next_hop {
                if expired.contains(nh) {
                    *cost = INF;
                    *next_hop = None;
                }
            }
        }
        for origin in &expired {
            vector.last_seen_from.remove(origin);
            warn!(node = %self.my_id, %origin, "dvr origin expired");
        }
    }

    fn periodic_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs_f64(self.cfg.advertise_interval_sec));
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            self.expire_old();
            {
                let vector = self.vector.lock().unwrap();
                self.install_into_state(&vector);
            }
            self.advertise_all();
        }
    }
}

impl RoutingService for DvrService {
    fn start(self: Arc<Self>) {
        {
            let vector = self.vector.lock().unwrap();
            self.install_into_state(&vector);
        }
        self.advertise_all();
        let periodic = Arc::clone(&self);
        thread::spawn(move || periodic.periodic_loop());
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn on_info(self: Arc<Self>, origin: String, payload: Value) {
        let Some(dv) = payload.get("dv").and_then(Value::as_object) else {
            return;
        };
        let Some(neigh_cost) = self.cost_to_neighbor(&origin) else {
            // DVR only trusts vectors advertised by direct neighbors.
            return;
        };

        let now = self.now();
        let mut changed = false;
        let mut vector = self.vector.lock().unwrap();
        vector.last_seen_from.insert(origin.clone(), now);

        for (dest, cost_via_origin) in dv {
            if dest == &self.my_id {
                continue;
            }
            let Some(cost_via_origin) = cost_via_origin.as_f64() else {
                continue;
            };
            let new_cost = neigh_cost + cost_via_origin;
            let current = vector
                .entries
                .get(dest)
                .copied()
                .unwrap_or((INF, None));

            if new_cost < current.0 - 1e-9 {
                vector
                    .entries
                    .insert(dest.clone(), (new_cost, Some(origin.clone())));
                changed = true;
            } else if current.1.as_deref() == Some(origin.as_str()) && cost_via_origin >= INF {
                vector.entries.insert(dest.clone(), (INF, None));
                changed = true;
            }
        }

        if changed {
            self.install_into_state(&vector);
            drop(vector);
            self.advertise_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BusRegistry;

    fn make_service(id: &str, registry: &BusRegistry, neighbors: &[(&str, f64)]) -> Arc<DvrService> {
        let state = Arc::new(State::new(id));
        state.set_neighbors(neighbors.iter().map(|(n, c)| (n.to_string(), *c)).collect());
        let bus = Arc::new(registry.register(id));
        let neighbor_map: BTreeMap<String, String> = neighbors
            .iter()
            .map(|(n, _)| (n.to_string(), n.to_string()))
            .collect();
        DvrService::new(state, bus, id, neighbor_map, DvrConfig::default())
    }

    #[test]
    fn ignores_info_from_non_neighbor() {
        let registry = BusRegistry::new();
        let svc = make_service("A", &registry, &[("B", 1.0)]);
        let payload = serde_json::json!({"dv": {"Z": 1.0}});
        svc.clone().on_info("stranger".to_string(), payload);
        assert_eq!(svc.state.get_next_hop("Z"), None);
    }

    #[test]
    fn relaxes_via_direct_neighbor() {
        let registry = BusRegistry::new();
        let svc = make_service("A", &registry, &[("B", 1.0)]);
        let payload = serde_json::json!({"dv": {"C": 1.0}});
        svc.clone().on_info("B".to_string(), payload);
        assert_eq!(svc.state.get_next_hop("C"), Some("B".to_string()));
    }

    #[test]
    fn split_horizon_poisons_route_in_vector_sent_back_to_source_neighbor() {
        let registry = BusRegistry::new();
        let svc = make_service("A", &registry, &[("B", 1.0), ("C", 1.0)]);

        svc.clone().on_info("B".to_string(), serde_json::json!({"dv": {"Z": 1.0}}));

        // Re-register "B" as a receivable inbox so advertise_all's publish lands here.
        let b_rx = registry.register("B");
        svc.advertise_all();
        let raw = b_rx.recv(Duration::from_millis(50)).unwrap().expect("vector sent to B");
        let parsed: Value = serde_json::from_slice(&raw).unwrap();
        let dv = parsed["payload"]["dv"].as_object().unwrap();
        assert_eq!(dv["Z"].as_f64().unwrap(), INF, "route learned via B must be poisoned in B's own vector");
    }
}
