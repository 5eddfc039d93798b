use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::model::packet::Packet;
use crate::routing::debounce::Debouncer;
use crate::routing::{parse_link_view, spf, RoutingService};
use crate::state::State;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy)]
pub struct LsrConfig {
    pub hello_timeout_sec: f64,
    pub info_interval_sec: f64,
    pub on_change_debounce_sec: f64,
    pub advertise_links_from_neighbors_table: bool,
}

impl Default for LsrConfig {
    fn default() -> Self {
        Self {
            hello_timeout_sec: 20.0,
            info_interval_sec: 12.0,
            on_change_debounce_sec: 0.4,
            advertise_links_from_neighbors_table: true,
        }
    }
}

pub struct LsrService {
    state: Arc<State>,
    transport: Arc<dyn Transport>,
    my_id: String,
    neighbor_map: BTreeMap<String, String>,
    cfg: LsrConfig,
    debouncer: Debouncer,
    last_advertised: Mutex<Option<BTreeMap<String, f64>>>,
    running: AtomicBool,
}

impl LsrService {
    pub fn new(
        state: Arc<State>,
        transport: Arc<dyn Transport>,
        my_id: impl Into<String>,
        neighbor_map: BTreeMap<String, String>,
        cfg: LsrConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            transport,
            my_id: my_id.into(),
            neighbor_map,
            debouncer: Debouncer::new(Duration::from_secs_f64(cfg.on_change_debounce_sec)),
            cfg,
            last_advertised: Mutex::new(None),
            running: AtomicBool::new(true),
        })
    }

    fn now(&self) -> f64 {
        crate::clock::now()
    }

    fn debounced_recompute_and_advertise(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.debouncer.trigger(move || {
            me.recompute_routes();
            me.advertise_info();
        });
    }

    fn recompute_routes(&self) {
        let now = self.now();
        let graph = self.state.build_graph(Some(self.cfg.hello_timeout_sec), now);
        let (next_hop, cost) = spf::dijkstra(&graph, &self.my_id);
        let entries = next_hop
            .into_iter()
            .map(|(dest, nh)| {
                let c = cost.get(&dest).copied().unwrap_or(f64::INFINITY);
                (dest, nh, c)
            })
            .collect();
        self.state.set_routes(entries);
        info!(node = %self.my_id, "lsr recomputed routing table");
    }

    fn advertise_info(&self) {
        let now = self.now();
        let view = if self.cfg.advertise_links_from_neighbors_table {
            self.state.get_alive_links(self.cfg.hello_timeout_sec, now)
        } else {
            self.state
                .get_routing_snapshot()
                .into_keys()
                .map(|dest| (dest, 1.0))
                .collect()
        };

        let mut last = self.last_advertised.lock().unwrap();
        if last.as_ref() == Some(&view) {
            return;
        }

        let packet = Packet::new_info(self.my_id.clone(), &view);
        if let Ok(bytes) = crate::model::packet::PacketFactory::encode(&packet) {
            let channels: Vec<String> = self.neighbor_map.values().cloned().collect();
            let _ = self.transport.broadcast(&channels, &bytes);
        }
        *last = Some(view);
    }

    fn periodic_advertise_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs_f64(self.cfg.info_interval_sec));
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            self.advertise_info();
        }
    }

    fn watchdog_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs(5));
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            let now = self.now();
            let mut changed = false;

            for dead in self.state.dead_neighbors(self.cfg.hello_timeout_sec, now) {
                let still_in_lsdb = self
                    .state
                    .get_lsdb_snapshot()
                    .get(&self.my_id)
                    .map(|links| links.contains_key(&dead))
                    .unwrap_or(false);
                if still_in_lsdb {
                    self.state.remove_neighbor(&dead);
                    changed = true;
                }
            }

            if !self
                .state
                .purge_stale_lsdb(3.0 * self.cfg.info_interval_sec, now)
                .is_empty()
            {
                changed = true;
            }

            if changed {
                self.debounced_recompute_and_advertise();
            }
        }
    }
}

impl RoutingService for LsrService {
    fn start(self: Arc<Self>) {
        let periodic = Arc::clone(&self);
        thread::spawn(move || periodic.periodic_advertise_loop());
        let watchdog = Arc::clone(&self);
        thread::spawn(move || watchdog.watchdog_loop());
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn on_info(self: Arc<Self>, origin: String, payload: Value) {
        let links = parse_link_view(&payload);
        let now = self.now();
        self.state.update_lsdb(origin, links, now);
        self.debounced_recompute_and_advertise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BusRegistry;

    fn make_service(id: &str, registry: &BusRegistry, neighbors: &[&str]) -> Arc<LsrService> {
        let state = Arc::new(State::new(id));
        let bus = Arc::new(registry.register(id));
        let neighbor_map: BTreeMap<String, String> = neighbors
            .iter()
            .map(|n| (n.to_string(), n.to_string()))
            .collect();
        LsrService::new(state, bus, id, neighbor_map, LsrConfig::default())
    }

    #[test]
    fn recompute_installs_routes_from_lsdb() {
        let registry = BusRegistry::new();
        let svc = make_service("A", &registry, &["B"]);
        svc.state.update_lsdb("A".to_string(), BTreeMap::from([("B".to_string(), 1.0)]), 0.0);
        svc.state.update_lsdb("B".to_string(), BTreeMap::from([("A".to_string(), 1.0), ("C".to_string(), 1.0)]), 0.0);
        svc.recompute_routes();
        assert_eq!(svc.state.get_next_hop("C"), Some("B".to_string()));
    }

    #[test]
    fn advertise_is_idempotent_on_unchanged_view() {
        let registry = BusRegistry::new();
        let svc = make_service("A", &registry, &[]);
        svc.advertise_info();
        let first = svc.last_advertised.lock().unwrap().clone();
        svc.advertise_info();
        let second = svc.last_advertised.lock().unwrap().clone();
        assert_eq!(first, second);
    }
}
