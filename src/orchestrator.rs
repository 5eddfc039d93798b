use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::config::{NodeConfig, Protocol};
use crate::forwarding::{ForwardingConfig, ForwardingEngine};
use crate::model::packet::{Packet, PacketFactory};
use crate::routing::dijkstra_static::DijkstraStaticService;
use crate::routing::dvr::{DvrConfig, DvrService};
use crate::routing::lsr::{LsrConfig, LsrService};
use crate::routing::RoutingService;
use crate::state::State;
use crate::transport::{BusRegistry, Transport};

/// Wires the State Store, Transport, the selected Routing Service, and the
/// Forwarding Engine together for one node, then owns its HELLO beacon and
/// the external command surface (`send`, `routing_table`, `shutdown`).
pub struct NodeOrchestrator {
    state: Arc<State>,
    transport: Arc<dyn Transport>,
    my_id: String,
    neighbor_map: BTreeMap<String, String>,
    neighbor_weights: BTreeMap<String, f64>,
    protocol: Protocol,
    routing: Option<Arc<dyn RoutingService>>,
    forwarding: Arc<ForwardingEngine>,
    hello_interval_sec: f64,
    running: AtomicBool,
}

impl NodeOrchestrator {
    /// `registry` is the shared in-process bus every node in this process
    /// publishes to and reads from; it stands in for the host:port a real
    /// broker connection would be built from.
    pub fn new(cfg: &NodeConfig, registry: &BusRegistry) -> Arc<Self> {
        let state = Arc::new(State::new(cfg.my_id.clone()));
        state.set_neighbors(cfg.neighbor_weights.iter().map(|(id, cost)| (id.clone(), *cost)).collect());

        let transport: Arc<dyn Transport> = Arc::new(registry.register(cfg.my_channel()));

        let routing: Option<Arc<dyn RoutingService>> = match cfg.protocol {
            Protocol::Lsr => Some(LsrService::new(
                state.clone(),
                transport.clone(),
                cfg.my_id.clone(),
                cfg.neighbor_map.clone(),
                LsrConfig {
                    hello_timeout_sec: cfg.hello_timeout_sec,
                    info_interval_sec: cfg.info_interval_sec,
                    ..LsrConfig::default()
                },
            ) as Arc<dyn RoutingService>),
            Protocol::Dvr => Some(DvrService::new(
                state.clone(),
                transport.clone(),
                cfg.my_id.clone(),
                cfg.neighbor_map.clone(),
                DvrConfig {
                    advertise_interval_sec: cfg.info_interval_sec,
                    entry_timeout_sec: cfg.hello_timeout_sec.max(25.0),
                    ..DvrConfig::default()
                },
            ) as Arc<dyn RoutingService>),
            Protocol::Dijkstra => Some(DijkstraStaticService::new(
                state.clone(),
                cfg.my_id.clone(),
                cfg.static_topology(),
            ) as Arc<dyn RoutingService>),
            Protocol::Flooding => None,
        };

        let forwarding = ForwardingEngine::new(
            state.clone(),
            transport.clone(),
            cfg.my_id.clone(),
            cfg.neighbor_map.clone(),
            routing.clone(),
            ForwardingConfig {
                hello_timeout_sec: cfg.hello_timeout_sec,
            },
        );

        Arc::new(Self {
            state,
            transport,
            my_id: cfg.my_id.clone(),
            neighbor_map: cfg.neighbor_map.clone(),
            neighbor_weights: cfg.neighbor_weights.clone(),
            protocol: cfg.protocol,
            routing,
            forwarding,
            hello_interval_sec: cfg.hello_interval_sec,
            running: AtomicBool::new(true),
        })
    }

    /// Emits the initial HELLO broadcast, then — for LSR only — an `Info`
    /// built directly from the configured direct-link costs (not whatever
    /// hello-liveness has confirmed so far, since no hello has round-tripped
    /// yet); only then starts the routing service and forwarding engine.
    /// Mirrors the reference implementation's `_emit_initial_control_packets`.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.transport.connect()?;
        self.broadcast_hello();
        if self.protocol == Protocol::Lsr {
            self.broadcast_initial_lsr_info();
        }
        if let Some(routing) = &self.routing {
            Arc::clone(routing).start();
        }
        self.forwarding.start();

        let beacon = Arc::clone(self);
        thread::spawn(move || beacon.hello_beacon_loop());

        info!(node = %self.my_id, neighbors = ?self.neighbor_map.keys().collect::<Vec<_>>(), "node started");
        Ok(())
    }

    /// Tears down producers before the channel they write to: beacon stops
    /// implicitly via `running`, then routing, then forwarding, then
    /// transport.
    pub fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(routing) = &self.routing {
            routing.stop();
        }
        self.forwarding.stop();
        self.transport.close()?;
        info!(node = %self.my_id, "node shut down");
        Ok(())
    }

    pub fn send(&self, dst: impl Into<String>, body: impl Serialize) {
        self.forwarding.send(dst, body);
    }

    pub fn routing_table(&self) -> BTreeMap<String, (String, f64)> {
        self.state.dump_routes()
    }

    fn broadcast_hello(&self) {
        let packet = Packet::new_hello(self.my_id.clone());
        if let Ok(bytes) = PacketFactory::encode(&packet) {
            let channels: Vec<String> = self.neighbor_map.values().cloned().collect();
            let _ = self.transport.broadcast(&channels, &bytes);
        }
    }

    fn broadcast_initial_lsr_info(&self) {
        let packet = Packet::new_info(self.my_id.clone(), &self.neighbor_weights);
        if let Ok(bytes) = PacketFactory::encode(&packet) {
            let channels: Vec<String> = self.neighbor_map.values().cloned().collect();
            let _ = self.transport.broadcast(&channels, &bytes);
        }
    }

    fn hello_beacon_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs_f64(self.hello_interval_sec));
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            self.broadcast_hello();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn config_for(my_id: &str, neighbor_map: BTreeMap<String, String>, protocol: Protocol) -> NodeConfig {
        NodeConfig {
            section: "sec10".to_string(),
            topo_id: "topo1".to_string(),
            my_id: my_id.to_string(),
            hello_interval_sec: 0.05,
            info_interval_sec: 30.0,
            hello_timeout_sec: 20.0,
            log_level: "info".to_string(),
            protocol,
            transport: "in-process".to_string(),
            names_cfg: neighbor_map.clone(),
            topo_cfg: BTreeMap::new(),
            neighbor_ids: neighbor_map.keys().cloned().collect(),
            neighbor_weights: neighbor_map.keys().map(|id| (id.clone(), 1.0)).collect(),
            neighbor_map,
        }
    }

    #[test]
    fn start_emits_a_hello_broadcast_to_every_neighbor() {
        let registry = BusRegistry::new();
        let b_bus = registry.register("B");

        let mut neighbor_map = BTreeMap::new();
        neighbor_map.insert("B".to_string(), "B".to_string());
        let cfg = config_for("A", neighbor_map, Protocol::Flooding);

        let node = NodeOrchestrator::new(&cfg, &registry);
        node.start().unwrap();

        let raw = b_bus.recv(StdDuration::from_millis(100)).unwrap().expect("hello delivered");
        let parsed = PacketFactory::parse(&raw).unwrap();
        assert_eq!(parsed.kind, crate::model::packet::PacketKind::Hello);

        node.shutdown().unwrap();
    }

    #[test]
    fn send_with_no_route_and_no_direct_neighbor_falls_back_to_flooding() {
        let registry = BusRegistry::new();
        let b_bus = registry.register("B");

        let mut neighbor_map = BTreeMap::new();
        neighbor_map.insert("B".to_string(), "B".to_string());
        let cfg = config_for("A", neighbor_map, Protocol::Flooding);

        let node = NodeOrchestrator::new(&cfg, &registry);
        node.start().unwrap();
        let _ = b_bus.recv(StdDuration::from_millis(100)).unwrap();

        node.send("Z", "hola");
        let raw = b_bus.recv(StdDuration::from_millis(100)).unwrap().expect("message flooded to B");
        let parsed = PacketFactory::parse(&raw).unwrap();
        assert_eq!(parsed.kind, crate::model::packet::PacketKind::Message);
        assert_eq!(parsed.to, "Z");

        node.shutdown().unwrap();
    }
}
