use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::model::packet::{Packet, PacketFactory, PacketKind, BROADCAST};
use crate::routing::RoutingService;
use crate::state::State;
use crate::transport::Transport;

/// How long a `msg_id` is remembered in the dedup cache after first sight.
/// Matches the reference implementation's `TTLCache(120)`.
const SEEN_TTL_SEC: f64 = 120.0;

#[derive(Debug, Clone, Copy)]
pub struct ForwardingConfig {
    pub hello_timeout_sec: f64,
}

/// Decodes inbound packets, dispatches them by kind, relays or delivers
/// them, and runs periodic housekeeping. `routing` is `None` in flooding
/// mode; every other protocol wires its active [`RoutingService`] here so
/// `Info` packets reach it.
pub struct ForwardingEngine {
    state: Arc<State>,
    transport: Arc<dyn Transport>,
    my_id: String,
    neighbor_map: BTreeMap<String, String>,
    channel_to_id: BTreeMap<String, String>,
    routing: Option<Arc<dyn RoutingService>>,
    cfg: ForwardingConfig,
    running: AtomicBool,
}

impl ForwardingEngine {
    pub fn new(
        state: Arc<State>,
        transport: Arc<dyn Transport>,
        my_id: impl Into<String>,
        neighbor_map: BTreeMap<String, String>,
        routing: Option<Arc<dyn RoutingService>>,
        cfg: ForwardingConfig,
    ) -> Arc<Self> {
        let channel_to_id = neighbor_map
            .iter()
            .map(|(id, channel)| (channel.clone(), id.clone()))
            .collect();
        Arc::new(Self {
            state,
            transport,
            my_id: my_id.into(),
            neighbor_map,
            channel_to_id,
            routing,
            cfg,
            running: AtomicBool::new(true),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let reader = Arc::clone(self);
        thread::spawn(move || reader.read_loop());
        let keeper = Arc::clone(self);
        thread::spawn(move || keeper.housekeeping_loop());
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Originates a new `Message` at this node: no TTL decrement, empty
    /// headers (this is hop zero, not a relay).
    pub fn send(&self, to: impl Into<String>, body: impl Serialize) {
        let packet = Packet::new_message(self.my_id.clone(), to, body);
        self.dispatch_outbound(packet);
    }

    fn now(&self) -> f64 {
        crate::clock::now()
    }

    // ---- compatibility coercion -----------------------------------------

    /// Rewrites channel names to `NodeID`s, forces `hello` packets onto
    /// `"broadcast"`, and upgrades the legacy `{type:"message", hops}` wire
    /// shape into an `Info` packet, all before the payload ever reaches
    /// [`PacketFactory::parse`]. Anything that isn't even valid JSON is
    /// passed through unchanged so `parse` can report the real error.
    fn coerce_compat(&self, raw: &[u8]) -> Vec<u8> {
        let Ok(mut value) = serde_json::from_slice::<Value>(raw) else {
            return raw.to_vec();
        };
        if let Value::Object(obj) = &mut value {
            self.coerce_channel_names(obj);
            self.force_hello_broadcast(obj);
            rewrite_legacy_message_as_info(obj);
        }
        serde_json::to_vec(&value).unwrap_or_else(|_| raw.to_vec())
    }

    fn coerce_channel_names(&self, obj: &mut Map<String, Value>) {
        for field in ["from", "to"] {
            let Some(Value::String(text)) = obj.get(field) else {
                continue;
            };
            if text.eq_ignore_ascii_case(BROADCAST) {
                continue;
            }
            if let Some(node_id) = self.channel_to_id.get(text) {
                obj.insert(field.to_string(), Value::String(node_id.clone()));
            }
        }
    }

    fn force_hello_broadcast(&self, obj: &mut Map<String, Value>) {
        if obj.get("type").and_then(Value::as_str) != Some("hello") {
            return;
        }
        obj.insert("to".to_string(), Value::String(BROADCAST.to_string()));
        obj.insert("headers".to_string(), Value::Array(Vec::new()));
        obj.insert("payload".to_string(), Value::Null);
    }

    // ---- read loop & dispatch --------------------------------------------

    fn read_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            match self.transport.recv(Duration::from_millis(200)) {
                Ok(Some(raw)) => {
                    let coerced = self.coerce_compat(&raw);
                    match PacketFactory::parse(&coerced) {
                        Ok(packet) => self.handle_packet(packet),
                        Err(err) => {
                            warn!(node = %self.my_id, error = %err, "dropping malformed packet");
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(node = %self.my_id, error = %err, "transport recv error");
                }
            }
        }
    }

    fn handle_packet(&self, packet: Packet) {
        let now = self.now();

        if self.state.is_seen(&packet.msg_id, now) {
            return;
        }
        self.state.mark_seen(&packet.msg_id, now, SEEN_TTL_SEC);

        if packet.seen_cycle(&self.my_id) {
            return;
        }
        if packet.kind != PacketKind::Hello && packet.ttl == 0 {
            return;
        }

        match packet.kind {
            PacketKind::Hello => {
                self.state.touch_hello(&packet.from, now);
            }
            PacketKind::Info => self.handle_info(packet),
            PacketKind::Message => self.handle_message(packet),
        }
    }

    fn handle_info(&self, packet: Packet) {
        match &self.routing {
            Some(routing) => Arc::clone(routing).on_info(packet.from.clone(), packet.payload.clone()),
            None => debug!(node = %self.my_id, from = %packet.from, "info packet ignored, no routing service active"),
        }
        let prev_hop = packet.previous_hop().to_string();
        let relayed = packet
            .with_decremented_ttl()
            .with_appended_hop(self.my_id.clone());
        if relayed.ttl > 0 {
            self.broadcast_to_neighbors(&relayed, Some(&prev_hop));
        }
    }

    fn handle_message(&self, packet: Packet) {
        if packet.to == self.my_id {
            info!(node = %self.my_id, from = %packet.from, "[DELIVERED] message from {}", packet.from);
            return;
        }

        let prev_hop = packet.previous_hop().to_string();
        let relayed = packet
            .with_decremented_ttl()
            .with_appended_hop(self.my_id.clone());
        if relayed.ttl == 0 {
            return;
        }

        let next_hop_channel = self
            .state
            .get_next_hop(&packet.to)
            .and_then(|next_hop| self.neighbor_map.get(&next_hop).cloned());

        match next_hop_channel {
            Some(channel) => self.unicast(&relayed, &channel),
            None => self.broadcast_to_neighbors(&relayed, Some(&prev_hop)),
        }
    }

    fn dispatch_outbound(&self, packet: Packet) {
        if let Some(channel) = self.neighbor_map.get(&packet.to) {
            self.unicast(&packet, channel);
            return;
        }
        if let Some(channel) = self
            .state
            .get_next_hop(&packet.to)
            .and_then(|next_hop| self.neighbor_map.get(&next_hop).cloned())
        {
            self.unicast(&packet, &channel);
            return;
        }
        self.broadcast_to_neighbors(&packet, None);
    }

    fn unicast(&self, packet: &Packet, channel: &str) {
        if let Ok(bytes) = PacketFactory::encode(packet) {
            let _ = self.transport.publish(channel, &bytes);
        }
    }

    fn broadcast_to_neighbors(&self, packet: &Packet, exclude: Option<&str>) {
        let channels: Vec<String> = self
            .neighbor_map
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != exclude)
            .map(|(_, channel)| channel.clone())
            .collect();
        if channels.is_empty() {
            return;
        }
        if let Ok(bytes) = PacketFactory::encode(packet) {
            let _ = self.transport.broadcast(&channels, &bytes);
        }
    }

    // ---- housekeeping -----------------------------------------------------

    fn housekeeping_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs(5));
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            let now = self.now();
            self.state.purge_seen(now);
            for dead in self.state.dead_neighbors(self.cfg.hello_timeout_sec, now) {
                warn!(node = %self.my_id, neighbor = %dead, "neighbor missed its hello timeout");
            }
        }
    }
}

/// Rewrites `{type:"message", from, to, hops}` into an `Info` packet. This
/// is the on-wire shape the link-state advertise path used before packets
/// carried an explicit `kind`; some peers still emit it. The coerced
/// payload is keyed by the legacy packet's own `to` field, i.e.
/// `{type:message,from:X,to:Y,hops:4}` becomes `{type:info,payload:{Y:4}}`.
fn rewrite_legacy_message_as_info(obj: &mut Map<String, Value>) {
    let is_legacy = obj.get("type").and_then(Value::as_str) == Some("message")
        && obj.contains_key("hops")
        && !obj.contains_key("payload");
    if !is_legacy {
        return;
    }
    let neighbor = obj.get("to").and_then(Value::as_str).unwrap_or_default().to_string();
    let hops = obj.remove("hops").unwrap_or(Value::Null);
    obj.insert("type".to_string(), Value::String("info".to_string()));
    obj.insert("to".to_string(), Value::String(BROADCAST.to_string()));
    let mut payload = Map::new();
    payload.insert(neighbor, hops);
    obj.insert("payload".to_string(), Value::Object(payload));
    obj.entry("ttl").or_insert(Value::Number(8.into()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BusRegistry;
    use std::time::Duration as StdDuration;

    fn neighbor_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(id, ch)| (id.to_string(), ch.to_string())).collect()
    }

    #[test]
    fn replaying_the_same_msg_id_is_a_no_op_the_second_time() {
        let registry = BusRegistry::new();
        let bus_a = Arc::new(registry.register("A"));
        let bus_b = registry.register("B");
        let state = Arc::new(State::new("A"));
        let engine = ForwardingEngine::new(
            state,
            bus_a,
            "A",
            neighbor_map(&[("B", "B")]),
            None,
            ForwardingConfig { hello_timeout_sec: 20.0 },
        );

        let packet = Packet::new_message("X", "Z", "hi");
        engine.handle_packet(packet.clone());
        engine.handle_packet(packet);

        assert!(bus_b.recv(StdDuration::from_millis(50)).unwrap().is_some(), "first delivery should relay");
        assert!(bus_b.recv(StdDuration::from_millis(20)).unwrap().is_none(), "replay of the same msg_id must not relay again");
    }

    #[test]
    fn packet_already_carrying_this_node_in_headers_is_dropped() {
        let registry = BusRegistry::new();
        let bus_a = Arc::new(registry.register("A"));
        let state = Arc::new(State::new("A"));
        let engine = ForwardingEngine::new(
            state,
            bus_a,
            "A",
            neighbor_map(&[]),
            None,
            ForwardingConfig { hello_timeout_sec: 20.0 },
        );
        let packet = Packet::new_message("X", "Z", "hi").with_appended_hop("A");
        assert!(packet.seen_cycle("A"));
        engine.handle_packet(packet);
    }

    #[test]
    fn flooding_mode_relays_to_every_neighbor_except_the_previous_hop() {
        let registry = BusRegistry::new();
        let bus_a = Arc::new(registry.register("A"));
        let bus_b = registry.register("B");
        let bus_c = registry.register("C");
        let state = Arc::new(State::new("A"));
        let engine = ForwardingEngine::new(
            state,
            bus_a,
            "A",
            neighbor_map(&[("B", "B"), ("C", "C")]),
            None,
            ForwardingConfig { hello_timeout_sec: 20.0 },
        );

        let packet = Packet::new_message("X", "Z", "hi").with_appended_hop("B");
        engine.handle_packet(packet);

        assert!(bus_c.recv(StdDuration::from_millis(50)).unwrap().is_some());
        assert!(bus_b.recv(StdDuration::from_millis(20)).unwrap().is_none());
    }

    #[test]
    fn message_addressed_to_self_is_delivered_not_relayed() {
        let registry = BusRegistry::new();
        let bus_a = Arc::new(registry.register("A"));
        let bus_b = registry.register("B");
        let state = Arc::new(State::new("A"));
        let engine = ForwardingEngine::new(
            state,
            bus_a,
            "A",
            neighbor_map(&[("B", "B")]),
            None,
            ForwardingConfig { hello_timeout_sec: 20.0 },
        );

        let packet = Packet::new_message("X", "A", "hi");
        engine.handle_packet(packet);
        assert!(bus_b.recv(StdDuration::from_millis(20)).unwrap().is_none());
    }

    #[test]
    fn ttl_zero_drops_message_but_not_hello() {
        let registry = BusRegistry::new();
        let bus_a = Arc::new(registry.register("A"));
        let bus_b = registry.register("B");
        let state = Arc::new(State::new("A"));
        state.set_neighbors(vec![("B".to_string(), 1.0)]);
        let engine = ForwardingEngine::new(
            state.clone(),
            bus_a,
            "A",
            neighbor_map(&[("B", "B")]),
            None,
            ForwardingConfig { hello_timeout_sec: 20.0 },
        );

        let mut dead_on_arrival = Packet::new_message("X", "Z", "hi");
        dead_on_arrival.ttl = 0;
        engine.handle_packet(dead_on_arrival);
        assert!(bus_b.recv(StdDuration::from_millis(20)).unwrap().is_none());

        assert_eq!(state.dead_neighbors(20.0, engine.now()), vec!["B".to_string()], "B hasn't said hello yet");
        let mut hello = Packet::new_hello("B");
        hello.ttl = 0;
        engine.handle_packet(hello);
        assert!(state.dead_neighbors(20.0, engine.now()).is_empty(), "ttl-0 hello is still processed, not dropped");
    }

    #[test]
    fn routed_mode_unicasts_via_the_next_hop_when_known() {
        let registry = BusRegistry::new();
        let bus_a = Arc::new(registry.register("A"));
        let bus_b = registry.register("B");
        let bus_c = registry.register("C");
        let state = Arc::new(State::new("A"));
        state.set_routes(vec![("Z".to_string(), "B".to_string(), 2.0)]);
        let engine = ForwardingEngine::new(
            state,
            bus_a,
            "A",
            neighbor_map(&[("B", "B"), ("C", "C")]),
            Some(Arc::new(NoopRouting) as Arc<dyn RoutingService>),
            ForwardingConfig { hello_timeout_sec: 20.0 },
        );

        let packet = Packet::new_message("X", "Z", "hi");
        engine.handle_packet(packet);

        assert!(bus_b.recv(StdDuration::from_millis(50)).unwrap().is_some());
        assert!(bus_c.recv(StdDuration::from_millis(20)).unwrap().is_none());
    }

    #[test]
    fn routed_mode_falls_back_to_flooding_with_no_route() {
        let registry = BusRegistry::new();
        let bus_a = Arc::new(registry.register("A"));
        let bus_b = registry.register("B");
        let state = Arc::new(State::new("A"));
        let engine = ForwardingEngine::new(
            state,
            bus_a,
            "A",
            neighbor_map(&[("B", "B")]),
            Some(Arc::new(NoopRouting) as Arc<dyn RoutingService>),
            ForwardingConfig { hello_timeout_sec: 20.0 },
        );

        let packet = Packet::new_message("X", "Z", "hi");
        engine.handle_packet(packet);
        assert!(bus_b.recv(StdDuration::from_millis(50)).unwrap().is_some());
    }

    #[test]
    fn legacy_message_with_hops_is_coerced_into_info() {
        let registry = BusRegistry::new();
        let bus_a = Arc::new(registry.register("A"));
        let state = Arc::new(State::new("A"));
        let engine = ForwardingEngine::new(
            state,
            bus_a,
            "A",
            neighbor_map(&[]),
            None,
            ForwardingConfig { hello_timeout_sec: 20.0 },
        );

        let legacy = serde_json::json!({
            "type": "message",
            "from": "X",
            "to": "Y",
            "hops": 4,
        });
        let coerced = engine.coerce_compat(legacy.to_string().as_bytes());
        let parsed = PacketFactory::parse(&coerced).unwrap();
        assert_eq!(parsed.kind, PacketKind::Info);
        assert_eq!(parsed.to, BROADCAST);
        assert_eq!(parsed.payload["Y"], 4);
    }

    #[test]
    fn channel_name_in_from_field_is_rewritten_to_node_id() {
        let registry = BusRegistry::new();
        let bus_a = Arc::new(registry.register("A"));
        let state = Arc::new(State::new("A"));
        let engine = ForwardingEngine::new(
            state,
            bus_a,
            "A",
            neighbor_map(&[("B", "sec10.topo1.B")]),
            None,
            ForwardingConfig { hello_timeout_sec: 20.0 },
        );

        let raw = serde_json::json!({
            "type": "hello",
            "from": "sec10.topo1.B",
            "to": "broadcast",
        });
        let coerced = engine.coerce_compat(raw.to_string().as_bytes());
        let parsed = PacketFactory::parse(&coerced).unwrap();
        assert_eq!(parsed.from, "B");
    }

    struct NoopRouting;
    impl RoutingService for NoopRouting {
        fn start(self: Arc<Self>) {}
        fn stop(&self) {}
        fn on_info(self: Arc<Self>, _origin: String, _payload: Value) {}
    }
}
