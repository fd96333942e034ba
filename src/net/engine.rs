//! Per-lobby network engine
//!
//! Tracks connected clients, routes inbound interactions to bound handlers and
//! delivers outbound events. Messages on queued routes wait in one of two
//! queues until the game engine drains them at a tick boundary; everything
//! else is delivered synchronously inside the call that produced it.
//!
//! Every table sits behind its own lock and no lock is held while a handler or
//! a client sink runs, so handlers may freely send, broadcast or register.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::metrics::Metrics;
use crate::net::protocol::{
    self, encode_payload, DispatchMessage, ProtocolError, CLIENT_CONNECTED, CLIENT_DISCONNECTED,
};
use crate::net::routes::{Interaction, NetworkEventTarget, RouteRegistry};

/// Outbound half of one client connection
pub trait ClientSink: Send + Sync {
    /// Queue a text frame for the client
    fn send(&self, frame: String);

    /// Disconnect the client with a human readable reason
    fn close(&self, reason: &str);
}

/// Per-lobby duplex message bus
pub struct NetworkEngine {
    lobby_id: Uuid,
    config: NetworkConfig,
    metrics: Arc<Metrics>,
    clients: Mutex<HashMap<String, Arc<dyn ClientSink>>>,
    routes: Mutex<RouteRegistry>,
    /// Client -> server, drained before logic update
    interactions: Mutex<VecDeque<DispatchMessage>>,
    /// Server -> client, drained after logic update
    events: Mutex<VecDeque<DispatchMessage>>,
    /// Set by shutdown while it holds the client table; refuses later registrations
    shut_down: AtomicBool,
}

impl NetworkEngine {
    pub fn new(lobby_id: Uuid, config: NetworkConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            lobby_id,
            config,
            metrics,
            clients: Mutex::new(HashMap::new()),
            routes: Mutex::new(RouteRegistry::new()),
            interactions: Mutex::new(VecDeque::new()),
            events: Mutex::new(VecDeque::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn lobby_id(&self) -> Uuid {
        self.lobby_id
    }

    // ------------------------------------------------------------------
    // Game engine hooks
    // ------------------------------------------------------------------

    /// Bind every logic service's handlers
    pub fn start<T: NetworkEventTarget + ?Sized>(&self, targets: &[Arc<T>]) {
        for target in targets {
            self.register_network_events(Arc::clone(target));
        }
    }

    /// Unbind every logic service's handlers
    pub fn exit<T: NetworkEventTarget + ?Sized>(&self, targets: &[Arc<T>]) {
        for target in targets {
            self.unregister_network_events(Arc::clone(target));
        }
    }

    /// Dispatch queued interactions, including any queued while draining
    pub fn interactions_update(&self, delta: Duration) {
        let mut processed = 0usize;
        loop {
            // Pop under the lock, dispatch without it
            let next = self.interactions.lock().pop_front();
            let Some(message) = next else { break };
            self.dispatch(&message);
            processed += 1;
        }
        if processed > 0 {
            trace!(lobby = %self.lobby_id, processed, ?delta, "Drained interactions");
        }
    }

    /// Deliver queued events, including any queued while draining
    pub fn events_update(&self, delta: Duration) {
        let mut processed = 0usize;
        loop {
            let next = self.events.lock().pop_front();
            let Some(message) = next else { break };
            self.deliver(&message);
            processed += 1;
        }
        if processed > 0 {
            trace!(lobby = %self.lobby_id, processed, ?delta, "Drained events");
        }
    }

    /// Drop every binding and queued message, then disconnect every client
    pub fn shutdown(&self, message: &str) {
        self.routes.lock().clear();
        self.interactions.lock().clear();
        self.events.lock().clear();

        let clients: Vec<_> = {
            let mut clients = self.clients.lock();
            self.shut_down.store(true, Ordering::SeqCst);
            clients.drain().collect()
        };
        for (client_id, sink) in &clients {
            debug!(lobby = %self.lobby_id, client = %client_id, "Disconnecting client");
            sink.close(message);
            Metrics::decr(&self.metrics.clients_connected);
        }

        info!(
            lobby = %self.lobby_id,
            disconnected = clients.len(),
            "Network engine shut down: {}", message
        );
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send a payload to one client. Unknown recipients are dropped.
    pub fn send_message<T: Serialize + ?Sized>(
        &self,
        route: &str,
        recipient: &str,
        payload: &T,
        is_success: bool,
    ) -> Result<(), NetworkError> {
        let message = DispatchMessage::new(route, recipient, encode_payload(payload)?);
        self.post_event(if is_success { message } else { message.failed() });
        Ok(())
    }

    /// Send the same payload to several clients
    pub fn send_message_to<T, S>(&self, route: &str, recipients: &[S], payload: &T) -> Result<(), NetworkError>
    where
        T: Serialize + ?Sized,
        S: AsRef<str>,
    {
        let data = encode_payload(payload)?;
        for recipient in recipients {
            self.post_event(DispatchMessage::new(route, recipient.as_ref(), data.clone()));
        }
        Ok(())
    }

    /// Send a payload to every client registered at the time of the call
    pub fn broadcast_message<T: Serialize + ?Sized>(&self, route: &str, payload: &T) -> Result<(), NetworkError> {
        let recipients = self.connected_clients();
        self.send_message_to(route, &recipients, payload)
    }

    fn post_event(&self, message: DispatchMessage) {
        if self.config.is_queued(&message.route) {
            self.events.lock().push_back(message);
        } else {
            self.deliver(&message);
        }
    }

    fn deliver(&self, message: &DispatchMessage) {
        let sink = self.clients.lock().get(&message.user_id).cloned();
        let Some(sink) = sink else {
            // Connect/disconnect races make this routine
            debug!(
                lobby = %self.lobby_id,
                route = %message.route,
                recipient = %message.user_id,
                "Dropping event for unknown client"
            );
            Metrics::incr(&self.metrics.messages_dropped);
            return;
        };

        match protocol::encode(message) {
            Ok(frame) => {
                sink.send(frame);
                Metrics::incr(&self.metrics.messages_sent);
            }
            Err(e) => warn!(lobby = %self.lobby_id, route = %message.route, "Failed to encode event: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Accept a raw frame from an authenticated client
    pub fn receive_message(&self, sender_id: &str, raw: &str) -> Result<(), NetworkError> {
        Metrics::incr(&self.metrics.messages_received);

        let mut message = protocol::decode(raw)?;
        // The transport authenticated the sender; the embedded id is never trusted
        message.user_id = sender_id.to_string();

        if self.config.is_queued(&message.route) {
            self.interactions.lock().push_back(message);
        } else {
            self.dispatch(&message);
        }
        Ok(())
    }

    fn dispatch(&self, message: &DispatchMessage) {
        let bindings = self.routes.lock().bindings_for(&message.route);
        if bindings.is_empty() {
            debug!(lobby = %self.lobby_id, route = %message.route, "No handlers bound for route");
            return;
        }

        let interaction = Interaction {
            lobby_id: self.lobby_id,
            route: &message.route,
            sender: &message.user_id,
            data: &message.data,
        };

        for binding in bindings {
            if let Err(e) = (binding.handler)(&interaction) {
                let text = e.to_string();
                warn!(
                    lobby = %self.lobby_id,
                    route = %message.route,
                    owner = %binding.owner,
                    handler = binding.name,
                    "Handler failed: {}", text
                );
                Metrics::incr(&self.metrics.dispatch_failures);

                if let Err(e) = self.send_message(&message.route, &message.user_id, &text, false) {
                    warn!(lobby = %self.lobby_id, "Failed to report handler error: {}", e);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    /// Register a client. Returns false if the id is already registered or
    /// the engine has shut down.
    pub fn register_client(&self, client_id: &str, sink: Arc<dyn ClientSink>) -> bool {
        {
            let mut clients = self.clients.lock();
            if self.shut_down.load(Ordering::SeqCst) || clients.contains_key(client_id) {
                return false;
            }
            clients.insert(client_id.to_string(), sink);
        }
        Metrics::incr(&self.metrics.clients_connected);
        info!(lobby = %self.lobby_id, client = %client_id, "Client registered");

        self.announce(CLIENT_CONNECTED, client_id);
        true
    }

    /// Unregister a client. Returns false if the id was not registered.
    pub fn unregister_client(&self, client_id: &str) -> bool {
        if self.clients.lock().remove(client_id).is_none() {
            return false;
        }
        Metrics::decr(&self.metrics.clients_connected);
        info!(lobby = %self.lobby_id, client = %client_id, "Client unregistered");

        self.announce(CLIENT_DISCONNECTED, client_id);
        true
    }

    /// Broadcast a membership change and dispatch it immediately, whatever the tick phase
    fn announce(&self, route: &str, client_id: &str) {
        if let Err(e) = self.broadcast_message(route, client_id) {
            warn!(lobby = %self.lobby_id, route, "Failed to broadcast: {}", e);
        }

        match encode_payload(client_id) {
            Ok(data) => self.dispatch(&DispatchMessage::new(route, client_id, data)),
            Err(e) => warn!(lobby = %self.lobby_id, route, "Failed to encode client id: {}", e),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.clients.lock().keys().cloned().collect()
    }

    pub fn connected_client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.clients.lock().contains_key(client_id)
    }

    // ------------------------------------------------------------------
    // Route registration
    // ------------------------------------------------------------------

    /// Bind a target's declared handlers. Re-registering is a no-op.
    pub fn register_network_events<T: NetworkEventTarget + ?Sized>(&self, target: Arc<T>) {
        let owner = target.owner().to_string();
        let prefixes = target.route_prefixes().to_vec();
        let events = target.network_events();

        let added = self.routes.lock().register(&owner, &prefixes, events);
        debug!(lobby = %self.lobby_id, owner = %owner, added, "Registered network events");
    }

    /// Remove a target's declared handlers
    pub fn unregister_network_events<T: NetworkEventTarget + ?Sized>(&self, target: Arc<T>) {
        let owner = target.owner().to_string();
        let prefixes = target.route_prefixes().to_vec();
        let events = target.network_events();

        let removed = self.routes.lock().unregister(&owner, &prefixes, &events);
        debug!(lobby = %self.lobby_id, owner = %owner, removed, "Unregistered network events");
    }

    pub fn binding_count(&self, route: &str) -> usize {
        self.routes.lock().binding_count(route)
    }

    pub fn pending_interactions(&self) -> usize {
        self.interactions.lock().len()
    }

    pub fn pending_events(&self) -> usize {
        self.events.lock().len()
    }
}

impl fmt::Debug for NetworkEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkEngine")
            .field("lobby_id", &self.lobby_id)
            .field("clients", &self.connected_client_count())
            .finish()
    }
}

/// Network engine errors
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::net::routes::{bind, NetworkEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> Arc<NetworkEngine> {
        NetworkEngine::new(Uuid::new_v4(), NetworkConfig::default(), Arc::new(Metrics::new()))
    }

    fn frame(route: &str, data: &str) -> String {
        protocol::encode(&DispatchMessage::new(route, "spoofed", data.to_string())).unwrap()
    }

    /// Counts calls per route and optionally fails
    struct Probe {
        calls: Mutex<Vec<(String, String)>>,
        fail_on: Option<&'static str>,
    }

    impl Probe {
        fn new(fail_on: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(Vec::new()), fail_on })
        }

        fn calls_on(&self, route: &str) -> usize {
            self.calls.lock().iter().filter(|(r, _)| r == route).count()
        }

        fn record(&self, interaction: &Interaction<'_>) -> anyhow::Result<()> {
            self.calls
                .lock()
                .push((interaction.route.to_string(), interaction.sender.to_string()));
            if self.fail_on == Some(interaction.route) {
                anyhow::bail!("illegal move");
            }
            Ok(())
        }
    }

    impl NetworkEventTarget for Probe {
        fn owner(&self) -> &str {
            "probe"
        }

        fn route_prefixes(&self) -> &[&'static str] {
            &["game"]
        }

        fn network_events(self: Arc<Self>) -> Vec<NetworkEvent> {
            vec![
                NetworkEvent::new("on_move", "move", bind(&self, Probe::record)),
                NetworkEvent::new("on_chat", "/chat/", bind(&self, Probe::record)),
                NetworkEvent::new("on_connect", CLIENT_CONNECTED, bind(&self, Probe::record)).ignoring_prefix(),
                NetworkEvent::new("on_lobby", "lobby/ping", bind(&self, Probe::record)).ignoring_prefix(),
            ]
        }
    }

    #[test]
    fn test_register_client_broadcasts_and_dispatches() {
        let engine = engine();
        let probe = Probe::new(None);
        engine.register_network_events(probe.clone());

        let sink = RecordingSink::new();
        assert!(engine.register_client("u1", sink.clone()));

        // Sole client receives its own announcement
        let announced = sink.on_route(CLIENT_CONNECTED);
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].payload::<String>().unwrap(), "u1");

        // Synthetic interaction reached the handler without a tick
        assert_eq!(probe.calls_on(CLIENT_CONNECTED), 1);
        assert_eq!(engine.connected_client_count(), 1);
    }

    #[test]
    fn test_register_client_twice_is_noop() {
        let engine = engine();
        let probe = Probe::new(None);
        engine.register_network_events(probe.clone());

        assert!(engine.register_client("u1", RecordingSink::new()));
        assert!(!engine.register_client("u1", RecordingSink::new()));
        assert_eq!(probe.calls_on(CLIENT_CONNECTED), 1);
    }

    #[test]
    fn test_unregister_client_notifies_remaining() {
        let engine = engine();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        engine.register_client("a", a.clone());
        engine.register_client("b", b.clone());

        assert!(engine.unregister_client("b"));
        assert!(!engine.unregister_client("b"));

        let left = a.on_route(CLIENT_DISCONNECTED);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].payload::<String>().unwrap(), "b");
        assert!(b.on_route(CLIENT_DISCONNECTED).is_empty());
    }

    #[test]
    fn test_double_registration_delivers_once() {
        let engine = engine();
        let probe = Probe::new(None);
        engine.register_network_events(probe.clone());
        engine.register_network_events(probe.clone());

        engine.register_client("u1", RecordingSink::new());
        engine.receive_message("u1", &frame("lobby/ping", "null")).unwrap();

        assert_eq!(probe.calls_on("lobby/ping"), 1);
    }

    #[test]
    fn test_queued_interactions_wait_for_drain() {
        let engine = engine();
        let probe = Probe::new(None);
        engine.register_network_events(probe.clone());

        engine.receive_message("u1", &frame("game/move", "{}")).unwrap();
        assert_eq!(probe.calls_on("game/move"), 0);
        assert_eq!(engine.pending_interactions(), 1);

        engine.interactions_update(Duration::from_millis(50));
        assert_eq!(probe.calls_on("game/move"), 1);
        assert_eq!(engine.pending_interactions(), 0);
    }

    #[test]
    fn test_unqueued_interactions_dispatch_immediately() {
        let engine = engine();
        let probe = Probe::new(None);
        engine.register_network_events(probe.clone());

        engine.receive_message("u1", &frame("lobby/ping", "null")).unwrap();
        assert_eq!(probe.calls_on("lobby/ping"), 1);
    }

    #[test]
    fn test_sender_is_overwritten() {
        let engine = engine();
        let probe = Probe::new(None);
        engine.register_network_events(probe.clone());

        engine.receive_message("real-user", &frame("lobby/ping", "null")).unwrap();
        let calls = probe.calls.lock().clone();
        assert_eq!(calls, vec![("lobby/ping".to_string(), "real-user".to_string())]);
    }

    #[test]
    fn test_composed_routes() {
        let engine = engine();
        engine.register_network_events(Probe::new(None));

        assert_eq!(engine.binding_count("game/move"), 1);
        assert_eq!(engine.binding_count("game/chat"), 1);
        assert_eq!(engine.binding_count(CLIENT_CONNECTED), 1);
        assert_eq!(engine.binding_count("game/client_connected"), 0);
    }

    #[test]
    fn test_queued_events_wait_for_drain() {
        let engine = engine();
        let sink = RecordingSink::new();
        engine.register_client("u1", sink.clone());

        engine.send_message("game/state", "u1", &42, true).unwrap();
        assert!(sink.on_route("game/state").is_empty());
        assert_eq!(engine.pending_events(), 1);

        engine.events_update(Duration::ZERO);
        let delivered = sink.on_route("game/state");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload::<i32>().unwrap(), 42);
    }

    #[test]
    fn test_unqueued_events_deliver_immediately() {
        let engine = engine();
        let sink = RecordingSink::new();
        engine.register_client("u1", sink.clone());

        engine.send_message("lobby/info", "u1", "hello", true).unwrap();
        assert_eq!(sink.on_route("lobby/info").len(), 1);
    }

    #[test]
    fn test_unknown_recipient_is_dropped() {
        let engine = engine();
        assert!(engine.send_message("lobby/info", "ghost", "hello", true).is_ok());
        assert_eq!(engine.metrics.messages_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_send_to_many() {
        let engine = engine();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        engine.register_client("a", a.clone());
        engine.register_client("b", b.clone());

        engine.send_message_to("lobby/info", &["a", "b", "ghost"], "hi").unwrap();
        assert_eq!(a.on_route("lobby/info").len(), 1);
        assert_eq!(b.on_route("lobby/info").len(), 1);
    }

    #[test]
    fn test_broadcast_uses_snapshot_at_call_time() {
        let engine = engine();
        let a = RecordingSink::new();
        engine.register_client("a", a.clone());

        engine.broadcast_message("game/tick", &1).unwrap();
        // Joins before the drain but after the broadcast
        let late = RecordingSink::new();
        engine.register_client("late", late.clone());
        engine.events_update(Duration::ZERO);

        assert_eq!(a.on_route("game/tick").len(), 1);
        assert!(late.on_route("game/tick").is_empty());
    }

    #[test]
    fn test_handler_error_answers_sender() {
        let engine = engine();
        let probe = Probe::new(Some("lobby/ping"));
        engine.register_network_events(probe.clone());

        let sink = RecordingSink::new();
        engine.register_client("u1", sink.clone());
        engine.receive_message("u1", &frame("lobby/ping", "null")).unwrap();

        let replies = sink.on_route("lobby/ping");
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].is_success);
        assert_eq!(replies[0].payload::<String>().unwrap(), "illegal move");
    }

    #[test]
    fn test_handler_error_does_not_stop_other_handlers() {
        struct Second(AtomicUsize);

        impl NetworkEventTarget for Second {
            fn owner(&self) -> &str {
                "second"
            }

            fn network_events(self: Arc<Self>) -> Vec<NetworkEvent> {
                vec![NetworkEvent::new(
                    "count",
                    "lobby/ping",
                    bind(&self, |s: &Second, _| {
                        s.0.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )]
            }
        }

        let engine = engine();
        engine.register_network_events(Probe::new(Some("lobby/ping")));
        let second = Arc::new(Second(AtomicUsize::new(0)));
        engine.register_network_events(second.clone());

        engine.receive_message("u1", &frame("lobby/ping", "null")).unwrap();
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queued_handler_error_replies_at_events_drain() {
        let engine = engine();
        let probe = Probe::new(Some("game/move"));
        engine.register_network_events(probe.clone());
        let sink = RecordingSink::new();
        engine.register_client("u1", sink.clone());

        engine.receive_message("u1", &frame("lobby/ping", "null")).unwrap();
        engine.receive_message("u1", &frame("game/move", "{}")).unwrap();
        engine.interactions_update(Duration::ZERO);

        // Failure reply rides the queued route, so it waits for the events drain
        assert!(sink.on_route("game/move").is_empty());
        assert_eq!(engine.pending_events(), 1);

        engine.events_update(Duration::ZERO);
        let replies = sink.on_route("game/move");
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].is_success);
        assert_eq!(replies[0].payload::<String>().unwrap(), "illegal move");

        // Handlers on other routes are untouched
        assert_eq!(probe.calls_on("lobby/ping"), 1);
        assert!(sink.on_route("lobby/ping").is_empty());
        assert_eq!(engine.metrics.dispatch_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_register_after_shutdown_is_refused() {
        let engine = engine();
        engine.register_client("u1", RecordingSink::new());
        engine.shutdown("lobby closed");
        assert!(engine.is_shut_down());

        let late = RecordingSink::new();
        assert!(!engine.register_client("u2", late.clone()));
        assert_eq!(engine.connected_client_count(), 0);
        assert!(late.messages().is_empty());
    }

    #[test]
    fn test_events_drain_to_fixpoint() {
        /// Re-queues one follow-up event while the first is being delivered
        struct Relay {
            engine: Arc<NetworkEngine>,
            fired: AtomicUsize,
        }

        impl ClientSink for Relay {
            fn send(&self, frame: String) {
                let message = protocol::decode(&frame).unwrap();
                if message.route == "game/first" && self.fired.fetch_add(1, Ordering::SeqCst) == 0 {
                    self.engine.send_message("game/second", "u1", &2, true).unwrap();
                }
            }

            fn close(&self, _reason: &str) {}
        }

        let engine = engine();
        let recorder = RecordingSink::new();
        engine.register_client("u1", recorder.clone());
        let relay = Arc::new(Relay { engine: engine.clone(), fired: AtomicUsize::new(0) });
        engine.register_client("relay", relay.clone());

        engine.send_message("game/first", "relay", &1, true).unwrap();
        engine.events_update(Duration::ZERO);

        // Follow-up queued during the drain was delivered by the same drain
        assert_eq!(recorder.on_route("game/second").len(), 1);
        assert_eq!(engine.pending_events(), 0);
    }

    #[test]
    fn test_interactions_drain_to_fixpoint() {
        struct Chain {
            engine: Arc<NetworkEngine>,
            seen: AtomicUsize,
        }

        impl NetworkEventTarget for Chain {
            fn owner(&self) -> &str {
                "chain"
            }

            fn route_prefixes(&self) -> &[&'static str] {
                &["game"]
            }

            fn network_events(self: Arc<Self>) -> Vec<NetworkEvent> {
                vec![NetworkEvent::new(
                    "step",
                    "step",
                    bind(&self, |c: &Chain, i| {
                        if c.seen.fetch_add(1, Ordering::SeqCst) == 0 {
                            c.engine.receive_message(i.sender, &frame("game/step", "null"))?;
                        }
                        Ok(())
                    }),
                )]
            }
        }

        let engine = engine();
        let chain = Arc::new(Chain { engine: engine.clone(), seen: AtomicUsize::new(0) });
        engine.register_network_events(chain.clone());

        engine.receive_message("u1", &frame("game/step", "null")).unwrap();
        engine.interactions_update(Duration::ZERO);

        assert_eq!(chain.seen.load(Ordering::SeqCst), 2);
        assert_eq!(engine.pending_interactions(), 0);
    }

    #[test]
    fn test_unregister_network_events() {
        let engine = engine();
        let probe = Probe::new(None);
        engine.register_network_events(probe.clone());
        engine.unregister_network_events(probe.clone());

        engine.receive_message("u1", &frame("lobby/ping", "null")).unwrap();
        assert_eq!(probe.calls_on("lobby/ping"), 0);
        assert_eq!(engine.binding_count("game/move"), 0);
    }

    #[test]
    fn test_receive_rejects_malformed_frame() {
        let engine = engine();
        assert!(matches!(
            engine.receive_message("u1", "{oops"),
            Err(NetworkError::Protocol(ProtocolError::Decode(_)))
        ));
    }

    #[test]
    fn test_shutdown_clears_bindings_and_closes_clients() {
        let engine = engine();
        let probe = Probe::new(None);
        engine.register_network_events(probe.clone());
        let sink = RecordingSink::new();
        engine.register_client("u1", sink.clone());
        engine.send_message("game/state", "u1", &1, true).unwrap();

        engine.shutdown("lobby deleted");

        assert_eq!(sink.closed_with().as_deref(), Some("lobby deleted"));
        assert_eq!(engine.connected_client_count(), 0);
        assert_eq!(engine.pending_events(), 0);
        assert_eq!(engine.binding_count("game/move"), 0);
        // Transport's late unregister is a no-op
        assert!(!engine.unregister_client("u1"));
    }
}
