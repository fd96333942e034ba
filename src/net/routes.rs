//! Route registry: route string -> ordered handler bindings
//!
//! Targets declare their handlers explicitly through [`NetworkEventTarget`].
//! A target's route prefixes (most general first) are composed with each
//! handler's own route, so a service under `game` declaring `move` is bound
//! to `game/move`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::net::protocol::{decode_payload, ProtocolError};

/// Handler invoked for every interaction on its bound route
pub type HandlerFn = Arc<dyn Fn(&Interaction<'_>) -> anyhow::Result<()> + Send + Sync>;

/// An inbound message as seen by a handler
#[derive(Debug, Clone, Copy)]
pub struct Interaction<'a> {
    pub lobby_id: Uuid,
    pub route: &'a str,
    /// Authenticated sender (never the id embedded in the frame)
    pub sender: &'a str,
    /// JSON-encoded payload
    pub data: &'a str,
}

impl Interaction<'_> {
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        decode_payload(self.data)
    }
}

/// A handler declaration, before its route is composed with the owner's prefixes
#[derive(Clone)]
pub struct NetworkEvent {
    /// Identifies the handler within its owner; (owner, name) is unique per route
    pub name: &'static str,
    pub route: String,
    /// Bind `route` as-is, without the owner's prefixes
    pub ignore_prefix: bool,
    pub handler: HandlerFn,
}

impl NetworkEvent {
    pub fn new(name: &'static str, route: impl Into<String>, handler: HandlerFn) -> Self {
        Self {
            name,
            route: route.into(),
            ignore_prefix: false,
            handler,
        }
    }

    pub fn ignoring_prefix(mut self) -> Self {
        self.ignore_prefix = true;
        self
    }
}

impl fmt::Debug for NetworkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkEvent")
            .field("name", &self.name)
            .field("route", &self.route)
            .field("ignore_prefix", &self.ignore_prefix)
            .finish()
    }
}

/// Anything that can bind handlers onto a network engine
pub trait NetworkEventTarget: Send + Sync {
    /// Stable identity of this target within one network engine
    fn owner(&self) -> &str;

    /// Route prefixes, most general first
    fn route_prefixes(&self) -> &[&'static str] {
        &[]
    }

    /// Handlers this target wants bound
    fn network_events(self: Arc<Self>) -> Vec<NetworkEvent>;
}

/// Wrap a method-like closure so the handler holds only a weak reference to its target.
///
/// Interactions arriving after the target is dropped are ignored.
pub fn bind<T, F>(target: &Arc<T>, f: F) -> HandlerFn
where
    T: Send + Sync + 'static,
    F: Fn(&T, &Interaction<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let weak: Weak<T> = Arc::downgrade(target);
    Arc::new(move |interaction| match weak.upgrade() {
        Some(target) => f(&target, interaction),
        None => Ok(()),
    })
}

/// Compose a bound route from the owner's prefixes and a handler route.
///
/// Each prefix contributes exactly one trailing '/'; the handler route is
/// stripped of leading and trailing '/'.
pub fn compose_route(prefixes: &[&str], route: &str, ignore_prefix: bool) -> String {
    let mut composed = String::new();
    if !ignore_prefix {
        for prefix in prefixes {
            let segment = prefix.trim_matches('/');
            if segment.is_empty() {
                continue;
            }
            composed.push_str(segment);
            composed.push('/');
        }
    }

    let tail = route.trim_matches('/');
    if tail.is_empty() {
        composed.truncate(composed.trim_end_matches('/').len());
    } else {
        composed.push_str(tail);
    }
    composed
}

/// A handler bound to a composed route
#[derive(Clone)]
pub struct RouteBinding {
    pub owner: String,
    pub name: &'static str,
    pub route: String,
    pub handler: HandlerFn,
}

impl fmt::Debug for RouteBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteBinding")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("route", &self.route)
            .finish()
    }
}

/// Route -> bindings, in registration order
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: HashMap<String, Vec<RouteBinding>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a target's declared events. Returns the number of new bindings.
    pub fn register(&mut self, owner: &str, prefixes: &[&str], events: Vec<NetworkEvent>) -> usize {
        let mut added = 0;
        for event in events {
            let route = compose_route(prefixes, &event.route, event.ignore_prefix);
            let bindings = self.routes.entry(route.clone()).or_default();

            if bindings
                .iter()
                .any(|b| b.owner == owner && b.name == event.name)
            {
                continue;
            }

            bindings.push(RouteBinding {
                owner: owner.to_string(),
                name: event.name,
                route,
                handler: event.handler,
            });
            added += 1;
        }
        added
    }

    /// Remove a target's declared events. Returns the number of removed bindings.
    pub fn unregister(&mut self, owner: &str, prefixes: &[&str], events: &[NetworkEvent]) -> usize {
        let mut removed = 0;
        for event in events {
            let route = compose_route(prefixes, &event.route, event.ignore_prefix);
            let Some(bindings) = self.routes.get_mut(&route) else {
                continue;
            };

            let before = bindings.len();
            bindings.retain(|b| !(b.owner == owner && b.name == event.name));
            removed += before - bindings.len();

            if bindings.is_empty() {
                self.routes.remove(&route);
            }
        }
        removed
    }

    /// Snapshot of the bindings on an exact route
    pub fn bindings_for(&self, route: &str) -> Vec<RouteBinding> {
        self.routes.get(route).cloned().unwrap_or_default()
    }

    pub fn binding_count(&self, route: &str) -> usize {
        self.routes.get(route).map_or(0, Vec::len)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> HandlerFn {
        Arc::new(|_| Ok(()))
    }

    #[test]
    fn test_compose_route() {
        assert_eq!(compose_route(&["game"], "move", false), "game/move");
        assert_eq!(compose_route(&["/game/"], "/move/", false), "game/move");
        assert_eq!(compose_route(&["game", "trains"], "build", false), "game/trains/build");
        assert_eq!(compose_route(&["lobby"], "client_disconnected", true), "client_disconnected");
        assert_eq!(compose_route(&[], "updated", false), "updated");
        assert_eq!(compose_route(&["game"], "", false), "game");
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = RouteRegistry::new();
        let events = vec![NetworkEvent::new("on_move", "move", noop())];

        assert_eq!(registry.register("svc", &["game"], events.clone()), 1);
        assert_eq!(registry.register("svc", &["game"], events), 0);
        assert_eq!(registry.binding_count("game/move"), 1);
    }

    #[test]
    fn test_fan_out_keeps_registration_order() {
        let mut registry = RouteRegistry::new();
        registry.register("a", &["game"], vec![NetworkEvent::new("h", "move", noop())]);
        registry.register("b", &["game"], vec![NetworkEvent::new("h", "move", noop())]);

        let owners: Vec<_> = registry
            .bindings_for("game/move")
            .into_iter()
            .map(|b| b.owner)
            .collect();
        assert_eq!(owners, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_unregister_only_removes_owner() {
        let mut registry = RouteRegistry::new();
        let events = vec![NetworkEvent::new("h", "move", noop())];
        registry.register("a", &["game"], events.clone());
        registry.register("b", &["game"], events.clone());

        assert_eq!(registry.unregister("a", &["game"], &events), 1);
        assert_eq!(registry.binding_count("game/move"), 1);

        assert_eq!(registry.unregister("b", &["game"], &events), 1);
        assert_eq!(registry.route_count(), 0);
    }

    #[test]
    fn test_bind_holds_weak_reference() {
        struct Counter(AtomicUsize);

        let target = Arc::new(Counter(AtomicUsize::new(0)));
        let handler = bind(&target, |t: &Counter, _| {
            t.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let interaction = Interaction {
            lobby_id: Uuid::nil(),
            route: "game/move",
            sender: "u",
            data: "null",
        };
        handler(&interaction).unwrap();
        assert_eq!(target.0.load(Ordering::SeqCst), 1);

        drop(target);
        // Dropped target: handler is a no-op
        assert!(handler(&interaction).is_ok());
    }
}
