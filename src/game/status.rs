use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Operational status of a game engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Created,
    Stopped,
    Loading,
    Paused,
    Running,
}

impl EngineStatus {
    /// Whether the engine owns live logic services
    pub fn is_active(&self) -> bool {
        matches!(self, EngineStatus::Loading | EngineStatus::Paused | EngineStatus::Running)
    }
}

/// Route status changes are broadcast on
pub const STATUS_ROUTE: &str = "game/status";

/// Payload of a status broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: EngineStatus,
    pub previous: EngineStatus,
}

/// Called with (new, old) after every status write
pub type StatusObserver = Arc<dyn Fn(EngineStatus, EngineStatus) -> anyhow::Result<()> + Send + Sync>;

/// Status field plus its notify list.
///
/// The field is written first and observers run afterwards without any lock
/// held; an observer error is logged and never rolls the field back.
pub struct StatusCell {
    status: RwLock<EngineStatus>,
    observers: RwLock<Vec<StatusObserver>>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(EngineStatus::Created),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn get(&self) -> EngineStatus {
        *self.status.read()
    }

    pub fn subscribe(&self, observer: StatusObserver) {
        self.observers.write().push(observer);
    }

    /// Write the status and notify. Returns the previous status.
    pub fn set(&self, status: EngineStatus) -> EngineStatus {
        let previous = std::mem::replace(&mut *self.status.write(), status);

        let observers = self.observers.read().clone();
        for observer in observers {
            if let Err(e) = observer(status, previous) {
                warn!("Status observer failed on {:?} -> {:?}: {:#}", previous, status, e);
            }
        }
        previous
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_starts_created() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), EngineStatus::Created);
        assert!(!cell.get().is_active());
    }

    #[test]
    fn test_observers_see_every_transition() {
        let cell = StatusCell::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cell.subscribe(Arc::new(move |new: EngineStatus, old: EngineStatus| -> anyhow::Result<()> {
            sink.lock().push((old, new));
            Ok(())
        }));

        cell.set(EngineStatus::Loading);
        cell.set(EngineStatus::Running);

        assert_eq!(
            *seen.lock(),
            vec![
                (EngineStatus::Created, EngineStatus::Loading),
                (EngineStatus::Loading, EngineStatus::Running),
            ]
        );
    }

    #[test]
    fn test_observer_error_keeps_new_status() {
        let cell = StatusCell::new();
        cell.subscribe(Arc::new(|_: EngineStatus, _: EngineStatus| -> anyhow::Result<()> {
            anyhow::bail!("observer down")
        }));
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        cell.subscribe(Arc::new(move |_: EngineStatus, _: EngineStatus| -> anyhow::Result<()> {
            *flag.lock() = true;
            Ok(())
        }));

        assert_eq!(cell.set(EngineStatus::Running), EngineStatus::Created);
        assert_eq!(cell.get(), EngineStatus::Running);
        assert!(*called.lock());
    }
}
