use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::game::presence::PresenceService;
use crate::lobby::GameConfiguration;
use crate::net::{NetworkEngine, NetworkEventTarget};

/// A pluggable unit of gameplay behaviour driven by the game engine.
///
/// Every hook takes `&self`: handlers bound through [`NetworkEventTarget`]
/// may run on a transport task while the tick loop runs `update`, so a
/// service keeps its mutable state behind its own lock.
pub trait LogicService: NetworkEventTarget {
    /// First pass at startup, before any service has started
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Second pass at startup, after every service has initialized
    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// One tick of game logic
    fn update(&self, delta: Duration) -> anyhow::Result<()>;

    fn pause(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn unpause(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Last hook before the service's bindings are removed
    fn exit(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a factory gets to build a lobby's services from
#[derive(Clone)]
pub struct ServiceContext {
    pub lobby_id: Uuid,
    pub network: Arc<NetworkEngine>,
    pub config: GameConfiguration,
}

/// Builds the services for one game engine run, in update order
pub type ServiceFactory = Arc<dyn Fn(&ServiceContext) -> Vec<Arc<dyn LogicService>> + Send + Sync>;

/// Services every lobby gets unless the server is built with its own factory
pub fn default_service_factory() -> ServiceFactory {
    Arc::new(|ctx: &ServiceContext| -> Vec<Arc<dyn LogicService>> {
        let presence: Arc<dyn LogicService> = PresenceService::new(Arc::clone(&ctx.network));
        vec![presence]
    })
}
