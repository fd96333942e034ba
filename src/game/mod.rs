pub mod engine;
pub mod presence;
pub mod service;
pub mod status;
pub mod tick;

pub use engine::{EngineError, GameEngine};
pub use presence::PresenceService;
pub use service::{default_service_factory, LogicService, ServiceContext, ServiceFactory};
pub use status::{EngineStatus, StatusChange, StatusObserver, STATUS_ROUTE};
