//! Per-lobby networking: wire envelope, route dispatch, the network engine
//! and the WebSocket transport feeding it.

pub mod engine;
pub mod protocol;
pub mod routes;
pub mod transport;

pub use engine::{ClientSink, NetworkEngine, NetworkError};
pub use protocol::DispatchMessage;
pub use routes::{bind, Interaction, NetworkEvent, NetworkEventTarget};
