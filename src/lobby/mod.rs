//! Lobby records, their storage, and the manager that starts and stops each
//! lobby's engines.

pub mod manager;
pub mod record;
pub mod repository;
pub mod requests;

pub use manager::{LobbyError, LobbyManager, LobbyUpdate};
pub use record::{EmptyLobbyPolicy, GameConfiguration, Lobby, LobbyRecord, LobbySnapshot, LobbyState};
pub use repository::{JsonFileLobbyRepository, LobbyRepository, MemoryLobbyRepository, RepositoryError};
pub use requests::{LobbyRequests, RequestError};
