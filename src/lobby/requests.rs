//! Request surface over the lobby manager
//!
//! Identity is already verified when these run. Each method checks what the
//! caller may do and turns manager errors into the three rejections clients see.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::manager::{LobbyError, LobbyManager, LobbyUpdate};
use super::record::{GameConfiguration, LobbySnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLobbyRequest {
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub config: GameConfiguration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateLobbyRequest {
    pub name: Option<String>,
    pub is_private: Option<bool>,
    pub config: Option<GameConfiguration>,
}

impl From<UpdateLobbyRequest> for LobbyUpdate {
    fn from(request: UpdateLobbyRequest) -> Self {
        Self {
            name: request.name,
            is_private: request.is_private,
            config: request.config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub url: String,
}

pub struct LobbyRequests {
    manager: Arc<LobbyManager>,
}

impl LobbyRequests {
    pub fn new(manager: Arc<LobbyManager>) -> Self {
        Self { manager }
    }

    pub fn public_lobbies(&self) -> Vec<LobbySnapshot> {
        self.manager.public_lobbies()
    }

    pub fn user_lobbies(&self, user_id: &str, owned_only: bool) -> Vec<LobbySnapshot> {
        self.manager.user_lobbies(user_id, owned_only)
    }

    /// A public lobby, or a private one the caller belongs to
    pub fn get_lobby(&self, user_id: &str, id: Uuid) -> Result<LobbySnapshot, RequestError> {
        let snapshot = self.manager.get_lobby(id)?;
        if snapshot.record.is_private && !snapshot.record.is_member(user_id) {
            return Err(RequestError::Unauthorized);
        }
        Ok(snapshot)
    }

    pub fn create_lobby(&self, user_id: &str, request: CreateLobbyRequest) -> Result<LobbySnapshot, RequestError> {
        Ok(self
            .manager
            .create_lobby(&request.name, request.is_private, user_id, request.config)?)
    }

    pub fn update_lobby(
        &self,
        user_id: &str,
        id: Uuid,
        request: UpdateLobbyRequest,
    ) -> Result<LobbySnapshot, RequestError> {
        self.require_owner(user_id, id)?;
        Ok(self.manager.update_lobby(id, request.into())?)
    }

    pub fn delete_lobby(&self, user_id: &str, id: Uuid) -> Result<(), RequestError> {
        self.require_owner(user_id, id)?;
        Ok(self.manager.delete_lobby(id)?)
    }

    pub fn connection_url(&self, id: Uuid) -> Result<ConnectionInfo, RequestError> {
        Ok(ConnectionInfo {
            url: self.manager.connection_url(id)?,
        })
    }

    fn require_owner(&self, user_id: &str, id: Uuid) -> Result<(), RequestError> {
        if self.manager.get_lobby(id)?.record.is_owner(user_id) {
            Ok(())
        } else {
            Err(RequestError::Unauthorized)
        }
    }
}

/// User-visible request rejections
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Not found")]
    NotFound,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl RequestError {
    /// HTTP status a front end would answer with
    pub fn status_code(&self) -> u16 {
        match self {
            RequestError::NotFound => 404,
            RequestError::Unauthorized => 401,
            RequestError::Conflict(_) => 409,
        }
    }
}

impl From<LobbyError> for RequestError {
    fn from(error: LobbyError) -> Self {
        match error {
            LobbyError::NotFound(_) => RequestError::NotFound,
            LobbyError::JoinRefused | LobbyError::NotOwner => RequestError::Unauthorized,
            other => {
                warn!("Lobby request failed: {}", other);
                RequestError::Conflict(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::lobby::repository::MemoryLobbyRepository;
    use crate::metrics::Metrics;

    fn requests() -> LobbyRequests {
        let config = ServerConfig {
            max_lobbies: 1,
            ..ServerConfig::default()
        };
        let manager = LobbyManager::new(&config, Arc::new(MemoryLobbyRepository::new()), Arc::new(Metrics::new())).unwrap();
        LobbyRequests::new(manager)
    }

    fn create(requests: &LobbyRequests, is_private: bool) -> Uuid {
        requests
            .create_lobby(
                "owner",
                CreateLobbyRequest {
                    name: "room".into(),
                    is_private,
                    config: GameConfiguration::default(),
                },
            )
            .unwrap()
            .record
            .id
    }

    #[test]
    fn test_only_owner_updates_and_deletes() {
        let requests = requests();
        let id = create(&requests, false);
        let rename = UpdateLobbyRequest {
            name: Some("mine".into()),
            ..UpdateLobbyRequest::default()
        };

        assert_eq!(
            requests.update_lobby("intruder", id, rename.clone()).unwrap_err(),
            RequestError::Unauthorized
        );
        assert_eq!(requests.delete_lobby("intruder", id).unwrap_err(), RequestError::Unauthorized);

        assert_eq!(requests.update_lobby("owner", id, rename).unwrap().record.name, "mine");
        requests.delete_lobby("owner", id).unwrap();
        assert_eq!(requests.delete_lobby("owner", id).unwrap_err(), RequestError::NotFound);
    }

    #[test]
    fn test_private_lobby_hidden_from_strangers() {
        let requests = requests();
        let id = create(&requests, true);

        assert_eq!(requests.get_lobby("stranger", id).unwrap_err(), RequestError::Unauthorized);
        assert!(requests.get_lobby("owner", id).is_ok());
        assert!(requests.public_lobbies().is_empty());
        assert_eq!(requests.user_lobbies("owner", true).len(), 1);
    }

    #[test]
    fn test_internal_errors_become_conflicts() {
        let requests = requests();
        create(&requests, false);

        let err = requests
            .create_lobby(
                "owner",
                CreateLobbyRequest {
                    name: "second".into(),
                    is_private: false,
                    config: GameConfiguration::default(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, RequestError::Conflict(_)));
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_connection_url() {
        let requests = requests();
        let id = create(&requests, false);
        let info = requests.connection_url(id).unwrap();
        assert!(info.url.ends_with(&format!("/ws/game/{}", id)));
        assert_eq!(requests.connection_url(Uuid::new_v4()).unwrap_err().status_code(), 404);
    }

    #[test]
    fn test_create_request_defaults() {
        let request: CreateLobbyRequest = serde_json::from_str(r#"{"name":"quick"}"#).unwrap();
        assert!(!request.is_private);
        assert_eq!(request.config, GameConfiguration::default());
    }
}
