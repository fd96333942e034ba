//! Lobby data model
//!
//! [`LobbyRecord`] is the persisted part of a lobby. [`Lobby`] wraps it with
//! the runtime state and engine handles that never reach storage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::GameEngine;
use crate::net::NetworkEngine;

const JOIN_CODE_LEN: usize = 6;
const JOIN_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// What happens when the last client leaves a running lobby
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmptyLobbyPolicy {
    /// Keep everything running
    #[default]
    None,
    /// Pause the game engine, if any
    Pause,
    /// Stop both engines
    Shutdown,
}

/// Settings a game engine is started with. Changes apply on the next start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameConfiguration {
    #[serde(default)]
    pub empty_lobby_policy: EmptyLobbyPolicy,
    /// Gameplay parameters, interpreted by logic services
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl GameConfiguration {
    pub fn with_policy(empty_lobby_policy: EmptyLobbyPolicy) -> Self {
        Self {
            empty_lobby_policy,
            ..Self::default()
        }
    }

    /// Typed lookup of a gameplay parameter
    pub fn parameter<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.parameters
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Runtime lifecycle of a lobby
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobbyState {
    /// No engines
    Closed,
    /// Network engine live, no game engine
    Initialized,
    Loading,
    Running,
    Paused,
}

/// Persisted lobby attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyRecord {
    pub id: Uuid,
    pub name: String,
    pub owner_id: String,
    pub is_private: bool,
    pub join_code: String,
    /// Always contains the owner
    pub members: BTreeSet<String>,
    #[serde(default)]
    pub config: GameConfiguration,
}

impl LobbyRecord {
    pub fn new(name: impl Into<String>, is_private: bool, owner_id: impl Into<String>, config: GameConfiguration) -> Self {
        let owner_id = owner_id.into();
        let mut members = BTreeSet::new();
        members.insert(owner_id.clone());

        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner_id,
            is_private,
            join_code: generate_join_code(),
            members,
            config,
        }
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    /// Join policy: members always, otherwise a private lobby wants the owner or the code
    pub fn admits(&self, user_id: &str, code: Option<&str>) -> bool {
        if self.is_member(user_id) || !self.is_private || self.is_owner(user_id) {
            return true;
        }
        code == Some(self.join_code.as_str())
    }

    /// Add a member. Returns false if already present.
    pub fn add_member(&mut self, user_id: &str) -> bool {
        self.members.insert(user_id.to_string())
    }

    /// Remove a non-owner member. Returns false for the owner or a non-member.
    pub fn remove_member(&mut self, user_id: &str) -> bool {
        if self.is_owner(user_id) {
            return false;
        }
        self.members.remove(user_id)
    }
}

/// Six uppercase alphanumerics
pub fn generate_join_code() -> String {
    let mut rng = rand::thread_rng();
    (0..JOIN_CODE_LEN)
        .map(|_| JOIN_CODE_CHARSET[rng.gen_range(0..JOIN_CODE_CHARSET.len())] as char)
        .collect()
}

/// A loaded lobby: record plus runtime handles
#[derive(Debug)]
pub struct Lobby {
    pub record: LobbyRecord,
    pub state: LobbyState,
    pub network: Option<Arc<NetworkEngine>>,
    pub game: Option<Arc<GameEngine>>,
}

impl Lobby {
    /// Wrap a stored record with no engines
    pub fn closed(record: LobbyRecord) -> Self {
        Self {
            record,
            state: LobbyState::Closed,
            network: None,
            game: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            record: self.record.clone(),
            state: self.state,
            connected_clients: self
                .network
                .as_ref()
                .map_or(0, |network| network.connected_client_count()),
        }
    }
}

/// What clients and the request surface see of a lobby
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbySnapshot {
    #[serde(flatten)]
    pub record: LobbyRecord,
    pub state: LobbyState,
    pub connected_clients: usize,
}
