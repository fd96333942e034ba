//! In-session roster
//!
//! Tracks which clients are connected while a game runs and pushes the roster
//! on `game/roster` whenever it changes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::game::service::LogicService;
use crate::net::protocol::{CLIENT_CONNECTED, CLIENT_DISCONNECTED};
use crate::net::routes::{bind, Interaction, NetworkEvent, NetworkEventTarget};
use crate::net::NetworkEngine;

/// Route the roster travels on
pub const ROSTER_ROUTE: &str = "game/roster";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub players: Vec<String>,
}

pub struct PresenceService {
    network: Arc<NetworkEngine>,
    players: Mutex<BTreeSet<String>>,
}

impl PresenceService {
    pub fn new(network: Arc<NetworkEngine>) -> Arc<Self> {
        Arc::new(Self {
            network,
            players: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn roster(&self) -> Roster {
        Roster {
            players: self.players.lock().iter().cloned().collect(),
        }
    }

    fn broadcast_roster(&self) -> anyhow::Result<()> {
        self.network.broadcast_message(ROSTER_ROUTE, &self.roster())?;
        Ok(())
    }

    fn on_client_connected(&self, interaction: &Interaction<'_>) -> anyhow::Result<()> {
        if self.players.lock().insert(interaction.sender.to_string()) {
            debug!(lobby = %interaction.lobby_id, player = %interaction.sender, "Player joined session");
            self.broadcast_roster()?;
        }
        Ok(())
    }

    fn on_client_disconnected(&self, interaction: &Interaction<'_>) -> anyhow::Result<()> {
        if self.players.lock().remove(interaction.sender) {
            debug!(lobby = %interaction.lobby_id, player = %interaction.sender, "Player left session");
            self.broadcast_roster()?;
        }
        Ok(())
    }

    fn on_roster_request(&self, interaction: &Interaction<'_>) -> anyhow::Result<()> {
        self.network
            .send_message(ROSTER_ROUTE, interaction.sender, &self.roster(), true)?;
        Ok(())
    }
}

impl NetworkEventTarget for PresenceService {
    fn owner(&self) -> &str {
        "presence"
    }

    fn route_prefixes(&self) -> &[&'static str] {
        &["game"]
    }

    fn network_events(self: Arc<Self>) -> Vec<NetworkEvent> {
        vec![
            NetworkEvent::new(
                "client_connected",
                CLIENT_CONNECTED,
                bind(&self, PresenceService::on_client_connected),
            )
            .ignoring_prefix(),
            NetworkEvent::new(
                "client_disconnected",
                CLIENT_DISCONNECTED,
                bind(&self, PresenceService::on_client_disconnected),
            )
            .ignoring_prefix(),
            NetworkEvent::new("roster", "roster", bind(&self, PresenceService::on_roster_request)),
        ]
    }
}

impl LogicService for PresenceService {
    fn init(&self) -> anyhow::Result<()> {
        // Clients connected before the engine started never produced a
        // client_connected this service could see
        self.players.lock().extend(self.network.connected_clients());
        Ok(())
    }

    fn update(&self, _delta: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    fn exit(&self) -> anyhow::Result<()> {
        self.players.lock().clear();
        Ok(())
    }
}
