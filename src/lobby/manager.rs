use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, NetworkConfig, ServerConfig, LOBBY_ROUTE_PREFIX};
use crate::game::{
    default_service_factory, EngineError, EngineStatus, GameEngine, ServiceFactory, StatusChange,
    STATUS_ROUTE,
};
use crate::lobby::record::{EmptyLobbyPolicy, GameConfiguration, Lobby, LobbyRecord, LobbySnapshot, LobbyState};
use crate::lobby::repository::{LobbyRepository, RepositoryError};
use crate::metrics::Metrics;
use crate::net::protocol::{CLIENT_DISCONNECTED, LOBBY_UPDATED};
use crate::net::routes::{bind, Interaction, NetworkEvent, NetworkEventTarget};
use crate::net::{ClientSink, NetworkEngine, NetworkError};

const EMPTY_LOBBY_MESSAGE: &str = "Lobby closed: no players left";
const SERVER_SHUTDOWN_MESSAGE: &str = "Server shutting down";
const LOBBY_DELETED_MESSAGE: &str = "Lobby deleted";
/// Registrations lost to a concurrent lobby shutdown before giving up
const CONNECT_ATTEMPTS: usize = 3;

/// Mutable lobby attributes; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct LobbyUpdate {
    pub name: Option<String>,
    pub is_private: Option<bool>,
    /// Applies the next time the game engine starts
    pub config: Option<GameConfiguration>,
}

/// Owns every lobby record and orchestrates each lobby's engine pair.
///
/// Lobbies are independent: each sits behind its own mutex and the map lock is
/// only held to look a lobby up. Engine calls for a lobby happen under that
/// lobby's mutex, never under the map lock.
pub struct LobbyManager {
    lobbies: RwLock<HashMap<Uuid, Arc<Mutex<Lobby>>>>,
    repository: Arc<dyn LobbyRepository>,
    metrics: Arc<Metrics>,
    services: ServiceFactory,
    engine_config: EngineConfig,
    network_config: NetworkConfig,
    public_base_url: String,
    max_lobbies: usize,
    /// Registered on each network engine to observe disconnects and lobby commands
    self_ref: Weak<LobbyManager>,
}

impl LobbyManager {
    /// Create a manager with the bundled logic services, loading every stored lobby as Closed
    pub fn new(
        config: &ServerConfig,
        repository: Arc<dyn LobbyRepository>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, LobbyError> {
        Self::with_services(config, repository, metrics, default_service_factory())
    }

    pub fn with_services(
        config: &ServerConfig,
        repository: Arc<dyn LobbyRepository>,
        metrics: Arc<Metrics>,
        services: ServiceFactory,
    ) -> Result<Arc<Self>, LobbyError> {
        let stored = repository.enumerate()?;
        let lobbies: HashMap<_, _> = stored
            .into_iter()
            .map(|record| (record.id, Arc::new(Mutex::new(Lobby::closed(record)))))
            .collect();

        metrics
            .lobbies_loaded
            .store(lobbies.len() as u64, std::sync::atomic::Ordering::Relaxed);
        info!("Loaded {} stored lobbies", lobbies.len());

        Ok(Arc::new_cyclic(|self_ref| Self {
            lobbies: RwLock::new(lobbies),
            repository,
            metrics,
            services,
            engine_config: config.engine.clone(),
            network_config: config.network.clone(),
            public_base_url: config.public_base_url.clone(),
            max_lobbies: config.max_lobbies,
            self_ref: self_ref.clone(),
        }))
    }

    fn lobby(&self, id: Uuid) -> Result<Arc<Mutex<Lobby>>, LobbyError> {
        self.lobbies
            .read()
            .get(&id)
            .cloned()
            .ok_or(LobbyError::NotFound(id))
    }

    fn all_lobbies(&self) -> Vec<Arc<Mutex<Lobby>>> {
        self.lobbies.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Create a lobby owned by `owner_id`. The owner is its only member and it starts Closed.
    pub fn create_lobby(
        &self,
        name: &str,
        is_private: bool,
        owner_id: &str,
        config: GameConfiguration,
    ) -> Result<LobbySnapshot, LobbyError> {
        let mut lobbies = self.lobbies.write();
        if lobbies.len() >= self.max_lobbies {
            return Err(LobbyError::TooManyLobbies);
        }

        let record = LobbyRecord::new(name, is_private, owner_id, config);
        self.repository.save(&record)?;

        let lobby = Lobby::closed(record);
        let snapshot = lobby.snapshot();
        lobbies.insert(lobby.id(), Arc::new(Mutex::new(lobby)));
        Metrics::incr(&self.metrics.lobbies_loaded);

        info!(lobby = %snapshot.record.id, owner = %owner_id, "Lobby '{}' created", name);
        Ok(snapshot)
    }

    pub fn get_lobby(&self, id: Uuid) -> Result<LobbySnapshot, LobbyError> {
        Ok(self.lobby(id)?.lock().snapshot())
    }

    pub fn public_lobbies(&self) -> Vec<LobbySnapshot> {
        self.collect_snapshots(|record| !record.is_private)
    }

    /// Lobbies `user_id` belongs to, or only those it owns
    pub fn user_lobbies(&self, user_id: &str, owned_only: bool) -> Vec<LobbySnapshot> {
        self.collect_snapshots(|record| {
            if owned_only {
                record.is_owner(user_id)
            } else {
                record.is_member(user_id)
            }
        })
    }

    fn collect_snapshots(&self, filter: impl Fn(&LobbyRecord) -> bool) -> Vec<LobbySnapshot> {
        let mut snapshots: Vec<_> = self
            .all_lobbies()
            .iter()
            .filter_map(|lobby| {
                let lobby = lobby.lock();
                filter(&lobby.record).then(|| lobby.snapshot())
            })
            .collect();
        snapshots.sort_by(|a, b| a.record.name.cmp(&b.record.name).then(a.record.id.cmp(&b.record.id)));
        snapshots
    }

    pub fn update_lobby(&self, id: Uuid, update: LobbyUpdate) -> Result<LobbySnapshot, LobbyError> {
        let lobby = self.lobby(id)?;
        let mut lobby = lobby.lock();

        let previous = lobby.record.clone();
        if let Some(name) = update.name {
            lobby.record.name = name;
        }
        if let Some(is_private) = update.is_private {
            lobby.record.is_private = is_private;
        }
        if let Some(config) = update.config {
            lobby.record.config = config;
        }

        if let Err(e) = self.repository.save(&lobby.record) {
            lobby.record = previous;
            return Err(e.into());
        }
        self.broadcast_update(&lobby);
        Ok(lobby.snapshot())
    }

    /// Add a member. Returns false if `user_id` already was one.
    pub fn add_lobby_player(&self, id: Uuid, user_id: &str) -> Result<bool, LobbyError> {
        let lobby = self.lobby(id)?;
        let mut lobby = lobby.lock();
        self.add_member_locked(&mut lobby, user_id)
    }

    fn add_member_locked(&self, lobby: &mut Lobby, user_id: &str) -> Result<bool, LobbyError> {
        if !lobby.record.add_member(user_id) {
            return Ok(false);
        }
        if let Err(e) = self.repository.save(&lobby.record) {
            lobby.record.members.remove(user_id);
            return Err(e.into());
        }

        debug!(lobby = %lobby.id(), user = %user_id, "Member added");
        self.broadcast_update(lobby);
        Ok(true)
    }

    /// Remove a member. The owner cannot leave its own lobby.
    pub fn remove_lobby_player(&self, id: Uuid, user_id: &str) -> Result<bool, LobbyError> {
        let lobby = self.lobby(id)?;
        let mut lobby = lobby.lock();

        if lobby.record.is_owner(user_id) {
            return Err(LobbyError::OwnerCannotLeave);
        }
        if !lobby.record.remove_member(user_id) {
            return Ok(false);
        }
        if let Err(e) = self.repository.save(&lobby.record) {
            lobby.record.add_member(user_id);
            return Err(e.into());
        }

        self.broadcast_update(&lobby);
        Ok(true)
    }

    /// Stop both engines, then drop the lobby from storage
    pub fn delete_lobby(&self, id: Uuid) -> Result<(), LobbyError> {
        let lobby = self.lobby(id)?;
        {
            let mut lobby = lobby.lock();
            self.full_shutdown_locked(&mut lobby, LOBBY_DELETED_MESSAGE)?;
            self.repository.delete(id)?;
        }

        if self.lobbies.write().remove(&id).is_some() {
            Metrics::decr(&self.metrics.lobbies_loaded);
        }
        info!(lobby = %id, "Lobby deleted");
        Ok(())
    }

    /// Where clients connect to join `id`
    pub fn connection_url(&self, id: Uuid) -> Result<String, LobbyError> {
        self.lobby(id)?;
        Ok(format!("{}/ws/game/{}", self.public_base_url, id))
    }

    pub fn lobby_count(&self) -> usize {
        self.lobbies.read().len()
    }

    /// The live network engine of `id`, if any
    pub fn network_engine(&self, id: Uuid) -> Result<Option<Arc<NetworkEngine>>, LobbyError> {
        Ok(self.lobby(id)?.lock().network.clone())
    }

    // ------------------------------------------------------------------
    // Network engine
    // ------------------------------------------------------------------

    /// Bring up the lobby's network engine. A no-op if one is live.
    pub fn start_lobby(&self, id: Uuid) -> Result<Arc<NetworkEngine>, LobbyError> {
        let lobby = self.lobby(id)?;
        let mut lobby = lobby.lock();
        Ok(self.start_lobby_locked(&mut lobby))
    }

    fn start_lobby_locked(&self, lobby: &mut Lobby) -> Arc<NetworkEngine> {
        if let Some(network) = &lobby.network {
            return Arc::clone(network);
        }

        let network = NetworkEngine::new(lobby.id(), self.network_config.clone(), Arc::clone(&self.metrics));
        lobby.network = Some(Arc::clone(&network));
        lobby.state = LobbyState::Initialized;

        if let Some(manager) = self.self_ref.upgrade() {
            network.register_network_events(manager);
        }
        Metrics::incr(&self.metrics.network_engines_active);
        info!(lobby = %lobby.id(), "Network engine started");

        self.persist_logged(lobby);
        self.broadcast_update(lobby);
        network
    }

    /// Admit a client and register it on the lobby's network engine.
    ///
    /// Join policy runs first: a refused user never touches an engine and
    /// never becomes a member. If the lobby shuts down between admission and
    /// registration, the client is admitted again on a fresh engine.
    pub fn connect_client(
        &self,
        id: Uuid,
        user_id: &str,
        code: Option<&str>,
        sink: Arc<dyn ClientSink>,
    ) -> Result<Arc<NetworkEngine>, LobbyError> {
        let lobby = self.lobby(id)?;

        for _ in 0..CONNECT_ATTEMPTS {
            let network = {
                let mut lobby = lobby.lock();
                if !lobby.record.admits(user_id, code) {
                    warn!(lobby = %id, user = %user_id, "Join refused: bad join code");
                    return Err(LobbyError::JoinRefused);
                }

                self.add_member_locked(&mut lobby, user_id)?;
                self.start_lobby_locked(&mut lobby)
            };

            // Outside the lobby lock: registration dispatches client_connected
            if network.register_client(user_id, Arc::clone(&sink)) {
                return Ok(network);
            }
            if !network.is_shut_down() {
                return Err(LobbyError::AlreadyConnected(user_id.to_string()));
            }
            debug!(lobby = %id, user = %user_id, "Lobby shut down during connect, retrying");
        }

        Err(LobbyError::Unavailable(id))
    }

    // ------------------------------------------------------------------
    // Game engine
    // ------------------------------------------------------------------

    /// Start the game engine, bringing up the network engine first if needed.
    /// A no-op if the engine is already active.
    pub fn start_engine(&self, id: Uuid) -> Result<(), LobbyError> {
        let lobby = self.lobby(id)?;
        let mut lobby = lobby.lock();
        self.start_engine_locked(&mut lobby)
    }

    fn start_engine_locked(&self, lobby: &mut Lobby) -> Result<(), LobbyError> {
        if lobby.game.as_ref().is_some_and(|game| game.status().is_active()) {
            return Ok(());
        }

        let network = self.start_lobby_locked(lobby);
        lobby.state = LobbyState::Loading;

        let game = GameEngine::new(lobby.id(), self.engine_config.clone(), Arc::clone(&self.metrics));
        let status_network = Arc::downgrade(&network);
        game.subscribe(Arc::new(move |status: EngineStatus, previous: EngineStatus| -> anyhow::Result<()> {
            if let Some(network) = status_network.upgrade() {
                network.broadcast_message(STATUS_ROUTE, &StatusChange { status, previous })?;
            }
            Ok(())
        }));

        if let Err(e) = game.start(network, lobby.record.config.clone(), &self.services) {
            warn!(lobby = %lobby.id(), "Game engine failed to start: {}", e);
            lobby.game = None;
            lobby.state = LobbyState::Initialized;
            self.broadcast_update(lobby);
            return Err(e.into());
        }

        lobby.game = Some(game);
        lobby.state = LobbyState::Running;
        self.persist_logged(lobby);
        self.broadcast_update(lobby);
        Ok(())
    }

    pub fn pause_engine(&self, id: Uuid) -> Result<(), LobbyError> {
        let lobby = self.lobby(id)?;
        let mut lobby = lobby.lock();
        let game = lobby.game.clone().ok_or(LobbyError::EngineNotRunning(id))?;

        game.pause()?;
        lobby.state = LobbyState::Paused;
        self.broadcast_update(&lobby);
        Ok(())
    }

    pub fn unpause_engine(&self, id: Uuid) -> Result<(), LobbyError> {
        let lobby = self.lobby(id)?;
        let mut lobby = lobby.lock();
        let game = lobby.game.clone().ok_or(LobbyError::EngineNotRunning(id))?;

        lobby.state = LobbyState::Loading;
        if let Err(e) = game.unpause() {
            lobby.state = LobbyState::Paused;
            return Err(e.into());
        }
        lobby.state = LobbyState::Running;
        self.broadcast_update(&lobby);
        Ok(())
    }

    /// Stop the game engine. The network engine and its clients stay.
    pub fn shutdown_engine(&self, id: Uuid) -> Result<(), LobbyError> {
        let lobby = self.lobby(id)?;
        let mut lobby = lobby.lock();
        self.shutdown_engine_locked(&mut lobby);
        Ok(())
    }

    fn shutdown_engine_locked(&self, lobby: &mut Lobby) {
        if let Some(game) = lobby.game.take() {
            game.shutdown();
        }
        lobby.state = if lobby.network.is_some() {
            LobbyState::Initialized
        } else {
            LobbyState::Closed
        };
        self.persist_logged(lobby);
        self.broadcast_update(lobby);
    }

    /// Stop and start the game engine, picking up a changed configuration
    pub fn restart_engine(&self, id: Uuid) -> Result<(), LobbyError> {
        let lobby = self.lobby(id)?;
        let mut lobby = lobby.lock();
        self.shutdown_engine_locked(&mut lobby);
        self.start_engine_locked(&mut lobby)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop both engines and disconnect every client
    fn full_shutdown_locked(&self, lobby: &mut Lobby, message: &str) -> Result<(), LobbyError> {
        if lobby.network.is_none() && lobby.game.is_none() {
            return Ok(());
        }

        if let Some(game) = lobby.game.take() {
            game.shutdown();
        }
        if let Some(network) = lobby.network.take() {
            network.shutdown(message);
            Metrics::decr(&self.metrics.network_engines_active);
        }
        lobby.state = LobbyState::Closed;

        info!(lobby = %lobby.id(), "Lobby shut down: {}", message);
        self.repository.save(&lobby.record)?;
        self.broadcast_update(lobby);
        Ok(())
    }

    /// Shut every lobby down. A failing lobby is logged and the rest still stop.
    pub fn shutdown_all(&self) {
        let lobbies = self.all_lobbies();
        info!("Shutting down {} lobbies", lobbies.len());

        for lobby in lobbies {
            let mut lobby = lobby.lock();
            if let Err(e) = self.full_shutdown_locked(&mut lobby, SERVER_SHUTDOWN_MESSAGE) {
                warn!(lobby = %lobby.id(), "Failed to shut lobby down: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn persist_logged(&self, lobby: &Lobby) {
        if let Err(e) = self.repository.save(&lobby.record) {
            warn!(lobby = %lobby.id(), "Failed to persist lobby: {}", e);
        }
    }

    /// Send the lobby to its clients. Offline lobbies have nobody to tell.
    fn broadcast_update(&self, lobby: &Lobby) {
        let Some(network) = &lobby.network else {
            return;
        };
        if let Err(e) = network.broadcast_message(LOBBY_UPDATED, &lobby.snapshot()) {
            warn!(lobby = %lobby.id(), "Failed to broadcast lobby update: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Route handlers
    // ------------------------------------------------------------------

    fn on_client_disconnected(&self, interaction: &Interaction<'_>) -> anyhow::Result<()> {
        let lobby = self.lobby(interaction.lobby_id)?;
        let mut lobby = lobby.lock();

        let Some(network) = lobby.network.clone() else {
            return Ok(());
        };
        if network.connected_client_count() > 0 {
            return Ok(());
        }

        match lobby.record.config.empty_lobby_policy {
            EmptyLobbyPolicy::None => {}
            EmptyLobbyPolicy::Pause => {
                if let Some(game) = lobby.game.clone() {
                    game.pause()?;
                    lobby.state = LobbyState::Paused;
                    debug!(lobby = %lobby.id(), "Last client left, game paused");
                }
            }
            EmptyLobbyPolicy::Shutdown => {
                self.full_shutdown_locked(&mut lobby, EMPTY_LOBBY_MESSAGE)?;
            }
        }
        Ok(())
    }

    /// Run a lobby command on behalf of its owner
    fn owner_command(
        &self,
        interaction: &Interaction<'_>,
        command: impl FnOnce(&Self, Uuid) -> Result<(), LobbyError>,
    ) -> anyhow::Result<()> {
        let lobby = self.lobby(interaction.lobby_id)?;
        if !lobby.lock().record.is_owner(interaction.sender) {
            return Err(LobbyError::NotOwner.into());
        }
        command(self, interaction.lobby_id)?;
        Ok(())
    }

    fn on_start(&self, interaction: &Interaction<'_>) -> anyhow::Result<()> {
        self.owner_command(interaction, Self::start_engine)
    }

    fn on_pause(&self, interaction: &Interaction<'_>) -> anyhow::Result<()> {
        self.owner_command(interaction, Self::pause_engine)
    }

    fn on_unpause(&self, interaction: &Interaction<'_>) -> anyhow::Result<()> {
        self.owner_command(interaction, Self::unpause_engine)
    }

    fn on_stop(&self, interaction: &Interaction<'_>) -> anyhow::Result<()> {
        self.owner_command(interaction, Self::shutdown_engine)
    }
}

impl NetworkEventTarget for LobbyManager {
    fn owner(&self) -> &str {
        "lobby-manager"
    }

    fn route_prefixes(&self) -> &[&'static str] {
        &[LOBBY_ROUTE_PREFIX]
    }

    fn network_events(self: Arc<Self>) -> Vec<NetworkEvent> {
        vec![
            NetworkEvent::new(
                "client_disconnected",
                CLIENT_DISCONNECTED,
                bind(&self, LobbyManager::on_client_disconnected),
            )
            .ignoring_prefix(),
            NetworkEvent::new("start", "start", bind(&self, LobbyManager::on_start)),
            NetworkEvent::new("pause", "pause", bind(&self, LobbyManager::on_pause)),
            NetworkEvent::new("unpause", "unpause", bind(&self, LobbyManager::on_unpause)),
            NetworkEvent::new("stop", "stop", bind(&self, LobbyManager::on_stop)),
        ]
    }
}

/// Lobby manager errors
#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    #[error("Lobby {0} not found")]
    NotFound(Uuid),
    #[error("Too many lobbies")]
    TooManyLobbies,
    #[error("Wrong join code")]
    JoinRefused,
    #[error("Only the lobby owner can do that")]
    NotOwner,
    #[error("The owner cannot leave its own lobby")]
    OwnerCannotLeave,
    #[error("User {0} is already connected")]
    AlreadyConnected(String),
    #[error("Lobby {0} kept shutting down while connecting")]
    Unavailable(Uuid),
    #[error("Lobby {0} has no game engine")]
    EngineNotRunning(Uuid),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Storage error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}
