use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Game engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Target ticks per second for every lobby's update loop
    pub target_tick_rate: u32,
}

impl EngineConfig {
    /// Duration of one tick at the target rate
    pub fn target_tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_tick_rate.max(1)))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { target_tick_rate: 20 }
    }
}

/// Prefix of the lobby control routes bound by the lobby manager
pub const LOBBY_ROUTE_PREFIX: &str = "lobby";

/// Network engine tuning
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Routes starting with any of these prefixes are buffered until the
    /// next tick boundary instead of being delivered immediately
    pub queued_route_prefixes: Vec<String>,
}

impl NetworkConfig {
    /// Whether messages on `route` wait for a tick boundary
    pub fn is_queued(&self, route: &str) -> bool {
        self.queued_route_prefixes
            .iter()
            .any(|prefix| route.starts_with(prefix.as_str()))
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            queued_route_prefixes: vec!["game/".to_string()],
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Base URL handed to clients asking where to connect
    pub public_base_url: String,
    /// Root directory of the JSON lobby repository
    pub data_dir: PathBuf,
    /// Port of the metrics endpoint
    pub metrics_port: u16,
    /// Maximum number of stored lobbies
    pub max_lobbies: usize,
    /// Static bearer tokens (token -> user id) for the built-in authenticator
    pub auth_tokens: HashMap<String, String>,
    pub engine: EngineConfig,
    pub network: NetworkConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8080,
            public_base_url: "ws://localhost:8080".to_string(),
            data_dir: PathBuf::from("./lobbies"),
            metrics_port: 9090,
            max_lobbies: 1000,
            auth_tokens: HashMap::new(),
            engine: EngineConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(parsed) if parsed > 0 => config.port = parsed,
                Ok(_) => tracing::warn!("PORT must be > 0, using default"),
                Err(_) => tracing::warn!("Invalid PORT '{}', using default", port),
            }
        }

        if let Ok(url) = std::env::var("PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(port) = std::env::var("METRICS_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) if parsed > 0 => config.metrics_port = parsed,
                _ => tracing::warn!("Invalid METRICS_PORT '{}', using default", port),
            }
        }

        if let Ok(max_lobbies) = std::env::var("MAX_LOBBIES") {
            match max_lobbies.parse::<usize>() {
                Ok(parsed) if parsed > 0 => config.max_lobbies = parsed,
                _ => tracing::warn!("Invalid MAX_LOBBIES '{}', using default", max_lobbies),
            }
        }

        if let Ok(rate) = std::env::var("TICK_RATE") {
            match rate.parse::<u32>() {
                Ok(parsed) if (1..=240).contains(&parsed) => {
                    config.engine.target_tick_rate = parsed;
                }
                _ => tracing::warn!("TICK_RATE must be 1-240, using default"),
            }
        }

        if let Ok(prefixes) = std::env::var("QUEUED_ROUTE_PREFIXES") {
            config.network.queued_route_prefixes = parse_list(&prefixes);
        }

        if let Ok(tokens) = std::env::var("AUTH_TOKENS") {
            config.auth_tokens = parse_token_table(&tokens);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0"));
        }
        if self.port == self.metrics_port {
            return Err(ConfigError::Invalid("metrics port must differ from server port"));
        }
        if self.max_lobbies == 0 {
            return Err(ConfigError::Invalid("max_lobbies must be at least 1"));
        }
        if self.engine.target_tick_rate == 0 {
            return Err(ConfigError::Invalid("target_tick_rate must be at least 1"));
        }
        if self
            .network
            .queued_route_prefixes
            .iter()
            .any(|prefix| prefix.is_empty())
        {
            // An empty prefix matches every route, lobby control included.
            return Err(ConfigError::Invalid("queued route prefixes cannot be empty"));
        }
        if self
            .network
            .queued_route_prefixes
            .iter()
            .any(|prefix| queues_lobby_routes(prefix))
        {
            // Lobby control takes the lobby lock and must never run inside a tick
            return Err(ConfigError::Invalid("queued route prefixes cannot match lobby routes"));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Whether `prefix` would queue any `lobby/...` route
fn queues_lobby_routes(prefix: &str) -> bool {
    let lobby_root = format!("{}/", LOBBY_ROUTE_PREFIX);
    lobby_root.starts_with(prefix) || prefix.starts_with(&lobby_root)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_token_table(raw: &str) -> HashMap<String, String> {
    let mut table = HashMap::new();
    for entry in parse_list(raw) {
        match entry.split_once(':') {
            Some((token, user)) if !token.is_empty() && !user.is_empty() => {
                table.insert(token.to_string(), user.to_string());
            }
            _ => tracing::warn!("Ignoring malformed AUTH_TOKENS entry"),
        }
    }
    table
}
