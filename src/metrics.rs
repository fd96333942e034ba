//! Prometheus-compatible metrics endpoint
//!
//! Exposes lobby and engine counters in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, debug};

/// Metrics registry for the lobby server
#[derive(Debug)]
pub struct Metrics {
    // Lobby counts
    pub lobbies_loaded: AtomicU64,
    pub network_engines_active: AtomicU64,
    pub game_engines_running: AtomicU64,

    // Network stats
    pub clients_connected: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub dispatch_failures: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Server uptime
    start_time: Instant,

    // Rolling tick times across all lobbies
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            lobbies_loaded: AtomicU64::new(0),
            network_engines_active: AtomicU64::new(0),
            game_engines_running: AtomicU64::new(0),
            clients_connected: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(1000)),
        }
    }

    /// Increment a counter
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement a gauge without wrapping below zero
    pub fn decr(gauge: &AtomicU64) {
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > 1000 {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("lobby_server_lobbies_loaded", "Lobbies held by the lobby manager", "gauge",
            self.lobbies_loaded.load(Ordering::Relaxed));
        metric!("lobby_server_network_engines_active", "Lobbies with a live network engine", "gauge",
            self.network_engines_active.load(Ordering::Relaxed));
        metric!("lobby_server_game_engines_running", "Lobbies with a running game engine", "gauge",
            self.game_engines_running.load(Ordering::Relaxed));

        metric!("lobby_server_clients_connected", "Registered clients across all lobbies", "gauge",
            self.clients_connected.load(Ordering::Relaxed));
        metric!("lobby_server_messages_received_total", "Interactions received from clients", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("lobby_server_messages_sent_total", "Events delivered to clients", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("lobby_server_messages_dropped_total", "Events addressed to unknown clients", "counter",
            self.messages_dropped.load(Ordering::Relaxed));
        metric!("lobby_server_dispatch_failures_total", "Handler errors answered to the sender", "counter",
            self.dispatch_failures.load(Ordering::Relaxed));

        metric!("lobby_server_tick_time_microseconds", "Last tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("lobby_server_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("lobby_server_tick_time_max_microseconds", "Maximum tick time in the window", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("lobby_server_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("lobby_server_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "lobbies": {
                "loaded": self.lobbies_loaded.load(Ordering::Relaxed),
                "network_engines": self.network_engines_active.load(Ordering::Relaxed),
                "game_engines": self.game_engines_running.load(Ordering::Relaxed),
            },
            "network": {
                "clients": self.clients_connected.load(Ordering::Relaxed),
                "messages_received": self.messages_received.load(Ordering::Relaxed),
                "messages_sent": self.messages_sent.load(Ordering::Relaxed),
                "messages_dropped": self.messages_dropped.load(Ordering::Relaxed),
                "dispatch_failures": self.dispatch_failures.load(Ordering::Relaxed),
            },
            "ticks": {
                "tick_time_us": self.tick_time_us.load(Ordering::Relaxed),
                "tick_time_p95_us": self.tick_time_p95_us.load(Ordering::Relaxed),
                "tick_time_max_us": self.tick_time_max_us.load(Ordering::Relaxed),
                "tick_count": self.tick_count.load(Ordering::Relaxed),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    // /metrics/json must be checked before the /metrics prefix
                    let response = if request.starts_with("GET /metrics/json") {
                        http_response("200 OK", "application/json", &metrics.to_json())
                    } else if request.starts_with("GET /metrics") {
                        http_response("200 OK", "text/plain; version=0.0.4", &metrics.to_prometheus())
                    } else if request.starts_with("GET /health") {
                        http_response("200 OK", "text/plain", "OK")
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.clients_connected.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tick_time() {
        let metrics = Metrics::new();

        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) > 0);
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_decr_saturates_at_zero() {
        let metrics = Metrics::new();
        Metrics::decr(&metrics.clients_connected);
        assert_eq!(metrics.clients_connected.load(Ordering::Relaxed), 0);

        Metrics::incr(&metrics.clients_connected);
        Metrics::incr(&metrics.clients_connected);
        Metrics::decr(&metrics.clients_connected);
        assert_eq!(metrics.clients_connected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.lobbies_loaded.store(7, Ordering::Relaxed);
        metrics.clients_connected.store(3, Ordering::Relaxed);

        let output = metrics.to_prometheus();

        assert!(output.contains("lobby_server_lobbies_loaded 7"));
        assert!(output.contains("lobby_server_clients_connected 3"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.messages_sent.store(42, Ordering::Relaxed);

        let parsed: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(parsed["network"]["messages_sent"], 42);
        assert!(parsed["lobbies"].is_object());
    }
}
