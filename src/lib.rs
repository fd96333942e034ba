//! Lobby Engine Server Library
//!
//! Hosts multiplayer lobbies. Each live lobby owns a network engine that routes
//! client messages to handlers and, once a game starts, a tick-driven game
//! engine running pluggable logic services.

pub mod auth;
pub mod config;
pub mod game;
pub mod lobby;
pub mod metrics;
pub mod net;
