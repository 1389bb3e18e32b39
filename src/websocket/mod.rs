//! WebSocket module for BuddyBot server
//!
//! This module handles WebSocket upgrades and the per-connection read and
//! write pumps that sit between a socket and the hub.

mod connection;
mod server;

pub use connection::{decode_inbound, Connection, WsStream};
pub use server::{user_id_from_uri, WebSocketServer};
