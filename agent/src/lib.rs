//! Agent side of the burrow reverse HTTP tunnel.
//!
//! The agent lives inside the private network. It dials out to the relay's
//! WebSocket endpoint (optionally through a SOCKS5 or HTTP-CONNECT proxy,
//! verifying that routing first), executes the tunnelled requests against a
//! local backend, and reconnects with exponential backoff whenever the link
//! drops.

pub mod agent;
pub mod config;
pub mod handler;
pub mod proxy;
pub mod tunnel;
pub mod verify;
