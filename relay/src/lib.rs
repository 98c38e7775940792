//! Relay side of the burrow reverse HTTP tunnel.
//!
//! The relay owns the public listener. Agents connect outbound over
//! WebSocket to a reserved upgrade path and are held in a pool; every other
//! incoming HTTP request is serialised, framed, and dispatched to one of
//! the pooled agent links, and the reply frames are reassembled into the
//! public response.

pub mod config;
pub mod handler;
pub mod pool;
pub mod server;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;
