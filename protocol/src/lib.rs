//! Wire protocol shared by the burrow relay and agent.
//!
//! A tunnel link carries many concurrent HTTP exchanges over one WebSocket
//! connection. Each exchange is a *stream*, identified by a 32-bit id, and
//! everything on the wire is a [`frame::Frame`]: a 9-byte header followed by
//! up to 64 KiB of payload, one frame per binary WebSocket message.
//!
//! Requests and responses travel as JSON ([`message::TunnelledRequest`],
//! [`message::TunnelledResponse`]), fragmented across frames when they
//! exceed the payload cap. Agents authenticate at upgrade time with a
//! time-bounded HMAC token ([`auth`]).

pub mod auth;
pub mod frame;
pub mod message;
