//! Chat relays built on two scheduling models.
//!
//! - [`relay`] is a two-party TCP relay: newline-delimited text, one OS thread
//!   per connection, capacity enforced at accept time.
//! - [`chat`] is an open broadcast chat over WebSockets: one text frame per
//!   message, every connection a task on a single-threaded runtime.
//!
//! Both share the same core:
//!
//! - [`registry`] tracks connected peers behind a lock and hands out
//!   snapshots for fan-out.
//! - [`session`] holds the per-connection state machine and input
//!   validation.
//! - [`broadcast`] delivers one message to every peer but the sender,
//!   dropping recipients whose send fails.
//! - [`message`] defines chat messages and the literal notices of each
//!   transport profile.
//!
//! [`relay_client`] and [`chat_client`] are terminal clients for the two
//! servers; [`cli`] and [`config`] turn command-line flags into a
//! [`config::ServerConfig`].

pub mod broadcast;
pub mod chat;
pub mod chat_client;
pub mod cli;
pub mod config;
pub mod message;
pub mod registry;
pub mod relay;
pub mod relay_client;
pub mod session;
