//! # Bifrost Server
//!
//! Reverse-tunnel server core: accepts agent control connections on the
//! backend port, binds one public TCP listener per tunnel mapping, and
//! relays end-user streams to the agents as newline-delimited JSON frames.
//!
//! The admin plane (REST API, persistence, UI) is a separate collaborator
//! that drives [`registry::TunnelRegistry`] and is not part of this crate.

pub mod backend;
pub mod codec;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod state;
