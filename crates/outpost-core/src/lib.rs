//! Core building blocks for the outpost endpoint agent.
//!
//! This crate holds everything the agent binary composes at runtime: the
//! crypto primitives facade, the wire records, the secure session layer,
//! the bounded message queues, the on-disk configuration, and the
//! supervisor contract. Nothing in here spawns threads or opens sockets;
//! the agent wires these pieces together.

pub mod compress;
pub mod config;
pub mod crypto;
pub mod nanny;
pub mod queue;
pub mod session;
pub mod wire;

#[cfg(test)]
mod testutil;
