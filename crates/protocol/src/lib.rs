//! devsync Protocol
//!
//! Shared types for communication between the devsync server and clients.
//! These types are serialized as JSON over WebSocket.

pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::{codes, ServerMessage};
pub use types::*;
