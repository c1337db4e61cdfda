//! Voice connections: one per (bot, guild), owning the platform voice socket
//! and the currently playing audio source.
//!
//! The raw voice transport is a seam ([`VoiceSocket`]) so the connection state
//! machine can be driven by the shipped platform gateway in production and by
//! deterministic sockets in tests.

mod connection;
mod error;
mod gateway;
mod manager;
mod socket;
#[cfg(test)]
mod testutil;

pub use connection::VoiceConnection;
pub use error::VoiceError;
pub use gateway::{PlatformSocket, PlatformSocketFactory};
pub use manager::{VoiceEvents, VoiceManager};
pub use socket::{OpusFrameProvider, VoiceSocket, VoiceSocketFactory, VoiceStateUpdate};
