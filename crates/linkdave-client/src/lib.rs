//! Controller-side library: discovers LinkDave nodes, keeps one logical
//! player per guild, relays chat-platform voice credentials, and migrates
//! players away from draining nodes.

mod error;
mod events;
mod manager;
mod node;
mod player;

pub use error::ClientError;
pub use events::{ManagerEvent, NodeEvent};
pub use manager::Manager;
pub use node::{NodeClient, NodeOptions, NodeState};
pub use player::Player;
