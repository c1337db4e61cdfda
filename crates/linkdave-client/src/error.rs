use linkdave_protocol::Snowflake;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("node is not connected")]
    NotConnected,
    #[error("no available nodes")]
    NoAvailableNodes,
    #[error("failed to connect to node: {0}")]
    Connect(String),
    #[error("no voice endpoint available")]
    MissingEndpoint,
    #[error("migration handshake timed out")]
    MigrateTimeout,
    #[error("no player for guild {0}")]
    PlayerNotFound(Snowflake),
}
