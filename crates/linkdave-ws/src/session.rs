use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use linkdave_protocol::{Message, Snowflake};
use tokio::sync::mpsc;

use crate::player::PlayerState;

/// Outbound frames buffered per session; overflow drops the frame.
const OUTBOUND_QUEUE: usize = 256;

/// One controller WebSocket connection and its per-guild players.
pub struct Session {
    pub id: String,
    pub client_name: String,
    bot_id: Mutex<Option<Snowflake>>,
    identified: AtomicBool,
    tx: mpsc::Sender<Message>,
    players: Mutex<HashMap<Snowflake, Arc<PlayerState>>>,
}

impl Session {
    pub fn new(client_name: String) -> (Arc<Session>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            client_name,
            bot_id: Mutex::new(None),
            identified: AtomicBool::new(false),
            tx,
            players: Mutex::new(HashMap::new()),
        });
        (session, rx)
    }

    /// Non-blocking enqueue; a slow reader loses frames rather than stalling
    /// the producer.
    pub fn send(&self, msg: Message) {
        if self.tx.try_send(msg).is_err() {
            tracing::warn!(session = %self.id, "client send buffer full, dropping message");
        }
    }

    pub fn identify(&self, bot_id: Snowflake) {
        *self.bot_id.lock().unwrap() = Some(bot_id);
        self.identified.store(true, Ordering::Release);
    }

    pub fn is_identified(&self) -> bool {
        self.identified.load(Ordering::Acquire)
    }

    pub fn bot_id(&self) -> Snowflake {
        self.bot_id.lock().unwrap().unwrap_or_default()
    }

    pub fn get_or_create_player(&self, guild_id: Snowflake) -> Arc<PlayerState> {
        let mut players = self.players.lock().unwrap();
        players
            .entry(guild_id)
            .or_insert_with(|| Arc::new(PlayerState::new(guild_id)))
            .clone()
    }

    pub fn player(&self, guild_id: Snowflake) -> Option<Arc<PlayerState>> {
        self.players.lock().unwrap().get(&guild_id).cloned()
    }

    pub fn remove_player(&self, guild_id: Snowflake) {
        self.players.lock().unwrap().remove(&guild_id);
    }

    pub fn player_count(&self) -> usize {
        self.players.lock().unwrap().len()
    }

    pub fn playing_count(&self) -> usize {
        self.players
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.is_playing())
            .count()
    }
}
