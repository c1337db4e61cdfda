use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use linkdave_protocol::{PlayData, PlayerStateKind, Snowflake};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::events::{ManagerEvent, NodeEvent};
use crate::node::{NodeClient, NodeOptions};
use crate::player::{GatewaySend, Player};

/// The controller's node pool and per-guild player registry.
///
/// Construct one per bot; feed it raw chat-platform gateway packets via
/// [`Manager::handle_raw`] and consume [`ManagerEvent`]s from the returned
/// receiver.
pub struct Manager {
    user_id: Snowflake,
    node_options: NodeOptions,
    nodes: RwLock<HashMap<String, Arc<NodeClient>>>,
    players: RwLock<HashMap<Snowflake, Arc<Player>>>,
    send_gateway: Arc<GatewaySend>,
    host_tx: mpsc::UnboundedSender<ManagerEvent>,
    node_event_tx: mpsc::UnboundedSender<(String, NodeEvent)>,
}

impl Manager {
    pub fn new(
        user_id: Snowflake,
        node_options: NodeOptions,
        send_gateway: impl Fn(Snowflake, Value) + Send + Sync + 'static,
    ) -> (Arc<Manager>, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (node_event_tx, node_event_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Manager {
            user_id,
            node_options,
            nodes: RwLock::new(HashMap::new()),
            players: RwLock::new(HashMap::new()),
            send_gateway: Arc::new(send_gateway),
            host_tx,
            node_event_tx,
        });

        tokio::spawn(event_loop(Arc::downgrade(&manager), node_event_rx));
        (manager, host_rx)
    }

    /// Register a node and connect to it.
    pub async fn add_node(&self, name: &str, url: &str) -> Result<Arc<NodeClient>, ClientError> {
        let node = NodeClient::new(name, url, self.node_options, self.node_event_tx.clone());
        node.connect(self.user_id).await?;
        self.nodes
            .write()
            .unwrap()
            .insert(name.to_string(), node.clone());
        Ok(node)
    }

    pub fn node(&self, name: &str) -> Option<Arc<NodeClient>> {
        self.nodes.read().unwrap().get(name).cloned()
    }

    /// Lowest-loaded connected, non-draining node; ties fall to iteration
    /// order.
    pub fn best_node(&self, exclude: Option<&str>) -> Result<Arc<NodeClient>, ClientError> {
        let nodes = self.nodes.read().unwrap();
        let mut best: Option<Arc<NodeClient>> = None;
        for node in nodes.values() {
            if Some(node.name.as_str()) == exclude || !node.is_available() {
                continue;
            }
            match &best {
                Some(current) if current.player_count() <= node.player_count() => {}
                _ => best = Some(node.clone()),
            }
        }
        best.ok_or(ClientError::NoAvailableNodes)
    }

    /// The guild's player, created on the best node if it does not exist.
    pub fn get_player(&self, guild_id: Snowflake) -> Result<Arc<Player>, ClientError> {
        if let Some(player) = self.players.read().unwrap().get(&guild_id) {
            return Ok(player.clone());
        }

        let node = self.best_node(None)?;
        let player = Player::new(guild_id, node.clone(), self.send_gateway.clone());

        let mut players = self.players.write().unwrap();
        match players.get(&guild_id) {
            Some(existing) => Ok(existing.clone()),
            None => {
                players.insert(guild_id, player.clone());
                node.increment_players();
                Ok(player)
            }
        }
    }

    pub fn player(&self, guild_id: Snowflake) -> Option<Arc<Player>> {
        self.players.read().unwrap().get(&guild_id).cloned()
    }

    /// Drop a guild's player. No Disconnect is sent to the node; the caller
    /// decides whether to leave the voice channel first.
    pub fn destroy_player(&self, guild_id: Snowflake, reason: &str) {
        let player = self.players.write().unwrap().remove(&guild_id);
        if let Some(player) = player {
            player.node().decrement_players();
            let _ = self.host_tx.send(ManagerEvent::PlayerDestroyed {
                guild_id,
                reason: reason.to_string(),
            });
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.read().unwrap().len()
    }

    /// Feed a raw chat-platform gateway packet. Only our bot's
    /// VOICE_STATE_UPDATE and any VOICE_SERVER_UPDATE matter; everything else
    /// is ignored.
    pub fn handle_raw(&self, packet: &Value) {
        let Some(t) = packet.get("t").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(d) = packet.get("d") else { return };

        match t {
            "VOICE_STATE_UPDATE" => {
                let user_id = d
                    .get("user_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<Snowflake>().ok());
                if user_id != Some(self.user_id) {
                    return;
                }
                let Some(guild_id) = parse_id(d.get("guild_id")) else {
                    return;
                };
                let Some(player) = self.player(guild_id) else {
                    return;
                };
                let channel_id = parse_id(d.get("channel_id"));
                let session_id = d
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if let Err(e) = player.handle_voice_state(channel_id, session_id) {
                    tracing::warn!(guild_id = %guild_id, error = %e, "voice state relay failed");
                }
            }
            "VOICE_SERVER_UPDATE" => {
                let Some(guild_id) = parse_id(d.get("guild_id")) else {
                    return;
                };
                let Some(player) = self.player(guild_id) else {
                    return;
                };
                let Some(token) = d.get("token").and_then(|v| v.as_str()) else {
                    return;
                };
                let endpoint = d
                    .get("endpoint")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                if let Err(e) = player.handle_voice_server(token.to_string(), endpoint) {
                    tracing::warn!(guild_id = %guild_id, error = %e, "voice server relay failed");
                }
            }
            _ => {}
        }
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.host_tx.send(event);
    }

    /// A guild-scoped event is only meaningful when it came from the node the
    /// guild currently routes through.
    fn routed_player(&self, guild_id: Snowflake, node_name: &str) -> Option<Arc<Player>> {
        let player = self.player(guild_id)?;
        (player.node().name == node_name).then_some(player)
    }

    fn handle_node_event(self: &Arc<Self>, node_name: String, event: NodeEvent) {
        match event {
            NodeEvent::Ready(ready) => self.emit(ManagerEvent::NodeReady {
                node: node_name,
                session_id: ready.session_id,
            }),
            NodeEvent::NodeDraining(data) => {
                self.emit(ManagerEvent::NodeDraining {
                    node: node_name.clone(),
                    reason: data.reason,
                    deadline_ms: data.deadline_ms,
                });
                let manager = self.clone();
                tokio::spawn(async move {
                    manager.migrate_away_from(&node_name).await;
                });
            }
            NodeEvent::Closed { code, reason } => self.emit(ManagerEvent::NodeClosed {
                node: node_name,
                code,
                reason,
            }),
            NodeEvent::TrackStart(data) => {
                if let Some(player) = self.routed_player(data.guild_id, &node_name) {
                    player.set_track(Some(data.track.clone()));
                    self.emit(ManagerEvent::TrackStart {
                        node: node_name,
                        data,
                    });
                }
            }
            NodeEvent::TrackEnd(data) => {
                if let Some(player) = self.routed_player(data.guild_id, &node_name) {
                    player.set_track(None);
                    self.emit(ManagerEvent::TrackEnd {
                        node: node_name,
                        data,
                    });
                }
            }
            NodeEvent::TrackError(data) => {
                if self.routed_player(data.guild_id, &node_name).is_some() {
                    self.emit(ManagerEvent::TrackError {
                        node: node_name,
                        data,
                    });
                }
            }
            NodeEvent::PlayerUpdate(data) => {
                if let Some(player) = self.routed_player(data.guild_id, &node_name) {
                    player.record_update(data.clone());
                    self.emit(ManagerEvent::PlayerUpdate {
                        node: node_name,
                        data,
                    });
                }
            }
            NodeEvent::VoiceConnect(data) => {
                if self.routed_player(data.guild_id, &node_name).is_some() {
                    self.emit(ManagerEvent::VoiceConnect {
                        node: node_name,
                        data,
                    });
                }
            }
            NodeEvent::VoiceDisconnect(data) => {
                if self.routed_player(data.guild_id, &node_name).is_some() {
                    self.emit(ManagerEvent::VoiceDisconnect {
                        node: node_name,
                        data,
                    });
                }
            }
            // Stats update the node's cached fields in the client; Pong and
            // uncorrelated MigrateReady frames carry nothing for the host.
            NodeEvent::Stats(_) | NodeEvent::Pong | NodeEvent::MigrateReady(_) => {}
        }
    }

    /// Move every player off a draining node; players with nowhere to go are
    /// destroyed.
    async fn migrate_away_from(self: &Arc<Self>, node_name: &str) {
        let affected: Vec<Arc<Player>> = {
            let players = self.players.read().unwrap();
            players
                .values()
                .filter(|p| p.node().name == node_name)
                .cloned()
                .collect()
        };

        tracing::info!(node = node_name, players = affected.len(), "migrating players off draining node");

        for player in affected {
            let target = match self.best_node(Some(node_name)) {
                Ok(target) => target,
                Err(_) => {
                    tracing::warn!(guild_id = %player.guild_id, "no migration target, destroying player");
                    self.destroy_player(player.guild_id, "no available nodes");
                    continue;
                }
            };
            if let Err(e) = self.move_player(&player, target).await {
                tracing::warn!(guild_id = %player.guild_id, error = %e, "player migration failed");
            }
        }
    }

    /// The migration handshake: snapshot on the old node, re-point, replay
    /// credentials and playback on the new one. The old node is NOT sent a
    /// Disconnect; it tears the voice connection down itself once the new
    /// node takes over.
    async fn move_player(
        &self,
        player: &Arc<Player>,
        target: Arc<NodeClient>,
    ) -> Result<(), ClientError> {
        player.set_migrating(true);
        let old = player.node();

        let snapshot = match old.migrate_player(player.guild_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                player.set_migrating(false);
                return Err(e);
            }
        };

        player.set_node(target.clone());
        old.decrement_players();
        target.increment_players();

        let replay: Result<(), ClientError> = (|| {
            if let Some(update) = player.cached_voice_update() {
                target.voice_update(update)?;
            }
            if snapshot.state == PlayerStateKind::Playing && !snapshot.url.is_empty() {
                target.play(PlayData {
                    guild_id: player.guild_id,
                    url: snapshot.url,
                    start_time: snapshot.position,
                    volume: snapshot.volume,
                })?;
            }
            Ok(())
        })();
        player.set_migrating(false);
        replay?;
        self.emit(ManagerEvent::PlayerMigrated {
            guild_id: player.guild_id,
            from: old.name.clone(),
            to: target.name.clone(),
        });
        tracing::info!(
            guild_id = %player.guild_id,
            from = %old.name,
            to = %target.name,
            "player migrated"
        );
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert_node_for_test(&self, node: Arc<NodeClient>) {
        self.nodes
            .write()
            .unwrap()
            .insert(node.name.clone(), node);
    }
}

async fn event_loop(
    manager: Weak<Manager>,
    mut rx: mpsc::UnboundedReceiver<(String, NodeEvent)>,
) {
    while let Some((node_name, event)) = rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_node_event(node_name, event);
    }
}

fn parse_id(value: Option<&Value>) -> Option<Snowflake> {
    value?.as_str()?.parse().ok()
}
