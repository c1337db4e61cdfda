use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use linkdave_audio::{Source, SourceError};
use linkdave_protocol::{
    Message, NodeDrainingData, Snowflake, StatsData, TrackEndData, TrackEndReason, TrackErrorData,
    TrackInfo, VoiceDisconnectData, OP_NODE_DRAINING, OP_STATS, OP_TRACK_END, OP_TRACK_ERROR,
    OP_VOICE_DISCONNECT,
};
use linkdave_voice::{VoiceEvents, VoiceManager};
use serde::Serialize;

use crate::session::Session;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
    pub uptime_ms: i64,
    pub memory_mb: u64,
    pub num_workers: usize,
}

/// Shared node state: session registries, drain flag, and the event fan-out
/// from the voice manager back to controller sessions.
pub struct NodeServer {
    manager: Arc<VoiceManager>,
    sessions: DashMap<String, Arc<Session>>,
    sessions_by_bot: DashMap<Snowflake, Vec<Arc<Session>>>,
    started_at: Instant,
    draining: AtomicBool,
    version: String,
    system: Mutex<sysinfo::System>,
}

impl NodeServer {
    pub fn new(version: &str, manager: Arc<VoiceManager>) -> Arc<NodeServer> {
        let server = Arc::new(NodeServer {
            manager,
            sessions: DashMap::new(),
            sessions_by_bot: DashMap::new(),
            started_at: Instant::now(),
            draining: AtomicBool::new(false),
            version: version.to_string(),
            system: Mutex::new(sysinfo::System::new()),
        });
        server.manager.set_event_handler(server.clone());
        server
    }

    pub fn manager(&self) -> &Arc<VoiceManager> {
        &self.manager
    }

    /// Broadcast Stats to every session every five seconds.
    pub fn start_stats_ticker(self: &Arc<Self>) {
        let server = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(server) = server.upgrade() else { break };
                let stats = server.stats();
                server.broadcast(Message::new(OP_STATS, &stats));
            }
        });
    }

    pub fn register(&self, session: &Arc<Session>) {
        self.sessions.insert(session.id.clone(), session.clone());
        self.sessions_by_bot
            .entry(session.bot_id())
            .or_default()
            .push(session.clone());
    }

    pub fn unregister(&self, session: &Arc<Session>) {
        self.sessions.remove(&session.id);
        if let Some(mut sessions) = self.sessions_by_bot.get_mut(&session.bot_id()) {
            sessions.retain(|s| s.id != session.id);
            let empty = sessions.is_empty();
            drop(sessions);
            if empty {
                self.sessions_by_bot
                    .remove_if(&session.bot_id(), |_, v| v.is_empty());
            }
        }
    }

    fn sessions_for_bot(&self, bot_id: Snowflake) -> Vec<Arc<Session>> {
        self.sessions_by_bot
            .get(&bot_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn broadcast(&self, msg: Message) {
        for session in self.sessions.iter() {
            session.send(msg.clone());
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn player_count(&self) -> usize {
        self.sessions.iter().map(|s| s.player_count()).sum()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Flip the drain flag and ask every controller to migrate its players.
    /// The binary keeps polling `player_count` until zero or the deadline.
    pub fn drain(&self, reason: &str, deadline_ms: i64) {
        self.draining.store(true, Ordering::Release);
        tracing::info!(reason, deadline_ms, "entering drain mode");
        self.broadcast(Message::new(
            OP_NODE_DRAINING,
            &NodeDrainingData {
                reason: reason.to_string(),
                deadline_ms,
            },
        ));
    }

    pub fn stats(&self) -> StatsData {
        let mut players = 0;
        let mut playing = 0;
        for session in self.sessions.iter() {
            players += session.player_count();
            playing += session.playing_count();
        }

        let (memory_used, memory_alloc, cpu_usage) = self.process_stats();

        StatsData {
            players,
            playing_tracks: playing,
            uptime: self.started_at.elapsed().as_millis() as i64,
            memory_used,
            memory_alloc,
            cpu_usage,
            draining: self.is_draining(),
        }
    }

    pub fn health(&self) -> HealthResponse {
        let (memory_used, _, _) = self.process_stats();
        let num_workers = tokio::runtime::Handle::try_current()
            .map(|h| h.metrics().num_workers())
            .unwrap_or(0);
        HealthResponse {
            status: "ok",
            version: self.version.clone(),
            uptime_ms: self.started_at.elapsed().as_millis() as i64,
            memory_mb: memory_used / 1024 / 1024,
            num_workers,
        }
    }

    fn process_stats(&self) -> (u64, u64, f64) {
        let mut system = self.system.lock().unwrap();
        let pid = sysinfo::Pid::from_u32(std::process::id());
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) => (
                process.memory(),
                process.virtual_memory(),
                process.cpu_usage() as f64,
            ),
            None => (0, 0, 0.0),
        }
    }
}

impl VoiceEvents for NodeServer {
    fn on_track_end(
        &self,
        bot_id: Snowflake,
        guild_id: Snowflake,
        source: Arc<dyn Source>,
        reason: TrackEndReason,
    ) {
        for session in self.sessions_for_bot(bot_id) {
            let Some(player) = session.player(guild_id) else {
                continue;
            };

            // Replaced and stopped players were already re-stated by the
            // command handler that caused them.
            if reason != TrackEndReason::Replaced && reason != TrackEndReason::Stopped {
                player.set_idle();
            }

            session.send(Message::new(
                OP_TRACK_END,
                &TrackEndData {
                    guild_id,
                    track: TrackInfo {
                        url: source.url(),
                        title: None,
                        duration: source.duration_ms(),
                    },
                    reason,
                },
            ));
        }
    }

    fn on_track_exception(
        &self,
        bot_id: Snowflake,
        guild_id: Snowflake,
        source: Arc<dyn Source>,
        error: &SourceError,
    ) {
        for session in self.sessions_for_bot(bot_id) {
            session.send(Message::new(
                OP_TRACK_ERROR,
                &TrackErrorData {
                    guild_id,
                    track: TrackInfo {
                        url: source.url(),
                        title: None,
                        duration: source.duration_ms(),
                    },
                    error: error.to_string(),
                },
            ));
        }
    }

    fn on_voice_disconnected(&self, bot_id: Snowflake, guild_id: Snowflake) {
        for session in self.sessions_for_bot(bot_id) {
            session.remove_player(guild_id);
            session.send(Message::new(
                OP_VOICE_DISCONNECT,
                &VoiceDisconnectData {
                    guild_id,
                    reason: Some("connection_lost".to_string()),
                },
            ));
        }
    }
}
