use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use linkdave_protocol::*;
use serde::de::DeserializeOwned;

use crate::server::NodeServer;
use crate::session::Session;

const WRITE_WAIT: Duration = Duration::from_secs(10);
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping a little before the read deadline would expire.
const PING_PERIOD: Duration = Duration::from_millis(PONG_WAIT.as_millis() as u64 * 9 / 10);
const VOICE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn handle_connection(
    socket: WebSocket,
    server: Arc<NodeServer>,
    client_name: String,
) {
    let (session, mut outbound_rx) = Session::new(client_name);
    tracing::info!(
        session = %session.id,
        client = %session.client_name,
        "client connected"
    );

    let (mut sender, mut receiver) = socket.split();

    let mut ping_interval = tokio::time::interval(PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.tick().await;

    let read_deadline = tokio::time::sleep(PONG_WAIT);
    tokio::pin!(read_deadline);

    let disconnect_reason = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        dispatch(&server, &session, text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        read_deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + PONG_WAIT);
                    }
                    Some(Ok(WsMessage::Close(_))) => break "client close frame".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("websocket receive error: {e}"),
                    None => break "websocket stream ended".to_string(),
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(msg) = outbound else {
                    break "outbound queue closed".to_string();
                };
                let Ok(text) = serde_json::to_string(&msg) else {
                    continue;
                };
                match tokio::time::timeout(WRITE_WAIT, sender.send(WsMessage::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break format!("websocket send error: {e}"),
                    Err(_) => break "websocket write deadline exceeded".to_string(),
                }
            }
            _ = ping_interval.tick() => {
                let ping = WsMessage::Ping(Vec::new().into());
                match tokio::time::timeout(WRITE_WAIT, sender.send(ping)).await {
                    Ok(Ok(())) => {}
                    _ => break "websocket ping send error".to_string(),
                }
            }
            () = &mut read_deadline => break "read deadline exceeded".to_string(),
        }
    };

    server.unregister(&session);
    tracing::info!(
        session = %session.id,
        reason = %disconnect_reason,
        "client disconnected"
    );
}

fn decode<T: DeserializeOwned>(op: u8, d: Option<serde_json::Value>) -> Option<T> {
    let Some(value) = d else {
        tracing::warn!(op, "message missing payload");
        return None;
    };
    match serde_json::from_value(value) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(op, error = %e, "failed to decode payload");
            None
        }
    }
}

async fn dispatch(server: &Arc<NodeServer>, session: &Arc<Session>, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(session = %session.id, error = %e, "failed to parse message");
            return;
        }
    };

    match msg.op {
        OP_IDENTIFY => {
            if let Some(identify) = decode::<IdentifyData>(msg.op, msg.d) {
                handle_identify(server, session, identify);
            }
        }
        OP_VOICE_UPDATE => {
            if let Some(update) = decode::<VoiceUpdateData>(msg.op, msg.d) {
                handle_voice_update(server, session, update).await;
            }
        }
        OP_PLAY => {
            if let Some(play) = decode::<PlayData>(msg.op, msg.d) {
                handle_play(server, session, play);
            }
        }
        OP_PAUSE => {
            if let Some(guild) = decode::<GuildData>(msg.op, msg.d) {
                handle_pause(server, session, guild.guild_id);
            }
        }
        OP_RESUME => {
            if let Some(guild) = decode::<GuildData>(msg.op, msg.d) {
                handle_resume(server, session, guild.guild_id);
            }
        }
        OP_STOP => {
            if let Some(guild) = decode::<GuildData>(msg.op, msg.d) {
                handle_stop(server, session, guild.guild_id);
            }
        }
        OP_SEEK => {
            if let Some(seek) = decode::<SeekData>(msg.op, msg.d) {
                handle_seek(server, session, seek);
            }
        }
        OP_DISCONNECT => {
            if let Some(guild) = decode::<GuildData>(msg.op, msg.d) {
                handle_disconnect(server, session, guild.guild_id);
            }
        }
        OP_PING => session.send(Message::empty(OP_PONG)),
        OP_VOLUME => {
            if let Some(volume) = decode::<VolumeData>(msg.op, msg.d) {
                handle_volume(server, session, volume);
            }
        }
        OP_PLAYER_MIGRATE => {
            if let Some(guild) = decode::<GuildData>(msg.op, msg.d) {
                handle_player_migrate(session, guild.guild_id);
            }
        }
        op => tracing::warn!(session = %session.id, op, "unknown op code"),
    }
}

fn handle_identify(server: &Arc<NodeServer>, session: &Arc<Session>, identify: IdentifyData) {
    session.identify(identify.bot_id);
    server.register(session);

    tracing::info!(
        session = %session.id,
        bot_id = %identify.bot_id,
        "client identified"
    );

    session.send(Message::new(
        OP_READY,
        &ReadyData {
            session_id: session.id.clone(),
            resumed: false,
        },
    ));
}

async fn handle_voice_update(
    server: &Arc<NodeServer>,
    session: &Arc<Session>,
    update: VoiceUpdateData,
) {
    tracing::info!(
        guild_id = %update.guild_id,
        channel_id = %update.channel_id,
        "voice update received"
    );

    let player = session.get_or_create_player(update.guild_id);

    let result = server
        .manager()
        .connect(
            session.bot_id(),
            update.guild_id,
            update.channel_id,
            update.session_id,
            update.event,
            VOICE_CONNECT_TIMEOUT,
        )
        .await;

    if let Err(e) = result {
        tracing::error!(guild_id = %update.guild_id, error = %e, "failed to connect to voice");
        session.send(Message::new(
            OP_TRACK_ERROR,
            &TrackErrorData {
                guild_id: update.guild_id,
                track: TrackInfo::default(),
                error: format!("failed to connect to voice: {e}"),
            },
        ));
        return;
    }

    player.set_channel_id(update.channel_id);

    session.send(Message::new(
        OP_VOICE_CONNECT,
        &VoiceConnectData {
            guild_id: update.guild_id,
            channel_id: update.channel_id,
        },
    ));
}

fn handle_play(server: &Arc<NodeServer>, session: &Arc<Session>, play: PlayData) {
    let player = session.get_or_create_player(play.guild_id);
    if play.volume > 0 {
        player.set_volume(play.volume);
    }

    tracing::info!(guild_id = %play.guild_id, url = %play.url, "play requested");

    // Source construction fetches over the network; report failures over the
    // socket instead of stalling the pump.
    let server = server.clone();
    let session = session.clone();
    tokio::spawn(async move {
        let result = server
            .manager()
            .play(session.bot_id(), play.guild_id, &play.url, play.start_time)
            .await;

        let source = match result {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(guild_id = %play.guild_id, error = %e, "playback failed");
                session.send(Message::new(
                    OP_TRACK_ERROR,
                    &TrackErrorData {
                        guild_id: play.guild_id,
                        track: TrackInfo {
                            url: play.url.clone(),
                            ..TrackInfo::default()
                        },
                        error: e.to_string(),
                    },
                ));
                return;
            }
        };

        player.set_playing(&play.url, play.start_time);

        session.send(Message::new(
            OP_TRACK_START,
            &TrackStartData {
                guild_id: play.guild_id,
                track: TrackInfo {
                    url: source.url(),
                    title: None,
                    duration: source.duration_ms(),
                },
            },
        ));

        send_player_update(&session, play.guild_id, &player);
    });
}

fn send_player_update(session: &Arc<Session>, guild_id: Snowflake, player: &crate::PlayerState) {
    let (state, position, volume) = player.update_data();
    session.send(Message::new(
        OP_PLAYER_UPDATE,
        &PlayerUpdateData {
            guild_id,
            state,
            position,
            volume,
        },
    ));
}

fn handle_pause(server: &Arc<NodeServer>, session: &Arc<Session>, guild_id: Snowflake) {
    let Some(player) = session.player(guild_id) else {
        return;
    };

    if let Err(e) = server.manager().pause(session.bot_id(), guild_id) {
        tracing::error!(guild_id = %guild_id, error = %e, "failed to pause");
        return;
    }

    player.set_paused(server.manager().position(session.bot_id(), guild_id));
    send_player_update(session, guild_id, &player);
}

fn handle_resume(server: &Arc<NodeServer>, session: &Arc<Session>, guild_id: Snowflake) {
    let Some(player) = session.player(guild_id) else {
        return;
    };

    if let Err(e) = server.manager().resume(session.bot_id(), guild_id) {
        tracing::error!(guild_id = %guild_id, error = %e, "failed to resume");
        return;
    }

    player.set_resumed(server.manager().position(session.bot_id(), guild_id));
    send_player_update(session, guild_id, &player);
}

fn handle_stop(server: &Arc<NodeServer>, session: &Arc<Session>, guild_id: Snowflake) {
    let Some(player) = session.player(guild_id) else {
        return;
    };

    if let Err(e) = server.manager().stop(session.bot_id(), guild_id) {
        tracing::error!(guild_id = %guild_id, error = %e, "failed to stop");
        return;
    }

    player.set_idle();
    send_player_update(session, guild_id, &player);
}

fn handle_seek(server: &Arc<NodeServer>, session: &Arc<Session>, seek: SeekData) {
    let Some(player) = session.player(seek.guild_id) else {
        return;
    };

    if let Err(e) = server
        .manager()
        .seek(session.bot_id(), seek.guild_id, seek.position)
    {
        tracing::error!(guild_id = %seek.guild_id, error = %e, "failed to seek");
        session.send(Message::new(
            OP_TRACK_ERROR,
            &TrackErrorData {
                guild_id: seek.guild_id,
                track: TrackInfo::default(),
                error: e.to_string(),
            },
        ));
        return;
    }

    player.refresh_position(server.manager().position(session.bot_id(), seek.guild_id));
    send_player_update(session, seek.guild_id, &player);
}

fn handle_disconnect(server: &Arc<NodeServer>, session: &Arc<Session>, guild_id: Snowflake) {
    tracing::info!(guild_id = %guild_id, "processing disconnect op");

    server.manager().disconnect(session.bot_id(), guild_id);
    session.remove_player(guild_id);

    session.send(Message::new(
        OP_VOICE_DISCONNECT,
        &VoiceDisconnectData {
            guild_id,
            reason: Some("requested".to_string()),
        },
    ));
}

fn handle_volume(server: &Arc<NodeServer>, session: &Arc<Session>, volume: VolumeData) {
    let Some(player) = session.player(volume.guild_id) else {
        return;
    };

    player.set_volume(volume.volume);

    let (state, _, stored_volume) = player.update_data();
    session.send(Message::new(
        OP_PLAYER_UPDATE,
        &PlayerUpdateData {
            guild_id: volume.guild_id,
            state,
            position: server.manager().position(session.bot_id(), volume.guild_id),
            volume: stored_volume,
        },
    ));
}

fn handle_player_migrate(session: &Arc<Session>, guild_id: Snowflake) {
    let Some(player) = session.player(guild_id) else {
        tracing::warn!(guild_id = %guild_id, "player not found for migration");
        return;
    };

    let (url, position, volume, state) = player.migrate_snapshot();
    session.send(Message::new(
        OP_MIGRATE_READY,
        &MigrateReadyData {
            guild_id,
            url: url.clone(),
            position,
            volume,
            state,
        },
    ));

    tracing::info!(guild_id = %guild_id, url = %url, "player migration state sent");
}
