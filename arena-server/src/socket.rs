//! WebSocket lifecycle and event dispatch.
//!
//! Each accepted socket is split into a send task (drains the connection's
//! outbound channel) and a receive task (parses envelopes and dispatches).
//! Whichever finishes first aborts the other, then the shared cleanup runs
//! the normal disconnect path. The first meaningful event on every socket is
//! `registerPlayer`; until it succeeds only ping traffic is answered.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::consts::{PERSISTENT_ID_MAX_LEN, PERSISTENT_ID_MIN_LEN, PROJECTILE_SPEED};
use protocol::events::{
    AdsState, Envelope, ErrorNotice, EventParseError, RateLimit, RegisterPayload, ServerTime,
    SessionIssued,
};
use protocol::wire::{ProfileInfo, RoomPhase};
use protocol::{ClientEvent, ErrorCode, ServerEvent};
use tokio::sync::mpsc;

use crate::abuse::{AuditRecord, AuditStream, EventRateLimiter, StrikeReason};
use crate::input;
use crate::lobby;
use crate::party;
use crate::reconnect;
use crate::room::{ConnId, Projectile};
use crate::session::verify_token;
use crate::state::AppState;
use crate::telemetry::Telemetry;
use crate::util::now_ms;
use crate::{friends, sim};

/// Handshake guard: sockets accepted per source IP.
const CONNECT_IP_LIMIT: RateLimit = RateLimit { max: 30, window_ms: 10_000 };
/// Handshake guard: registrations per source IP.
const REGISTER_IP_LIMIT: RateLimit = RateLimit { max: 20, window_ms: 10_000 };
/// Handshake guard: registrations per claimed device id.
const REGISTER_PID_LIMIT: RateLimit = RateLimit { max: 12, window_ms: 10_000 };

/// Per-connection dispatch state, owned by the receive task.
struct SocketContext {
    rate: EventRateLimiter,
    authenticated: bool,
}

/// Whether a standing block swallows a gameplay event, and if so whether the
/// rejection is still worth an audit line.
enum Gate {
    Open,
    Blocked,
    BlockedLog,
}

/// Upgrades the HTTP request into the socket pair.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(app): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket(socket, app, addr))
}

/// Does the whole handling from start to finish: registration of the
/// connection, paired pump tasks, then disconnect cleanup.
async fn websocket(stream: WebSocket, app: Arc<AppState>, addr: SocketAddr) {
    let ip = addr.ip().to_string();
    // Buckets are keyed per operation so the connect budget never eats into
    // the register/create/join budgets of the same address.
    if !app.ip_limits.allow(&format!("connect:{ip}"), CONNECT_IP_LIMIT, now_ms()) {
        // Too many sockets from one address; drop before allocating anything.
        tracing::warn!(%ip, "Connection rejected by handshake guard");
        return;
    }

    // By splitting, we can send and receive at the same time.
    let (sender, receiver) = stream.split();
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    let conn_id = app.transport.register(ip, tx);
    Telemetry::bump(&app.telemetry.connections_total);
    tracing::debug!(conn_id, "Socket connected");

    let mut send_task = tokio::spawn(send_loop(sender, rx));
    let recv_app = app.clone();
    let mut recv_task = tokio::spawn(async move { receive_loop(receiver, recv_app, conn_id).await });

    // If any one of the tasks runs to completion, we abort the other.
    tokio::select! {
        _ = &mut send_task => { recv_task.abort(); }
        _ = &mut recv_task => { send_task.abort(); }
    }

    let meta = app.transport.unregister(conn_id);
    if let Some(room_code) = meta.and_then(|m| m.room_code) {
        lobby::handle_disconnect(&app, &room_code, conn_id).await;
    }
    tracing::debug!(conn_id, "Socket closed");
}

/// Drains the outbound channel into the socket.
async fn send_loop(mut sender: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        let text = match std::str::from_utf8(&frame) {
            Ok(text) => text.to_string(),
            Err(_) => continue,
        };
        if sender.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

/// Parses inbound frames until the socket dies.
async fn receive_loop(mut receiver: SplitStream<WebSocket>, app: Arc<AppState>, conn_id: ConnId) {
    let mut ctx = SocketContext { rate: EventRateLimiter::default(), authenticated: false };
    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue, // axum answers ping/pong frames itself
            Err(_) => break,
        };
        handle_frame(&app, conn_id, &mut ctx, &text).await;
    }
}

async fn handle_frame(app: &AppState, conn_id: ConnId, ctx: &mut SocketContext, text: &str) {
    let now = now_ms();
    Telemetry::bump(&app.telemetry.events_total);

    let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
        tracing::debug!(conn_id, "Unparseable frame dropped");
        return;
    };

    if !ctx.rate.allow(&envelope.event, now) {
        Telemetry::bump(&app.telemetry.rate_limited_total);
        rate_limit_strike(app, conn_id, &envelope.event, now).await;
        return;
    }

    let event = match ClientEvent::parse(&envelope.event, envelope.data.as_ref()) {
        Ok(event) => event,
        Err(EventParseError::UnknownEvent) => {
            tracing::debug!(conn_id, event = %envelope.event, "Unknown event dropped");
            return;
        }
        Err(EventParseError::BadPayload) => {
            bad_payload(app, conn_id, &envelope.event, now).await;
            return;
        }
    };

    if !ctx.authenticated {
        match &event {
            ClientEvent::RegisterPlayer(payload) => {
                ctx.authenticated = handle_register(app, conn_id, payload, now).await;
                return;
            }
            ClientEvent::Pong | ClientEvent::ClientPing(_) => {}
            _ => {
                app.transport.send(
                    conn_id,
                    &ServerEvent::AuthError(ErrorNotice {
                        code: ErrorCode::AuthRequired,
                        message: ErrorCode::AuthRequired.as_str().to_string(),
                    }),
                );
                return;
            }
        }
    }

    match event {
        ClientEvent::RegisterPlayer(payload) => {
            // Re-registration refreshes the token.
            ctx.authenticated = handle_register(app, conn_id, &payload, now).await;
        }
        ClientEvent::UpdateName(p) => friends::handle_update_name(app, conn_id, &p.new_name).await,
        ClientEvent::FriendsGetList => friends::handle_get_list(app, conn_id).await,
        ClientEvent::FriendsSearch(p) => {
            friends::handle_search(app, conn_id, &p.query, p.limit).await
        }
        ClientEvent::FriendsSendRequest(p) => {
            friends::handle_send_request(app, conn_id, &p.target_profile_id).await
        }
        ClientEvent::FriendsRespondRequest(p) => {
            friends::handle_respond_request(app, conn_id, &p.request_id, p.accept).await
        }
        ClientEvent::PartyInviteFriend(p) => {
            party::handle_invite_friend(app, conn_id, &p.target_profile_id, now).await
        }
        ClientEvent::PartyInviteRespond(p) => {
            party::handle_invite_respond(app, conn_id, &p.invite_id, p.accept, now).await
        }
        ClientEvent::Pong => {}
        ClientEvent::ClientPing(p) => {
            app.transport.send(
                conn_id,
                &ServerEvent::ClientPong(ServerTime { t: p.t, server_time: now }),
            );
        }
        ClientEvent::AdsGetState => handle_ads_get_state(app, conn_id).await,
        ClientEvent::AdsRewardedCompleted(p) => {
            handle_rewarded_completed(app, conn_id, &p.reward_type, now).await
        }
        ClientEvent::CreateRoom(p) => {
            lobby::handle_create_room(app, conn_id, p.player_name.as_deref(), now).await
        }
        ClientEvent::JoinRoom(p) => {
            lobby::handle_join_room(app, conn_id, &p.room_code, p.player_name.as_deref(), now).await
        }
        ClientEvent::PlayerReady => lobby::handle_ready(app, conn_id, false).await,
        ClientEvent::ToggleReady => lobby::handle_ready(app, conn_id, true).await,
        ClientEvent::StartGame => lobby::handle_start_game(app, conn_id, now).await,
        ClientEvent::PlayerInput(p) => handle_player_input(app, conn_id, &p, now).await,
        ClientEvent::FireProjectile(p) => handle_fire(app, conn_id, &p, now).await,
        ClientEvent::LeaveRoom => lobby::handle_leave_room(app, conn_id, now).await,
        ClientEvent::RequestLobbyState(p) => {
            lobby::handle_lobby_state(app, conn_id, p.room_code.as_deref()).await
        }
        ClientEvent::ReturnToLobby(p) => {
            lobby::handle_lobby_state(app, conn_id, p.room_code.as_deref()).await
        }
        ClientEvent::AckMatchResults => lobby::handle_ack_results(app, conn_id).await,
        ClientEvent::KickPlayer(p) => lobby::handle_kick(app, conn_id, p.target()).await,
    }
}

/// Strike for an over-budget event when the caller is an in-room player,
/// plus the generic rate-limit error either way.
async fn rate_limit_strike(app: &AppState, conn_id: ConnId, event: &str, now: u64) {
    if let Some(meta) = app.transport.meta(conn_id) {
        if let (Some(room_code), Some(key)) = (meta.room_code, meta.player_key) {
            let mut rooms = app.rooms.lock().await;
            if let Some(room) = rooms.get_mut(&room_code) {
                app.record_strike(
                    room,
                    key,
                    StrikeReason::RateLimit(event.to_string()),
                    serde_json::json!({ "event": event }),
                    now,
                );
            }
        }
    }
    app.transport.send(
        conn_id,
        &ServerEvent::Error(ErrorNotice {
            code: ErrorCode::RateLimited,
            message: format!("rate limit exceeded for {event}"),
        }),
    );
}

/// Malformed payloads on the gameplay hot path earn a strike; everything
/// else is silently dropped.
async fn bad_payload(app: &AppState, conn_id: ConnId, event: &str, now: u64) {
    if !matches!(event, "playerInput" | "fireProjectile") {
        tracing::debug!(conn_id, event, "Malformed payload dropped");
        return;
    }
    if let Some(meta) = app.transport.meta(conn_id) {
        if let (Some(room_code), Some(key)) = (meta.room_code, meta.player_key) {
            let mut rooms = app.rooms.lock().await;
            if let Some(room) = rooms.get_mut(&room_code) {
                app.record_strike(
                    room,
                    key,
                    StrikeReason::InvalidPayload,
                    serde_json::json!({ "event": event }),
                    now,
                );
            }
        }
    }
}

fn valid_persistent_id(id: &str) -> bool {
    (PERSISTENT_ID_MIN_LEN..=PERSISTENT_ID_MAX_LEN).contains(&id.len())
        && id.chars().all(|c| c.is_ascii_graphic())
}

/// `registerPlayer`: token verification or first-time bootstrap, session
/// issue, identity binding and the auto-reconnect scan.
async fn handle_register(
    app: &AppState,
    conn_id: ConnId,
    payload: &RegisterPayload,
    now: u64,
) -> bool {
    let pid = payload.id.trim();
    if !valid_persistent_id(pid) {
        app.transport.send(
            conn_id,
            &ServerEvent::AuthError(ErrorNotice {
                code: ErrorCode::InvalidCredentials,
                message: "persistent id must be 6-64 printable characters".into(),
            }),
        );
        return false;
    }

    let meta = app.transport.meta(conn_id);
    let ip = meta.map(|m| m.remote_ip).unwrap_or_default();
    if !app.ip_limits.allow(&format!("register:{ip}"), REGISTER_IP_LIMIT, now)
        || !app.pid_limits.allow(&format!("register:{pid}"), REGISTER_PID_LIMIT, now)
    {
        Telemetry::bump(&app.telemetry.rate_limited_total);
        app.transport.send(
            conn_id,
            &ServerEvent::Error(ErrorNotice {
                code: ErrorCode::RateLimited,
                message: "registration rate limit exceeded".into(),
            }),
        );
        return false;
    }

    // A valid prior token carries the name forward; a broken one is treated
    // as a first-time bootstrap.
    let mut token_name = None;
    if let Some(token) = payload.token.as_deref() {
        match verify_token(&app.config.session_secret, token, now) {
            Ok(claims) if claims.pid == pid => token_name = Some(claims.name),
            Ok(_) => tracing::warn!(conn_id, "Token bound to a different device, ignoring"),
            Err(err) => tracing::debug!(conn_id, %err, "Stale session token, reissuing"),
        }
    }

    let name_hint = payload.name.as_deref().or(token_name.as_deref());
    let name = crate::util::sanitize_name(name_hint, rand::random::<u32>());

    let profile = match app.identity.ensure_guest_profile(pid, &name).await {
        Ok(profile) => profile,
        Err(err) => {
            tracing::error!(conn_id, %err, "Identity store rejected bootstrap");
            app.transport.send(
                conn_id,
                &ServerEvent::AuthError(ErrorNotice {
                    code: ErrorCode::AuthContextRequired,
                    message: ErrorCode::AuthContextRequired.as_str().to_string(),
                }),
            );
            return false;
        }
    };

    let session = app.sessions.issue(
        &app.config.session_secret,
        pid,
        &name,
        Some((&profile.profile_id, &profile.friend_code, profile.username.as_deref())),
        profile.is_guest,
        now,
    );
    app.transport.set_identity(conn_id, pid, Some(&profile.profile_id));
    app.transport.send(
        conn_id,
        &ServerEvent::SessionToken(SessionIssued {
            token: session.token.clone(),
            expires_at: session.expires_at,
            profile: ProfileInfo {
                nickname: name.clone(),
                ..profile.clone()
            },
        }),
    );

    // Back into a running match, or deliver what finished while away.
    if !reconnect::try_reconnect(app, conn_id, pid, now).await {
        if let Some(pending) = app.results.fresh(pid, now) {
            app.transport
                .send(conn_id, &ServerEvent::MatchResultsPending(pending.wire()));
        }
    }
    true
}

/// `playerInput`.
async fn handle_player_input(
    app: &AppState,
    conn_id: ConnId,
    payload: &protocol::events::PlayerInputPayload,
    now: u64,
) {
    let Some(meta) = app.transport.meta(conn_id) else {
        return;
    };
    let (Some(room_code), Some(key)) = (meta.room_code, meta.player_key) else {
        return;
    };
    let mut rooms = app.rooms.lock().await;
    let Some(room) = rooms.get_mut(&room_code) else {
        return;
    };
    if room.phase != RoomPhase::Playing {
        return;
    }
    let gate = {
        let Some(player) = room.player_mut(key) else {
            return;
        };
        if player.conn_id != conn_id || player.disconnected {
            return;
        }
        if player.strikes.input_blocked(&app.config.abuse, now) {
            if player.strikes.should_log_block(now) { Gate::BlockedLog } else { Gate::Blocked }
        } else {
            Gate::Open
        }
    };
    match gate {
        Gate::BlockedLog => {
            let record = blocked_record(room, key, "playerInput", now);
            app.audit.append(record);
            return;
        }
        Gate::Blocked => return,
        Gate::Open => {}
    }

    let outcome = {
        let player = room.player_mut(key).expect("gate resolved the member");
        input::apply_player_input(player, payload, now)
    };
    match outcome {
        Ok(applied) => {
            if applied.toggle_spam {
                app.record_strike(
                    room,
                    key,
                    StrikeReason::InputToggleSpam,
                    serde_json::json!({ "seq": payload.seq }),
                    now,
                );
            }
        }
        Err(reason) => {
            app.record_strike(
                room,
                key,
                reason,
                serde_json::json!({ "seq": payload.seq, "angle": payload.angle }),
                now,
            );
        }
    }
}

/// `fireProjectile`.
async fn handle_fire(
    app: &AppState,
    conn_id: ConnId,
    payload: &protocol::events::FirePayload,
    now: u64,
) {
    let Some(meta) = app.transport.meta(conn_id) else {
        return;
    };
    let (Some(room_code), Some(key)) = (meta.room_code, meta.player_key) else {
        return;
    };
    let mut rooms = app.rooms.lock().await;
    let Some(room) = rooms.get_mut(&room_code) else {
        return;
    };
    if room.phase != RoomPhase::Playing {
        return;
    }
    let Some(map_key) = room.map_key else {
        return;
    };
    let map = app.maps.get(map_key);
    let gate = {
        let Some(player) = room.player_mut(key) else {
            return;
        };
        if player.conn_id != conn_id || player.disconnected || !player.alive() {
            return;
        }
        if player.strikes.fire_blocked(&app.config.abuse, now) {
            if player.strikes.should_log_block(now) { Gate::BlockedLog } else { Gate::Blocked }
        } else {
            Gate::Open
        }
    };
    match gate {
        Gate::BlockedLog => {
            let record = blocked_record(room, key, "fireProjectile", now);
            app.audit.append(record);
            return;
        }
        Gate::Blocked => return,
        Gate::Open => {}
    }

    let owned = room.projectiles_owned_by(key);
    let player = room.player(key).expect("gate resolved the member");
    let decision = input::validate_fire(player, payload, owned, map, now);
    if decision.angle_warning {
        app.record_strike(
            room,
            key,
            StrikeReason::FireAngleWarn,
            serde_json::json!({ "angle": payload.angle }),
            now,
        );
    }
    let shot = match decision.result {
        Ok(shot) => shot,
        Err(reason) => {
            app.record_strike(
                room,
                key,
                reason,
                serde_json::json!({ "angle": payload.angle }),
                now,
            );
            return;
        }
    };

    let id = room.alloc_projectile_id();
    {
        let player = room.player_mut(key).expect("checked above");
        player.last_shot_ms = now;
        player.charge_start_ms = 0;
        player.charging = false;
        // Opening fire always drops invisibility.
        player.invisible_until_ms = 0;
    }
    let projectile = Projectile {
        id,
        owner: key,
        x: shot.origin_x,
        y: shot.origin_y,
        vx: PROJECTILE_SPEED * shot.angle.cos(),
        vy: PROJECTILE_SPEED * shot.angle.sin(),
        angle: shot.angle,
        age_secs: 0.0,
    };
    let wire = projectile.wire_state();
    room.projectiles.push(projectile);
    app.transport
        .broadcast(sim::room_conns(room), &ServerEvent::ProjectileFired(wire));
}

fn blocked_record(
    room: &crate::room::Room,
    key: protocol::wire::PlayerKey,
    event: &str,
    now: u64,
) -> AuditRecord {
    let player = room.player(key);
    AuditRecord {
        ts: now,
        stream: AuditStream::Recent,
        reason: format!("blocked:{event}"),
        room: Some(room.code.clone()),
        conn_id: player.map(|p| p.conn_id),
        player_id: player.map(|p| p.persistent_id.clone()),
        name: player.map(|p| p.name.clone()),
        details: serde_json::Value::Null,
    }
}

/// `ads:getState`.
async fn handle_ads_get_state(app: &AppState, conn_id: ConnId) {
    let Some(pid) = app.transport.meta(conn_id).and_then(|m| m.persistent_id) else {
        return;
    };
    let flag = app.rewards.get(&pid);
    app.transport.send(
        conn_id,
        &ServerEvent::AdsStateEvent(AdsState {
            instant_respawn_pending: flag.instant_respawn_pending,
            updated_at: flag.updated_at_ms,
        }),
    );
}

/// `ads:rewardedCompleted` — only outside matches and while not ready.
async fn handle_rewarded_completed(app: &AppState, conn_id: ConnId, reward_type: &str, now: u64) {
    let Some(pid) = app.transport.meta(conn_id).and_then(|m| m.persistent_id) else {
        return;
    };
    if reward_type != "instantRespawn" {
        return send_plain_error(app, conn_id, ErrorCode::InvalidRewardType);
    }
    {
        let mut rooms = app.rooms.lock().await;
        if rooms.find_active_by_pid(&pid).is_some() {
            return send_plain_error(app, conn_id, ErrorCode::InMatch);
        }
        // The leader's pinned ready flag is not an expression of readiness.
        let ready_in_lobby = rooms.iter().any(|room| {
            room.phase == RoomPhase::Lobby
                && room
                    .players
                    .values()
                    .any(|p| p.persistent_id == pid && p.ready && p.key != room.leader)
        });
        if ready_in_lobby {
            return send_plain_error(app, conn_id, ErrorCode::NotAllowedWhileReady);
        }
    }

    let flag = app.rewards.set_pending(&pid, true, now);
    app.transport.send_to_pid(
        &pid,
        &ServerEvent::AdsStateEvent(AdsState {
            instant_respawn_pending: flag.instant_respawn_pending,
            updated_at: flag.updated_at_ms,
        }),
    );
}

fn send_plain_error(app: &AppState, conn_id: ConnId, code: ErrorCode) {
    app.transport.send(
        conn_id,
        &ServerEvent::Error(ErrorNotice { code, message: code.as_str().to_string() }),
    );
}
