//! The pre-match lobby protocol.
//!
//! Create, join, ready, start, leave, kick and the lobby snapshots. Every
//! handler resolves the caller through its connection metadata, takes the
//! room lock, mutates, and broadcasts the canonical lobby state so clients
//! never have to patch their member list themselves.

use protocol::ErrorCode;
use protocol::ServerEvent;
use protocol::consts::COUNTDOWN_MS;
use protocol::events::{AdsState, ErrorNotice, MatchAnnounce, RateLimit, RoomCreated};
use protocol::wire::{MapKey, PlayerKey, RoomPhase};
use rand::prelude::IndexedRandom;

use crate::party;
use crate::room::{ConnId, RoomStore};
use crate::state::AppState;
use crate::telemetry::Telemetry;
use crate::util::sanitize_name;

/// Handshake guard: room creations per source IP.
const CREATE_IP_LIMIT: RateLimit = RateLimit { max: 8, window_ms: 10_000 };
/// Handshake guard: room creations per device id.
const CREATE_PID_LIMIT: RateLimit = RateLimit { max: 4, window_ms: 10_000 };
/// Handshake guard: joins per source IP.
const JOIN_IP_LIMIT: RateLimit = RateLimit { max: 12, window_ms: 10_000 };
/// Handshake guard: joins per device id.
const JOIN_PID_LIMIT: RateLimit = RateLimit { max: 6, window_ms: 10_000 };

fn send_error(app: &AppState, conn_id: ConnId, code: ErrorCode) {
    app.transport.send(
        conn_id,
        &ServerEvent::Error(ErrorNotice { code, message: code.as_str().to_string() }),
    );
}

fn send_join_error(app: &AppState, conn_id: ConnId, code: ErrorCode) {
    app.transport.send(
        conn_id,
        &ServerEvent::JoinError(ErrorNotice { code, message: code.as_str().to_string() }),
    );
}

/// The caller's identity, or an auth error on the socket.
fn require_identity(app: &AppState, conn_id: ConnId) -> Option<(String, Option<String>)> {
    let meta = app.transport.meta(conn_id)?;
    match meta.persistent_id {
        Some(pid) => Some((pid, meta.profile_id)),
        None => {
            app.transport.send(
                conn_id,
                &ServerEvent::AuthError(ErrorNotice {
                    code: ErrorCode::AuthRequired,
                    message: ErrorCode::AuthRequired.as_str().to_string(),
                }),
            );
            None
        }
    }
}

/// Handshake-scope accounting for create/join: unlike the per-connection
/// event buckets, these survive a fresh socket, so reconnect churn cannot
/// reset them. `true` means the event may proceed.
fn handshake_guard(
    app: &AppState,
    conn_id: ConnId,
    pid: &str,
    op: &str,
    ip_limit: RateLimit,
    pid_limit: RateLimit,
    now_ms: u64,
) -> bool {
    let ip = app
        .transport
        .meta(conn_id)
        .map(|m| m.remote_ip)
        .unwrap_or_default();
    if app.ip_limits.allow(&format!("{op}:{ip}"), ip_limit, now_ms)
        && app.pid_limits.allow(&format!("{op}:{pid}"), pid_limit, now_ms)
    {
        return true;
    }
    Telemetry::bump(&app.telemetry.rate_limited_total);
    send_error(app, conn_id, ErrorCode::RateLimited);
    false
}

fn display_name(app: &AppState, pid: &str, hint: Option<&str>) -> String {
    match hint {
        Some(hint) => sanitize_name(Some(hint), rand::random::<u32>()),
        None => app
            .sessions
            .get(pid)
            .map(|s| s.name)
            .unwrap_or_else(|| sanitize_name(None, rand::random::<u32>())),
    }
}

/// `createRoom`. A caller with a live match record is reconnected instead.
pub async fn handle_create_room(
    app: &AppState,
    conn_id: ConnId,
    name_hint: Option<&str>,
    now_ms: u64,
) {
    let Some((pid, profile_id)) = require_identity(app, conn_id) else {
        return;
    };
    if !handshake_guard(app, conn_id, &pid, "create", CREATE_IP_LIMIT, CREATE_PID_LIMIT, now_ms) {
        return;
    }
    if crate::reconnect::try_reconnect(app, conn_id, &pid, now_ms).await {
        return;
    }

    let name = display_name(app, &pid, name_hint);
    let mut rooms = app.rooms.lock().await;
    let room = rooms.create();
    let key = room.add_player(conn_id, pid, profile_id, name);
    let code = room.code.clone();
    app.transport.set_room(conn_id, &code, key);
    app.transport.send(
        conn_id,
        &ServerEvent::RoomCreated(RoomCreated {
            room_code: code.clone(),
            player_key: key,
            lobby: room.lobby_state(),
        }),
    );
    app.emit_room(room, &ServerEvent::LobbyUpdate(room.lobby_state()));
    tracing::info!(room = %code, "Room created");
}

/// Membership insert shared by `joinRoom` and party-invite acceptance.
pub async fn join_room_for_conn(
    app: &AppState,
    conn_id: ConnId,
    pid: &str,
    profile_id: Option<&str>,
    room_code: &str,
    name: String,
) -> Result<(), ErrorCode> {
    let mut rooms = app.rooms.lock().await;
    let Some(room) = rooms.get_mut(room_code) else {
        return Err(ErrorCode::RoomNotFound);
    };
    if room.phase != RoomPhase::Lobby {
        return Err(ErrorCode::GameAlreadyStarted);
    }

    // A lobby rejoin from a new socket rebinds the existing record.
    if let Some(existing) = room.player_by_pid(pid).map(|p| p.key) {
        let player = room.player_mut(existing).expect("key just resolved");
        player.conn_id = conn_id;
        player.disconnected = false;
        app.transport.set_room(conn_id, room_code, existing);
        app.emit_room(room, &ServerEvent::LobbyUpdate(room.lobby_state()));
        return Ok(());
    }

    if room.is_full() {
        return Err(ErrorCode::RoomFull);
    }
    let key = room.add_player(conn_id, pid.to_string(), profile_id.map(str::to_string), name);
    app.transport.set_room(conn_id, room_code, key);
    let joined = room.player(key).expect("just inserted").lobby_entry(room.leader);
    app.emit_room(
        room,
        &ServerEvent::PlayerJoined { room_code: room_code.to_string(), player: joined },
    );
    app.emit_room(room, &ServerEvent::LobbyUpdate(room.lobby_state()));
    Ok(())
}

/// `joinRoom`.
pub async fn handle_join_room(
    app: &AppState,
    conn_id: ConnId,
    room_code: &str,
    name_hint: Option<&str>,
    now_ms: u64,
) {
    let Some((pid, profile_id)) = require_identity(app, conn_id) else {
        return;
    };
    if !handshake_guard(app, conn_id, &pid, "join", JOIN_IP_LIMIT, JOIN_PID_LIMIT, now_ms) {
        return;
    }
    if crate::reconnect::try_reconnect(app, conn_id, &pid, now_ms).await {
        return;
    }
    let name = display_name(app, &pid, name_hint);
    if let Err(code) =
        join_room_for_conn(app, conn_id, &pid, profile_id.as_deref(), room_code, name).await
    {
        send_join_error(app, conn_id, code);
    }
}

/// `playerReady` (set) and `toggleReady` (flip). The leader's flag is pinned.
pub async fn handle_ready(app: &AppState, conn_id: ConnId, toggle: bool) {
    let Some(meta) = app.transport.meta(conn_id) else {
        return;
    };
    let Some(room_code) = meta.room_code else {
        return;
    };
    let mut rooms = app.rooms.lock().await;
    let Some(room) = rooms.get_mut(&room_code) else {
        return;
    };
    if room.phase != RoomPhase::Lobby {
        return;
    }
    let Some(key) = room.player_key_by_conn(conn_id) else {
        return;
    };
    if key == room.leader {
        return;
    }
    let ready = {
        let player = room.player_mut(key).expect("member resolved");
        player.ready = if toggle { !player.ready } else { true };
        player.ready
    };
    app.emit_room(room, &ServerEvent::PlayerReadyUpdate { player_key: key, ready });
    let lobby = room.lobby_state();
    // Older clients refresh their member list from the bare player array.
    app.emit_room(room, &ServerEvent::UpdatePlayers { players: lobby.players.clone() });
    app.emit_room(room, &ServerEvent::LobbyUpdate(lobby));
}

/// `startGame` — leader only, everyone ready, nobody dangling.
pub async fn handle_start_game(app: &AppState, conn_id: ConnId, now_ms: u64) {
    let Some(meta) = app.transport.meta(conn_id) else {
        return;
    };
    let Some(room_code) = meta.room_code else {
        return send_error(app, conn_id, ErrorCode::RoomNotFound);
    };

    let mut consumed_rewards: Vec<String> = Vec::new();
    {
        let mut rooms = app.rooms.lock().await;
        let Some(room) = rooms.get_mut(&room_code) else {
            return send_error(app, conn_id, ErrorCode::RoomNotFound);
        };
        if room.phase != RoomPhase::Lobby {
            return send_error(app, conn_id, ErrorCode::GameAlreadyStarted);
        }
        let Some(key) = room.player_key_by_conn(conn_id) else {
            return;
        };
        if key != room.leader {
            return send_error(app, conn_id, ErrorCode::NotLeader);
        }
        if !room.all_ready() {
            return send_error(app, conn_id, ErrorCode::NotAllReady);
        }

        let map_key = *MapKey::ALL.choose(&mut rand::rng()).expect("maps exist");
        let map = app.maps.get(map_key);
        room.phase = RoomPhase::Starting;
        room.map_key = Some(map_key);
        room.countdown_started_ms = now_ms;
        room.match_start_ms = 0;
        room.next_spawn = 0;
        room.projectiles.clear();
        room.kill_chains.clear();
        room.suspicion = Default::default();
        room.last_results = None;
        room.sync.reset();
        room.seed_buffs(map);

        let keys: Vec<PlayerKey> = room.players.keys().copied().collect();
        for key in keys {
            let (x, y) = room.next_spawn_point(map);
            let player = room.player_mut(key).expect("iterating member keys");
            player.x = x;
            player.y = y;
            player.hp = protocol::consts::BASE_MAX_HP;
            player.max_hp = protocol::consts::BASE_MAX_HP;
            player.kills = 0;
            player.deaths = 0;
            player.killstreak = 0;
            player.clear_buffs();
            player.charging = false;
            player.charge_start_ms = 0;
            player.last_shot_ms = 0;
            player.died_at_ms = 0;
            player.reset_input_keep_seq();
            player.strikes.reset();
            player.instant_respawns_used = 0;
            let granted = app.rewards.take_pending(&player.persistent_id, now_ms);
            player.instant_respawns_left =
                if granted { protocol::consts::INSTANT_RESPAWN_CHARGES } else { 0 };
            if granted {
                consumed_rewards.push(player.persistent_id.clone());
            }
        }

        let announce = MatchAnnounce {
            map: map_key,
            countdown_ms: COUNTDOWN_MS,
            starts_at: now_ms + COUNTDOWN_MS,
        };
        app.emit_room(room, &ServerEvent::GameStarting(announce.clone()));
        app.emit_room(room, &ServerEvent::CountdownStart(announce));
        app.emit_room(room, &ServerEvent::LobbyUpdate(room.lobby_state()));
        Telemetry::bump(&app.telemetry.matches_started_total);
        tracing::info!(room = %room_code, map = map_key.as_str(), "Match starting");
    }

    // The room left the lobby: kill its invites, tell consumed-flag owners.
    let cancelled = app.invites.invalidate_room(&room_code);
    party::notify_invites_expired(app, &cancelled);
    for pid in consumed_rewards {
        app.transport.send_to_pid(
            &pid,
            &ServerEvent::AdsStateEvent(AdsState {
                instant_respawn_pending: false,
                updated_at: now_ms,
            }),
        );
    }
}

/// How a member ends up leaving a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    Leave,
    Kick,
    Disconnect,
}

/// Removes or detaches a member, with leader election, room deletion and all
/// broadcasts. The caller already holds the room lock.
pub fn remove_member(
    app: &AppState,
    rooms: &mut RoomStore,
    room_code: &str,
    key: PlayerKey,
    kind: Departure,
) {
    let Some(room) = rooms.get_mut(room_code) else {
        return;
    };
    let old_leader = room.leader;

    if room.phase == RoomPhase::Lobby || kind == Departure::Kick {
        let Some(removed) = room.remove_player(key) else {
            return;
        };
        app.transport.clear_room(removed.conn_id);
        if room.players.is_empty() {
            let code = room.code.clone();
            rooms.remove(&code);
            let cancelled = app.invites.invalidate_room(&code);
            party::notify_invites_expired(app, &cancelled);
            tracing::info!(room = %code, "Room deleted");
            return;
        }
        app.emit_room(
            room,
            &ServerEvent::PlayerLeft { player_key: removed.key, name: removed.name },
        );
        if room.leader != old_leader {
            let name = room.player(room.leader).map(|p| p.name.clone()).unwrap_or_default();
            app.emit_room(room, &ServerEvent::NewLeader { player_key: room.leader, name });
        }
        app.emit_room(room, &ServerEvent::LobbyUpdate(room.lobby_state()));
        return;
    }

    // Mid-match: preserve the record for reconnection.
    let Some(player) = room.player_mut(key) else {
        return;
    };
    let conn = player.conn_id;
    player.disconnected = true;
    app.transport.clear_room(conn);

    if room.players.values().all(|p| p.disconnected) {
        // Nobody left to play for; the match ends early by deletion.
        let code = room.code.clone();
        rooms.remove(&code);
        let cancelled = app.invites.invalidate_room(&code);
        party::notify_invites_expired(app, &cancelled);
        tracing::info!(room = %code, "Room emptied mid-match, deleted");
        return;
    }
    if key == old_leader {
        if let Some(new_leader) = room.elect_leader() {
            let name = room.player(new_leader).map(|p| p.name.clone()).unwrap_or_default();
            app.emit_room(room, &ServerEvent::NewLeader { player_key: new_leader, name });
        }
    }
    app.emit_room(room, &ServerEvent::LobbyUpdate(room.lobby_state()));
}

/// `leaveRoom`.
pub async fn handle_leave_room(app: &AppState, conn_id: ConnId, _now_ms: u64) {
    let Some(meta) = app.transport.meta(conn_id) else {
        return;
    };
    let Some(room_code) = meta.room_code else {
        return;
    };
    let mut rooms = app.rooms.lock().await;
    let Some(key) = rooms
        .get(&room_code)
        .and_then(|room| room.players.values().find(|p| p.conn_id == conn_id))
        .map(|p| p.key)
    else {
        app.transport.clear_room(conn_id);
        return;
    };
    remove_member(app, &mut rooms, &room_code, key, Departure::Leave);
}

/// Socket closed: same path as an explicit leave, driven by the last-known
/// metadata because the connection is already unregistered.
pub async fn handle_disconnect(app: &AppState, room_code: &str, conn_id: ConnId) {
    let mut rooms = app.rooms.lock().await;
    let Some(key) = rooms
        .get(room_code)
        .and_then(|room| room.players.values().find(|p| p.conn_id == conn_id))
        .map(|p| p.key)
    else {
        return;
    };
    remove_member(app, &mut rooms, room_code, key, Departure::Disconnect);
}

/// `kickPlayer` — leader only, lobby only, never the leader itself.
pub async fn handle_kick(app: &AppState, conn_id: ConnId, target: Option<PlayerKey>) {
    let Some(meta) = app.transport.meta(conn_id) else {
        return;
    };
    let Some(room_code) = meta.room_code else {
        return send_error(app, conn_id, ErrorCode::RoomNotFound);
    };
    let Some(target) = target else {
        return send_error(app, conn_id, ErrorCode::InvalidKickTarget);
    };
    let mut rooms = app.rooms.lock().await;
    let Some(room) = rooms.get_mut(&room_code) else {
        return send_error(app, conn_id, ErrorCode::RoomNotFound);
    };
    if room.phase != RoomPhase::Lobby {
        return send_error(app, conn_id, ErrorCode::GameAlreadyStarted);
    }
    let Some(caller) = room.player_key_by_conn(conn_id) else {
        return;
    };
    if caller != room.leader {
        return send_error(app, conn_id, ErrorCode::NotLeader);
    }
    if target == room.leader || room.player(target).is_none() {
        return send_error(app, conn_id, ErrorCode::InvalidKickTarget);
    }
    let target_conn = room.player(target).map(|p| p.conn_id);
    if let Some(target_conn) = target_conn {
        app.transport.send(
            target_conn,
            &ServerEvent::KickedFromParty { room_code: room_code.clone() },
        );
    }
    remove_member(app, &mut rooms, &room_code, target, Departure::Kick);
}

/// `requestLobbyState` / `returnToLobby`: a fresh snapshot, re-binding the
/// socket to its member record on the way.
pub async fn handle_lobby_state(app: &AppState, conn_id: ConnId, room_code: Option<&str>) {
    let Some((pid, _)) = require_identity(app, conn_id) else {
        return;
    };
    let meta_room = app.transport.meta(conn_id).and_then(|m| m.room_code);
    let Some(code) = room_code.map(str::to_string).or(meta_room) else {
        return send_error(app, conn_id, ErrorCode::RoomNotFound);
    };
    let mut rooms = app.rooms.lock().await;
    let Some(room) = rooms.get_mut(&code) else {
        return send_error(app, conn_id, ErrorCode::RoomNotFound);
    };
    if let Some(key) = room.player_by_pid(&pid).map(|p| p.key) {
        let player = room.player_mut(key).expect("key just resolved");
        player.conn_id = conn_id;
        player.disconnected = false;
        app.transport.set_room(conn_id, &code, key);
    }
    app.transport
        .send(conn_id, &ServerEvent::LobbySnapshot(room.lobby_state()));
}

/// `ackMatchResults`: drop the pending copy and mark the archive seen.
pub async fn handle_ack_results(app: &AppState, conn_id: ConnId) {
    let Some((pid, _)) = require_identity(app, conn_id) else {
        return;
    };
    let Some(room_code) = app.results.ack(&pid) else {
        return;
    };
    let mut rooms = app.rooms.lock().await;
    if let Some(room) = rooms.get_mut(&room_code) {
        if let Some(archive) = room.last_results.as_mut() {
            archive.seen_by.insert(pid);
            tracing::debug!(room = %room_code, seen = archive.seen_by.len(), "Results acknowledged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::AuditLog;
    use crate::config::ServerConfig;
    use crate::identity::InMemoryIdentityStore;
    use crate::state::AppState;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Client {
        conn: ConnId,
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    impl Client {
        /// Event names of everything queued so far, draining the channel.
        fn events(&mut self) -> Vec<String> {
            let mut names = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
                names.push(value["event"].as_str().unwrap_or_default().to_string());
            }
            names
        }

        fn last_payload_of(&mut self, event: &str) -> Option<serde_json::Value> {
            let mut found = None;
            while let Ok(frame) = self.rx.try_recv() {
                let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
                if value["event"] == event {
                    found = Some(value["data"].clone());
                }
            }
            found
        }
    }

    fn app() -> Arc<AppState> {
        let (audit, _rx) = AuditLog::new();
        Arc::new(AppState::new(
            ServerConfig::default(),
            Arc::new(InMemoryIdentityStore::default()),
            audit,
        ))
    }

    fn client(app: &AppState, pid: &str) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = app.transport.register("127.0.0.1".into(), tx);
        app.transport.set_identity(conn, pid, None);
        Client { conn, rx }
    }

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(fut)
    }

    async fn room_code_of(app: &AppState, conn: ConnId) -> String {
        app.transport.meta(conn).and_then(|m| m.room_code).expect("in a room")
    }

    #[test]
    fn seventh_join_gets_room_full() {
        block_on(async {
            let app = app();
            let mut leader = client(&app, "device-leader");
            handle_create_room(&app, leader.conn, Some("Lead"), 1_000).await;
            let code = room_code_of(&app, leader.conn).await;
            assert!(leader.events().contains(&"roomCreated".to_string()));

            for i in 0..5 {
                let mut member = client(&app, &format!("device-m{i:05}"));
                handle_join_room(&app, member.conn, &code, None, 1_000).await;
                assert!(member.events().contains(&"lobbyUpdate".to_string()), "seat {i}");
            }
            let mut seventh = client(&app, "device-sevent");
            handle_join_room(&app, seventh.conn, &code, None, 1_000).await;
            let err = seventh.last_payload_of("joinError").expect("join error");
            assert_eq!(err["code"], "ROOM_FULL");
        });
    }

    #[test]
    fn create_guard_trips_on_the_fifth_room() {
        block_on(async {
            let app = app();
            let mut creator = client(&app, "device-burst1");
            for _ in 0..CREATE_PID_LIMIT.max {
                handle_create_room(&app, creator.conn, None, 1_000).await;
                handle_leave_room(&app, creator.conn, 1_000).await;
            }
            handle_create_room(&app, creator.conn, None, 1_000).await;
            let err = creator.last_payload_of("error").expect("rate limited");
            assert_eq!(err["code"], "RATE_LIMITED");
            let rooms = app.rooms.lock().await;
            assert_eq!(rooms.len(), 0);
        });
    }

    #[test]
    fn join_of_unknown_room_is_an_error() {
        block_on(async {
            let app = app();
            let mut member = client(&app, "device-member");
            handle_join_room(&app, member.conn, "00000", None, 1_000).await;
            let err = member.last_payload_of("joinError").expect("join error");
            assert_eq!(err["code"], "ROOM_NOT_FOUND");
        });
    }

    #[test]
    fn start_needs_everyone_ready_and_the_leader() {
        block_on(async {
            let app = app();
            let mut leader = client(&app, "device-leader");
            handle_create_room(&app, leader.conn, None, 1_000).await;
            let code = room_code_of(&app, leader.conn).await;
            let mut member = client(&app, "device-member");
            handle_join_room(&app, member.conn, &code, None, 1_000).await;

            // Member cannot start.
            handle_start_game(&app, member.conn, 2_000).await;
            let err = member.last_payload_of("error").expect("error");
            assert_eq!(err["code"], "NOT_LEADER");

            // Leader cannot start while the member is not ready.
            handle_start_game(&app, leader.conn, 2_000).await;
            let err = leader.last_payload_of("error").expect("error");
            assert_eq!(err["code"], "NOT_ALL_READY");

            handle_ready(&app, member.conn, false).await;
            handle_start_game(&app, leader.conn, 3_000).await;
            let events = leader.events();
            assert!(events.contains(&"gameStarting".to_string()));
            assert!(events.contains(&"countdownStart".to_string()));

            let rooms = app.rooms.lock().await;
            let room = rooms.get(&code).unwrap();
            assert_eq!(room.phase, RoomPhase::Starting);
            assert!(room.map_key.is_some());
            assert_eq!(room.buffs.len(), protocol::consts::BUFF_SPAWN_COUNT);
            assert_eq!(room.countdown_started_ms, 3_000);
        });
    }

    #[test]
    fn leader_departure_hands_the_room_over() {
        block_on(async {
            let app = app();
            let leader = client(&app, "device-leader");
            handle_create_room(&app, leader.conn, None, 1_000).await;
            let code = room_code_of(&app, leader.conn).await;
            let mut member = client(&app, "device-member");
            handle_join_room(&app, member.conn, &code, None, 1_000).await;
            member.events();

            handle_leave_room(&app, leader.conn, 2_000).await;
            let events = member.events();
            assert!(events.contains(&"playerLeft".to_string()));
            assert!(events.contains(&"newLeader".to_string()));

            let rooms = app.rooms.lock().await;
            let room = rooms.get(&code).unwrap();
            assert_eq!(room.players.len(), 1);
            assert!(room.player(room.leader).unwrap().ready);
        });
    }

    #[test]
    fn last_leaver_kills_the_room() {
        block_on(async {
            let app = app();
            let leader = client(&app, "device-leader");
            handle_create_room(&app, leader.conn, None, 1_000).await;
            let code = room_code_of(&app, leader.conn).await;
            handle_leave_room(&app, leader.conn, 2_000).await;
            let rooms = app.rooms.lock().await;
            assert!(rooms.get(&code).is_none());
        });
    }

    #[test]
    fn kick_rules_leader_only_and_not_self() {
        block_on(async {
            let app = app();
            let mut leader = client(&app, "device-leader");
            handle_create_room(&app, leader.conn, None, 1_000).await;
            let code = room_code_of(&app, leader.conn).await;
            let mut member = client(&app, "device-member");
            handle_join_room(&app, member.conn, &code, None, 1_000).await;

            let member_key = app.transport.meta(member.conn).unwrap().player_key.unwrap();
            let leader_key = app.transport.meta(leader.conn).unwrap().player_key.unwrap();

            // Member cannot kick.
            handle_kick(&app, member.conn, Some(leader_key)).await;
            let err = member.last_payload_of("error").expect("error");
            assert_eq!(err["code"], "NOT_LEADER");

            // Leader cannot kick itself.
            handle_kick(&app, leader.conn, Some(leader_key)).await;
            let err = leader.last_payload_of("error").expect("error");
            assert_eq!(err["code"], "INVALID_KICK_TARGET");

            handle_kick(&app, leader.conn, Some(member_key)).await;
            assert!(member.events().contains(&"kickedFromParty".to_string()));
            let rooms = app.rooms.lock().await;
            assert_eq!(rooms.get(&code).unwrap().players.len(), 1);
        });
    }

    #[test]
    fn mid_match_disconnect_preserves_the_record() {
        block_on(async {
            let app = app();
            let leader = client(&app, "device-leader");
            handle_create_room(&app, leader.conn, None, 1_000).await;
            let code = room_code_of(&app, leader.conn).await;
            let member = client(&app, "device-member");
            handle_join_room(&app, member.conn, &code, None, 1_000).await;
            handle_ready(&app, member.conn, false).await;
            handle_start_game(&app, leader.conn, 2_000).await;

            handle_disconnect(&app, &code, member.conn).await;
            let rooms = app.rooms.lock().await;
            let room = rooms.get(&code).unwrap();
            assert_eq!(room.players.len(), 2);
            assert_eq!(
                room.players.values().filter(|p| p.disconnected).count(),
                1
            );
        });
    }

    #[test]
    fn lobby_rejoin_rebinds_instead_of_adding_a_seat() {
        block_on(async {
            let app = app();
            let leader = client(&app, "device-leader");
            handle_create_room(&app, leader.conn, None, 1_000).await;
            let code = room_code_of(&app, leader.conn).await;
            let member = client(&app, "device-member");
            handle_join_room(&app, member.conn, &code, None, 1_000).await;

            // Same device on a fresh socket joins again.
            let member2 = client(&app, "device-member");
            handle_join_room(&app, member2.conn, &code, None, 1_500).await;
            let rooms = app.rooms.lock().await;
            let room = rooms.get(&code).unwrap();
            assert_eq!(room.players.len(), 2);
            let rebound = room.player_by_pid("device-member").unwrap();
            assert_eq!(rebound.conn_id, member2.conn);
        });
    }
}
