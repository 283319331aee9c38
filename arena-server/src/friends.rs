//! Friends and profile socket handlers.
//!
//! Thin glue between the event vocabulary and the identity store: map the
//! typed store errors onto wire codes, layer presence onto the friend rows,
//! and push updates to every live connection of the affected profiles.

use protocol::ErrorCode;
use protocol::ServerEvent;
use protocol::events::ErrorNotice;
use protocol::wire::{FriendEntry, FriendsView, ProfileInfo};

use crate::identity::{FriendsState, IdentityError};
use crate::room::ConnId;
use crate::state::AppState;
use crate::util::sanitize_name;

fn map_identity_error(err: &IdentityError) -> ErrorCode {
    match err {
        IdentityError::ProfileNotFound => ErrorCode::ProfileNotFound,
        IdentityError::FriendRequestAlreadyExists => ErrorCode::FriendRequestAlreadyExists,
        IdentityError::AlreadyFriends => ErrorCode::AlreadyFriends,
        IdentityError::FriendRequestNotFound => ErrorCode::FriendRequestNotFound,
        // Account-linking failures cannot reach the friends path; collapse
        // them onto the generic profile error rather than invent codes.
        _ => ErrorCode::ProfileNotFound,
    }
}

fn friends_error(app: &AppState, conn_id: ConnId, code: ErrorCode) {
    app.transport.send(
        conn_id,
        &ServerEvent::FriendsError(ErrorNotice { code, message: code.as_str().to_string() }),
    );
}

/// The caller's bound profile id, or a friends error.
fn require_profile(app: &AppState, conn_id: ConnId) -> Option<String> {
    match app.transport.meta(conn_id).and_then(|m| m.profile_id) {
        Some(profile_id) => Some(profile_id),
        None => {
            friends_error(app, conn_id, ErrorCode::AuthContextRequired);
            None
        }
    }
}

fn friend_entry(app: &AppState, profile: &ProfileInfo) -> FriendEntry {
    FriendEntry {
        profile_id: profile.profile_id.clone(),
        nickname: profile.nickname.clone(),
        friend_code: profile.friend_code.clone(),
        online: !app.transport.conns_for_profile(&profile.profile_id).is_empty(),
    }
}

fn build_view(app: &AppState, state: FriendsState) -> FriendsView {
    FriendsView {
        friends: state.friends.iter().map(|p| friend_entry(app, p)).collect(),
        incoming: state.incoming,
        outgoing: state.outgoing,
    }
}

async fn push_list(app: &AppState, profile_id: &str) {
    if let Ok(state) = app.identity.get_friends_state(profile_id).await {
        let view = ServerEvent::FriendsListUpdated(build_view(app, state));
        for conn in app.transport.conns_for_profile(profile_id) {
            app.transport.send(conn, &view);
        }
    }
}

/// `friends:getList`.
pub async fn handle_get_list(app: &AppState, conn_id: ConnId) {
    let Some(profile_id) = require_profile(app, conn_id) else {
        return;
    };
    match app.identity.get_friends_state(&profile_id).await {
        Ok(state) => {
            let view = build_view(app, state);
            app.transport.send(conn_id, &ServerEvent::FriendsListUpdated(view));
        }
        Err(err) => friends_error(app, conn_id, map_identity_error(&err)),
    }
}

/// `friends:search`.
pub async fn handle_search(app: &AppState, conn_id: ConnId, query: &str, limit: Option<usize>) {
    let Some(profile_id) = require_profile(app, conn_id) else {
        return;
    };
    let limit = limit.unwrap_or(20).min(50);
    match app.identity.search_friend_profiles(&profile_id, query, limit).await {
        Ok(profiles) => {
            let results = profiles.iter().map(|p| friend_entry(app, p)).collect();
            app.transport
                .send(conn_id, &ServerEvent::FriendsSearchResult { results });
        }
        Err(err) => friends_error(app, conn_id, map_identity_error(&err)),
    }
}

/// `friends:sendRequest`.
pub async fn handle_send_request(app: &AppState, conn_id: ConnId, target_profile_id: &str) {
    let Some(profile_id) = require_profile(app, conn_id) else {
        return;
    };
    match app.identity.send_friend_request(&profile_id, target_profile_id).await {
        Ok(request) => {
            app.transport
                .send(conn_id, &ServerEvent::FriendsRequestSent(request.clone()));
            let incoming = ServerEvent::FriendsIncomingRequest(request);
            for conn in app.transport.conns_for_profile(target_profile_id) {
                app.transport.send(conn, &incoming);
            }
        }
        Err(err) => friends_error(app, conn_id, map_identity_error(&err)),
    }
}

/// `friends:respondRequest`.
pub async fn handle_respond_request(
    app: &AppState,
    conn_id: ConnId,
    request_id: &str,
    accept: bool,
) {
    let Some(profile_id) = require_profile(app, conn_id) else {
        return;
    };
    match app.identity.respond_friend_request(&profile_id, request_id, accept).await {
        Ok(outcome) => {
            let friend = outcome
                .accepted
                .then(|| friend_entry(app, &outcome.other_profile));
            app.transport.send(
                conn_id,
                &ServerEvent::FriendsRequestResponded {
                    request_id: outcome.request_id.clone(),
                    accepted: outcome.accepted,
                    friend,
                },
            );
            // Both sides see their lists change.
            push_list(app, &profile_id).await;
            push_list(app, &outcome.other_profile.profile_id).await;
        }
        Err(err) => friends_error(app, conn_id, map_identity_error(&err)),
    }
}

/// `updateName` — renames the session, the profile, and any in-room record.
pub async fn handle_update_name(app: &AppState, conn_id: ConnId, new_name: &str) {
    let Some(meta) = app.transport.meta(conn_id) else {
        return;
    };
    let Some(pid) = meta.persistent_id else {
        return friends_error(app, conn_id, ErrorCode::AuthContextRequired);
    };
    let name = sanitize_name(Some(new_name), rand::random::<u32>());
    app.sessions.set_name(&pid, &name);

    // Fall back to the session's bound profile for sockets that identified
    // before this connection picked up the slot.
    let mut profile_id = meta
        .profile_id
        .or_else(|| app.sessions.get(&pid).and_then(|s| s.profile_id))
        .unwrap_or_default();
    if !profile_id.is_empty() {
        if let Ok(info) = app.identity.set_nickname(&profile_id, &name).await {
            profile_id = info.profile_id;
        }
    }

    // Rename the live room record too, so lobby and scoreboard follow.
    if let Some(room_code) = meta.room_code {
        let mut rooms = app.rooms.lock().await;
        if let Some(room) = rooms.get_mut(&room_code) {
            if let Some(key) = room.player_key_by_conn(conn_id) {
                if let Some(player) = room.player_mut(key) {
                    player.name = name.clone();
                }
                app.emit_room(
                    room,
                    &ServerEvent::NicknameUpdated {
                        profile_id: profile_id.clone(),
                        nickname: name.clone(),
                    },
                );
                app.emit_room(room, &ServerEvent::LobbyUpdate(room.lobby_state()));
            }
        }
    }

    app.transport.send(
        conn_id,
        &ServerEvent::NicknameUpdated { profile_id, nickname: name },
    );
}
