//! Party invites: pull a friend into your lobby.
//!
//! Invites are only valid while the target room sits in the lobby phase; any
//! transition out of lobby (or room deletion) cancels everything pending for
//! that room. Expiry is checked on respond and swept by the watchdog.

use dashmap::DashMap;
use protocol::ErrorCode;
use protocol::ServerEvent;
use protocol::consts::PARTY_INVITE_TTL_MS;
use protocol::events::ErrorNotice;
use protocol::wire::{PartyInviteInfo, RoomPhase};
use rand::Rng;

use crate::lobby;
use crate::room::ConnId;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct PartyInvite {
    pub id: String,
    pub from_profile_id: String,
    pub from_nickname: String,
    pub to_profile_id: String,
    pub room_code: String,
    pub expires_at_ms: u64,
}

impl PartyInvite {
    pub fn wire(&self) -> PartyInviteInfo {
        PartyInviteInfo {
            invite_id: self.id.clone(),
            from_profile_id: self.from_profile_id.clone(),
            from_nickname: self.from_nickname.clone(),
            room_code: self.room_code.clone(),
            expires_at: self.expires_at_ms,
        }
    }
}

/// Pending invites by invite id.
#[derive(Debug, Default)]
pub struct InviteStore {
    invites: DashMap<String, PartyInvite>,
}

impl InviteStore {
    pub fn create(
        &self,
        from_profile_id: &str,
        from_nickname: &str,
        to_profile_id: &str,
        room_code: &str,
        now_ms: u64,
    ) -> PartyInvite {
        let invite = PartyInvite {
            id: format!("pinv-{:08x}", rand::rng().random::<u32>()),
            from_profile_id: from_profile_id.to_string(),
            from_nickname: from_nickname.to_string(),
            to_profile_id: to_profile_id.to_string(),
            room_code: room_code.to_string(),
            expires_at_ms: now_ms + PARTY_INVITE_TTL_MS,
        };
        self.invites.insert(invite.id.clone(), invite.clone());
        invite
    }

    pub fn take(&self, invite_id: &str) -> Option<PartyInvite> {
        self.invites.remove(invite_id).map(|(_, i)| i)
    }

    /// True when this target already has a pending invite into the room.
    pub fn has_pending(&self, to_profile_id: &str, room_code: &str, now_ms: u64) -> bool {
        self.invites.iter().any(|i| {
            i.to_profile_id == to_profile_id
                && i.room_code == room_code
                && i.expires_at_ms > now_ms
        })
    }

    /// Cancels every invite targeting a room. Returns them for notification.
    pub fn invalidate_room(&self, room_code: &str) -> Vec<PartyInvite> {
        let ids: Vec<String> = self
            .invites
            .iter()
            .filter(|i| i.room_code == room_code)
            .map(|i| i.id.clone())
            .collect();
        ids.into_iter().filter_map(|id| self.take(&id)).collect()
    }

    /// Drops invites past their TTL. Returns them for notification.
    pub fn prune_expired(&self, now_ms: u64) -> Vec<PartyInvite> {
        let ids: Vec<String> = self
            .invites
            .iter()
            .filter(|i| i.expires_at_ms <= now_ms)
            .map(|i| i.id.clone())
            .collect();
        ids.into_iter().filter_map(|id| self.take(&id)).collect()
    }
}

/// Tells both sides that a batch of invites is gone.
pub fn notify_invites_expired(app: &AppState, invites: &[PartyInvite]) {
    for invite in invites {
        let event = ServerEvent::PartyInviteExpired { invite_id: invite.id.clone() };
        for conn in app.transport.conns_for_profile(&invite.to_profile_id) {
            app.transport.send(conn, &event);
        }
        for conn in app.transport.conns_for_profile(&invite.from_profile_id) {
            app.transport.send(conn, &event);
        }
    }
}

fn invite_error(app: &AppState, conn_id: ConnId, code: ErrorCode) {
    app.transport.send(
        conn_id,
        &ServerEvent::PartyInviteError(ErrorNotice {
            code,
            message: code.as_str().to_string(),
        }),
    );
}

/// `party:inviteFriend` — leaderless lobby members may invite too; the only
/// requirements are friendship, presence and a lobby-phase room.
pub async fn handle_invite_friend(
    app: &AppState,
    conn_id: ConnId,
    target_profile_id: &str,
    now_ms: u64,
) {
    let Some(meta) = app.transport.meta(conn_id) else {
        return;
    };
    let Some(profile_id) = meta.profile_id else {
        return invite_error(app, conn_id, ErrorCode::AuthContextRequired);
    };
    let Some(room_code) = meta.room_code else {
        return invite_error(app, conn_id, ErrorCode::PartyInviteNotAllowed);
    };

    // Friendship check against the identity store.
    let friends = match app.identity.get_friends_state(&profile_id).await {
        Ok(state) => state,
        Err(_) => return invite_error(app, conn_id, ErrorCode::ProfileNotFound),
    };
    if !friends.friends.iter().any(|f| f.profile_id == target_profile_id) {
        return invite_error(app, conn_id, ErrorCode::ProfileNotFound);
    }
    if app.transport.conns_for_profile(target_profile_id).is_empty() {
        return invite_error(app, conn_id, ErrorCode::TargetNotOnline);
    }

    let from_nickname;
    {
        let mut rooms = app.rooms.lock().await;
        let Some(room) = rooms.get_mut(&room_code) else {
            return invite_error(app, conn_id, ErrorCode::RoomNotFound);
        };
        if room.phase != RoomPhase::Lobby {
            return invite_error(app, conn_id, ErrorCode::PartyInviteNotAllowed);
        }
        if room
            .players
            .values()
            .any(|p| p.profile_id.as_deref() == Some(target_profile_id))
        {
            return invite_error(app, conn_id, ErrorCode::TargetAlreadyInParty);
        }
        from_nickname = room
            .player_by_conn(conn_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();
    }
    if app.invites.has_pending(target_profile_id, &room_code, now_ms) {
        return invite_error(app, conn_id, ErrorCode::PartyInviteNotAllowed);
    }

    let invite = app
        .invites
        .create(&profile_id, &from_nickname, target_profile_id, &room_code, now_ms);
    for conn in app.transport.conns_for_profile(target_profile_id) {
        app.transport
            .send(conn, &ServerEvent::PartyInviteReceived(invite.wire()));
    }
    app.transport
        .send(conn_id, &ServerEvent::PartyInviteSent(invite.wire()));
}

/// `party:inviteRespond` — acceptance moves the responder into the room.
pub async fn handle_invite_respond(
    app: &AppState,
    conn_id: ConnId,
    invite_id: &str,
    accept: bool,
    now_ms: u64,
) {
    let Some(meta) = app.transport.meta(conn_id) else {
        return;
    };
    let (Some(pid), Some(profile_id)) = (meta.persistent_id, meta.profile_id) else {
        return invite_error(app, conn_id, ErrorCode::AuthContextRequired);
    };

    let Some(invite) = app.invites.take(invite_id) else {
        return invite_error(app, conn_id, ErrorCode::PartyInviteExpired);
    };
    if invite.to_profile_id != profile_id {
        return invite_error(app, conn_id, ErrorCode::PartyInviteExpired);
    }
    if invite.expires_at_ms <= now_ms {
        notify_invites_expired(app, std::slice::from_ref(&invite));
        return invite_error(app, conn_id, ErrorCode::PartyInviteExpired);
    }

    let responded = |accepted: bool| ServerEvent::PartyInviteResponded {
        invite_id: invite.id.clone(),
        accepted,
        by_profile_id: profile_id.clone(),
    };

    if !accept {
        for conn in app.transport.conns_for_profile(&invite.from_profile_id) {
            app.transport.send(conn, &responded(false));
        }
        return;
    }

    // Leave the current lobby first, unless it is the invite's own room
    // (then the join below just rebinds the existing seat).
    if let Some(current) = app.transport.meta(conn_id).and_then(|m| m.room_code) {
        if current != invite.room_code {
            lobby::handle_leave_room(app, conn_id, now_ms).await;
        }
    }

    let name = app
        .sessions
        .get(&pid)
        .map(|s| s.name)
        .unwrap_or_else(|| "Player".to_string());
    match lobby::join_room_for_conn(app, conn_id, &pid, Some(&profile_id), &invite.room_code, name)
        .await
    {
        Ok(()) => {
            for conn in app.transport.conns_for_profile(&invite.from_profile_id) {
                app.transport.send(conn, &responded(true));
            }
            // Party members get the dedicated lobby-state push on top of the
            // regular lobby update.
            let rooms = app.rooms.lock().await;
            if let Some(room) = rooms.get(&invite.room_code) {
                app.emit_room(room, &ServerEvent::PartyLobbyState(room.lobby_state()));
            }
        }
        Err(code) => invite_error(app, conn_id, code),
    }
}
