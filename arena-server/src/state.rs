//! Process-wide state shared by the socket handlers and the tick driver.
//!
//! Rooms are behind one async mutex: the tick and every room-touching event
//! handler serialize on it, which is the whole concurrency story for room
//! mutation. The keyed side tables (sessions, results, rewards, guards) are
//! concurrent maps written on the socket path.

use std::sync::Arc;

use protocol::ServerEvent;
use protocol::events::{AbuseAction, AntiCheatNotice};
use protocol::wire::PlayerKey;
use tokio::sync::Mutex;

use crate::abuse::{AuditLog, AuditRecord, AuditStream, ScopedRateLimiter, StrikeReason};
use crate::config::ServerConfig;
use crate::identity::IdentityStore;
use crate::map::MapCatalog;
use crate::party::InviteStore;
use crate::reconnect::ReconnectGuard;
use crate::results::ResultsStore;
use crate::rewards::RewardStore;
use crate::room::{Room, RoomStore};
use crate::session::SessionStore;
use crate::sim;
use crate::telemetry::Telemetry;
use crate::transport::Transport;

pub struct AppState {
    pub config: ServerConfig,
    pub maps: MapCatalog,
    pub rooms: Mutex<RoomStore>,
    pub transport: Transport,
    pub sessions: SessionStore,
    pub results: ResultsStore,
    pub rewards: RewardStore,
    pub invites: InviteStore,
    pub reconnect: ReconnectGuard,
    /// Handshake guards by source address and by claimed device id.
    pub ip_limits: ScopedRateLimiter,
    pub pid_limits: ScopedRateLimiter,
    pub audit: AuditLog,
    pub telemetry: Telemetry,
    pub identity: Arc<dyn IdentityStore>,
}

impl AppState {
    pub fn new(config: ServerConfig, identity: Arc<dyn IdentityStore>, audit: AuditLog) -> Self {
        Self {
            config,
            maps: MapCatalog::new(),
            rooms: Mutex::new(RoomStore::default()),
            transport: Transport::default(),
            sessions: SessionStore::default(),
            results: ResultsStore::default(),
            rewards: RewardStore::default(),
            invites: InviteStore::default(),
            reconnect: ReconnectGuard::default(),
            ip_limits: ScopedRateLimiter::default(),
            pid_limits: ScopedRateLimiter::default(),
            audit,
            telemetry: Telemetry::default(),
            identity,
        }
    }

    /// Broadcast to every connected member of a room.
    pub fn emit_room(&self, room: &Room, event: &ServerEvent) {
        self.transport.broadcast(sim::room_conns(room), event);
    }

    /// Records a strike against an in-room player: window accounting, room
    /// suspicion, audit trail, telemetry, and the offender notice on
    /// escalation. Returns the escalation crossed, if any.
    pub fn record_strike(
        &self,
        room: &mut Room,
        player_key: PlayerKey,
        reason: StrikeReason,
        details: serde_json::Value,
        now_ms: u64,
    ) -> Option<AbuseAction> {
        let room_code = room.code.clone();
        let Some(player) = room.players.get_mut(&player_key) else {
            return None;
        };
        let conn_id = player.conn_id;
        let pid = player.persistent_id.clone();
        let name = player.name.clone();
        let action = player.strikes.record(&self.config.abuse, now_ms);
        let block_until = player.strikes.block_until_ms;
        room.suspicion.record(player_key);

        Telemetry::bump(&self.telemetry.strikes_total);
        self.audit.append(AuditRecord {
            ts: now_ms,
            stream: AuditStream::Recent,
            reason: reason.wire_str().into_owned(),
            room: Some(room_code.clone()),
            conn_id: Some(conn_id),
            player_id: Some(pid.clone()),
            name: Some(name.clone()),
            details,
        });

        if let Some(action) = action {
            let (counter, expires_at) = match action {
                AbuseAction::Warn => (&self.telemetry.warns_total, None),
                AbuseAction::SoftBlock => (&self.telemetry.soft_blocks_total, Some(block_until)),
                AbuseAction::HardBlock => (&self.telemetry.hard_blocks_total, Some(block_until)),
            };
            Telemetry::bump(counter);
            self.audit.append(AuditRecord {
                ts: now_ms,
                stream: AuditStream::Escalations,
                reason: reason.wire_str().into_owned(),
                room: Some(room_code),
                conn_id: Some(conn_id),
                player_id: Some(pid),
                name: Some(name),
                details: serde_json::json!({ "action": action, "blockUntil": block_until }),
            });
            self.transport.send(
                conn_id,
                &ServerEvent::AntiCheatAction(AntiCheatNotice {
                    action,
                    reason: reason.wire_str().into_owned(),
                    expires_at,
                }),
            );
        }
        action
    }
}
