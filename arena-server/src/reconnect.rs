//! Reconnection into a running match.
//!
//! Identification scans the rooms for an in-match record with the same
//! persistent id; a hit rebinds the record's connection id to the new socket
//! and resets the input state so the fresh sequence counter cannot earn false
//! strikes. A per-device guard bounds how often the scan may run, and a
//! still-attached older socket is evicted before the rebind.

use dashmap::DashMap;
use protocol::ServerEvent;
use protocol::consts::{RECONNECT_MAX_ATTEMPTS, RECONNECT_WINDOW_MS};
use protocol::events::ReconnectedToGame;

use crate::room::ConnId;
use crate::sim;
use crate::state::AppState;
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, Default)]
struct AttemptWindow {
    window_start_ms: u64,
    attempts: u32,
}

/// Outcome of asking the guard for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectBudget {
    Allowed,
    /// Blocked; retry after this many milliseconds.
    Limited { retry_after_ms: u64 },
}

#[derive(Debug, Default)]
pub struct ReconnectGuard {
    windows: DashMap<String, AttemptWindow>,
}

impl ReconnectGuard {
    /// Counts an attempt and reports whether it may proceed.
    pub fn check(&self, persistent_id: &str, now_ms: u64) -> ReconnectBudget {
        let mut entry = self.windows.entry(persistent_id.to_string()).or_default();
        if now_ms.saturating_sub(entry.window_start_ms) >= RECONNECT_WINDOW_MS {
            entry.window_start_ms = now_ms;
            entry.attempts = 0;
        }
        entry.attempts += 1;
        if entry.attempts <= RECONNECT_MAX_ATTEMPTS {
            ReconnectBudget::Allowed
        } else {
            let retry_after_ms =
                (entry.window_start_ms + RECONNECT_WINDOW_MS).saturating_sub(now_ms);
            ReconnectBudget::Limited { retry_after_ms }
        }
    }

    /// Drops windows idle longer than the guard window.
    pub fn prune(&self, now_ms: u64) {
        self.windows
            .retain(|_, w| now_ms.saturating_sub(w.window_start_ms) < RECONNECT_WINDOW_MS);
    }
}

/// Attempts to bind this connection to an in-match record of the device.
/// Returns `true` when the event is fully handled (reconnected or limited).
pub async fn try_reconnect(app: &AppState, conn_id: ConnId, pid: &str, now_ms: u64) -> bool {
    let mut rooms = app.rooms.lock().await;
    let Some(room) = rooms.find_active_by_pid(pid) else {
        return false;
    };
    let Some(map_key) = room.map_key else {
        return false;
    };

    match app.reconnect.check(pid, now_ms) {
        ReconnectBudget::Allowed => {}
        ReconnectBudget::Limited { retry_after_ms } => {
            app.transport
                .send(conn_id, &ServerEvent::ReconnectLimited { retry_after_ms });
            return true;
        }
    }

    let Some(key) = room.player_by_pid(pid).map(|p| p.key) else {
        return false;
    };
    let old_conn = room.player(key).map(|p| p.conn_id);
    if let Some(old_conn) = old_conn {
        if old_conn != conn_id && app.transport.meta(old_conn).is_some() {
            // Evict the stale socket; dropping its channel ends its tasks.
            app.transport.unregister(old_conn);
        }
    }

    let room_code = room.code.clone();
    {
        let player = room.player_mut(key).expect("key just resolved");
        player.conn_id = conn_id;
        player.disconnected = false;
        player.reset_input_for_reconnect();
    }
    app.transport.set_room(conn_id, &room_code, key);
    Telemetry::bump(&app.telemetry.reconnects_total);

    let payload = ReconnectedToGame {
        room_code,
        map: map_key,
        phase: room.phase,
        match_start: room.match_start_ms,
        player_key: key,
        players: room.players.values().map(|p| p.wire_state(now_ms)).collect(),
        buffs: room.buffs.iter().map(|b| b.wire_state()).collect(),
    };
    app.transport
        .send(conn_id, &ServerEvent::ReconnectedToGame(payload));
    app.transport
        .broadcast(sim::room_conns(room), &ServerEvent::LobbyUpdate(room.lobby_state()));
    tracing::info!(conn_id, "Reconnected into running match");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_allows_six_then_limits() {
        let guard = ReconnectGuard::default();
        for _ in 0..RECONNECT_MAX_ATTEMPTS {
            assert_eq!(guard.check("device-aaaaaa", 1_000), ReconnectBudget::Allowed);
        }
        match guard.check("device-aaaaaa", 2_000) {
            ReconnectBudget::Limited { retry_after_ms } => {
                assert_eq!(retry_after_ms, RECONNECT_WINDOW_MS - 1_000);
            }
            ReconnectBudget::Allowed => panic!("seventh attempt must be limited"),
        }
    }

    #[test]
    fn window_expiry_restores_the_budget() {
        let guard = ReconnectGuard::default();
        for _ in 0..=RECONNECT_MAX_ATTEMPTS {
            guard.check("device-aaaaaa", 1_000);
        }
        assert_eq!(
            guard.check("device-aaaaaa", 1_000 + RECONNECT_WINDOW_MS),
            ReconnectBudget::Allowed
        );
    }

    #[test]
    fn devices_are_independent() {
        let guard = ReconnectGuard::default();
        for _ in 0..=RECONNECT_MAX_ATTEMPTS {
            guard.check("device-aaaaaa", 1_000);
        }
        assert_eq!(guard.check("device-bbbbbb", 1_000), ReconnectBudget::Allowed);
    }
}
