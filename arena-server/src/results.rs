//! Post-match result retention.
//!
//! When a match ends every participant gets a pending copy of the final
//! scoreboard keyed by persistent id, so a device that reconnects late still
//! sees the result screen. Entries expire after the retention window and the
//! client acknowledges receipt; a second ack is a no-op.

use dashmap::DashMap;
use protocol::consts::RESULTS_RETENTION_MS;
use protocol::wire::{MatchResults, PlayerResult};

/// One retained result.
#[derive(Debug, Clone)]
pub struct PendingResult {
    pub room_code: String,
    pub players: Vec<PlayerResult>,
    pub ended_at_ms: u64,
    pub expires_at_ms: u64,
}

impl PendingResult {
    pub fn wire(&self) -> MatchResults {
        MatchResults {
            room_code: self.room_code.clone(),
            players: self.players.clone(),
            ended_at: self.ended_at_ms,
        }
    }
}

/// Pending results keyed by persistent id.
#[derive(Debug, Default)]
pub struct ResultsStore {
    pending: DashMap<String, PendingResult>,
}

impl ResultsStore {
    /// Stores the scoreboard for every participant of a finished match.
    pub fn store_match(
        &self,
        room_code: &str,
        participants: &[String],
        players: Vec<PlayerResult>,
        ended_at_ms: u64,
    ) {
        for pid in participants {
            self.pending.insert(
                pid.clone(),
                PendingResult {
                    room_code: room_code.to_string(),
                    players: players.clone(),
                    ended_at_ms,
                    expires_at_ms: ended_at_ms + RESULTS_RETENTION_MS,
                },
            );
        }
    }

    /// The still-fresh pending result for this device, if any. Expired
    /// entries are dropped on the way out.
    pub fn fresh(&self, persistent_id: &str, now_ms: u64) -> Option<PendingResult> {
        let expired = match self.pending.get(persistent_id) {
            Some(entry) if entry.expires_at_ms > now_ms => return Some(entry.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.pending.remove(persistent_id);
        }
        None
    }

    /// Acknowledge receipt. Idempotent: the first call removes the entry and
    /// reports the room it belonged to, later calls do nothing.
    pub fn ack(&self, persistent_id: &str) -> Option<String> {
        self.pending.remove(persistent_id).map(|(_, p)| p.room_code)
    }

    /// Periodic cleanup of entries nobody ever fetched.
    pub fn prune(&self, now_ms: u64) {
        self.pending.retain(|_, p| p.expires_at_ms > now_ms);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
