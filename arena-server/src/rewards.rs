//! The instant-respawn reward flag.
//!
//! A rewarded-ad completion marks the device pending. The next match start
//! converts the flag into three in-match charges; a death consumes a charge
//! and skips the respawn delay. If a granted player finishes the match
//! without using any charge the flag is restored, otherwise it stays cleared.

use dashmap::DashMap;

/// Per-device reward state.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewardFlag {
    pub instant_respawn_pending: bool,
    pub updated_at_ms: u64,
}

#[derive(Debug, Default)]
pub struct RewardStore {
    flags: DashMap<String, RewardFlag>,
}

impl RewardStore {
    pub fn get(&self, persistent_id: &str) -> RewardFlag {
        self.flags.get(persistent_id).map(|f| *f).unwrap_or_default()
    }

    pub fn set_pending(&self, persistent_id: &str, pending: bool, now_ms: u64) -> RewardFlag {
        let flag = RewardFlag { instant_respawn_pending: pending, updated_at_ms: now_ms };
        self.flags.insert(persistent_id.to_string(), flag);
        flag
    }

    /// Consumes the pending flag at match start; returns whether charges are
    /// granted for this match.
    pub fn take_pending(&self, persistent_id: &str, now_ms: u64) -> bool {
        let was_pending = self.get(persistent_id).instant_respawn_pending;
        if was_pending {
            self.set_pending(persistent_id, false, now_ms);
        }
        was_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_pending_clears_the_flag_once() {
        let store = RewardStore::default();
        store.set_pending("device-aaaaaa", true, 100);
        assert!(store.take_pending("device-aaaaaa", 200));
        assert!(!store.take_pending("device-aaaaaa", 300));
        assert!(!store.get("device-aaaaaa").instant_respawn_pending);
    }

    #[test]
    fn unknown_devices_default_to_not_pending() {
        let store = RewardStore::default();
        assert!(!store.get("device-zzzzzz").instant_respawn_pending);
        assert!(!store.take_pending("device-zzzzzz", 100));
    }
}
