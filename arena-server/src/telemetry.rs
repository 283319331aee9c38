//! Process-wide counters and the plain-text admin page.
//!
//! Nothing here is required for gameplay correctness; the counters are
//! relaxed atomics bumped from wherever something notable happens and
//! rendered on `GET /telemetry`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::room::RoomStore;

#[derive(Debug, Default)]
pub struct Telemetry {
    pub connections_total: AtomicU64,
    pub events_total: AtomicU64,
    pub strikes_total: AtomicU64,
    pub warns_total: AtomicU64,
    pub soft_blocks_total: AtomicU64,
    pub hard_blocks_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub reconnects_total: AtomicU64,
    pub matches_started_total: AtomicU64,
    pub matches_finished_total: AtomicU64,
}

impl Telemetry {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Renders the admin page: global counters first, then one line per room
    /// with its suspicion aggregates.
    pub fn render(&self, rooms: &RoomStore, live_connections: usize) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "connections: live {:>5}  total {:>8}\n",
            live_connections,
            Self::read(&self.connections_total)
        ));
        out.push_str(&format!(
            "events:      total {:>8}  rate-limited {:>6}\n",
            Self::read(&self.events_total),
            Self::read(&self.rate_limited_total)
        ));
        out.push_str(&format!(
            "strikes:     total {:>8}  warn {:>5}  soft {:>5}  hard {:>5}\n",
            Self::read(&self.strikes_total),
            Self::read(&self.warns_total),
            Self::read(&self.soft_blocks_total),
            Self::read(&self.hard_blocks_total)
        ));
        out.push_str(&format!(
            "matches:     started {:>6}  finished {:>6}  reconnects {:>6}\n",
            Self::read(&self.matches_started_total),
            Self::read(&self.matches_finished_total),
            Self::read(&self.reconnects_total)
        ));
        out.push_str(&format!("rooms: {}\n", rooms.len()));
        for room in rooms.iter() {
            let suspects = {
                let mut entries: Vec<_> = room.suspicion.per_player.iter().collect();
                entries.sort_by(|a, b| b.1.cmp(a.1));
                entries
                    .iter()
                    .map(|(key, score)| format!("{key}:{score}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            out.push_str(&format!(
                "Room: {:<6} Phase: {:<8?} Players: {:>2} Suspicion events: {:>5} [{}]\n",
                room.code,
                room.phase,
                room.players.len(),
                room.suspicion.total_events,
                suspects
            ));
        }
        out
    }
}
