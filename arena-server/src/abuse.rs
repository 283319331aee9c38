//! Strike accounting, escalation and the audit trail.
//!
//! Every rejected gameplay event records a strike against the player. Strikes
//! accumulate in a rolling window and escalate to warn, soft block and hard
//! block. In observe mode escalations are only counted and logged; in enforce
//! mode they gate `playerInput` and `fireProjectile`. Everything lands in the
//! append-only JSONL audit streams via a dedicated writer task so the tick
//! never touches the filesystem.

use std::borrow::Cow;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Mutex;

use dashmap::DashMap;
use protocol::events::{AbuseAction, RateLimit};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{AbuseConfig, AbuseMode};

/// Strikes older than this fall out of the accounting window.
pub const STRIKE_WINDOW_MS: u64 = 15_000;
/// Minimum spacing of audit lines caused by one standing block.
pub const BLOCK_LOG_COOLDOWN_MS: u64 = 1_200;
/// In-memory ring of recent strike records.
pub const RECENT_RING_CAP: usize = 100;

/// Why a strike was recorded. The wire string is stable for log consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrikeReason {
    InvalidPayload,
    InputSeqWindow,
    InputAngleInvalid,
    InputToggleSpam,
    FireRate,
    FireStaleInput,
    FireChargeTooShort,
    FireProjectileCap,
    FireAngleWarn,
    FireAngleHardReject,
    FireOriginViolation,
    FireOcclusion,
    RateLimit(String),
}

impl StrikeReason {
    pub fn wire_str(&self) -> Cow<'static, str> {
        match self {
            Self::InvalidPayload => Cow::Borrowed("invalid_payload"),
            Self::InputSeqWindow => Cow::Borrowed("input_seq_window_violation"),
            Self::InputAngleInvalid => Cow::Borrowed("input_angle_invalid"),
            Self::InputToggleSpam => Cow::Borrowed("input_toggle_spam"),
            Self::FireRate => Cow::Borrowed("fire_rate_violation"),
            Self::FireStaleInput => Cow::Borrowed("fire_stale_input"),
            Self::FireChargeTooShort => Cow::Borrowed("fire_charge_too_short"),
            Self::FireProjectileCap => Cow::Borrowed("fire_projectile_cap"),
            Self::FireAngleWarn => Cow::Borrowed("fire_angle_warn"),
            Self::FireAngleHardReject => Cow::Borrowed("fire_angle_hard_reject"),
            Self::FireOriginViolation => Cow::Borrowed("fire_origin_violation"),
            Self::FireOcclusion => Cow::Borrowed("fire_path_occluded"),
            Self::RateLimit(event) => Cow::Owned(format!("rate_limit:{event}")),
        }
    }
}

/// Standing block level of one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockLevel {
    #[default]
    None,
    Soft,
    Hard,
}

/// Per-player strike bookkeeping, embedded in the room player record.
#[derive(Debug, Clone, Default)]
pub struct StrikeState {
    pub window_start_ms: u64,
    pub count_in_window: u32,
    pub warned: bool,
    pub level: BlockLevel,
    pub block_until_ms: u64,
    last_block_log_ms: u64,
}

impl StrikeState {
    /// Records one strike and reports the escalation crossed, if any.
    pub fn record(&mut self, cfg: &AbuseConfig, now_ms: u64) -> Option<AbuseAction> {
        if now_ms.saturating_sub(self.window_start_ms) >= STRIKE_WINDOW_MS {
            self.window_start_ms = now_ms;
            self.count_in_window = 0;
            self.warned = false;
        }
        self.count_in_window += 1;

        if self.count_in_window == cfg.hard_threshold {
            self.level = BlockLevel::Hard;
            self.block_until_ms = now_ms + cfg.hard_block_ms;
            Some(AbuseAction::HardBlock)
        } else if self.count_in_window == cfg.soft_threshold {
            self.level = BlockLevel::Soft;
            self.block_until_ms = now_ms + cfg.soft_block_ms;
            Some(AbuseAction::SoftBlock)
        } else if self.count_in_window == cfg.warn_threshold && !self.warned {
            self.warned = true;
            Some(AbuseAction::Warn)
        } else {
            None
        }
    }

    fn block_active(&self, now_ms: u64) -> bool {
        self.level != BlockLevel::None && now_ms < self.block_until_ms
    }

    /// Whether a `fireProjectile` event must be rejected right now.
    pub fn fire_blocked(&self, cfg: &AbuseConfig, now_ms: u64) -> bool {
        cfg.mode == AbuseMode::Enforce && self.block_active(now_ms)
    }

    /// Whether a `playerInput` event must be rejected right now.
    pub fn input_blocked(&self, cfg: &AbuseConfig, now_ms: u64) -> bool {
        cfg.mode == AbuseMode::Enforce
            && self.level == BlockLevel::Hard
            && now_ms < self.block_until_ms
    }

    /// Rate-limits audit lines while a block keeps rejecting events.
    pub fn should_log_block(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_block_log_ms) >= BLOCK_LOG_COOLDOWN_MS {
            self.last_block_log_ms = now_ms;
            true
        } else {
            false
        }
    }

    /// Cleared on match start and reconnect so stale windows cannot carry
    /// penalties across contexts.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Token buckets
// ---------------------------------------------------------------------------

/// One fixed-window counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateWindow {
    window_start_ms: u64,
    count: u32,
}

impl RateWindow {
    /// Counts the event and reports whether it is still inside the budget.
    pub fn allow(&mut self, limit: RateLimit, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.window_start_ms) >= limit.window_ms {
            self.window_start_ms = now_ms;
            self.count = 0;
        }
        self.count += 1;
        self.count <= limit.max
    }
}

/// Per-connection event buckets. Owned by the socket task, no sharing.
#[derive(Debug, Default)]
pub struct EventRateLimiter {
    windows: HashMap<String, RateWindow>,
}

impl EventRateLimiter {
    /// Accounts one occurrence of `event`; `true` means process it.
    pub fn allow(&mut self, event: &str, now_ms: u64) -> bool {
        let Some(limit) = protocol::ClientEvent::rate_limit(event) else {
            return true;
        };
        self.windows
            .entry(event.to_string())
            .or_default()
            .allow(limit, now_ms)
    }
}

/// Process-wide buckets keyed by an arbitrary scope string (source IP or
/// persistent id) guarding the handshake-adjacent events.
#[derive(Debug, Default)]
pub struct ScopedRateLimiter {
    buckets: DashMap<String, RateWindow>,
}

impl ScopedRateLimiter {
    pub fn allow(&self, scope: &str, limit: RateLimit, now_ms: u64) -> bool {
        self.buckets
            .entry(scope.to_string())
            .or_default()
            .allow(limit, now_ms)
    }

    /// Drops buckets that have been idle for at least `idle_ms`.
    pub fn prune(&self, idle_ms: u64, now_ms: u64) {
        self.buckets
            .retain(|_, w| now_ms.saturating_sub(w.window_start_ms) < idle_ms);
    }
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

/// Which JSONL file a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStream {
    Recent,
    Escalations,
    RoomSnapshots,
}

impl AuditStream {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Recent => "anti-cheat-recent.jsonl",
            Self::Escalations => "anti-cheat-escalations.jsonl",
            Self::RoomSnapshots => "anti-cheat-room-snapshots.jsonl",
        }
    }
}

/// One self-contained audit line.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub ts: u64,
    #[serde(skip)]
    pub stream: AuditStream,
    pub reason: String,
    pub room: Option<String>,
    pub conn_id: Option<u64>,
    pub player_id: Option<String>,
    pub name: Option<String>,
    pub details: Value,
}

/// Handle game code appends to. The ring is for the telemetry page; the
/// channel feeds the file writer.
#[derive(Debug)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditRecord>,
    ring: Mutex<VecDeque<AuditRecord>>,
}

impl AuditLog {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx, ring: Mutex::new(VecDeque::with_capacity(RECENT_RING_CAP)) },
            rx,
        )
    }

    pub fn append(&self, record: AuditRecord) {
        if record.stream == AuditStream::Recent {
            let mut ring = self.ring.lock().expect("audit ring poisoned");
            if ring.len() == RECENT_RING_CAP {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }
        // The writer task owning the receiver may already be gone during
        // shutdown; records are best-effort at that point.
        let _ = self.tx.send(record);
    }

    pub fn recent(&self) -> Vec<AuditRecord> {
        self.ring.lock().expect("audit ring poisoned").iter().cloned().collect()
    }
}

/// Drains the audit channel into the per-stream JSONL files until the sender
/// side is dropped, then flushes and exits.
pub async fn run_audit_writer(
    mut rx: mpsc::UnboundedReceiver<AuditRecord>,
    data_dir: std::path::PathBuf,
) {
    if let Err(err) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(?err, dir = %data_dir.display(), "Cannot create audit data dir");
        // Keep draining so senders never notice; records are lost.
        while rx.recv().await.is_some() {}
        return;
    }

    let mut files: HashMap<&'static str, std::fs::File> = HashMap::new();
    while let Some(record) = rx.recv().await {
        let name = record.stream.file_name();
        let file = files.entry(name).or_insert_with(|| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(data_dir.join(name))
                .unwrap_or_else(|err| {
                    tracing::error!(?err, file = name, "Audit file open failed, using sink");
                    // A null sink keeps the loop simple on broken setups.
                    std::fs::OpenOptions::new()
                        .write(true)
                        .open(if cfg!(windows) { "NUL" } else { "/dev/null" })
                        .expect("null sink")
                })
        });
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(err) = writeln!(file, "{line}") {
                    tracing::warn!(?err, "Audit append failed");
                }
            }
            Err(err) => tracing::warn!(?err, "Audit record serialization failed"),
        }
    }
    for file in files.values_mut() {
        let _ = file.flush();
    }
    tracing::info!("Audit writer drained");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(mode: AbuseMode) -> AbuseConfig {
        AbuseConfig { mode, ..AbuseConfig::default() }
    }

    #[test]
    fn escalation_ladder_fires_at_exact_thresholds() {
        let cfg = cfg(AbuseMode::Enforce);
        let mut st = StrikeState::default();
        let mut actions = Vec::new();
        for _ in 0..10 {
            if let Some(a) = st.record(&cfg, 1_000) {
                actions.push((st.count_in_window, a));
            }
        }
        assert_eq!(
            actions,
            vec![
                (3, AbuseAction::Warn),
                (6, AbuseAction::SoftBlock),
                (10, AbuseAction::HardBlock),
            ]
        );
    }

    #[test]
    fn window_expiry_resets_the_count() {
        let cfg = cfg(AbuseMode::Enforce);
        let mut st = StrikeState::default();
        st.record(&cfg, 0);
        st.record(&cfg, 0);
        // Third strike lands in a fresh window, so no warn.
        assert_eq!(st.record(&cfg, STRIKE_WINDOW_MS), None);
        assert_eq!(st.count_in_window, 1);
    }

    #[test]
    fn soft_block_gates_fire_only_and_expires() {
        let cfg = cfg(AbuseMode::Enforce);
        let mut st = StrikeState::default();
        for _ in 0..6 {
            st.record(&cfg, 1_000);
        }
        assert_eq!(st.level, BlockLevel::Soft);
        assert!(st.fire_blocked(&cfg, 1_001));
        assert!(!st.input_blocked(&cfg, 1_001));
        assert!(!st.fire_blocked(&cfg, 1_000 + cfg.soft_block_ms));
    }

    #[test]
    fn hard_block_gates_both_event_kinds() {
        let cfg = cfg(AbuseMode::Enforce);
        let mut st = StrikeState::default();
        for _ in 0..10 {
            st.record(&cfg, 1_000);
        }
        assert_eq!(st.level, BlockLevel::Hard);
        assert!(st.fire_blocked(&cfg, 2_000));
        assert!(st.input_blocked(&cfg, 2_000));
        assert!(!st.input_blocked(&cfg, 1_000 + cfg.hard_block_ms));
    }

    #[test]
    fn observe_mode_never_blocks() {
        let cfg = cfg(AbuseMode::Observe);
        let mut st = StrikeState::default();
        for _ in 0..10 {
            st.record(&cfg, 1_000);
        }
        assert!(!st.fire_blocked(&cfg, 1_001));
        assert!(!st.input_blocked(&cfg, 1_001));
    }

    #[test]
    fn block_logging_honors_the_cooldown() {
        let mut st = StrikeState::default();
        assert!(st.should_log_block(5_000));
        assert!(!st.should_log_block(5_000 + BLOCK_LOG_COOLDOWN_MS - 1));
        assert!(st.should_log_block(5_000 + BLOCK_LOG_COOLDOWN_MS));
    }

    #[test]
    fn rate_window_allows_up_to_the_budget_then_recovers() {
        let limit = RateLimit { max: 3, window_ms: 1_000 };
        let mut w = RateWindow::default();
        assert!(w.allow(limit, 0));
        assert!(w.allow(limit, 10));
        assert!(w.allow(limit, 20));
        assert!(!w.allow(limit, 30));
        assert!(w.allow(limit, 1_000));
    }

    #[test]
    fn event_limiter_uses_the_protocol_budgets() {
        let mut limiter = EventRateLimiter::default();
        for _ in 0..4 {
            assert!(limiter.allow("createRoom", 0));
        }
        assert!(!limiter.allow("createRoom", 0));
        // Unlimited events always pass.
        for _ in 0..100 {
            assert!(limiter.allow("pong", 0));
        }
    }

    #[test]
    fn recent_ring_is_capped() {
        let (log, mut rx) = AuditLog::new();
        for i in 0..(RECENT_RING_CAP as u64 + 20) {
            log.append(AuditRecord {
                ts: i,
                stream: AuditStream::Recent,
                reason: "fire_rate_violation".into(),
                room: None,
                conn_id: Some(i),
                player_id: None,
                name: None,
                details: Value::Null,
            });
        }
        let recent = log.recent();
        assert_eq!(recent.len(), RECENT_RING_CAP);
        assert_eq!(recent.first().unwrap().ts, 20);
        // Everything still reached the writer channel.
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, RECENT_RING_CAP + 20);
    }

    #[test]
    fn rate_limit_reason_carries_the_event_name() {
        let reason = StrikeReason::RateLimit("fireProjectile".into());
        assert_eq!(reason.wire_str(), "rate_limit:fireProjectile");
    }
}
