//! Payload types carried inside the event envelopes.
//!
//! World state flows as a full snapshot or as per-entity deltas. A delta upsert
//! carries only the fields that actually changed; [`WorldSnapshot::apply_delta`]
//! is the client-side reconstruction, kept next to the types so both directions
//! stay in lockstep.

use serde::{Deserialize, Serialize};

/// Room-local stable identifier of a player record.
pub type PlayerKey = u16;

/// The maps a match can be played on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKey {
    Forest,
    Canyon,
    Island,
}

impl MapKey {
    pub const ALL: [MapKey; 3] = [MapKey::Forest, MapKey::Canyon, MapKey::Island];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forest => "forest",
            Self::Canyon => "canyon",
            Self::Island => "island",
        }
    }
}

/// Lifecycle phase of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPhase {
    Lobby,
    Starting,
    Playing,
}

impl RoomPhase {
    /// `starting` and `playing` both count as an active match; reconnect
    /// predicates treat the countdown the same as live play.
    pub fn is_active_match(self) -> bool {
        matches!(self, Self::Starting | Self::Playing)
    }
}

/// What a buff spawn point currently offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuffKind {
    Health,
    Shield,
    Invisible,
    Speed,
}

/// Killstreak reward tiers, attached to kill broadcasts when reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreakTier {
    ExtraCore,
    Momentum,
    FastCharge,
    SteadyAim,
    Legendary,
}

impl StreakTier {
    /// The tier reached exactly at the given killstreak, if any.
    pub fn at_streak(streak: u32) -> Option<StreakTier> {
        match streak {
            3 => Some(Self::ExtraCore),
            5 => Some(Self::Momentum),
            7 => Some(Self::FastCharge),
            9 => Some(Self::SteadyAim),
            12 => Some(Self::Legendary),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Lobby
// ---------------------------------------------------------------------------

/// One seat in a lobby snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPlayer {
    pub id: PlayerKey,
    pub name: String,
    pub ready: bool,
    pub connected: bool,
    pub is_leader: bool,
}

/// The canonical lobby state broadcast after every membership change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyState {
    pub room_code: String,
    pub leader: PlayerKey,
    pub phase: RoomPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<MapKey>,
    pub players: Vec<LobbyPlayer>,
}

// ---------------------------------------------------------------------------
// World state
// ---------------------------------------------------------------------------

/// Full per-player state as carried in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub id: PlayerKey,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub angle: f64,
    pub hp: i32,
    pub max_hp: i32,
    pub kills: u32,
    pub deaths: u32,
    pub killstreak: u32,
    pub has_shield: bool,
    pub invisible: bool,
    pub speed_boost: bool,
    pub shield_until: u64,
    pub invisible_until: u64,
    pub speed_until: u64,
    pub charging: bool,
    pub last_seq: u64,
}

/// Full projectile state as carried in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectileState {
    pub id: u64,
    pub owner: PlayerKey,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub angle: f64,
}

/// Full buff-spawn state as carried in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuffState {
    pub id: u8,
    pub x: f64,
    pub y: f64,
    pub kind: BuffKind,
    pub active: bool,
    pub taken_at: u64,
}

/// Changed fields of one player. Absent fields did not change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpsert {
    pub id: PlayerKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kills: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deaths: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killstreak: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_shield: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invisible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_boost: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shield_until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invisible_until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
}

/// Changed fields of one projectile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectileUpsert {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<PlayerKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
}

/// Changed fields of one buff spawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuffUpsert {
    pub id: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<BuffKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<u64>,
}

/// Upserts plus removals for one entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaSet<T, Id> {
    pub upserts: Vec<T>,
    pub removed: Vec<Id>,
}

impl<T, Id> Default for DeltaSet<T, Id> {
    fn default() -> Self {
        Self { upserts: Vec::new(), removed: Vec::new() }
    }
}

impl<T, Id> DeltaSet<T, Id> {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removed.is_empty()
    }
}

/// Full entity lists of one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldSnapshot {
    pub players: Vec<PlayerState>,
    pub projectiles: Vec<ProjectileState>,
    pub buffs: Vec<BuffState>,
}

/// Per-kind changes since the previously emitted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldDelta {
    pub players: DeltaSet<PlayerUpsert, PlayerKey>,
    pub projectiles: DeltaSet<ProjectileUpsert, u64>,
    pub buffs: DeltaSet<BuffUpsert, u8>,
}

impl WorldDelta {
    pub fn is_empty(&self) -> bool {
        self.players.is_empty() && self.projectiles.is_empty() && self.buffs.is_empty()
    }
}

/// Snapshot or delta, distinguished by the `mode` tag on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StateUpdateBody {
    Snapshot(WorldSnapshot),
    Delta(WorldDelta),
}

/// The per-tick world broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub server_time: u64,
    pub remaining_ms: u64,
    #[serde(flatten)]
    pub body: StateUpdateBody,
}

impl PlayerState {
    /// Folds an upsert into this state.
    pub fn apply(&mut self, u: &PlayerUpsert) {
        if let Some(v) = &u.name {
            self.name = v.clone();
        }
        if let Some(v) = u.x {
            self.x = v;
        }
        if let Some(v) = u.y {
            self.y = v;
        }
        if let Some(v) = u.angle {
            self.angle = v;
        }
        if let Some(v) = u.hp {
            self.hp = v;
        }
        if let Some(v) = u.max_hp {
            self.max_hp = v;
        }
        if let Some(v) = u.kills {
            self.kills = v;
        }
        if let Some(v) = u.deaths {
            self.deaths = v;
        }
        if let Some(v) = u.killstreak {
            self.killstreak = v;
        }
        if let Some(v) = u.has_shield {
            self.has_shield = v;
        }
        if let Some(v) = u.invisible {
            self.invisible = v;
        }
        if let Some(v) = u.speed_boost {
            self.speed_boost = v;
        }
        if let Some(v) = u.shield_until {
            self.shield_until = v;
        }
        if let Some(v) = u.invisible_until {
            self.invisible_until = v;
        }
        if let Some(v) = u.speed_until {
            self.speed_until = v;
        }
        if let Some(v) = u.charging {
            self.charging = v;
        }
        if let Some(v) = u.last_seq {
            self.last_seq = v;
        }
    }
}

impl ProjectileState {
    pub fn apply(&mut self, u: &ProjectileUpsert) {
        if let Some(v) = u.owner {
            self.owner = v;
        }
        if let Some(v) = u.x {
            self.x = v;
        }
        if let Some(v) = u.y {
            self.y = v;
        }
        if let Some(v) = u.vx {
            self.vx = v;
        }
        if let Some(v) = u.vy {
            self.vy = v;
        }
        if let Some(v) = u.angle {
            self.angle = v;
        }
    }
}

impl BuffState {
    pub fn apply(&mut self, u: &BuffUpsert) {
        if let Some(v) = u.kind {
            self.kind = v;
        }
        if let Some(v) = u.active {
            self.active = v;
        }
        if let Some(v) = u.taken_at {
            self.taken_at = v;
        }
    }
}

impl WorldSnapshot {
    /// Reconstructs the next snapshot from a delta. Upserts of unknown ids
    /// insert; an upsert with only an id is a plain no-op on known entities.
    pub fn apply_delta(&mut self, delta: &WorldDelta) {
        for u in &delta.players.upserts {
            match self.players.iter_mut().find(|p| p.id == u.id) {
                Some(p) => p.apply(u),
                None => {
                    let mut p = PlayerState {
                        id: u.id,
                        name: String::new(),
                        x: 0.0,
                        y: 0.0,
                        angle: 0.0,
                        hp: 0,
                        max_hp: 0,
                        kills: 0,
                        deaths: 0,
                        killstreak: 0,
                        has_shield: false,
                        invisible: false,
                        speed_boost: false,
                        shield_until: 0,
                        invisible_until: 0,
                        speed_until: 0,
                        charging: false,
                        last_seq: 0,
                    };
                    p.apply(u);
                    self.players.push(p);
                }
            }
        }
        self.players.retain(|p| !delta.players.removed.contains(&p.id));

        for u in &delta.projectiles.upserts {
            match self.projectiles.iter_mut().find(|p| p.id == u.id) {
                Some(p) => p.apply(u),
                None => {
                    let mut p = ProjectileState {
                        id: u.id,
                        owner: 0,
                        x: 0.0,
                        y: 0.0,
                        vx: 0.0,
                        vy: 0.0,
                        angle: 0.0,
                    };
                    p.apply(u);
                    self.projectiles.push(p);
                }
            }
        }
        self.projectiles.retain(|p| !delta.projectiles.removed.contains(&p.id));

        for u in &delta.buffs.upserts {
            match self.buffs.iter_mut().find(|b| b.id == u.id) {
                Some(b) => b.apply(u),
                None => {
                    let mut b = BuffState {
                        id: u.id,
                        x: 0.0,
                        y: 0.0,
                        kind: BuffKind::Health,
                        active: false,
                        taken_at: 0,
                    };
                    b.apply(u);
                    self.buffs.push(b);
                }
            }
        }
        self.buffs.retain(|b| !delta.buffs.removed.contains(&b.id));
    }
}

// ---------------------------------------------------------------------------
// Combat / match events
// ---------------------------------------------------------------------------

/// Where a projectile ended its flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSurface {
    Map,
    Player,
    Shield,
}

/// Impact marker for client effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitEffect {
    pub x: f64,
    pub y: f64,
    pub surface: HitSurface,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PlayerKey>,
    pub headshot: bool,
}

/// Scoreline of one side of a kill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillSide {
    pub id: PlayerKey,
    pub name: String,
    pub kills: u32,
    pub deaths: u32,
    pub killstreak: u32,
}

/// Broadcast for every death.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerKilled {
    pub killer: KillSide,
    pub victim: KillSide,
    pub is_headshot: bool,
    pub chain_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streak_tier: Option<StreakTier>,
}

/// Final scoreline of one participant, archived at match end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    pub id: PlayerKey,
    pub name: String,
    pub kills: u32,
    pub deaths: u32,
}

/// Results payload for `gameEnd` and `matchResultsPending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResults {
    pub room_code: String,
    pub players: Vec<PlayerResult>,
    pub ended_at: u64,
}

// ---------------------------------------------------------------------------
// Friends / party / profile
// ---------------------------------------------------------------------------

/// Public shape of a profile as the client sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileInfo {
    pub profile_id: String,
    pub nickname: String,
    pub friend_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub is_guest: bool,
}

/// One friend row including presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendEntry {
    pub profile_id: String,
    pub nickname: String,
    pub friend_code: String,
    pub online: bool,
}

/// An open friend request, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestEntry {
    pub request_id: String,
    pub from_profile_id: String,
    pub from_nickname: String,
    pub to_profile_id: String,
    pub to_nickname: String,
}

/// Full friends view pushed on `friends:listUpdated`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendsView {
    pub friends: Vec<FriendEntry>,
    pub incoming: Vec<FriendRequestEntry>,
    pub outgoing: Vec<FriendRequestEntry>,
}

/// A party invite as delivered to the invitee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyInviteInfo {
    pub invite_id: String,
    pub from_profile_id: String,
    pub from_nickname: String,
    pub room_code: String,
    pub expires_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_player(id: PlayerKey) -> PlayerState {
        PlayerState {
            id,
            name: format!("p{id}"),
            x: 100.0,
            y: 200.0,
            angle: 0.5,
            hp: 3,
            max_hp: 3,
            kills: 0,
            deaths: 0,
            killstreak: 0,
            has_shield: false,
            invisible: false,
            speed_boost: false,
            shield_until: 0,
            invisible_until: 0,
            speed_until: 0,
            charging: false,
            last_seq: 0,
        }
    }

    #[test]
    fn streak_tiers_only_at_exact_thresholds() {
        assert_eq!(StreakTier::at_streak(3), Some(StreakTier::ExtraCore));
        assert_eq!(StreakTier::at_streak(4), None);
        assert_eq!(StreakTier::at_streak(12), Some(StreakTier::Legendary));
        assert_eq!(StreakTier::at_streak(13), None);
    }

    #[test]
    fn upsert_application_is_field_wise() {
        let mut p = sample_player(1);
        p.apply(&PlayerUpsert {
            id: 1,
            x: Some(150.0),
            hp: Some(1),
            ..Default::default()
        });
        assert_eq!(p.x, 150.0);
        assert_eq!(p.y, 200.0);
        assert_eq!(p.hp, 1);
        assert_eq!(p.name, "p1");
    }

    #[test]
    fn delta_application_inserts_updates_and_removes() {
        let mut world = WorldSnapshot {
            players: vec![sample_player(1), sample_player(2)],
            projectiles: vec![],
            buffs: vec![],
        };
        let delta = WorldDelta {
            players: DeltaSet {
                upserts: vec![
                    PlayerUpsert { id: 1, kills: Some(2), ..Default::default() },
                    PlayerUpsert { id: 3, name: Some("late".into()), ..Default::default() },
                ],
                removed: vec![2],
            },
            ..Default::default()
        };
        world.apply_delta(&delta);
        assert_eq!(world.players.len(), 2);
        assert_eq!(world.players[0].kills, 2);
        assert_eq!(world.players[1].name, "late");
    }

    #[test]
    fn state_update_round_trips_through_json() {
        let update = StateUpdate {
            server_time: 123,
            remaining_ms: 45_000,
            body: StateUpdateBody::Delta(WorldDelta {
                projectiles: DeltaSet { upserts: vec![], removed: vec![7] },
                ..Default::default()
            }),
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"mode\":\"delta\""));
        let back: StateUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }

    #[test]
    fn unchanged_upsert_fields_are_omitted_on_the_wire() {
        let u = PlayerUpsert { id: 9, x: Some(1.0), ..Default::default() };
        let json = serde_json::to_string(&u).unwrap();
        assert_eq!(json, "{\"id\":9,\"x\":1.0}");
    }
}
