//! Room aggregates and the process-wide room store.
//!
//! A room owns its players, projectiles and buffs; every mutation happens
//! under the store lock so the tick and the socket handlers never interleave
//! on the same room. Player records are keyed by a stable room-local key and
//! carry the connection id as data, which makes reconnection a rebind instead
//! of a map-key move.

use std::collections::{BTreeMap, HashMap, HashSet};

use protocol::consts::{BASE_MAX_HP, MAX_PLAYERS_PER_ROOM};
use protocol::wire::{
    BuffKind, BuffState, LobbyPlayer, LobbyState, MapKey, PlayerKey, PlayerResult, PlayerState,
    ProjectileState, RoomPhase,
};
use rand::Rng;

use crate::abuse::StrikeState;
use crate::map::MapSpec;
use crate::sync::SyncState;

pub type ConnId = u64;

/// Latest validated movement input of a player.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputState {
    pub w: bool,
    pub a: bool,
    pub s: bool,
    pub d: bool,
    pub angle: f64,
    pub charging: bool,
    pub seq: u64,
}

/// Bookkeeping for the toggle-spam meter.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputIntegrity {
    pub last_mask: u8,
    pub last_input_ms: u64,
    pub points: u32,
    pub window_start_ms: u64,
}

/// One in-room player record.
#[derive(Debug, Clone)]
pub struct Player {
    pub key: PlayerKey,
    pub conn_id: ConnId,
    pub persistent_id: String,
    pub profile_id: Option<String>,
    pub name: String,
    pub ready: bool,
    pub disconnected: bool,

    pub x: f64,
    pub y: f64,
    pub angle: f64,
    pub hp: i32,
    pub max_hp: i32,
    pub kills: u32,
    pub deaths: u32,
    pub killstreak: u32,

    pub shield_until_ms: u64,
    pub invisible_until_ms: u64,
    pub speed_until_ms: u64,

    pub charging: bool,
    pub charge_start_ms: u64,
    pub last_shot_ms: u64,
    pub died_at_ms: u64,

    pub input_seq: u64,
    pub input: InputState,
    pub integrity: InputIntegrity,

    pub instant_respawns_left: u32,
    pub instant_respawns_used: u32,

    pub strikes: StrikeState,
}

impl Player {
    pub fn new(
        key: PlayerKey,
        conn_id: ConnId,
        persistent_id: String,
        profile_id: Option<String>,
        name: String,
        ready: bool,
    ) -> Self {
        Self {
            key,
            conn_id,
            persistent_id,
            profile_id,
            name,
            ready,
            disconnected: false,
            x: 0.0,
            y: 0.0,
            angle: 0.0,
            hp: BASE_MAX_HP,
            max_hp: BASE_MAX_HP,
            kills: 0,
            deaths: 0,
            killstreak: 0,
            shield_until_ms: 0,
            invisible_until_ms: 0,
            speed_until_ms: 0,
            charging: false,
            charge_start_ms: 0,
            last_shot_ms: 0,
            died_at_ms: 0,
            input_seq: 0,
            input: InputState::default(),
            integrity: InputIntegrity::default(),
            instant_respawns_left: 0,
            instant_respawns_used: 0,
            strikes: StrikeState::default(),
        }
    }

    pub fn alive(&self) -> bool {
        self.hp > 0
    }

    pub fn has_shield(&self, now_ms: u64) -> bool {
        self.shield_until_ms > now_ms
    }

    pub fn is_invisible(&self, now_ms: u64) -> bool {
        self.invisible_until_ms > now_ms
    }

    pub fn has_speed_boost(&self, now_ms: u64) -> bool {
        self.speed_until_ms > now_ms
    }

    /// Clears expired buff timers so the expiry invariant holds.
    pub fn expire_buffs(&mut self, now_ms: u64) {
        if self.shield_until_ms != 0 && self.shield_until_ms <= now_ms {
            self.shield_until_ms = 0;
        }
        if self.invisible_until_ms != 0 && self.invisible_until_ms <= now_ms {
            self.invisible_until_ms = 0;
        }
        if self.speed_until_ms != 0 && self.speed_until_ms <= now_ms {
            self.speed_until_ms = 0;
        }
    }

    /// Drops all timed buffs immediately (death, respawn).
    pub fn clear_buffs(&mut self) {
        self.shield_until_ms = 0;
        self.invisible_until_ms = 0;
        self.speed_until_ms = 0;
    }

    /// Back to idle movement, keeping the sequence high-water mark.
    pub fn reset_input_keep_seq(&mut self) {
        let seq = self.input_seq;
        self.input = InputState::default();
        self.input.seq = seq;
        self.integrity = InputIntegrity::default();
    }

    /// Full input reset as used on reconnect.
    pub fn reset_input_for_reconnect(&mut self) {
        self.input_seq = 0;
        self.input = InputState::default();
        self.integrity = InputIntegrity::default();
        self.last_shot_ms = 0;
        self.charging = false;
        self.charge_start_ms = 0;
        self.strikes.reset();
    }

    pub fn wire_state(&self, now_ms: u64) -> PlayerState {
        PlayerState {
            id: self.key,
            name: self.name.clone(),
            x: self.x,
            y: self.y,
            angle: self.angle,
            hp: self.hp,
            max_hp: self.max_hp,
            kills: self.kills,
            deaths: self.deaths,
            killstreak: self.killstreak,
            has_shield: self.has_shield(now_ms),
            invisible: self.is_invisible(now_ms),
            speed_boost: self.has_speed_boost(now_ms),
            shield_until: self.shield_until_ms,
            invisible_until: self.invisible_until_ms,
            speed_until: self.speed_until_ms,
            charging: self.charging,
            last_seq: self.input_seq,
        }
    }

    pub fn lobby_entry(&self, leader: PlayerKey) -> LobbyPlayer {
        LobbyPlayer {
            id: self.key,
            name: self.name.clone(),
            ready: self.ready,
            connected: !self.disconnected,
            is_leader: self.key == leader,
        }
    }
}

/// A projectile in flight.
#[derive(Debug, Clone)]
pub struct Projectile {
    pub id: u64,
    pub owner: PlayerKey,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub angle: f64,
    pub age_secs: f64,
}

impl Projectile {
    pub fn wire_state(&self) -> ProjectileState {
        ProjectileState {
            id: self.id,
            owner: self.owner,
            x: self.x,
            y: self.y,
            vx: self.vx,
            vy: self.vy,
            angle: self.angle,
        }
    }
}

/// One of the six fixed buff spawn points.
#[derive(Debug, Clone)]
pub struct Buff {
    pub id: u8,
    pub x: f64,
    pub y: f64,
    pub kind: BuffKind,
    pub active: bool,
    pub taken_at_ms: u64,
}

impl Buff {
    pub fn wire_state(&self) -> BuffState {
        BuffState {
            id: self.id,
            x: self.x,
            y: self.y,
            kind: self.kind,
            active: self.active,
            taken_at: self.taken_at_ms,
        }
    }
}

/// Chained-kill tracking per killer.
#[derive(Debug, Clone, Copy, Default)]
pub struct KillChain {
    pub count: u32,
    pub last_kill_ms: u64,
}

/// Per-room abuse aggregates for the telemetry page and end-of-match audit.
#[derive(Debug, Clone, Default)]
pub struct SuspicionLedger {
    pub per_player: HashMap<PlayerKey, u32>,
    pub total_events: u64,
}

impl SuspicionLedger {
    pub fn record(&mut self, key: PlayerKey) {
        *self.per_player.entry(key).or_default() += 1;
        self.total_events += 1;
    }
}

/// Archived results of the last finished match in this room.
#[derive(Debug, Clone)]
pub struct MatchArchive {
    pub players: Vec<PlayerResult>,
    pub ended_at_ms: u64,
    pub seen_by: HashSet<String>,
}

/// The room aggregate.
#[derive(Debug)]
pub struct Room {
    pub code: String,
    pub leader: PlayerKey,
    pub players: BTreeMap<PlayerKey, Player>,
    pub phase: RoomPhase,
    pub map_key: Option<MapKey>,
    pub countdown_started_ms: u64,
    pub match_start_ms: u64,
    pub next_spawn: usize,
    next_player_key: PlayerKey,
    next_projectile_id: u64,
    pub projectiles: Vec<Projectile>,
    pub buffs: Vec<Buff>,
    pub kill_chains: HashMap<PlayerKey, KillChain>,
    pub suspicion: SuspicionLedger,
    pub last_results: Option<MatchArchive>,
    pub sync: SyncState,
}

impl Room {
    pub fn new(code: String) -> Self {
        Self {
            code,
            leader: 0,
            players: BTreeMap::new(),
            phase: RoomPhase::Lobby,
            map_key: None,
            countdown_started_ms: 0,
            match_start_ms: 0,
            next_spawn: 0,
            next_player_key: 1,
            next_projectile_id: 1,
            projectiles: Vec::new(),
            buffs: Vec::new(),
            kill_chains: HashMap::new(),
            suspicion: SuspicionLedger::default(),
            last_results: None,
            sync: SyncState::default(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= MAX_PLAYERS_PER_ROOM
    }

    pub fn is_active_match(&self) -> bool {
        self.phase.is_active_match()
    }

    /// Inserts a new player and returns its key. The first member becomes
    /// leader with ready forced on.
    pub fn add_player(
        &mut self,
        conn_id: ConnId,
        persistent_id: String,
        profile_id: Option<String>,
        name: String,
    ) -> PlayerKey {
        let key = self.next_player_key;
        self.next_player_key += 1;
        let is_first = self.players.is_empty();
        let player = Player::new(key, conn_id, persistent_id, profile_id, name, is_first);
        self.players.insert(key, player);
        if is_first {
            self.leader = key;
        }
        key
    }

    pub fn player(&self, key: PlayerKey) -> Option<&Player> {
        self.players.get(&key)
    }

    pub fn player_mut(&mut self, key: PlayerKey) -> Option<&mut Player> {
        self.players.get_mut(&key)
    }

    pub fn player_by_conn(&self, conn_id: ConnId) -> Option<&Player> {
        self.players.values().find(|p| p.conn_id == conn_id && !p.disconnected)
    }

    pub fn player_key_by_conn(&self, conn_id: ConnId) -> Option<PlayerKey> {
        self.player_by_conn(conn_id).map(|p| p.key)
    }

    pub fn player_by_pid(&self, persistent_id: &str) -> Option<&Player> {
        self.players.values().find(|p| p.persistent_id == persistent_id)
    }

    /// Removes a record entirely; returns it for the departure broadcast.
    pub fn remove_player(&mut self, key: PlayerKey) -> Option<Player> {
        let removed = self.players.remove(&key)?;
        self.kill_chains.remove(&key);
        if self.leader == key {
            self.elect_leader();
        }
        Some(removed)
    }

    /// Picks the next leader, preferring connected members. The new leader is
    /// always flagged ready.
    pub fn elect_leader(&mut self) -> Option<PlayerKey> {
        let new_leader = self
            .players
            .values()
            .find(|p| !p.disconnected)
            .or_else(|| self.players.values().next())
            .map(|p| p.key)?;
        self.leader = new_leader;
        if let Some(p) = self.players.get_mut(&new_leader) {
            p.ready = true;
        }
        Some(new_leader)
    }

    /// True when every connected non-leader member is ready and nobody is
    /// dangling disconnected in the lobby.
    pub fn all_ready(&self) -> bool {
        self.players
            .values()
            .all(|p| !p.disconnected && (p.key == self.leader || p.ready))
    }

    pub fn connected_count(&self) -> usize {
        self.players.values().filter(|p| !p.disconnected).count()
    }

    pub fn lobby_state(&self) -> LobbyState {
        LobbyState {
            room_code: self.code.clone(),
            leader: self.leader,
            phase: self.phase,
            map: self.map_key,
            players: self.players.values().map(|p| p.lobby_entry(self.leader)).collect(),
        }
    }

    /// Next spawn point by round-robin over the map's fixed list.
    pub fn next_spawn_point(&mut self, map: &MapSpec) -> (f64, f64) {
        let point = map.spawns[self.next_spawn % map.spawns.len()];
        self.next_spawn += 1;
        point
    }

    pub fn alloc_projectile_id(&mut self) -> u64 {
        let id = self.next_projectile_id;
        self.next_projectile_id += 1;
        id
    }

    pub fn projectiles_owned_by(&self, key: PlayerKey) -> usize {
        self.projectiles.iter().filter(|p| p.owner == key).count()
    }

    /// Seeds the six buff points from the map with random types.
    pub fn seed_buffs(&mut self, map: &MapSpec) {
        self.buffs = map
            .buff_spawns
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| Buff {
                id: i as u8,
                x,
                y,
                kind: random_buff_kind(),
                active: true,
                taken_at_ms: 0,
            })
            .collect();
    }

    pub fn final_results(&self) -> Vec<PlayerResult> {
        self.players
            .values()
            .map(|p| PlayerResult {
                id: p.key,
                name: p.name.clone(),
                kills: p.kills,
                deaths: p.deaths,
            })
            .collect()
    }
}

/// Uniform buff type selection used at seed and respawn time.
pub fn random_buff_kind() -> BuffKind {
    match rand::rng().random_range(0..4) {
        0 => BuffKind::Health,
        1 => BuffKind::Shield,
        2 => BuffKind::Invisible,
        _ => BuffKind::Speed,
    }
}

/// All rooms, keyed by their 5-digit code.
#[derive(Debug, Default)]
pub struct RoomStore {
    rooms: HashMap<String, Room>,
}

impl RoomStore {
    /// Samples codes until one is free. First digit is never zero.
    pub fn allocate_code(&self) -> String {
        let mut rng = rand::rng();
        loop {
            let code = rng.random_range(10_000..=99_999).to_string();
            if !self.rooms.contains_key(&code) {
                return code;
            }
        }
    }

    pub fn create(&mut self) -> &mut Room {
        let code = self.allocate_code();
        self.rooms.entry(code.clone()).or_insert_with(|| Room::new(code))
    }

    pub fn get(&self, code: &str) -> Option<&Room> {
        self.rooms.get(code)
    }

    pub fn get_mut(&mut self, code: &str) -> Option<&mut Room> {
        self.rooms.get_mut(code)
    }

    pub fn remove(&mut self, code: &str) -> Option<Room> {
        self.rooms.remove(code)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Room> {
        self.rooms.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// The active-match room containing a record for this device, if any.
    pub fn find_active_by_pid(&mut self, persistent_id: &str) -> Option<&mut Room> {
        self.rooms
            .values_mut()
            .find(|r| r.is_active_match() && r.player_by_pid(persistent_id).is_some())
    }

    /// Codes of rooms with no members left; collected by the tick for removal.
    pub fn empty_room_codes(&self) -> Vec<String> {
        self.rooms
            .values()
            .filter(|r| r.players.is_empty())
            .map(|r| r.code.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_with_players(n: usize) -> Room {
        let mut room = Room::new("12345".into());
        for i in 0..n {
            room.add_player(i as u64 + 1, format!("device-{i:06}"), None, format!("p{i}"));
        }
        room
    }

    #[test]
    fn first_member_is_leader_and_ready() {
        let room = room_with_players(2);
        assert_eq!(room.leader, 1);
        assert!(room.player(1).unwrap().ready);
        assert!(!room.player(2).unwrap().ready);
    }

    #[test]
    fn sixth_seat_fills_the_room() {
        let room = room_with_players(6);
        assert!(room.is_full());
        let room = room_with_players(5);
        assert!(!room.is_full());
    }

    #[test]
    fn leader_departure_elects_a_connected_member() {
        let mut room = room_with_players(3);
        room.player_mut(2).unwrap().disconnected = true;
        room.remove_player(1);
        // Key 2 is disconnected, so key 3 takes over and is forced ready.
        assert_eq!(room.leader, 3);
        assert!(room.player(3).unwrap().ready);
    }

    #[test]
    fn all_ready_requires_connected_members_only() {
        let mut room = room_with_players(3);
        room.player_mut(2).unwrap().ready = true;
        room.player_mut(3).unwrap().ready = true;
        assert!(room.all_ready());
        room.player_mut(3).unwrap().disconnected = true;
        assert!(!room.all_ready());
    }

    #[test]
    fn spawn_points_rotate_round_robin() {
        let map = crate::map::MapCatalog::new();
        let spec = map.get(MapKey::Forest);
        let mut room = room_with_players(1);
        let first = room.next_spawn_point(spec);
        let second = room.next_spawn_point(spec);
        assert_ne!(first, second);
        for _ in 0..spec.spawns.len() - 2 {
            room.next_spawn_point(spec);
        }
        assert_eq!(room.next_spawn_point(spec), first);
    }

    #[test]
    fn room_codes_are_five_digits_with_nonzero_lead() {
        let store = RoomStore::default();
        for _ in 0..100 {
            let code = store.allocate_code();
            assert_eq!(code.len(), 5);
            assert_ne!(code.as_bytes()[0], b'0');
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn store_finds_active_rooms_by_device() {
        let mut store = RoomStore::default();
        let code = {
            let room = store.create();
            room.add_player(9, "device-aaaaaa".into(), None, "a".into());
            room.code.clone()
        };
        assert!(store.find_active_by_pid("device-aaaaaa").is_none());
        store.get_mut(&code).unwrap().phase = RoomPhase::Playing;
        assert!(store.find_active_by_pid("device-aaaaaa").is_some());
        assert!(store.find_active_by_pid("device-zzzzzz").is_none());
    }

    #[test]
    fn expired_buff_timers_are_zeroed() {
        let mut player = Player::new(1, 1, "device-000001".into(), None, "p".into(), false);
        player.shield_until_ms = 5_000;
        player.speed_until_ms = 9_000;
        player.expire_buffs(6_000);
        assert_eq!(player.shield_until_ms, 0);
        assert_eq!(player.speed_until_ms, 9_000);
        assert!(!player.has_shield(6_000));
        assert!(player.has_speed_boost(6_000));
    }

    #[test]
    fn input_reset_for_reconnect_zeroes_the_sequence() {
        let mut player = Player::new(1, 1, "device-000001".into(), None, "p".into(), false);
        player.input_seq = 500;
        player.input.seq = 500;
        player.last_shot_ms = 123;
        player.reset_input_for_reconnect();
        assert_eq!(player.input_seq, 0);
        assert_eq!(player.last_shot_ms, 0);
        // The delayed variant keeps the high-water mark instead.
        player.input_seq = 77;
        player.input.w = true;
        player.reset_input_keep_seq();
        assert_eq!(player.input_seq, 77);
        assert!(!player.input.w);
    }
}
