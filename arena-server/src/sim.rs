//! The authoritative simulation step.
//!
//! One logical tick walks every room: countdown promotion, player respawns
//! and motion, projectile integration with swept hit tests, buff expiry and
//! respawn, the world broadcast, and the match-end transition. All timing is
//! timestamp-driven and evaluated here, so there are no timer callbacks whose
//! cancellation could leak.
//!
//! The step itself is a pure function of room state and `now_ms`; it reports
//! the events to broadcast and leaves the I/O to the driver.

use protocol::ServerEvent;
use protocol::consts::{
    BASE_SPEED, BUFF_DURATION_MS, BUFF_RESPAWN_MS, CHARGING_SPEED_FACTOR, COUNTDOWN_MS,
    HEADSHOT_RADIUS, HIT_RADIUS, KILL_CHAIN_WINDOW_MS, MATCH_DURATION_MS, PROJECTILE_LIFETIME_SECS,
    PROJECTILE_TIP_OFFSET, RESPAWN_DELAY_MS, SPEED_BOOST_FACTOR,
};
use protocol::wire::{
    BuffKind, HitEffect, HitSurface, KillSide, MatchResults, PlayerKey, PlayerKilled, PlayerResult,
    RoomPhase, StateUpdate, StreakTier, WorldSnapshot,
};

use crate::config::ServerConfig;
use crate::geom;
use crate::map::{MapCatalog, MapSpec};
use crate::room::{ConnId, Room, random_buff_kind};

/// A buff pickup triggers within this distance of the spawn point.
const BUFF_PICKUP_RADIUS: f64 = 30.0;

/// Everything the driver must persist when a match finishes.
#[derive(Debug)]
pub struct MatchEnd {
    pub room_code: String,
    pub participants: Vec<String>,
    pub results: Vec<PlayerResult>,
    pub ended_at_ms: u64,
    /// Devices whose instant-respawn flag is restored (granted, never used).
    pub reward_restores: Vec<String>,
    /// Suspicion totals archived for the audit room snapshot.
    pub suspicion_total: u64,
}

/// Connected members' connection ids, the broadcast set of a room.
pub fn room_conns(room: &Room) -> Vec<ConnId> {
    room.players
        .values()
        .filter(|p| !p.disconnected)
        .map(|p| p.conn_id)
        .collect()
}

/// Advances one room by one tick.
pub fn step_room(
    room: &mut Room,
    maps: &MapCatalog,
    cfg: &ServerConfig,
    now_ms: u64,
    dt_secs: f64,
    out: &mut Vec<ServerEvent>,
) -> Option<MatchEnd> {
    match room.phase {
        RoomPhase::Lobby => None,
        RoomPhase::Starting => {
            step_countdown(room, now_ms, out);
            None
        }
        RoomPhase::Playing => step_playing(room, maps, cfg, now_ms, dt_secs, out),
    }
}

fn step_countdown(room: &mut Room, now_ms: u64, out: &mut Vec<ServerEvent>) {
    if now_ms.saturating_sub(room.countdown_started_ms) < COUNTDOWN_MS {
        return;
    }
    let Some(map) = room.map_key else {
        // A countdown without a map cannot happen through the lobby path;
        // fall back to the lobby instead of playing on nothing.
        room.phase = RoomPhase::Lobby;
        return;
    };
    room.phase = RoomPhase::Playing;
    room.match_start_ms = now_ms;
    room.sync.reset();
    let started = protocol::events::MatchStarted {
        map,
        match_start: now_ms,
        duration_ms: MATCH_DURATION_MS,
    };
    out.push(ServerEvent::GameStarted(started.clone()));
    // Legacy alias kept for older clients.
    out.push(ServerEvent::GameStart(started));
}

fn step_playing(
    room: &mut Room,
    maps: &MapCatalog,
    cfg: &ServerConfig,
    now_ms: u64,
    dt_secs: f64,
    out: &mut Vec<ServerEvent>,
) -> Option<MatchEnd> {
    let map_key = room.map_key?;
    let map = maps.get(map_key);

    step_players(room, map, now_ms, dt_secs, out);
    step_projectiles(room, map, now_ms, dt_secs, out);
    step_buff_respawns(room, now_ms, out);
    broadcast_state(room, cfg, now_ms, out);

    if now_ms.saturating_sub(room.match_start_ms) >= MATCH_DURATION_MS {
        Some(finish_match(room, now_ms, out))
    } else {
        None
    }
}

fn step_players(room: &mut Room, map: &MapSpec, now_ms: u64, dt_secs: f64, out: &mut Vec<ServerEvent>) {
    // Respawns first: they need the room-level spawn cursor.
    let due: Vec<PlayerKey> = room
        .players
        .values()
        .filter(|p| !p.alive() && now_ms.saturating_sub(p.died_at_ms) >= RESPAWN_DELAY_MS)
        .map(|p| p.key)
        .collect();
    for key in due {
        respawn_player(room, key, map, now_ms, out);
    }

    // Motion and pickups; split borrows so the buff list stays reachable.
    let Room { players, buffs, .. } = room;
    for player in players.values_mut() {
        if !player.alive() {
            continue;
        }
        player.expire_buffs(now_ms);
        if player.disconnected {
            continue;
        }

        let input = player.input;
        let mut speed = BASE_SPEED;
        if player.has_speed_boost(now_ms) {
            speed *= SPEED_BOOST_FACTOR;
        }
        if input.charging {
            speed *= CHARGING_SPEED_FACTOR;
        }

        let mut dx = (input.d as i8 - input.a as i8) as f64;
        let mut dy = (input.s as i8 - input.w as i8) as f64;
        if dx != 0.0 && dy != 0.0 {
            let inv = std::f64::consts::FRAC_1_SQRT_2;
            dx *= inv;
            dy *= inv;
        }
        if dx != 0.0 || dy != 0.0 {
            let (cx, cy) = geom::clamp_to_field(
                player.x + dx * speed * dt_secs,
                player.y + dy * speed * dt_secs,
            );
            if !geom::player_blocked(map, cx, cy) {
                player.x = cx;
                player.y = cy;
            }
        }

        player.angle = input.angle;
        player.charging = input.charging;

        // Buff pickup at the new position.
        for buff in buffs.iter_mut() {
            if !buff.active {
                continue;
            }
            let dist_sq = (player.x - buff.x).powi(2) + (player.y - buff.y).powi(2);
            if dist_sq > BUFF_PICKUP_RADIUS * BUFF_PICKUP_RADIUS {
                continue;
            }
            buff.active = false;
            buff.taken_at_ms = now_ms;
            match buff.kind {
                BuffKind::Health => player.hp = (player.hp + 1).min(player.max_hp),
                BuffKind::Shield => player.shield_until_ms = now_ms + BUFF_DURATION_MS,
                BuffKind::Invisible => player.invisible_until_ms = now_ms + BUFF_DURATION_MS,
                BuffKind::Speed => player.speed_until_ms = now_ms + BUFF_DURATION_MS,
            }
            out.push(ServerEvent::BuffPickup {
                buff_id: buff.id,
                player_key: player.key,
                kind: buff.kind,
            });
        }
    }
}

fn step_projectiles(room: &mut Room, map: &MapSpec, now_ms: u64, dt_secs: f64, out: &mut Vec<ServerEvent>) {
    let mut projectiles = std::mem::take(&mut room.projectiles);
    projectiles.retain_mut(|proj| {
        let prev = (proj.x, proj.y);
        proj.x += proj.vx * dt_secs;
        proj.y += proj.vy * dt_secs;
        proj.age_secs += dt_secs;

        if geom::out_of_bounds(proj.x, proj.y) || proj.age_secs > PROJECTILE_LIFETIME_SECS {
            return false;
        }
        if geom::projectile_blocked(map, proj.x, proj.y) {
            out.push(ServerEvent::HitEffect(HitEffect {
                x: proj.x,
                y: proj.y,
                surface: HitSurface::Map,
                target: None,
                headshot: false,
            }));
            return false;
        }

        // Swept hit test, shifted forward by the projectile tip.
        let speed = (proj.vx * proj.vx + proj.vy * proj.vy).sqrt();
        let (tip_x, tip_y) = if speed > f64::EPSILON {
            (
                proj.vx / speed * PROJECTILE_TIP_OFFSET,
                proj.vy / speed * PROJECTILE_TIP_OFFSET,
            )
        } else {
            (0.0, 0.0)
        };
        let from = (prev.0 + tip_x, prev.1 + tip_y);
        let to = (proj.x + tip_x, proj.y + tip_y);

        let mut best: Option<(PlayerKey, geom::SweptHit)> = None;
        for target in room.players.values() {
            if target.key == proj.owner || !target.alive() {
                continue;
            }
            if let Some(hit) = geom::swept_circle_hit(from, to, (target.x, target.y), HIT_RADIUS) {
                if geom::better_hit(best.map(|(_, h)| h), hit) {
                    best = Some((target.key, hit));
                }
            }
        }
        let Some((victim_key, hit)) = best else {
            return true;
        };

        let shielded = room
            .players
            .get(&victim_key)
            .is_some_and(|v| v.has_shield(now_ms));
        let headshot = !shielded && hit.distance <= HEADSHOT_RADIUS;

        if shielded {
            if let Some(victim) = room.players.get_mut(&victim_key) {
                victim.shield_until_ms = 0;
            }
            out.push(ServerEvent::HitEffect(HitEffect {
                x: hit.x,
                y: hit.y,
                surface: HitSurface::Shield,
                target: Some(victim_key),
                headshot: false,
            }));
            out.push(ServerEvent::ShieldBreak { player_key: victim_key });
        } else {
            let mut dead = false;
            if let Some(victim) = room.players.get_mut(&victim_key) {
                victim.hp = if headshot { 0 } else { (victim.hp - 1).max(0) };
                dead = victim.hp == 0;
            }
            out.push(ServerEvent::HitEffect(HitEffect {
                x: hit.x,
                y: hit.y,
                surface: HitSurface::Player,
                target: Some(victim_key),
                headshot,
            }));
            if dead {
                handle_kill(room, proj.owner, victim_key, headshot, map, now_ms, out);
            }
        }
        false
    });
    room.projectiles = projectiles;
}

fn step_buff_respawns(room: &mut Room, now_ms: u64, out: &mut Vec<ServerEvent>) {
    for buff in room.buffs.iter_mut() {
        if buff.active || now_ms.saturating_sub(buff.taken_at_ms) < BUFF_RESPAWN_MS {
            continue;
        }
        buff.kind = random_buff_kind();
        buff.active = true;
        buff.taken_at_ms = 0;
        out.push(ServerEvent::BuffRespawn { buff: buff.wire_state() });
    }
}

fn broadcast_state(room: &mut Room, cfg: &ServerConfig, now_ms: u64, out: &mut Vec<ServerEvent>) {
    let snapshot = world_snapshot(room, now_ms);
    let body = room
        .sync
        .next_body(snapshot, now_ms, cfg.full_snapshot_interval_ms);
    let remaining_ms = (room.match_start_ms + MATCH_DURATION_MS).saturating_sub(now_ms);
    out.push(ServerEvent::StateUpdate(StateUpdate {
        server_time: now_ms,
        remaining_ms,
        body,
    }));
}

/// The full world as broadcast this tick.
pub fn world_snapshot(room: &Room, now_ms: u64) -> WorldSnapshot {
    WorldSnapshot {
        players: room.players.values().map(|p| p.wire_state(now_ms)).collect(),
        projectiles: room.projectiles.iter().map(|p| p.wire_state()).collect(),
        buffs: room.buffs.iter().map(|b| b.wire_state()).collect(),
    }
}

fn kill_side(room: &Room, key: PlayerKey) -> KillSide {
    match room.players.get(&key) {
        Some(p) => KillSide {
            id: p.key,
            name: p.name.clone(),
            kills: p.kills,
            deaths: p.deaths,
            killstreak: p.killstreak,
        },
        None => KillSide { id: key, name: String::new(), kills: 0, deaths: 0, killstreak: 0 },
    }
}

/// Applies a confirmed kill: scorelines, kill chain, streak tier, instant
/// respawn or the delayed one.
pub fn handle_kill(
    room: &mut Room,
    killer_key: PlayerKey,
    victim_key: PlayerKey,
    is_headshot: bool,
    map: &MapSpec,
    now_ms: u64,
    out: &mut Vec<ServerEvent>,
) {
    let mut streak_tier = None;
    if let Some(killer) = room.players.get_mut(&killer_key) {
        killer.kills += 1;
        killer.killstreak += 1;
        streak_tier = StreakTier::at_streak(killer.killstreak);
        if streak_tier == Some(StreakTier::ExtraCore) {
            killer.max_hp = protocol::consts::EXTRA_CORE_MAX_HP;
            killer.hp = (killer.hp + 1).min(killer.max_hp);
        }
    }
    let chain = room.kill_chains.entry(killer_key).or_default();
    if now_ms.saturating_sub(chain.last_kill_ms) <= KILL_CHAIN_WINDOW_MS && chain.count > 0 {
        chain.count += 1;
    } else {
        chain.count = 1;
    }
    chain.last_kill_ms = now_ms;
    let chain_count = chain.count;

    let mut instant_respawn = None;
    if let Some(victim) = room.players.get_mut(&victim_key) {
        victim.deaths += 1;
        victim.killstreak = 0;
        victim.hp = 0;
        victim.clear_buffs();
        victim.charging = false;
        victim.charge_start_ms = 0;
        victim.died_at_ms = now_ms;
        if victim.instant_respawns_left > 0 {
            victim.instant_respawns_left -= 1;
            victim.instant_respawns_used += 1;
            instant_respawn = Some(victim.instant_respawns_left);
        }
    }

    out.push(ServerEvent::PlayerKilled(PlayerKilled {
        killer: kill_side(room, killer_key),
        victim: kill_side(room, victim_key),
        is_headshot,
        chain_count,
        streak_tier,
    }));

    if let Some(remaining) = instant_respawn {
        respawn_player(room, victim_key, map, now_ms, out);
        out.push(ServerEvent::InstantRespawnUsed {
            player_key: victim_key,
            remaining,
        });
    }
}

/// Places the player on the next spawn point with a clean combat state.
pub fn respawn_player(
    room: &mut Room,
    key: PlayerKey,
    map: &MapSpec,
    now_ms: u64,
    out: &mut Vec<ServerEvent>,
) {
    let (x, y) = room.next_spawn_point(map);
    let Some(player) = room.players.get_mut(&key) else {
        return;
    };
    player.x = x;
    player.y = y;
    player.hp = protocol::consts::BASE_MAX_HP;
    player.max_hp = protocol::consts::BASE_MAX_HP;
    player.clear_buffs();
    player.charging = false;
    player.charge_start_ms = 0;
    player.last_shot_ms = 0;
    player.died_at_ms = 0;
    player.reset_input_keep_seq();
    let state = player.wire_state(now_ms);
    out.push(ServerEvent::PlayerRespawn { player: state });
}

/// Archives results, restores reward flags and resets the room to lobby.
fn finish_match(room: &mut Room, now_ms: u64, out: &mut Vec<ServerEvent>) -> MatchEnd {
    let results = room.final_results();
    let participants: Vec<String> = room
        .players
        .values()
        .map(|p| p.persistent_id.clone())
        .collect();
    let reward_restores: Vec<String> = room
        .players
        .values()
        .filter(|p| p.instant_respawns_used + p.instant_respawns_left > 0)
        .filter(|p| p.instant_respawns_used == 0)
        .map(|p| p.persistent_id.clone())
        .collect();

    room.last_results = Some(crate::room::MatchArchive {
        players: results.clone(),
        ended_at_ms: now_ms,
        seen_by: Default::default(),
    });

    out.push(ServerEvent::GameEnd(MatchResults {
        room_code: room.code.clone(),
        players: results.clone(),
        ended_at: now_ms,
    }));

    // Back to lobby: drop disconnected records, reset combat state.
    let suspicion_total = room.suspicion.total_events;
    room.phase = RoomPhase::Lobby;
    room.map_key = None;
    room.match_start_ms = 0;
    room.countdown_started_ms = 0;
    room.projectiles.clear();
    room.buffs.clear();
    room.kill_chains.clear();
    room.suspicion = Default::default();
    room.sync.reset();
    let gone: Vec<PlayerKey> = room
        .players
        .values()
        .filter(|p| p.disconnected)
        .map(|p| p.key)
        .collect();
    for key in gone {
        room.remove_player(key);
    }
    let leader = room.leader;
    for player in room.players.values_mut() {
        player.hp = protocol::consts::BASE_MAX_HP;
        player.max_hp = protocol::consts::BASE_MAX_HP;
        player.clear_buffs();
        player.charging = false;
        player.charge_start_ms = 0;
        player.died_at_ms = 0;
        player.instant_respawns_left = 0;
        player.instant_respawns_used = 0;
        player.ready = player.key == leader;
    }
    if !room.players.is_empty() {
        out.push(ServerEvent::LobbyUpdate(room.lobby_state()));
    }

    MatchEnd {
        room_code: room.code.clone(),
        participants,
        results,
        ended_at_ms: now_ms,
        reward_restores,
        suspicion_total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::consts::{BASE_MAX_HP, MAX_ACTIVE_PROJECTILES, PROJECTILE_SPEED};
    use protocol::wire::MapKey;
    use crate::room::{Buff, Projectile};

    fn cfg() -> ServerConfig {
        ServerConfig::default()
    }

    fn maps() -> MapCatalog {
        MapCatalog::new()
    }

    /// A two-player room mid-match at open field positions.
    fn playing_room(now: u64) -> Room {
        let mut room = Room::new("12345".into());
        room.add_player(10, "device-aaaaaa".into(), None, "A".into());
        room.add_player(20, "device-bbbbbb".into(), None, "B".into());
        room.phase = RoomPhase::Playing;
        room.map_key = Some(MapKey::Forest);
        room.match_start_ms = now;
        let positions = [(300.0, 300.0), (800.0, 300.0)];
        for (player, pos) in room.players.values_mut().zip(positions) {
            player.x = pos.0;
            player.y = pos.1;
        }
        room
    }

    fn projectile_towards(room: &mut Room, owner: PlayerKey, x: f64, y: f64, angle: f64) -> u64 {
        let id = room.alloc_projectile_id();
        room.projectiles.push(Projectile {
            id,
            owner,
            x,
            y,
            vx: PROJECTILE_SPEED * angle.cos(),
            vy: PROJECTILE_SPEED * angle.sin(),
            angle,
            age_secs: 0.0,
        });
        id
    }

    fn step(room: &mut Room, now: u64) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        step_room(room, &maps(), &cfg(), now, 1.0 / 30.0, &mut out);
        out
    }

    fn has_event(out: &[ServerEvent], pred: impl Fn(&ServerEvent) -> bool) -> bool {
        out.iter().any(pred)
    }

    #[test]
    fn countdown_promotes_to_playing_after_three_seconds() {
        let mut room = playing_room(0);
        room.phase = RoomPhase::Starting;
        room.countdown_started_ms = 10_000;
        let out = step(&mut room, 12_999);
        assert_eq!(room.phase, RoomPhase::Starting);
        assert!(out.is_empty());
        let out = step(&mut room, 13_000);
        assert_eq!(room.phase, RoomPhase::Playing);
        assert_eq!(room.match_start_ms, 13_000);
        assert!(has_event(&out, |e| matches!(e, ServerEvent::GameStarted(_))));
        assert!(has_event(&out, |e| matches!(e, ServerEvent::GameStart(_))));
    }

    #[test]
    fn movement_follows_input_with_diagonal_normalization() {
        let now = 100_000;
        let mut room = playing_room(now);
        {
            let p = room.players.get_mut(&1).unwrap();
            p.input.d = true;
            p.input.s = true;
        }
        step(&mut room, now);
        let p = room.player(1).unwrap();
        let step_len = BASE_SPEED / 30.0;
        let expected = step_len * std::f64::consts::FRAC_1_SQRT_2;
        assert!((p.x - (300.0 + expected)).abs() < 1e-6);
        assert!((p.y - (300.0 + expected)).abs() < 1e-6);
    }

    #[test]
    fn charging_halves_and_boost_raises_speed() {
        let now = 100_000;
        let mut room = playing_room(now);
        {
            let p = room.players.get_mut(&1).unwrap();
            p.input.d = true;
            p.input.charging = true;
        }
        step(&mut room, now);
        let expected = 300.0 + BASE_SPEED * CHARGING_SPEED_FACTOR / 30.0;
        assert!((room.player(1).unwrap().x - expected).abs() < 1e-6);

        let mut room = playing_room(now);
        {
            let p = room.players.get_mut(&1).unwrap();
            p.input.d = true;
            p.speed_until_ms = now + 1_000;
        }
        step(&mut room, now);
        let expected = 300.0 + BASE_SPEED * SPEED_BOOST_FACTOR / 30.0;
        assert!((room.player(1).unwrap().x - expected).abs() < 1e-6);
    }

    #[test]
    fn blocked_candidate_keeps_the_player_in_place() {
        let now = 100_000;
        let mut room = playing_room(now);
        {
            // Right next to the forest tree at (500, 400), walking into it.
            let p = room.players.get_mut(&1).unwrap();
            p.x = 500.0 - (18.0 + 45.0) - 1.0;
            p.y = 400.0;
            p.input.d = true;
        }
        let before = room.player(1).unwrap().x;
        step(&mut room, now);
        assert_eq!(room.player(1).unwrap().x, before);
    }

    #[test]
    fn disconnected_players_do_not_move() {
        let now = 100_000;
        let mut room = playing_room(now);
        {
            let p = room.players.get_mut(&1).unwrap();
            p.input.d = true;
            p.disconnected = true;
        }
        step(&mut room, now);
        assert_eq!(room.player(1).unwrap().x, 300.0);
    }

    #[test]
    fn dead_players_neither_move_nor_pick_up() {
        let now = 100_000;
        let mut room = playing_room(now);
        {
            let p = room.players.get_mut(&1).unwrap();
            p.hp = 0;
            p.died_at_ms = now - 100;
            p.input.d = true;
        }
        step(&mut room, now);
        assert_eq!(room.player(1).unwrap().x, 300.0);
    }

    #[test]
    fn centred_shot_is_a_headshot_and_kills_outright() {
        let now = 100_000;
        let mut room = playing_room(now);
        // Dead-centre sweep across B at (800, 300): one tick covers ~29 px.
        projectile_towards(&mut room, 1, 780.0, 300.0, 0.0);
        let out = step(&mut room, now);
        let victim = room.player(2).unwrap();
        assert_eq!(victim.hp, 0);
        assert_eq!(victim.deaths, 1);
        assert!(has_event(&out, |e| matches!(
            e,
            ServerEvent::PlayerKilled(k) if k.is_headshot && k.victim.id == 2 && k.killer.kills == 1
        )));
        assert!(room.projectiles.is_empty());
    }

    #[test]
    fn grazing_shot_takes_one_hp() {
        let now = 100_000;
        let mut room = playing_room(now);
        // Offset 20 px: inside hit radius 21, outside headshot radius 16.
        projectile_towards(&mut room, 1, 780.0, 320.0, 0.0);
        let out = step(&mut room, now);
        let victim = room.player(2).unwrap();
        assert_eq!(victim.hp, BASE_MAX_HP - 1);
        assert!(has_event(&out, |e| matches!(
            e,
            ServerEvent::HitEffect(h) if h.surface == HitSurface::Player && !h.headshot
        )));
    }

    #[test]
    fn shield_absorbs_one_hit_even_a_centred_one() {
        let now = 100_000;
        let mut room = playing_room(now);
        room.players.get_mut(&2).unwrap().shield_until_ms = now + 5_000;
        projectile_towards(&mut room, 1, 780.0, 300.0, 0.0);
        let out = step(&mut room, now);
        let victim = room.player(2).unwrap();
        assert_eq!(victim.hp, BASE_MAX_HP);
        assert_eq!(victim.shield_until_ms, 0);
        assert!(has_event(&out, |e| matches!(e, ServerEvent::ShieldBreak { player_key: 2 })));
        assert!(has_event(&out, |e| matches!(
            e,
            ServerEvent::HitEffect(h) if h.surface == HitSurface::Shield
        )));

        // The next centred shot damages normally.
        projectile_towards(&mut room, 1, 780.0, 300.0, 0.0);
        step(&mut room, now + 33);
        assert_eq!(room.player(2).unwrap().hp, 0);
    }

    #[test]
    fn projectiles_die_on_map_obstacles_with_an_effect() {
        let now = 100_000;
        let mut room = playing_room(now);
        // Straight into the tree at (500, 400).
        projectile_towards(&mut room, 1, 450.0, 400.0, 0.0);
        let out = step(&mut room, now);
        assert!(room.projectiles.is_empty());
        assert!(has_event(&out, |e| matches!(
            e,
            ServerEvent::HitEffect(h) if h.surface == HitSurface::Map
        )));
    }

    #[test]
    fn projectiles_expire_by_age_and_bounds() {
        let now = 100_000;
        let mut room = playing_room(now);
        let id = projectile_towards(&mut room, 1, 100.0, 1000.0, std::f64::consts::PI);
        // Heading left, will cross x=0 in a few ticks.
        let mut ticks = 0;
        while room.projectiles.iter().any(|p| p.id == id) {
            step(&mut room, now + ticks * 33);
            ticks += 1;
            assert!(ticks < 20, "projectile never left the field");
        }

        let id = projectile_towards(&mut room, 1, 1500.0, 1900.0, 0.0);
        room.projectiles.iter_mut().find(|p| p.id == id).unwrap().age_secs =
            PROJECTILE_LIFETIME_SECS + 0.001;
        step(&mut room, now);
        assert!(!room.projectiles.iter().any(|p| p.id == id));
    }

    #[test]
    fn kill_chain_counts_within_the_window() {
        let now = 100_000;
        let mut room = playing_room(now);
        let map_catalog = maps();
        let map = map_catalog.get(MapKey::Forest);
        let mut out = Vec::new();
        handle_kill(&mut room, 1, 2, false, map, now, &mut out);
        handle_kill(&mut room, 1, 2, false, map, now + 3_000, &mut out);
        handle_kill(&mut room, 1, 2, false, map, now + 3_000 + KILL_CHAIN_WINDOW_MS + 1, &mut out);
        let chains: Vec<u32> = out
            .iter()
            .filter_map(|e| match e {
                ServerEvent::PlayerKilled(k) => Some(k.chain_count),
                _ => None,
            })
            .collect();
        assert_eq!(chains, vec![1, 2, 1]);
    }

    #[test]
    fn extra_core_tier_raises_max_hp_and_heals() {
        let now = 100_000;
        let mut room = playing_room(now);
        room.players.get_mut(&1).unwrap().killstreak = 2;
        room.players.get_mut(&1).unwrap().hp = 2;
        let map_catalog = maps();
        let map = map_catalog.get(MapKey::Forest);
        let mut out = Vec::new();
        handle_kill(&mut room, 1, 2, false, map, now, &mut out);
        let killer = room.player(1).unwrap();
        assert_eq!(killer.killstreak, 3);
        assert_eq!(killer.max_hp, 4);
        assert_eq!(killer.hp, 3);
        assert!(out.iter().any(|e| matches!(
            e,
            ServerEvent::PlayerKilled(k) if k.streak_tier == Some(StreakTier::ExtraCore)
        )));
    }

    #[test]
    fn delayed_respawn_happens_after_three_seconds() {
        let now = 100_000;
        let mut room = playing_room(now);
        {
            let p = room.players.get_mut(&2).unwrap();
            p.hp = 0;
            p.died_at_ms = now;
        }
        step(&mut room, now + RESPAWN_DELAY_MS - 33);
        assert_eq!(room.player(2).unwrap().hp, 0);
        let out = step(&mut room, now + RESPAWN_DELAY_MS);
        let p = room.player(2).unwrap();
        assert_eq!(p.hp, BASE_MAX_HP);
        assert_eq!(p.max_hp, BASE_MAX_HP);
        assert_eq!(p.died_at_ms, 0);
        assert!(has_event(&out, |e| matches!(e, ServerEvent::PlayerRespawn { .. })));
    }

    #[test]
    fn instant_respawn_skips_the_delay_and_reports_remaining() {
        let now = 100_000;
        let mut room = playing_room(now);
        room.players.get_mut(&2).unwrap().instant_respawns_left = 2;
        let map_catalog = maps();
        let map = map_catalog.get(MapKey::Forest);
        let mut out = Vec::new();
        handle_kill(&mut room, 1, 2, true, map, now, &mut out);
        let p = room.player(2).unwrap();
        assert_eq!(p.hp, BASE_MAX_HP);
        assert_eq!(p.instant_respawns_left, 1);
        assert_eq!(p.instant_respawns_used, 1);
        assert!(out.iter().any(|e| matches!(
            e,
            ServerEvent::InstantRespawnUsed { player_key: 2, remaining: 1 }
        )));
    }

    #[test]
    fn buff_pickup_applies_effect_and_respawns_rerolled() {
        let now = 100_000;
        let mut room = playing_room(now);
        room.buffs.push(Buff {
            id: 0,
            x: 310.0,
            y: 300.0,
            kind: BuffKind::Speed,
            active: true,
            taken_at_ms: 0,
        });
        let out = step(&mut room, now);
        assert!(room.player(1).unwrap().has_speed_boost(now + 1));
        assert!(!room.buffs[0].active);
        assert_eq!(room.buffs[0].taken_at_ms, now);
        assert!(has_event(&out, |e| matches!(
            e,
            ServerEvent::BuffPickup { buff_id: 0, player_key: 1, kind: BuffKind::Speed }
        )));

        let out = step(&mut room, now + BUFF_RESPAWN_MS);
        assert!(room.buffs[0].active);
        assert_eq!(room.buffs[0].taken_at_ms, 0);
        assert!(has_event(&out, |e| matches!(e, ServerEvent::BuffRespawn { .. })));
    }

    #[test]
    fn timed_buffs_expire_during_the_tick() {
        let now = 100_000;
        let mut room = playing_room(now);
        room.players.get_mut(&1).unwrap().speed_until_ms = now + 100;
        step(&mut room, now + 200);
        assert_eq!(room.player(1).unwrap().speed_until_ms, 0);
    }

    #[test]
    fn state_broadcast_carries_server_time_and_remaining() {
        let now = 100_000;
        let mut room = playing_room(now);
        let out = step(&mut room, now + 10_000);
        let update = out
            .iter()
            .find_map(|e| match e {
                ServerEvent::StateUpdate(u) => Some(u),
                _ => None,
            })
            .expect("state update emitted");
        assert_eq!(update.server_time, now + 10_000);
        assert_eq!(update.remaining_ms, MATCH_DURATION_MS - 10_000);
    }

    #[test]
    fn match_ends_exactly_at_duration() {
        let now = 100_000;
        let mut room = playing_room(now);
        room.players.get_mut(&1).unwrap().kills = 7;
        let mut out = Vec::new();
        let end = step_room(
            &mut room,
            &maps(),
            &cfg(),
            now + MATCH_DURATION_MS - 1,
            1.0 / 30.0,
            &mut out,
        );
        assert!(end.is_none());
        let end = step_room(
            &mut room,
            &maps(),
            &cfg(),
            now + MATCH_DURATION_MS,
            1.0 / 30.0,
            &mut out,
        )
        .expect("match must end");
        assert_eq!(room.phase, RoomPhase::Lobby);
        assert_eq!(end.results.iter().find(|r| r.id == 1).unwrap().kills, 7);
        assert_eq!(end.participants.len(), 2);
        assert!(room.last_results.is_some());
        assert!(has_event(&out, |e| matches!(e, ServerEvent::GameEnd(_))));
        assert!(has_event(&out, |e| matches!(e, ServerEvent::LobbyUpdate(_))));
    }

    #[test]
    fn match_end_restores_unused_reward_and_keeps_used_cleared() {
        let now = 100_000;
        let mut room = playing_room(now);
        {
            let p = room.players.get_mut(&1).unwrap();
            p.instant_respawns_left = 3; // granted, unused
        }
        {
            let p = room.players.get_mut(&2).unwrap();
            p.instant_respawns_left = 1;
            p.instant_respawns_used = 2; // granted, consumed
        }
        let mut out = Vec::new();
        let end = step_room(
            &mut room,
            &maps(),
            &cfg(),
            now + MATCH_DURATION_MS,
            1.0 / 30.0,
            &mut out,
        )
        .unwrap();
        assert_eq!(end.reward_restores, vec!["device-aaaaaa".to_string()]);
    }

    #[test]
    fn match_end_drops_disconnected_records() {
        let now = 100_000;
        let mut room = playing_room(now);
        room.players.get_mut(&1).unwrap().disconnected = true;
        let mut out = Vec::new();
        step_room(&mut room, &maps(), &cfg(), now + MATCH_DURATION_MS, 1.0 / 30.0, &mut out);
        assert!(room.player(1).is_none());
        // Leadership moved on to the surviving member.
        assert_eq!(room.leader, 2);
    }

    #[test]
    fn after_a_kill_no_player_exceeds_the_projectile_cap() {
        // The cap itself is enforced at fire time; this guards the invariant
        // that the sim never spawns projectiles on its own.
        let now = 100_000;
        let mut room = playing_room(now);
        for _ in 0..MAX_ACTIVE_PROJECTILES {
            projectile_towards(&mut room, 1, 1500.0, 1500.0, 0.0);
        }
        step(&mut room, now);
        assert!(room.projectiles_owned_by(1) <= MAX_ACTIVE_PROJECTILES);
    }

    #[test]
    fn positions_stay_legal_over_many_ticks() {
        let now = 100_000;
        let mut room = playing_room(now);
        {
            let p = room.players.get_mut(&1).unwrap();
            p.input.a = true;
            p.input.w = true;
        }
        let map_catalog = maps();
        let map = map_catalog.get(MapKey::Forest);
        for i in 0..600 {
            step(&mut room, now + i * 33);
        }
        for p in room.players.values() {
            assert!(p.x >= 20.0 && p.x <= 2980.0);
            assert!(p.y >= 20.0 && p.y <= 1980.0);
            assert!(!geom::player_blocked(map, p.x, p.y));
        }
    }
}
