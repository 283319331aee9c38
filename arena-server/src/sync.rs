//! Snapshot/delta selection for the per-tick world broadcast.
//!
//! The sync ledger mirrors what the clients last received. A full snapshot
//! goes out on the first tick of a match and whenever the snapshot interval
//! elapsed; in between, only fields that moved beyond the epsilons are
//! emitted. Sub-epsilon drift stays in the ledger as the old value, so it is
//! flushed as soon as the accumulated change crosses the threshold.

use std::collections::HashMap;

use protocol::wire::{
    BuffState, BuffUpsert, DeltaSet, PlayerKey, PlayerState, PlayerUpsert, ProjectileState,
    ProjectileUpsert, StateUpdateBody, WorldDelta, WorldSnapshot,
};

/// Position and velocity changes below this are not worth a delta field.
pub const POS_EPSILON: f64 = 0.01;
/// Angle changes below this are not worth a delta field.
pub const ANGLE_EPSILON: f64 = 0.001;

/// Per-room broadcast ledger.
#[derive(Debug, Default)]
pub struct SyncState {
    last_full_ms: u64,
    seen_first_tick: bool,
    players: HashMap<PlayerKey, PlayerState>,
    projectiles: HashMap<u64, ProjectileState>,
    buffs: HashMap<u8, BuffState>,
}

impl SyncState {
    /// Forgets everything; the next update is a snapshot again.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Decides snapshot vs delta for this tick and advances the ledger.
    pub fn next_body(
        &mut self,
        current: WorldSnapshot,
        now_ms: u64,
        full_interval_ms: u64,
    ) -> StateUpdateBody {
        let want_full =
            !self.seen_first_tick || now_ms.saturating_sub(self.last_full_ms) >= full_interval_ms;
        if want_full {
            self.seen_first_tick = true;
            self.last_full_ms = now_ms;
            self.players = current.players.iter().map(|p| (p.id, p.clone())).collect();
            self.projectiles = current.projectiles.iter().map(|p| (p.id, p.clone())).collect();
            self.buffs = current.buffs.iter().map(|b| (b.id, b.clone())).collect();
            return StateUpdateBody::Snapshot(current);
        }

        let mut delta = WorldDelta::default();
        delta.players = diff_players(&mut self.players, &current.players);
        delta.projectiles = diff_projectiles(&mut self.projectiles, &current.projectiles);
        delta.buffs = diff_buffs(&mut self.buffs, &current.buffs);
        StateUpdateBody::Delta(delta)
    }
}

fn pos_changed(a: f64, b: f64) -> bool {
    (a - b).abs() > POS_EPSILON
}

fn angle_changed(a: f64, b: f64) -> bool {
    (a - b).abs() > ANGLE_EPSILON
}

fn full_player_upsert(p: &PlayerState) -> PlayerUpsert {
    PlayerUpsert {
        id: p.id,
        name: Some(p.name.clone()),
        x: Some(p.x),
        y: Some(p.y),
        angle: Some(p.angle),
        hp: Some(p.hp),
        max_hp: Some(p.max_hp),
        kills: Some(p.kills),
        deaths: Some(p.deaths),
        killstreak: Some(p.killstreak),
        has_shield: Some(p.has_shield),
        invisible: Some(p.invisible),
        speed_boost: Some(p.speed_boost),
        shield_until: Some(p.shield_until),
        invisible_until: Some(p.invisible_until),
        speed_until: Some(p.speed_until),
        charging: Some(p.charging),
        last_seq: Some(p.last_seq),
    }
}

fn diff_players(
    prev: &mut HashMap<PlayerKey, PlayerState>,
    current: &[PlayerState],
) -> DeltaSet<PlayerUpsert, PlayerKey> {
    let mut set = DeltaSet::default();
    for cur in current {
        match prev.get_mut(&cur.id) {
            None => {
                set.upserts.push(full_player_upsert(cur));
                prev.insert(cur.id, cur.clone());
            }
            Some(old) => {
                let mut u = PlayerUpsert { id: cur.id, ..Default::default() };
                if old.name != cur.name {
                    u.name = Some(cur.name.clone());
                }
                if pos_changed(old.x, cur.x) {
                    u.x = Some(cur.x);
                }
                if pos_changed(old.y, cur.y) {
                    u.y = Some(cur.y);
                }
                if angle_changed(old.angle, cur.angle) {
                    u.angle = Some(cur.angle);
                }
                if old.hp != cur.hp {
                    u.hp = Some(cur.hp);
                }
                if old.max_hp != cur.max_hp {
                    u.max_hp = Some(cur.max_hp);
                }
                if old.kills != cur.kills {
                    u.kills = Some(cur.kills);
                }
                if old.deaths != cur.deaths {
                    u.deaths = Some(cur.deaths);
                }
                if old.killstreak != cur.killstreak {
                    u.killstreak = Some(cur.killstreak);
                }
                if old.has_shield != cur.has_shield {
                    u.has_shield = Some(cur.has_shield);
                }
                if old.invisible != cur.invisible {
                    u.invisible = Some(cur.invisible);
                }
                if old.speed_boost != cur.speed_boost {
                    u.speed_boost = Some(cur.speed_boost);
                }
                if old.shield_until != cur.shield_until {
                    u.shield_until = Some(cur.shield_until);
                }
                if old.invisible_until != cur.invisible_until {
                    u.invisible_until = Some(cur.invisible_until);
                }
                if old.speed_until != cur.speed_until {
                    u.speed_until = Some(cur.speed_until);
                }
                if old.charging != cur.charging {
                    u.charging = Some(cur.charging);
                }
                if old.last_seq != cur.last_seq {
                    u.last_seq = Some(cur.last_seq);
                }
                if u != (PlayerUpsert { id: cur.id, ..Default::default() }) {
                    old.apply(&u);
                    set.upserts.push(u);
                }
            }
        }
    }
    let live: Vec<PlayerKey> = current.iter().map(|p| p.id).collect();
    prev.retain(|id, _| {
        let keep = live.contains(id);
        if !keep {
            set.removed.push(*id);
        }
        keep
    });
    set
}

fn diff_projectiles(
    prev: &mut HashMap<u64, ProjectileState>,
    current: &[ProjectileState],
) -> DeltaSet<ProjectileUpsert, u64> {
    let mut set = DeltaSet::default();
    for cur in current {
        match prev.get_mut(&cur.id) {
            None => {
                set.upserts.push(ProjectileUpsert {
                    id: cur.id,
                    owner: Some(cur.owner),
                    x: Some(cur.x),
                    y: Some(cur.y),
                    vx: Some(cur.vx),
                    vy: Some(cur.vy),
                    angle: Some(cur.angle),
                });
                prev.insert(cur.id, cur.clone());
            }
            Some(old) => {
                let mut u = ProjectileUpsert { id: cur.id, ..Default::default() };
                if pos_changed(old.x, cur.x) {
                    u.x = Some(cur.x);
                }
                if pos_changed(old.y, cur.y) {
                    u.y = Some(cur.y);
                }
                if pos_changed(old.vx, cur.vx) {
                    u.vx = Some(cur.vx);
                }
                if pos_changed(old.vy, cur.vy) {
                    u.vy = Some(cur.vy);
                }
                if angle_changed(old.angle, cur.angle) {
                    u.angle = Some(cur.angle);
                }
                if u != (ProjectileUpsert { id: cur.id, ..Default::default() }) {
                    old.apply(&u);
                    set.upserts.push(u);
                }
            }
        }
    }
    let live: Vec<u64> = current.iter().map(|p| p.id).collect();
    prev.retain(|id, _| {
        let keep = live.contains(id);
        if !keep {
            set.removed.push(*id);
        }
        keep
    });
    set
}

fn diff_buffs(prev: &mut HashMap<u8, BuffState>, current: &[BuffState]) -> DeltaSet<BuffUpsert, u8> {
    let mut set = DeltaSet::default();
    for cur in current {
        match prev.get_mut(&cur.id) {
            None => {
                set.upserts.push(BuffUpsert {
                    id: cur.id,
                    kind: Some(cur.kind),
                    active: Some(cur.active),
                    taken_at: Some(cur.taken_at),
                });
                prev.insert(cur.id, cur.clone());
            }
            Some(old) => {
                let mut u = BuffUpsert { id: cur.id, ..Default::default() };
                if old.kind != cur.kind {
                    u.kind = Some(cur.kind);
                }
                if old.active != cur.active {
                    u.active = Some(cur.active);
                }
                if old.taken_at != cur.taken_at {
                    u.taken_at = Some(cur.taken_at);
                }
                if u != (BuffUpsert { id: cur.id, ..Default::default() }) {
                    old.apply(&u);
                    set.upserts.push(u);
                }
            }
        }
    }
    // Buff spawn points never disappear during a match; removal only happens
    // when the ledger resets anyway, but keep the check for symmetry.
    let live: Vec<u8> = current.iter().map(|b| b.id).collect();
    prev.retain(|id, _| {
        let keep = live.contains(id);
        if !keep {
            set.removed.push(*id);
        }
        keep
    });
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::wire::BuffKind;

    fn player(id: PlayerKey, x: f64) -> PlayerState {
        PlayerState {
            id,
            name: format!("p{id}"),
            x,
            y: 500.0,
            angle: 0.0,
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

    fn world(players: Vec<PlayerState>) -> WorldSnapshot {
        WorldSnapshot { players, projectiles: vec![], buffs: vec![] }
    }

    #[test]
    fn first_tick_is_always_a_snapshot() {
        let mut sync = SyncState::default();
        match sync.next_body(world(vec![player(1, 100.0)]), 50_000, 1_000) {
            StateUpdateBody::Snapshot(s) => assert_eq!(s.players.len(), 1),
            StateUpdateBody::Delta(_) => panic!("expected snapshot"),
        }
    }

    #[test]
    fn interval_forces_a_fresh_snapshot() {
        let mut sync = SyncState::default();
        sync.next_body(world(vec![player(1, 100.0)]), 1_000, 1_000);
        match sync.next_body(world(vec![player(1, 100.0)]), 1_500, 1_000) {
            StateUpdateBody::Delta(d) => assert!(d.is_empty()),
            _ => panic!("expected delta"),
        }
        match sync.next_body(world(vec![player(1, 100.0)]), 2_000, 1_000) {
            StateUpdateBody::Snapshot(_) => {}
            _ => panic!("expected snapshot after interval"),
        }
    }

    #[test]
    fn delta_carries_only_changed_fields() {
        let mut sync = SyncState::default();
        sync.next_body(world(vec![player(1, 100.0)]), 1_000, 10_000);
        let mut moved = player(1, 104.2);
        moved.hp = 2;
        match sync.next_body(world(vec![moved]), 1_033, 10_000) {
            StateUpdateBody::Delta(d) => {
                assert_eq!(d.players.upserts.len(), 1);
                let u = &d.players.upserts[0];
                assert_eq!(u.x, Some(104.2));
                assert_eq!(u.hp, Some(2));
                assert_eq!(u.y, None);
                assert_eq!(u.name, None);
            }
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn sub_epsilon_drift_is_withheld_until_it_accumulates() {
        let mut sync = SyncState::default();
        sync.next_body(world(vec![player(1, 100.0)]), 1_000, 60_000);
        // 0.004 below the epsilon: nothing emitted.
        match sync.next_body(world(vec![player(1, 100.004)]), 1_033, 60_000) {
            StateUpdateBody::Delta(d) => assert!(d.players.upserts.is_empty()),
            _ => panic!("expected delta"),
        }
        // Another 0.008 pushes the total drift over the epsilon.
        match sync.next_body(world(vec![player(1, 100.012)]), 1_066, 60_000) {
            StateUpdateBody::Delta(d) => {
                assert_eq!(d.players.upserts[0].x, Some(100.012));
            }
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn departures_and_arrivals_show_up_as_removed_and_full_upserts() {
        let mut sync = SyncState::default();
        sync.next_body(world(vec![player(1, 100.0), player(2, 200.0)]), 1_000, 60_000);
        match sync.next_body(world(vec![player(1, 100.0), player(3, 300.0)]), 1_033, 60_000) {
            StateUpdateBody::Delta(d) => {
                assert_eq!(d.players.removed, vec![2]);
                assert_eq!(d.players.upserts.len(), 1);
                let u = &d.players.upserts[0];
                assert_eq!(u.id, 3);
                // New entities carry every field.
                assert!(u.name.is_some() && u.x.is_some() && u.hp.is_some());
            }
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn applying_deltas_reconstructs_the_current_world() {
        let mut sync = SyncState::default();
        let base = world(vec![player(1, 100.0), player(2, 200.0)]);
        let mut client = match sync.next_body(base, 1_000, 60_000) {
            StateUpdateBody::Snapshot(s) => s,
            _ => panic!("expected snapshot"),
        };

        let mut target = world(vec![player(1, 130.0), player(3, 300.0)]);
        target.players[0].kills = 4;
        target.buffs = vec![BuffState {
            id: 0,
            x: 750.0,
            y: 500.0,
            kind: BuffKind::Shield,
            active: true,
            taken_at: 0,
        }];
        match sync.next_body(target.clone(), 1_033, 60_000) {
            StateUpdateBody::Delta(d) => client.apply_delta(&d),
            _ => panic!("expected delta"),
        }
        assert_eq!(client, target);
    }

    #[test]
    fn ledger_reset_forces_snapshot_on_next_tick() {
        let mut sync = SyncState::default();
        sync.next_body(world(vec![player(1, 100.0)]), 1_000, 60_000);
        sync.reset();
        match sync.next_body(world(vec![player(1, 100.0)]), 1_033, 60_000) {
            StateUpdateBody::Snapshot(_) => {}
            _ => panic!("expected snapshot after reset"),
        }
    }
}
