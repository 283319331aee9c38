//! Per-event gameplay input validation.
//!
//! `playerInput` is cheap and frequent: sequence windowing, angle sanity and
//! the toggle-spam meter. `fireProjectile` is the expensive path: cadence,
//! charge hold, projectile cap, angle mismatch against the current movement
//! input, and muzzle-origin / occlusion geometry. Every rejection names a
//! [`StrikeReason`] so the abuse engine can account for it.

use protocol::consts::{
    CHARGE_GRACE_MS, CHARGE_REQUIRED_FAST_MS, CHARGE_REQUIRED_MS, FAST_CHARGE_STREAK,
    FIRE_ANGLE_REJECT_RAD, FIRE_ANGLE_WARN_RAD, FIRE_COOLDOWN_MS, INPUT_STALE_MS,
    MAX_ACTIVE_PROJECTILES, MUZZLE_OFFSET, MUZZLE_OFFSET_TOLERANCE, SEQ_AHEAD_SLACK,
    SEQ_BACK_SLACK, SEQ_MAX,
};
use protocol::events::{FirePayload, PlayerInputPayload};

use crate::abuse::StrikeReason;
use crate::geom;
use crate::map::MapSpec;
use crate::room::Player;
use crate::util::normalize_angle;

/// Points added per movement-mask change, by spacing of the change.
const TOGGLE_POINTS_FAST: u32 = 3;
const TOGGLE_POINTS_QUICK: u32 = 2;
const TOGGLE_POINTS_SLOW: u32 = 1;
/// Extra points when opposite keys are asserted together.
const OPPOSED_KEYS_POINTS: u32 = 2;
/// Meter threshold that records a strike and resets.
const TOGGLE_SPAM_THRESHOLD: u32 = 45;
/// Meter window length.
const TOGGLE_SPAM_WINDOW_MS: u64 = 1_500;

/// Result of applying a movement input.
#[derive(Debug, PartialEq)]
pub struct InputApplied {
    /// The toggle meter tripped on this event; record one strike but keep
    /// the (valid) input.
    pub toggle_spam: bool,
}

fn movement_mask(p: &PlayerInputPayload) -> u8 {
    (p.w as u8) | (p.a as u8) << 1 | (p.s as u8) << 2 | (p.d as u8) << 3
}

/// Validates and stores one `playerInput`. On success the stored input is
/// replaced and the sequence high-water mark advanced.
pub fn apply_player_input(
    player: &mut Player,
    payload: &PlayerInputPayload,
    now_ms: u64,
) -> Result<InputApplied, StrikeReason> {
    if !payload.angle.is_finite() {
        return Err(StrikeReason::InputAngleInvalid);
    }
    if payload.seq > SEQ_MAX {
        return Err(StrikeReason::InputSeqWindow);
    }
    let low = player.input_seq.saturating_sub(SEQ_BACK_SLACK);
    let high = player.input_seq + SEQ_AHEAD_SLACK;
    if payload.seq < low || payload.seq > high {
        return Err(StrikeReason::InputSeqWindow);
    }
    player.input_seq = player.input_seq.max(payload.seq);

    // Toggle-spam meter.
    let integrity = &mut player.integrity;
    if now_ms.saturating_sub(integrity.window_start_ms) >= TOGGLE_SPAM_WINDOW_MS {
        integrity.window_start_ms = now_ms;
        integrity.points = 0;
    }
    let mask = movement_mask(payload);
    if mask != integrity.last_mask {
        let dt = now_ms.saturating_sub(integrity.last_input_ms);
        integrity.points += if dt < 50 {
            TOGGLE_POINTS_FAST
        } else if dt < 100 {
            TOGGLE_POINTS_QUICK
        } else {
            TOGGLE_POINTS_SLOW
        };
        integrity.last_mask = mask;
    }
    if (payload.w && payload.s) || (payload.a && payload.d) {
        integrity.points += OPPOSED_KEYS_POINTS;
    }
    integrity.last_input_ms = now_ms;
    let toggle_spam = integrity.points >= TOGGLE_SPAM_THRESHOLD;
    if toggle_spam {
        integrity.points = 0;
        integrity.window_start_ms = now_ms;
    }

    // Charging edges.
    if payload.charging && !player.input.charging {
        player.charge_start_ms = now_ms;
    } else if !payload.charging && player.input.charging {
        player.charge_start_ms = 0;
    }

    player.input = crate::room::InputState {
        w: payload.w,
        a: payload.a,
        s: payload.s,
        d: payload.d,
        angle: normalize_angle(payload.angle),
        charging: payload.charging,
        seq: payload.seq,
    };

    Ok(InputApplied { toggle_spam })
}

/// An accepted shot: where the projectile starts and in which direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FireShot {
    pub origin_x: f64,
    pub origin_y: f64,
    pub angle: f64,
}

/// Outcome of validating a `fireProjectile`.
#[derive(Debug, PartialEq)]
pub struct FireDecision {
    pub result: Result<FireShot, StrikeReason>,
    /// Set when the shot is accepted but the angle deviation deserves a
    /// warning strike.
    pub angle_warning: bool,
}

fn reject(reason: StrikeReason) -> FireDecision {
    FireDecision { result: Err(reason), angle_warning: false }
}

/// Runs all fire checks against the player's current state.
pub fn validate_fire(
    player: &Player,
    payload: &FirePayload,
    owned_projectiles: usize,
    map: &MapSpec,
    now_ms: u64,
) -> FireDecision {
    if !payload.angle.is_finite() {
        return reject(StrikeReason::InputAngleInvalid);
    }
    if now_ms.saturating_sub(player.integrity.last_input_ms) > INPUT_STALE_MS {
        return reject(StrikeReason::FireStaleInput);
    }
    if now_ms.saturating_sub(player.last_shot_ms) < FIRE_COOLDOWN_MS {
        return reject(StrikeReason::FireRate);
    }
    let required = if player.killstreak >= FAST_CHARGE_STREAK {
        CHARGE_REQUIRED_FAST_MS
    } else {
        CHARGE_REQUIRED_MS
    };
    let held = if player.charge_start_ms == 0 {
        0
    } else {
        now_ms.saturating_sub(player.charge_start_ms)
    };
    if held < required - CHARGE_GRACE_MS {
        return reject(StrikeReason::FireChargeTooShort);
    }
    if owned_projectiles >= MAX_ACTIVE_PROJECTILES {
        return reject(StrikeReason::FireProjectileCap);
    }

    let angle = normalize_angle(payload.angle);
    let deviation = normalize_angle(angle - player.input.angle).abs();
    if deviation > FIRE_ANGLE_REJECT_RAD {
        return reject(StrikeReason::FireAngleHardReject);
    }
    let angle_warning = deviation > FIRE_ANGLE_WARN_RAD;

    // Muzzle origin: computed from the shooter unless the client reported one.
    let (ox, oy) = match (payload.x, payload.y) {
        (Some(x), Some(y)) => (x, y),
        _ => (
            player.x + MUZZLE_OFFSET * angle.cos(),
            player.y + MUZZLE_OFFSET * angle.sin(),
        ),
    };
    let origin_dist = ((ox - player.x).powi(2) + (oy - player.y).powi(2)).sqrt();
    if (origin_dist - MUZZLE_OFFSET).abs() > MUZZLE_OFFSET_TOLERANCE {
        return FireDecision { result: Err(StrikeReason::FireOriginViolation), angle_warning };
    }
    if geom::projectile_blocked(map, ox, oy) {
        return FireDecision { result: Err(StrikeReason::FireOriginViolation), angle_warning };
    }
    if geom::segment_occluded(map, player.x, player.y, ox, oy) {
        return FireDecision { result: Err(StrikeReason::FireOcclusion), angle_warning };
    }

    FireDecision {
        result: Ok(FireShot { origin_x: ox, origin_y: oy, angle }),
        angle_warning,
    }
}
