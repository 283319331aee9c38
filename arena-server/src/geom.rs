//! Collision and occlusion math.
//!
//! Everything operates on the active [`MapSpec`] and plain coordinates; the
//! simulation decides what to do with a positive test.

use protocol::consts::{
    EDGE_MARGIN, MAP_HEIGHT, MAP_WIDTH, OCCLUSION_SAMPLE_STEP, PLAYER_RADIUS, PROJECTILE_RADIUS,
};

use crate::map::MapSpec;

/// Clamps a candidate position to the walkable playfield.
pub fn clamp_to_field(x: f64, y: f64) -> (f64, f64) {
    (
        x.clamp(EDGE_MARGIN, MAP_WIDTH - EDGE_MARGIN),
        y.clamp(EDGE_MARGIN, MAP_HEIGHT - EDGE_MARGIN),
    )
}

/// True when a point is outside the playfield entirely (projectile bounds).
pub fn out_of_bounds(x: f64, y: f64) -> bool {
    x < 0.0 || y < 0.0 || x > MAP_WIDTH || y > MAP_HEIGHT
}

fn dist_sq(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let dx = ax - bx;
    let dy = ay - by;
    dx * dx + dy * dy
}

/// Would a player body centred at (x, y) intersect any obstacle?
pub fn player_blocked(map: &MapSpec, x: f64, y: f64) -> bool {
    for ob in &map.obstacles {
        if ob.kind.is_solid() {
            let reach = PLAYER_RADIUS + ob.w / 2.0;
            if dist_sq(x, y, ob.x, ob.y) <= reach * reach {
                return true;
            }
        } else {
            // Ellipse containment with the body radius folded into the axes.
            let a = ob.w / 2.0 + PLAYER_RADIUS;
            let b = ob.h / 2.0 + PLAYER_RADIUS;
            let nx = (x - ob.x) / a;
            let ny = (y - ob.y) / b;
            if nx * nx + ny * ny <= 1.0 {
                return true;
            }
        }
    }
    false
}

/// Would a projectile at (x, y) be stopped by a solid obstacle?
pub fn projectile_blocked(map: &MapSpec, x: f64, y: f64) -> bool {
    for ob in &map.obstacles {
        if !ob.kind.is_solid() {
            continue;
        }
        let reach = PROJECTILE_RADIUS + ob.w / 2.0;
        if dist_sq(x, y, ob.x, ob.y) <= reach * reach {
            return true;
        }
    }
    false
}

/// Samples the segment from (ax, ay) to (bx, by) in fixed steps and reports
/// whether any sample is blocked for projectiles. Used for muzzle occlusion.
pub fn segment_occluded(map: &MapSpec, ax: f64, ay: f64, bx: f64, by: f64) -> bool {
    let len = dist_sq(ax, ay, bx, by).sqrt();
    if len < f64::EPSILON {
        return projectile_blocked(map, ax, ay);
    }
    let steps = (len / OCCLUSION_SAMPLE_STEP).ceil() as usize;
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let x = ax + (bx - ax) * t;
        let y = ay + (by - ay) * t;
        if projectile_blocked(map, x, y) {
            return true;
        }
    }
    false
}

/// Closest point on the segment a->b to point p, as (t, x, y) with t in [0, 1].
pub fn closest_point_on_segment(
    ax: f64,
    ay: f64,
    bx: f64,
    by: f64,
    px: f64,
    py: f64,
) -> (f64, f64, f64) {
    let dx = bx - ax;
    let dy = by - ay;
    let len_sq = dx * dx + dy * dy;
    if len_sq < f64::EPSILON {
        return (0.0, ax, ay);
    }
    let t = (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0);
    (t, ax + dx * t, ay + dy * t)
}

/// One candidate from the swept projectile hit test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweptHit {
    /// Parameter along the swept segment where the closest approach happens.
    pub t: f64,
    /// Distance between the segment and the target centre at that point.
    pub distance: f64,
    /// The closest point itself (impact location for effects).
    pub x: f64,
    pub y: f64,
}

/// Tests the swept segment of a projectile against one target circle.
/// Returns the candidate when the closest approach is within `radius`.
pub fn swept_circle_hit(
    from: (f64, f64),
    to: (f64, f64),
    centre: (f64, f64),
    radius: f64,
) -> Option<SweptHit> {
    let (t, x, y) = closest_point_on_segment(from.0, from.1, to.0, to.1, centre.0, centre.1);
    let distance = dist_sq(x, y, centre.0, centre.1).sqrt();
    (distance <= radius).then_some(SweptHit { t, distance, x, y })
}

/// Orders two hit candidates: earliest along the sweep wins, ties break on
/// the smaller distance.
pub fn better_hit(current: Option<SweptHit>, candidate: SweptHit) -> bool {
    match current {
        None => true,
        Some(best) => {
            candidate.t < best.t || (candidate.t == best.t && candidate.distance < best.distance)
        }
    }
}
