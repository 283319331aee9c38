//! Gameplay constants both endpoints have to agree on.
//!
//! The client uses these for rendering and local prediction, the server for the
//! authoritative checks. Distances are in pixels, angles in radians, durations
//! in milliseconds unless the name says otherwise.

/// Playfield width.
pub const MAP_WIDTH: f64 = 3000.0;
/// Playfield height.
pub const MAP_HEIGHT: f64 = 2000.0;
/// Players are clamped this far away from the playfield edge.
pub const EDGE_MARGIN: f64 = 20.0;

/// Body radius of a player.
pub const PLAYER_RADIUS: f64 = 18.0;
/// Radius of a projectile.
pub const PROJECTILE_RADIUS: f64 = 3.0;
/// A projectile within this distance of a player centre counts as a hit.
pub const HIT_RADIUS: f64 = 21.0;
/// Head visual radius + projectile radius + jitter tolerance (8 + 3 + 5).
pub const HEADSHOT_RADIUS: f64 = 16.0;
/// The projectile tip sits this far ahead of its tracked position.
pub const PROJECTILE_TIP_OFFSET: f64 = 6.0;
/// The muzzle origin is offset this far from the shooter centre.
pub const MUZZLE_OFFSET: f64 = 25.0;
/// Allowed deviation of the reported muzzle origin from [`MUZZLE_OFFSET`].
pub const MUZZLE_OFFSET_TOLERANCE: f64 = 6.0;
/// Step width when sampling the shooter-to-muzzle segment for occlusion.
pub const OCCLUSION_SAMPLE_STEP: f64 = 6.0;

/// Base movement speed in px/s.
pub const BASE_SPEED: f64 = 127.05;
/// Speed multiplier while the speed buff is active.
pub const SPEED_BOOST_FACTOR: f64 = 1.25;
/// Speed multiplier while charging a shot.
pub const CHARGING_SPEED_FACTOR: f64 = 0.5;
/// Projectile speed in px/s.
pub const PROJECTILE_SPEED: f64 = 871.2;
/// Projectiles older than this are dropped.
pub const PROJECTILE_LIFETIME_SECS: f64 = 10.0;

/// Baseline hit points.
pub const BASE_MAX_HP: i32 = 3;
/// Hit points while the extra-core killstreak tier is active.
pub const EXTRA_CORE_MAX_HP: i32 = 4;
/// Delay between death and automatic respawn.
pub const RESPAWN_DELAY_MS: u64 = 3000;
/// Lobby-to-playing countdown length.
pub const COUNTDOWN_MS: u64 = 3000;
/// Match length.
pub const MATCH_DURATION_MS: u64 = 110_000;
/// A picked-up buff reappears after this delay.
pub const BUFF_RESPAWN_MS: u64 = 6000;
/// How long a timed buff (shield, invisible, speed) stays active.
pub const BUFF_DURATION_MS: u64 = 6000;
/// Kills within this window of each other extend a kill chain.
pub const KILL_CHAIN_WINDOW_MS: u64 = 6000;
/// Instant-respawn charges granted per match when the reward flag is pending.
pub const INSTANT_RESPAWN_CHARGES: u32 = 3;

/// Minimum spacing between two shots.
pub const FIRE_COOLDOWN_MS: u64 = 140;
/// A shot requires the charge to be held this long.
pub const CHARGE_REQUIRED_MS: u64 = 1000;
/// Reduced charge time at the fast-charge killstreak tier.
pub const CHARGE_REQUIRED_FAST_MS: u64 = 850;
/// Killstreak at which the reduced charge time applies.
pub const FAST_CHARGE_STREAK: u32 = 7;
/// Grace subtracted from the required charge time.
pub const CHARGE_GRACE_MS: u64 = 90;
/// Maximum projectiles a single player may have in flight.
pub const MAX_ACTIVE_PROJECTILES: usize = 8;
/// A shot is rejected when the last movement input is older than this.
pub const INPUT_STALE_MS: u64 = 4000;
/// Shot angle deviation from the movement angle that records a warning.
pub const FIRE_ANGLE_WARN_RAD: f64 = 1.8;
/// Shot angle deviation that rejects the shot.
pub const FIRE_ANGLE_REJECT_RAD: f64 = 2.75;

/// Tolerated backwards slack of the input sequence window.
pub const SEQ_BACK_SLACK: u64 = 2;
/// Tolerated forward slack of the input sequence window.
pub const SEQ_AHEAD_SLACK: u64 = 200;
/// Absolute upper bound for input sequence numbers.
pub const SEQ_MAX: u64 = 1_000_000_000;

/// Seats in a room.
pub const MAX_PLAYERS_PER_ROOM: usize = 6;
/// Number of fixed buff spawn points per map.
pub const BUFF_SPAWN_COUNT: usize = 6;

/// Session tokens live this long.
pub const SESSION_TTL_MS: u64 = 14 * 24 * 60 * 60 * 1000;
/// Finished-match results are retained this long for late reconnects.
pub const RESULTS_RETENTION_MS: u64 = 30 * 60 * 1000;
/// Party invites expire after this.
pub const PARTY_INVITE_TTL_MS: u64 = 45_000;
/// Reconnect guard window.
pub const RECONNECT_WINDOW_MS: u64 = 20_000;
/// Reconnect attempts allowed inside [`RECONNECT_WINDOW_MS`].
pub const RECONNECT_MAX_ATTEMPTS: u32 = 6;

/// Accepted length range for persistent device ids.
pub const PERSISTENT_ID_MIN_LEN: usize = 6;
/// See [`PERSISTENT_ID_MIN_LEN`].
pub const PERSISTENT_ID_MAX_LEN: usize = 64;
/// Display names are cut to this length.
pub const NAME_MAX_LEN: usize = 16;
