//! Small helpers shared across the server.

use std::time::{SystemTime, UNIX_EPOCH};

use protocol::consts::NAME_MAX_LEN;

/// Milliseconds since the Unix epoch. All gameplay timestamps use this clock
/// so the logic stays testable with explicit values.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Normalizes an angle into (-pi, pi].
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % std::f64::consts::TAU;
    if a > std::f64::consts::PI {
        a -= std::f64::consts::TAU;
    } else if a <= -std::f64::consts::PI {
        a += std::f64::consts::TAU;
    }
    a
}

/// Trims a display name to printable characters and the allowed length;
/// falls back to a generated one when nothing usable remains.
pub fn sanitize_name(raw: Option<&str>, fallback_tag: u32) -> String {
    let cleaned: String = raw
        .unwrap_or("")
        .chars()
        .filter(|c| !c.is_control())
        .take(NAME_MAX_LEN)
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        format!("Player-{:04}", fallback_tag % 10_000)
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn angle_normalization_lands_in_half_open_range() {
        assert!((normalize_angle(3.0 * PI) - PI).abs() < 1e-9);
        assert!((normalize_angle(-3.0 * PI) - PI).abs() < 1e-9);
        assert_eq!(normalize_angle(0.0), 0.0);
        let a = normalize_angle(-PI);
        assert!(a > -PI && a <= PI);
    }

    #[test]
    fn names_are_trimmed_and_defaulted() {
        assert_eq!(sanitize_name(Some("  Ada  "), 7), "Ada");
        assert_eq!(sanitize_name(Some("\u{0007}\u{0008}"), 7), "Player-0007");
        assert_eq!(sanitize_name(None, 12345), "Player-2345");
        assert!(sanitize_name(Some("abcdefghijklmnopqrstuvwxyz"), 0).len() <= NAME_MAX_LEN);
    }
}
