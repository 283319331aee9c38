//! Environment-driven server configuration.
//!
//! Everything is read once at startup; out-of-range values are clamped with a
//! warning instead of refusing to boot.

use std::env;
use std::path::PathBuf;

/// Whether abuse escalations actually block gameplay events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseMode {
    /// Escalations are counted and logged only.
    Observe,
    /// Soft blocks reject fire events, hard blocks reject fire and input.
    Enforce,
}

/// Strike thresholds and block durations of the abuse engine.
#[derive(Debug, Clone)]
pub struct AbuseConfig {
    pub mode: AbuseMode,
    pub warn_threshold: u32,
    pub soft_threshold: u32,
    pub hard_threshold: u32,
    pub soft_block_ms: u64,
    pub hard_block_ms: u64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            mode: AbuseMode::Observe,
            warn_threshold: 3,
            soft_threshold: 6,
            hard_threshold: 10,
            soft_block_ms: 3_000,
            hard_block_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub tick_rate: u32,
    pub full_snapshot_interval_ms: u64,
    pub session_secret: Vec<u8>,
    pub abuse: AbuseConfig,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            tick_rate: 30,
            full_snapshot_interval_ms: 1_000,
            session_secret: b"insecure-dev-secret".to_vec(),
            abuse: AbuseConfig::default(),
            data_dir: PathBuf::from("data"),
        }
    }
}

impl ServerConfig {
    /// Milliseconds between simulation ticks.
    pub fn tick_interval_ms(&self) -> u64 {
        1_000 / self.tick_rate as u64
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var::<u16>("PORT") {
            cfg.port = port;
        }
        if let Some(rate) = parse_var::<u32>("TICK_RATE") {
            cfg.tick_rate = clamp_warn("TICK_RATE", rate, 10, 60);
        }
        if let Some(interval) = parse_var::<u64>("STATE_FULL_SNAPSHOT_INTERVAL_MS") {
            cfg.full_snapshot_interval_ms =
                clamp_warn("STATE_FULL_SNAPSHOT_INTERVAL_MS", interval, 250, 5_000);
        }

        match env::var("SESSION_SECRET") {
            Ok(secret) if !secret.is_empty() => cfg.session_secret = secret.into_bytes(),
            _ => {
                // An ephemeral secret invalidates all tokens on restart.
                let secret: [u8; 32] = rand::random();
                tracing::warn!("SESSION_SECRET not set, generated an ephemeral secret");
                cfg.session_secret = secret.to_vec();
            }
        }

        if let Ok(mode) = env::var("ANTI_CHEAT_MODE") {
            match mode.as_str() {
                "enforce" => cfg.abuse.mode = AbuseMode::Enforce,
                "observe" => cfg.abuse.mode = AbuseMode::Observe,
                other => tracing::warn!(mode = other, "Unknown ANTI_CHEAT_MODE, using observe"),
            }
        }
        if let Some(v) = parse_var::<u32>("ANTI_CHEAT_WARN_THRESHOLD") {
            cfg.abuse.warn_threshold = v.max(1);
        }
        if let Some(v) = parse_var::<u32>("ANTI_CHEAT_SOFT_THRESHOLD") {
            cfg.abuse.soft_threshold = v.max(cfg.abuse.warn_threshold);
        }
        if let Some(v) = parse_var::<u32>("ANTI_CHEAT_HARD_THRESHOLD") {
            cfg.abuse.hard_threshold = v.max(cfg.abuse.soft_threshold);
        }
        if let Some(v) = parse_var::<u64>("ANTI_CHEAT_SOFT_BLOCK_MS") {
            cfg.abuse.soft_block_ms = v;
        }
        if let Some(v) = parse_var::<u64>("ANTI_CHEAT_HARD_BLOCK_MS") {
            cfg.abuse.hard_block_ms = v;
        }
        if let Ok(dir) = env::var("DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }

        cfg
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Unparseable environment value ignored");
            None
        }
    }
}

fn clamp_warn<T: PartialOrd + Copy + std::fmt::Display>(name: &str, value: T, lo: T, hi: T) -> T {
    if value < lo || value > hi {
        tracing::warn!(var = name, %value, %lo, %hi, "Value out of range, clamping");
    }
    if value < lo {
        lo
    } else if value > hi {
        hi
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_knobs() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.tick_rate, 30);
        assert_eq!(cfg.tick_interval_ms(), 33);
        assert_eq!(cfg.full_snapshot_interval_ms, 1_000);
        assert_eq!(cfg.abuse.mode, AbuseMode::Observe);
        assert_eq!(
            (cfg.abuse.warn_threshold, cfg.abuse.soft_threshold, cfg.abuse.hard_threshold),
            (3, 6, 10)
        );
    }

    #[test]
    fn clamping_is_inclusive_on_both_ends() {
        assert_eq!(clamp_warn("x", 9u32, 10, 60), 10);
        assert_eq!(clamp_warn("x", 10u32, 10, 60), 10);
        assert_eq!(clamp_warn("x", 61u32, 10, 60), 60);
        assert_eq!(clamp_warn("x", 45u32, 10, 60), 45);
    }
}
