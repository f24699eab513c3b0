//! Configuration and the small ambient seams around it: the
//! `ConfigSource` trait standing in for the real cluster configuration
//! store and the `Clock` trait selecting between wall-clock and
//! monotonic-uptime cycle timing (`use_uptime`).

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Read-only key/value fetch from the cluster configuration store. The
/// real store's parser and wire protocol live in the surrounding cluster
/// stack; this is the seam it plugs into.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory source for tests and for composing with other sources.
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource(pub HashMap<String, String>);

impl ConfigSource for MapConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Loads the configuration table from a TOML file. Sufficient for
/// `quorumd` to run standalone and for tests to supply fixtures.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfigSource {
    #[serde(flatten)]
    table: HashMap<String, toml::Value>,
}

impl TomlConfigSource {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| Error::Configuration(format!("parsing {}: {e}", path.display())))
    }
}

impl ConfigSource for TomlConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.table.get(key).map(|v| match v {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Resolved daemon configuration, with defaults and derivations applied
/// (`Config::resolve`).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub interval: Duration,
    pub tko: u32,
    pub tko_up: u32,
    pub upgrade_wait: u32,
    pub master_wait: u32,
    pub votes: u32,
    pub device: Option<String>,
    pub label: Option<String>,
    pub status_file: Option<String>,
    pub min_score: i64,
    pub scheduler: String,
    pub priority: i32,
    pub reboot: bool,
    pub paranoid: bool,
    pub allow_kill: bool,
    pub stop_cman: bool,
    pub use_uptime: bool,
}

impl Config {
    /// Apply the documented defaults and derivations over whatever
    /// `source` provides. Keys absent from `source` fall back to the
    /// documented default; `tko_up` and `master_wait` are derived from
    /// `tko` unless explicitly overridden: read the explicit key, then
    /// clamp against the derived floor.
    pub fn resolve(source: &dyn ConfigSource) -> Result<Self> {
        let interval_secs = parse_or(source, "interval", 1u64)?;
        let tko = parse_or(source, "tko", 10u32)?;

        let tko_up = match source.get("tko_up") {
            Some(v) => parse(&v, "tko_up")?,
            None => (tko / 3).max(2),
        };

        let upgrade_wait = parse_or(source, "upgrade_wait", 2u32)?;

        let master_wait = match source.get("master_wait") {
            Some(v) => parse(&v, "master_wait")?,
            None => (tko / 2).max(tko_up + 1),
        };
        let master_wait = master_wait.max(tko_up + 1);

        let votes = parse_or(source, "votes", 1u32)?;
        let min_score = parse_or(source, "min_score", 0i64)?;
        let priority = parse_or(source, "priority", 1i32)?;
        let reboot = parse_bool_or(source, "reboot", true)?;
        let paranoid = parse_bool_or(source, "paranoid", false)?;
        let allow_kill = parse_bool_or(source, "allow_kill", true)?;
        let stop_cman = parse_bool_or(source, "stop_cman", false)?;
        let use_uptime = parse_bool_or(source, "use_uptime", true)?;
        let scheduler = source.get("scheduler").unwrap_or_else(|| "RR".to_string());

        Ok(Self {
            interval: Duration::from_secs(interval_secs),
            tko,
            tko_up,
            upgrade_wait,
            master_wait,
            votes,
            device: source.get("device"),
            label: source.get("label"),
            status_file: source.get("status_file"),
            min_score,
            scheduler,
            priority,
            reboot,
            paranoid,
            allow_kill,
            stop_cman,
            use_uptime,
        })
    }

    /// `interval * tko`: the cycle-overrun budget.
    pub fn max_cycle(&self) -> Duration {
        self.interval * self.tko
    }

    /// Validate a resolved `score_max` against `min_score`. The node
    /// tolerates `score_max < min_score` at runtime (it just stays
    /// permanently ineligible), but callers that want to surface this as a
    /// hard startup failure instead can use this check.
    pub fn check_score_gate(&self, score_max: u64) -> Option<Error> {
        if self.min_score > 0 && score_max < self.min_score as u64 {
            Some(Error::ImpossibleScoreGate { score_max, score_min: self.min_score as u64 })
        } else {
            None
        }
    }
}

fn parse_or<T: std::str::FromStr>(source: &dyn ConfigSource, key: &str, default: T) -> Result<T> {
    match source.get(key) {
        Some(v) => parse(&v, key),
        None => Ok(default),
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T> {
    value.parse().map_err(|_| Error::Configuration(format!("key {key} has invalid value {value:?}")))
}

fn parse_bool_or(source: &dyn ConfigSource, key: &str, default: bool) -> Result<bool> {
    match source.get(key) {
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "yes" => Ok(true),
            "off" | "false" | "0" | "no" => Ok(false),
            _ => Err(Error::Configuration(format!("key {key} has invalid boolean {v:?}"))),
        },
        None => Ok(default),
    }
}

/// Selects which clock the quorum loop samples for `t0`/`t1`: monotonic
/// uptime survives NTP steps, wall clock is the fallback when
/// `use_uptime` is off.
pub trait Clock: Send {
    fn now(&self) -> Instant;
    /// Seconds since an arbitrary epoch, suitable for the status block's
    /// `timestamp` field. Only needs to be monotonic and comparable across
    /// this node's own writes; peers only ever compare it to their own
    /// prior observation.
    fn stamp_secs(&self) -> u64;
}

/// `CLOCK_MONOTONIC`-equivalent: immune to wall-clock adjustments.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn stamp_secs(&self) -> u64 {
        // `Instant` has no public epoch, so for the on-disk timestamp we
        // still need a comparable absolute value; uptime-style monotonic
        // behavior for timekeeping purposes is only relied upon for the
        // in-process t0/t1 measurement, not the wire timestamp.
        SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_secs()
    }
}

/// Plain wall clock, used when `use_uptime = off`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn stamp_secs(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_secs()
    }
}

/// Pick the clock implementation the `use_uptime` key selects.
pub fn clock_for(use_uptime: bool) -> Box<dyn Clock> {
    if use_uptime { Box::new(MonotonicClock) } else { Box::new(WallClock) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> MapConfigSource {
        MapConfigSource(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = Config::resolve(&map(&[])).unwrap();
        assert_eq!(cfg.interval, Duration::from_secs(1));
        assert_eq!(cfg.tko, 10);
        assert_eq!(cfg.tko_up, 3); // max(2, 10/3) = max(2, 3) = 3
        assert_eq!(cfg.upgrade_wait, 2);
        assert_eq!(cfg.master_wait, 5); // max(10/2, 3+1) = max(5, 4) = 5
        assert_eq!(cfg.min_score, 0);
        assert!(cfg.reboot);
        assert!(!cfg.paranoid);
        assert!(cfg.allow_kill);
        assert!(cfg.use_uptime);
    }

    #[test]
    fn tko_up_has_a_floor_of_two() {
        let cfg = Config::resolve(&map(&[("tko", "3")])).unwrap();
        assert_eq!(cfg.tko_up, 2); // max(2, 3/3) = max(2, 1) = 2
    }

    #[test]
    fn master_wait_floor_is_tko_up_plus_one() {
        let cfg = Config::resolve(&map(&[("tko", "2"), ("tko_up", "2")])).unwrap();
        // master_wait default = max(tko/2, tko_up+1) = max(1, 3) = 3
        assert_eq!(cfg.master_wait, 3);
    }

    #[test]
    fn explicit_overrides_are_honored() {
        let cfg = Config::resolve(&map(&[("interval", "5"), ("paranoid", "on"), ("min_score", "7")])).unwrap();
        assert_eq!(cfg.interval, Duration::from_secs(5));
        assert!(cfg.paranoid);
        assert_eq!(cfg.min_score, 7);
    }

    #[test]
    fn invalid_boolean_is_a_configuration_error() {
        let err = Config::resolve(&map(&[("paranoid", "maybe")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
