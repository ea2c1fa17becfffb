//! Injectable time source.
//!
//! Lease math runs on UTC epoch seconds; humans see a fixed-offset wall
//! clock string (`YYYY-MM-DD HH:MM`, default UTC+9). The two views come
//! from the same [`Clock`] and are never derived from each other inside
//! business logic.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

pub const WALL_FORMAT: &str = "%Y-%m-%d %H:%M";
pub const DEFAULT_TZ_OFFSET_HOURS: i32 = 9;

pub trait Clock: Send + Sync {
    /// Integer seconds since the UNIX epoch, UTC.
    fn now_epoch(&self) -> i64;

    /// Wall-clock string at the configured offset.
    fn now_wall(&self) -> String;

    /// The configured display offset.
    fn offset(&self) -> FixedOffset;
}

/// Real clock at a fixed display offset.
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Offset given in whole hours; out-of-range values fall back to the
    /// default (+9).
    pub fn from_offset_hours(hours: i32) -> Self {
        Self {
            offset: offset_from_hours(hours),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::from_offset_hours(DEFAULT_TZ_OFFSET_HOURS)
    }
}

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn now_wall(&self) -> String {
        Utc::now().with_timezone(&self.offset).format(WALL_FORMAT).to_string()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

pub fn offset_from_hours(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours * 3600)
        .unwrap_or_else(|| FixedOffset::east_opt(DEFAULT_TZ_OFFSET_HOURS * 3600).unwrap())
}

/// Parse a wall-clock cell back into a timestamp. `-` and blanks are the
/// "not set" sentinels and return `None`.
pub fn parse_wall(offset: FixedOffset, s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if s.is_empty() || s == "-" {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(s, WALL_FORMAT).ok()?;
    offset.from_local_datetime(&naive).single()
}

/// Hand-cranked clock for deterministic tests.
pub struct ManualClock {
    epoch: std::sync::atomic::AtomicI64,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(epoch: i64) -> Self {
        Self {
            epoch: std::sync::atomic::AtomicI64::new(epoch),
            offset: offset_from_hours(DEFAULT_TZ_OFFSET_HOURS),
        }
    }

    pub fn set(&self, epoch: i64) {
        self.epoch.store(epoch, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.epoch.fetch_add(seconds, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch(&self) -> i64 {
        self.epoch.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn now_wall(&self) -> String {
        let epoch = self.now_epoch();
        match DateTime::from_timestamp(epoch, 0) {
            Some(dt) => dt.with_timezone(&self.offset).format(WALL_FORMAT).to_string(),
            None => "-".to_string(),
        }
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}
