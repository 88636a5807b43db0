//! Time relevance categories and relevance decay
//!
//! Each [`TimeRelevance`] maps to a half-life. Relevance of a memory decays
//! exponentially with the time between the moment a query is about and the
//! moment the memory describes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Flat multiplier applied when the time relevance is unknown
pub const UNKNOWN_MULTIPLIER: f32 = 0.9;

/// Share of an `ALWAYS` memory's value that never decays
pub const ALWAYS_FLOOR: f32 = 0.8;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// How quickly a memory stops being relevant, ordered from unknown to
/// timeless
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeRelevance {
    #[default]
    Unknown,
    Day,
    Week,
    Month,
    Year,
    Decade,
    Century,
    Always,
}

impl TimeRelevance {
    pub const ALL: [TimeRelevance; 8] = [
        TimeRelevance::Unknown,
        TimeRelevance::Day,
        TimeRelevance::Week,
        TimeRelevance::Month,
        TimeRelevance::Year,
        TimeRelevance::Decade,
        TimeRelevance::Century,
        TimeRelevance::Always,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRelevance::Unknown => "UNKNOWN",
            TimeRelevance::Day => "DAY",
            TimeRelevance::Week => "WEEK",
            TimeRelevance::Month => "MONTH",
            TimeRelevance::Year => "YEAR",
            TimeRelevance::Decade => "DECADE",
            TimeRelevance::Century => "CENTURY",
            TimeRelevance::Always => "ALWAYS",
        }
    }

    /// Case-insensitive parse; anything unrecognised is `Unknown`
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .unwrap_or(TimeRelevance::Unknown)
    }

    /// Half-life in days, `None` for `Unknown`
    pub fn half_life_days(&self) -> Option<f64> {
        match self {
            TimeRelevance::Unknown => None,
            TimeRelevance::Day => Some(2.0),
            TimeRelevance::Week => Some(14.0),
            TimeRelevance::Month => Some(60.0),
            TimeRelevance::Year => Some(730.0),
            TimeRelevance::Decade => Some(7_300.0),
            TimeRelevance::Century => Some(73_000.0),
            TimeRelevance::Always => Some(730_000.0),
        }
    }
}

impl fmt::Display for TimeRelevance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decay `value` over `elapsed_secs` according to `kind`.
///
/// The sign of `elapsed_secs` is ignored.
pub fn time_decay(kind: TimeRelevance, value: f32, elapsed_secs: f64) -> f32 {
    let Some(half_life) = kind.half_life_days() else {
        return UNKNOWN_MULTIPLIER * value;
    };

    let days = elapsed_secs.abs() / SECONDS_PER_DAY;
    let rate = std::f64::consts::LN_2 / half_life;
    let factor = (-rate * days).exp() as f32;

    match kind {
        TimeRelevance::Always => ALWAYS_FLOOR * value + (1.0 - ALWAYS_FLOOR) * value * factor,
        _ => value * factor,
    }
}

/// Relevance of a memory to a query given both of their time anchors.
///
/// The lower of the two categories wins, so the faster decay applies and an
/// unknown side gives the flat [`UNKNOWN_MULTIPLIER`]. Times are epoch
/// seconds.
pub fn query_relevance(
    query_kind: TimeRelevance,
    query_time: f64,
    memory_kind: TimeRelevance,
    memory_time: f64,
    value: f32,
) -> f32 {
    time_decay(query_kind.min(memory_kind), value, query_time - memory_time)
}
