//! Care tasks, due dates and urgency
//!
//! Due dates are a fixed interval after the last care event. There is no
//! seasonal or history-based adjustment.

use crate::catalog::CareRequirements;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Misting cadence for humidity-loving plants
pub const MISTING_INTERVAL_DAYS: i32 = 2;

/// A kind of care a plant can receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CareTask {
    Watering,
    Fertilizing,
    Misting,
    Repotting,
    Pruning,
}

impl CareTask {
    pub const ALL: [CareTask; 5] = [
        CareTask::Watering,
        CareTask::Fertilizing,
        CareTask::Misting,
        CareTask::Repotting,
        CareTask::Pruning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CareTask::Watering => "watering",
            CareTask::Fertilizing => "fertilizing",
            CareTask::Misting => "misting",
            CareTask::Repotting => "repotting",
            CareTask::Pruning => "pruning",
        }
    }

    /// Imperative verb used in reminder copy ("time to water")
    pub fn verb(&self) -> &'static str {
        match self {
            CareTask::Watering => "water",
            CareTask::Fertilizing => "fertilize",
            CareTask::Misting => "mist",
            CareTask::Repotting => "repot",
            CareTask::Pruning => "prune",
        }
    }

    /// Accepts the stored form plus the bare verbs ("water", "mist")
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "watering" | "water" => Some(CareTask::Watering),
            "fertilizing" | "fertilize" | "fertilizer" => Some(CareTask::Fertilizing),
            "misting" | "mist" => Some(CareTask::Misting),
            "repotting" | "repot" => Some(CareTask::Repotting),
            "pruning" | "prune" => Some(CareTask::Pruning),
            _ => None,
        }
    }
}

impl std::fmt::Display for CareTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How pressing an overdue task is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(Urgency::Low),
            "medium" => Some(Urgency::Medium),
            "high" => Some(Urgency::High),
            "critical" => Some(Urgency::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next due date: last event plus a fixed interval
pub fn next_due(last_event: DateTime<Utc>, interval_days: i32) -> DateTime<Utc> {
    last_event + Duration::days(i64::from(interval_days.max(1)))
}

/// Whole days elapsed since `event`, clamped at zero
pub fn days_since(event: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - event).num_days().max(0)
}

/// Whole days a task is past its due date (negative when not yet due)
pub fn days_overdue(due: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - due).num_days()
}

pub fn urgency(task: CareTask, days_overdue: i64) -> Urgency {
    match task {
        CareTask::Watering => match days_overdue {
            d if d <= 0 => Urgency::Low,
            d if d <= 2 => Urgency::Medium,
            d if d <= 5 => Urgency::High,
            _ => Urgency::Critical,
        },
        CareTask::Fertilizing => match days_overdue {
            d if d <= 7 => Urgency::Low,
            d if d <= 30 => Urgency::Medium,
            _ => Urgency::High,
        },
        _ => match days_overdue {
            d if d <= 3 => Urgency::Low,
            d if d <= 14 => Urgency::Medium,
            _ => Urgency::High,
        },
    }
}

/// The (task, interval) pairs a new plant starts with
pub fn initial_schedules(requirements: &CareRequirements) -> Vec<(CareTask, i32)> {
    let mut schedules = vec![(CareTask::Watering, requirements.watering_frequency_days.max(1))];

    if let Some(days) = requirements.fertilizing_frequency_days {
        schedules.push((CareTask::Fertilizing, days.max(1)));
    }
    if requirements.humidity_level == "high" {
        schedules.push((CareTask::Misting, MISTING_INTERVAL_DAYS));
    }

    schedules
}

/// Parse a stored RFC 3339 timestamp
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Canonical stored form: UTC, second precision, `Z` suffix
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
