use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// The actions a device worker knows how to execute. Close is injected at
/// shutdown, is never re-enqueued, and permanently ends the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Measure,
    Calibrate,
    Dispense,
    HistoryPlot,
    GaugePlot,
    Close,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Measure => "measure",
            Self::Calibrate => "calibrate",
            Self::Dispense => "dispense",
            Self::HistoryPlot => "history_plot",
            Self::GaugePlot => "gauge_plot",
            Self::Close => "close",
        }
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "measure" => Ok(Self::Measure),
            "calibrate" => Ok(Self::Calibrate),
            "dispense" => Ok(Self::Dispense),
            "history_plot" => Ok(Self::HistoryPlot),
            "gauge_plot" => Ok(Self::GaugePlot),
            "close" => Ok(Self::Close),
            other => Err(format!("unknown action kind '{other}'")),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending action in one device's queue.
///
/// `seq` is the insertion order within the owning worker; it is assigned on
/// load/enqueue and only breaks ties between entries with equal priority and
/// scheduled time. It is not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub kind: ActionKind,
    pub scheduled_at: DateTime<FixedOffset>,
    pub priority: i32,
    pub interval_secs: Option<u64>,
    pub seq: u64,
}

impl QueueEntry {
    pub fn new(
        kind: ActionKind,
        scheduled_at: DateTime<FixedOffset>,
        priority: i32,
        interval_secs: Option<u64>,
    ) -> Self {
        Self {
            kind,
            scheduled_at,
            priority,
            interval_secs,
            seq: 0,
        }
    }

    /// Serializes to one persisted record: tab-separated fields, scheduled
    /// time as ISO-8601 with offset.
    pub fn to_record(&self) -> String {
        let interval = match self.interval_secs {
            Some(secs) => secs.to_string(),
            None => "-".to_string(),
        };
        format!(
            "{}\t{}\t{}\t{}",
            self.kind,
            self.scheduled_at.to_rfc3339(),
            self.priority,
            interval
        )
    }

    pub fn from_record(line: &str) -> Result<Self, String> {
        let mut fields = line.split('\t');
        let kind = fields
            .next()
            .ok_or("missing action kind")?
            .parse::<ActionKind>()?;
        let scheduled_at = fields
            .next()
            .ok_or("missing scheduled time")
            .and_then(|raw| {
                DateTime::parse_from_rfc3339(raw).map_err(|_| "bad scheduled time")
            })
            .map_err(|err| format!("{err} in '{line}'"))?;
        let priority = fields
            .next()
            .and_then(|raw| raw.parse::<i32>().ok())
            .ok_or_else(|| format!("bad priority in '{line}'"))?;
        let interval_secs = match fields.next() {
            Some("-") | None => None,
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| format!("bad interval in '{line}'"))?,
            ),
        };

        Ok(Self {
            kind,
            scheduled_at,
            priority,
            interval_secs,
            seq: 0,
        })
    }
}

/// Total order on a device queue: priority descending, then scheduled time
/// ascending, ties broken by insertion order.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.scheduled_at.cmp(&other.scheduled_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
