use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RunState {
    /// Not ticking; the initial state.
    Stopped = 0,
    /// `start()` is building shards and spawning the clock.
    Starting = 1,
    /// Clock keeps ticking but heartbeats are skipped.
    Paused = 2,
    /// `resume()` is rebuilding shards.
    Resuming = 3,
    /// Due tasks are dispatched every second.
    Started = 4,
    /// `close()` is waiting for the clock to acknowledge.
    Stopping = 5,
}

impl RunState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Starting,
            2 => RunState::Paused,
            3 => RunState::Resuming,
            4 => RunState::Started,
            5 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Stopped => "stopped",
            RunState::Starting => "starting",
            RunState::Paused => "paused",
            RunState::Resuming => "resuming",
            RunState::Started => "started",
            RunState::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(RunState::Stopped),
            "starting" => Ok(RunState::Starting),
            "paused" => Ok(RunState::Paused),
            "resuming" => Ok(RunState::Resuming),
            "started" => Ok(RunState::Started),
            "stopping" => Ok(RunState::Stopping),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// A task currently waiting in a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub name: String,
    pub trigger_time: DateTime<Utc>,
    /// Index of the shard holding the task.
    pub shard: usize,
}
