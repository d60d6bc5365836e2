//! `cronkit-core` — configuration shared by the cronkit crates.
//!
//! Config is read from `~/.cronkit/cronkit.toml` (or an explicit path) and
//! overridden by `CRONKIT_*` environment variables. Nested keys use a double
//! underscore: `CRONKIT_SCHEDULER__THREAD_COUNT=4`.

pub mod config;
pub mod error;

pub use config::{CronkitConfig, SchedulerConfig, TaskSpec};
pub use error::{CoreError, Result};
