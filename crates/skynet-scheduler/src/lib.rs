//! `skynet-scheduler` — scheduled-task subsystem with SQLite persistence.
//!
//! # Overview
//!
//! Tasks are persisted to a SQLite `tasks` table, with per-run history kept
//! in `run_log`. The [`engine::SchedulerEngine`] polls the database on an
//! interval and claims any task whose `next_run` has arrived (or whose prior
//! claim's lease went stale), forwarding it to a consumer for dispatch. The
//! consumer reports back through [`engine::SchedulerHandle::complete_run`],
//! which records the run and advances or retries the task.
//!
//! # Schedule types
//!
//! | Variant    | `schedule_value`                  | Behaviour                           |
//! |------------|------------------------------------|--------------------------------------|
//! | `Once`     | RFC3339 instant                    | Single fire, then `completed`        |
//! | `Interval` | milliseconds                       | Fires every N ms                     |
//! | `Cron`     | 5-field Unix or 6/7-field quartz   | Fires per expression, in task's tz   |

pub mod db;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod types;

pub use engine::{RunOutcome, SchedulerEngine, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use types::{ContextMode, NewTask, RunLogEntry, ScheduleType, Task, TaskStatus};
