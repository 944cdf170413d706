//! Record ids for rules and history entries.
//!
//! Ids are snowflakes rendered as decimal strings. Each process picks a
//! [`WorkerId`] so two processes writing to the same database never hand
//! out the same id.

use snowflake::SnowflakeIdBucket;
use std::sync::Mutex;

/// Largest machine or node number a snowflake can carry (five bits each).
pub const MAX_WORKER_PART: i32 = 31;

/// The machine/node pair baked into every generated id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerId {
    machine: i32,
    node: i32,
}

impl WorkerId {
    pub const DEFAULT: WorkerId = WorkerId { machine: 1, node: 1 };

    /// Returns `None` when either part is outside `0..=31`.
    pub fn new(machine: i32, node: i32) -> Option<Self> {
        let valid = 0..=MAX_WORKER_PART;
        (valid.contains(&machine) && valid.contains(&node)).then_some(Self { machine, node })
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A snowflake source bound to one worker.
pub struct IdGenerator {
    bucket: SnowflakeIdBucket,
}

impl IdGenerator {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            bucket: SnowflakeIdBucket::new(worker.machine, worker.node),
        }
    }

    pub fn next(&mut self) -> String {
        self.bucket.get_id().to_string()
    }
}

static GLOBAL: Mutex<Option<IdGenerator>> = Mutex::new(None);

/// Installs the process-wide generator. Call once at startup, before any
/// record is created.
pub fn init(worker: WorkerId) {
    let mut global = GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *global = Some(IdGenerator::new(worker));
}

/// Next id from the process-wide generator, falling back to
/// [`WorkerId::DEFAULT`] when [`init`] was never called.
pub fn next_id() -> String {
    let mut global = GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    global
        .get_or_insert_with(|| IdGenerator::new(WorkerId::DEFAULT))
        .next()
}
