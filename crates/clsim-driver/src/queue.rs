//! Work-group queues shared by the guest runtime and the device model.
//!
//! The guest appends to `waiting` in strict FIFO order; only the device
//! model moves ids from `waiting` to `running` and retires them.

use std::collections::{BTreeSet, VecDeque};

use crate::error::{DriverError, Result};

pub type WorkGroupId = u32;

/// Bounded waiting FIFO plus the device-owned running set.
#[derive(Debug, Clone)]
pub struct WorkGroupQueues {
    waiting: VecDeque<WorkGroupId>,
    running: BTreeSet<WorkGroupId>,
    capacity: usize,
}

impl WorkGroupQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            waiting: VecDeque::with_capacity(capacity),
            running: BTreeSet::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots left in the waiting queue. Always `capacity - waiting.len()`.
    pub fn free_slots(&self) -> usize {
        self.capacity - self.waiting.len()
    }

    pub fn waiting(&self) -> impl Iterator<Item = WorkGroupId> + '_ {
        self.waiting.iter().copied()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn is_running(&self, id: WorkGroupId) -> bool {
        self.running.contains(&id)
    }

    /// Both queues are empty.
    pub fn is_drained(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    /// Append `count` consecutive ids starting at `start`.
    ///
    /// Nothing is enqueued unless all of them fit.
    pub fn push_range(&mut self, start: WorkGroupId, count: u32) -> Result<()> {
        const CALL: &str = "si_ndrange_send_work_groups";
        let free = self.free_slots();
        if count as usize > free {
            return Err(DriverError::protocol(
                CALL,
                format!("{count} work-groups submitted but only {free} buffer entries are free"),
            ));
        }
        let Some(end) = start.checked_add(count) else {
            let reason = format!("work-group range {start}+{count} overflows");
            return Err(DriverError::protocol(CALL, reason));
        };
        self.waiting.extend(start..end);
        Ok(())
    }

    /// Device side: move up to `max` ids from the head of `waiting` to `running`.
    pub fn take_waiting(&mut self, max: usize) -> Vec<WorkGroupId> {
        let n = max.min(self.waiting.len());
        let taken: Vec<WorkGroupId> = self.waiting.drain(..n).collect();
        self.running.extend(taken.iter().copied());
        taken
    }

    /// Device side: a running work-group finished.
    pub fn retire(&mut self, id: WorkGroupId) -> Result<()> {
        if !self.running.remove(&id) {
            return Err(DriverError::protocol(
                "device",
                format!("work-group {id} retired but it is not running"),
            ));
        }
        Ok(())
    }
}
