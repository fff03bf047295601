//! Fixed-slot cooperative scheduler.
//!
//! One hardware tick is subdivided into several periodic task rates. Each
//! slot moves Undefined -> Ready on registration, Ready -> Started when its
//! period elapses (the callback runs synchronously inside [`Scheduler::tick`])
//! and back to Ready once the task reports completion. A task still Started
//! on a later tick is counted as overrunning and is not invoked again.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use core::fmt;

use libm::roundf;

/// Default slot count.
pub const MAX_TASKS: usize = 5;

/// Task body. Call [`Completion::mark_done`] to release the slot before
/// returning, or leave it Started and call [`Scheduler::mark_done`] later.
pub type TaskFn<C> = fn(&mut C, &mut Completion);

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TaskState {
    #[default]
    Undefined,
    Ready,
    Started,
}

/// Completion handle passed to a running task.
#[derive(Debug, Default)]
pub struct Completion {
    done: bool,
}

impl Completion {
    pub fn mark_done(&mut self) {
        self.done = true;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedulerError {
    /// Slot index outside the table.
    InvalidIndex(usize),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::InvalidIndex(index) => write!(f, "task slot {index} out of range"),
        }
    }
}

/// Read-only view of one slot, for diagnostics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub period_ticks: u32,
    /// Ticks spent Started since the last invocation.
    pub overruns: u32,
    /// Overrun ticks accumulated since registration.
    pub total_overruns: u32,
}

struct Slot<C> {
    callback: Option<TaskFn<C>>,
    status: TaskStatus,
    elapsed: u32,
}

impl<C> Slot<C> {
    const fn empty() -> Self {
        Self {
            callback: None,
            status: TaskStatus {
                state: TaskState::Undefined,
                period_ticks: 0,
                overruns: 0,
                total_overruns: 0,
            },
            elapsed: 0,
        }
    }
}

pub struct Scheduler<C, const N: usize = MAX_TASKS> {
    tick_ms: f32,
    slots: [Slot<C>; N],
    running: bool,
}

impl<C, const N: usize> Scheduler<C, N> {
    /// Creates an empty, stopped scheduler ticked every `tick_ms`.
    #[must_use]
    pub fn new(tick_ms: f32) -> Self {
        Self {
            tick_ms,
            slots: core::array::from_fn(|_| Slot::empty()),
            running: false,
        }
    }

    /// Registers `callback` in slot `index` to run every `period_ms`.
    ///
    /// # Errors
    ///
    /// Fails when `index` is outside the table. Registering an occupied slot
    /// replaces its task.
    pub fn add_task(
        &mut self,
        index: usize,
        callback: TaskFn<C>,
        period_ms: f32,
    ) -> Result<(), SchedulerError> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(SchedulerError::InvalidIndex(index))?;
        let period = roundf(period_ms / self.tick_ms);
        *slot = Slot {
            callback: Some(callback),
            status: TaskStatus {
                state: TaskState::Ready,
                period_ticks: if period > 0.0 { period as u32 } else { 0 },
                overruns: 0,
                total_overruns: 0,
            },
            elapsed: 0,
        };
        Ok(())
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Returns slot `index` to Ready. Unknown or idle slots are ignored.
    pub fn mark_done(&mut self, index: usize) {
        let started = self
            .slots
            .get_mut(index)
            .filter(|slot| slot.status.state == TaskState::Started);
        if let Some(slot) = started {
            slot.status.state = TaskState::Ready;
        }
    }

    /// Advances every registered task by one tick.
    pub fn tick(&mut self, context: &mut C) {
        if !self.running {
            return;
        }
        for slot in &mut self.slots {
            match slot.status.state {
                TaskState::Undefined => {}
                TaskState::Started => {
                    slot.status.overruns = slot.status.overruns.saturating_add(1);
                    slot.status.total_overruns = slot.status.total_overruns.saturating_add(1);
                }
                TaskState::Ready => {
                    slot.elapsed += 1;
                    if slot.elapsed < slot.status.period_ticks {
                        continue;
                    }
                    slot.elapsed = 0;
                    slot.status.overruns = 0;
                    slot.status.state = TaskState::Started;
                    if let Some(callback) = slot.callback {
                        let mut completion = Completion::default();
                        callback(context, &mut completion);
                        if completion.done {
                            slot.status.state = TaskState::Ready;
                        }
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn status(&self, index: usize) -> Option<TaskStatus> {
        self.slots.get(index).map(|slot| slot.status)
    }

    #[must_use]
    pub const fn tick_ms(&self) -> f32 {
        self.tick_ms
    }
}
