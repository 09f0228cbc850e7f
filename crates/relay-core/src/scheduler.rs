#![forbid(unsafe_code)]

//! Cooperative turn scheduler.
//!
//! All deferred work in relay runs through a [`Scheduler`] drained by the
//! host's run loop. Nothing here blocks or spawns threads: "later" means a
//! later point of the same thread's run loop.
//!
//! # Lanes
//!
//! | Lane         | Queued by                  | Runs during                |
//! |--------------|----------------------------|----------------------------|
//! | end of turn  | [`Scheduler::schedule`]    | [`Scheduler::flush`]       |
//! | later turn   | [`Scheduler::schedule_after_turns`] | [`Scheduler::end_turn`] once due |
//!
//! The end-of-turn lane plays the role of a microtask queue: reversed
//! subscription flushes, temp-value commits, re-render requests and stacked
//! publications all land there. The later-turn lane plays the role of a
//! zero-delay timer and is used for delayed provider teardown.
//!
//! # Invariants
//!
//! 1. Tasks in one lane run in FIFO order.
//! 2. Tasks queued while a flush is draining run in that same flush.
//! 3. No internal borrow is held while a task runs, so tasks may schedule,
//!    cancel, or query freely.
//! 4. A cancelled task never runs.
//!
//! # Failure Modes
//!
//! - **Self-rescheduling loop**: a task that always re-queues itself would
//!   keep `flush` busy forever. `flush` stops after
//!   [`SchedulerConfig::max_drain_rounds`] tasks and leaves the rest queued.
//! - **Re-entrant flush**: calling `flush` from inside a task is a no-op;
//!   the outer flush picks the work up.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::id::{MountId, TaskId};

type Task = Box<dyn FnOnce()>;

/// Configuration for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of tasks a single `flush` runs before yielding.
    /// Default: 10_000.
    pub max_drain_rounds: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_drain_rounds: 10_000,
        }
    }
}

impl SchedulerConfig {
    /// Set the drain ceiling.
    #[must_use]
    pub fn with_max_drain_rounds(mut self, rounds: usize) -> Self {
        self.max_drain_rounds = rounds.max(1);
        self
    }
}

struct Queued {
    id: TaskId,
    task: Task,
}

struct Delayed {
    id: TaskId,
    due_turn: u64,
    task: Task,
}

struct SchedulerInner {
    config: SchedulerConfig,
    next_id: u64,
    turn: u64,
    end_of_turn: VecDeque<Queued>,
    later: Vec<Delayed>,
    flushing: bool,
}

/// Shared handle to a single-threaded task queue.
///
/// Cloning a `Scheduler` creates a new handle to the **same** queues.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<SchedulerInner>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Scheduler")
            .field("turn", &inner.turn)
            .field("end_of_turn", &inner.end_of_turn.len())
            .field("later", &inner.later.len())
            .finish()
    }
}

/// Clears the `flushing` flag even if a task panics.
struct FlushGuard<'a> {
    inner: &'a RefCell<SchedulerInner>,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.inner.borrow_mut().flushing = false;
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    #[must_use]
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SchedulerInner {
                config,
                next_id: 0,
                turn: 0,
                end_of_turn: VecDeque::new(),
                later: Vec::new(),
                flushing: false,
            })),
        }
    }

    fn next_id(inner: &mut SchedulerInner) -> u64 {
        inner.next_id += 1;
        inner.next_id
    }

    /// Queue `task` for the end of the current turn.
    pub fn schedule(&self, task: impl FnOnce() + 'static) -> TaskId {
        let mut inner = self.inner.borrow_mut();
        let id = TaskId(Self::next_id(&mut inner));
        inner.end_of_turn.push_back(Queued {
            id,
            task: Box::new(task),
        });
        id
    }

    /// Queue `task` to run `turns` turns from now. Zero behaves like
    /// [`schedule`](Self::schedule).
    pub fn schedule_after_turns(&self, turns: u32, task: impl FnOnce() + 'static) -> TaskId {
        if turns == 0 {
            return self.schedule(task);
        }
        let mut inner = self.inner.borrow_mut();
        let id = TaskId(Self::next_id(&mut inner));
        let due_turn = inner.turn + u64::from(turns);
        inner.later.push(Delayed {
            id,
            due_turn,
            task: Box::new(task),
        });
        id
    }

    /// Drop a queued task. Returns `false` if it already ran or never existed.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut inner = self.inner.borrow_mut();
        if let Some(pos) = inner.end_of_turn.iter().position(|q| q.id == id) {
            inner.end_of_turn.remove(pos);
            return true;
        }
        if let Some(pos) = inner.later.iter().position(|d| d.id == id) {
            inner.later.remove(pos);
            return true;
        }
        false
    }

    /// Drain the end-of-turn lane. Returns the number of tasks run.
    pub fn flush(&self) -> usize {
        let limit = {
            let mut inner = self.inner.borrow_mut();
            if inner.flushing {
                return 0;
            }
            inner.flushing = true;
            inner.config.max_drain_rounds
        };
        let _guard = FlushGuard { inner: &self.inner };

        let mut ran = 0;
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                if ran >= limit {
                    if !inner.end_of_turn.is_empty() {
                        tracing::warn!(
                            message = "scheduler.drain_limit",
                            limit,
                            remaining = inner.end_of_turn.len()
                        );
                    }
                    None
                } else {
                    inner.end_of_turn.pop_front()
                }
            };
            let Some(queued) = next else {
                break;
            };
            (queued.task)();
            ran += 1;
        }
        ran
    }

    /// Finish the current turn: flush, advance the turn counter, then run
    /// every later-turn task that has come due (flushing after each one).
    pub fn end_turn(&self) -> usize {
        let mut ran = self.flush();
        let turn = {
            let mut inner = self.inner.borrow_mut();
            inner.turn += 1;
            inner.turn
        };
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                inner
                    .later
                    .iter()
                    .position(|d| d.due_turn <= turn)
                    .map(|pos| inner.later.remove(pos))
            };
            let Some(delayed) = next else {
                break;
            };
            (delayed.task)();
            ran += 1 + self.flush();
        }
        ran
    }

    /// Number of completed turns.
    #[must_use]
    pub fn turn(&self) -> u64 {
        self.inner.borrow().turn
    }

    /// Tasks waiting in either lane.
    #[must_use]
    pub fn pending(&self) -> usize {
        let inner = self.inner.borrow();
        inner.end_of_turn.len() + inner.later.len()
    }

    /// Whether both lanes are empty.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Allocate a mount identity unique within this scheduler.
    pub fn allocate_mount_id(&self) -> MountId {
        let mut inner = self.inner.borrow_mut();
        MountId(Self::next_id(&mut inner))
    }
}
