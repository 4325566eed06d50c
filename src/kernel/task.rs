//! Task table and scheduler bookkeeping
//!
//! A task is a slot in a fixed table; its identifier is its slot index.
//! Slot 0 is the permanent idle task. Tasks are cooperative: the entry
//! point is invoked once per quantum and is expected to return promptly
//! after doing a bounded amount of work, typically ending in a yield or
//! a sleep.
//!
//! The table owns all selection and watchdog bookkeeping; invoking entry
//! points is the kernel's job because entries receive `&mut Kernel`.

use super::config::{MAX_DIR_HANDLES, MAX_FILE_HANDLES, MAX_STACK_TRACE_DEPTH, MAX_TASKS};
use super::syscall::Kernel;

/// Task identifier. Equal to the task's slot index in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Task execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot is unoccupied
    Empty,
    /// Eligible for selection
    Ready,
    /// Selected this quantum
    Running,
    /// Waiting for `sleep_until`
    Sleeping,
    /// Waiting on another task or resource
    Blocked,
    /// Killed while running; reclaimed when its entry returns
    Zombie,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Empty => "empty",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Sleeping => "sleeping",
            TaskState::Blocked => "blocked",
            TaskState::Zombie => "zombie",
        };
        f.write_str(s)
    }
}

bitflags::bitflags! {
    /// Per-task capability bits. Each bit gates a family of syscalls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u8 {
        /// Storage (file and directory) operations
        const SD = 1 << 0;
        /// Display operations
        const DISPLAY = 1 << 1;
        /// Creating and killing other tasks
        const TASK_CREATE = 1 << 2;
        /// Digital and analog pin access
        const GPIO = 1 << 3;
        /// I2C bus access
        const I2C = 1 << 4;
        /// SPI bus access
        const SPI = 1 << 5;
    }
}

impl Caps {
    /// Default grant for freshly created tasks. I2C, SPI and task
    /// creation need an explicit grant.
    pub const USER_DEFAULT: Caps = Caps::SD.union(Caps::DISPLAY).union(Caps::GPIO);
}

/// One frame of a captured call-stack snapshot.
///
/// Without unwind tables the capture degrades to the entry point alone,
/// which is still enough to name the task in a panic dump.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function: String,
    pub addr: usize,
}

/// A task's entry point. Invoked once per quantum with the kernel it
/// lives in; the receiver makes a bounded step and returns.
pub type TaskEntry = Box<dyn FnMut(&mut Kernel) + 'static>;

/// Creation-time knobs for a task.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Higher wins. The idle task sits at 0; the default for user tasks
    /// is 10.
    pub priority: i32,
    pub caps: Caps,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: 10,
            caps: Caps::USER_DEFAULT,
        }
    }
}

/// One slot in the task table.
pub struct Task {
    pub name: String,
    pub state: TaskState,
    pub entry: Option<TaskEntry>,
    pub priority: i32,
    /// Last time the scheduler selected this task.
    pub last_run: u64,
    /// Last time this task yielded; the watchdog keys off this.
    pub last_yield: u64,
    /// Wake deadline while `Sleeping`.
    pub sleep_until: u64,
    /// Heap bytes currently charged to this task.
    pub memory_used: usize,
    pub caps: Caps,
    /// Mirror of kernel file-handle ownership, for reclaim on kill.
    pub file_handles: [bool; MAX_FILE_HANDLES],
    /// Mirror of kernel directory-handle ownership.
    pub dir_handles: [bool; MAX_DIR_HANDLES],
    pub stack_trace: Vec<StackFrame>,
}

impl Task {
    fn vacant() -> Self {
        Self {
            name: String::new(),
            state: TaskState::Empty,
            entry: None,
            priority: 0,
            last_run: 0,
            last_yield: 0,
            sleep_until: 0,
            memory_used: 0,
            caps: Caps::empty(),
            file_handles: [false; MAX_FILE_HANDLES],
            dir_handles: [false; MAX_DIR_HANDLES],
            stack_trace: Vec::new(),
        }
    }

    /// Record a best-effort stack snapshot: the entry point, by name.
    pub fn capture_stack(&mut self, addr: usize) {
        self.stack_trace.clear();
        self.stack_trace.push(StackFrame {
            function: self.name.clone(),
            addr,
        });
        self.stack_trace.truncate(MAX_STACK_TRACE_DEPTH);
    }
}

/// The fixed array of task slots plus the current-task cursor.
pub struct TaskTable {
    slots: Vec<Task>,
    current: usize,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_TASKS).map(|_| Task::vacant()).collect(),
            current: 0,
        }
    }

    /// Drop every task and reset the cursor. Used by kernel init.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = Task::vacant();
        }
        self.current = 0;
    }

    /// Install the permanent idle task in slot 0: priority 0, no
    /// capabilities, no entry point.
    pub fn install_idle(&mut self, now: u64) {
        let idle = &mut self.slots[0];
        idle.name = "idle".to_string();
        idle.state = TaskState::Ready;
        idle.priority = 0;
        idle.caps = Caps::empty();
        idle.last_yield = now;
    }

    /// Lowest free slot index, skipping the idle slot.
    pub fn alloc(&self) -> Option<usize> {
        (1..MAX_TASKS).find(|&i| self.slots[i].state == TaskState::Empty)
    }

    /// The task in `id`, if the slot is occupied.
    pub fn get(&self, id: usize) -> Option<&Task> {
        self.slots.get(id).filter(|t| t.state != TaskState::Empty)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Task> {
        self.slots
            .get_mut(id)
            .filter(|t| t.state != TaskState::Empty)
    }

    /// Direct slot access, occupied or not.
    pub(crate) fn slot_mut(&mut self, id: usize) -> &mut Task {
        &mut self.slots[id]
    }

    pub fn current_id(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &Task {
        &self.slots[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Task {
        &mut self.slots[self.current]
    }

    /// Move any sleeper whose deadline has passed back to ready.
    /// Deadlines are inclusive; a sleeper never wakes early.
    pub fn wake_sleepers(&mut self, now: u64) {
        for slot in &mut self.slots {
            if slot.state == TaskState::Sleeping && now >= slot.sleep_until {
                slot.state = TaskState::Ready;
            }
        }
    }

    /// Demote a lingering `Running` task to `Ready`. An entry that
    /// returned without yielding is at a quantum boundary regardless.
    pub fn demote_running(&mut self) {
        for slot in &mut self.slots {
            if slot.state == TaskState::Running {
                slot.state = TaskState::Ready;
            }
        }
    }

    /// Highest-priority ready slot, lowest index on ties. Falls back to
    /// the idle slot when nothing is ready.
    pub fn pick_ready(&self) -> usize {
        let mut best = 0;
        let mut best_priority = -1;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.state == TaskState::Ready && slot.priority > best_priority {
                best = i;
                best_priority = slot.priority;
            }
        }
        best
    }

    /// Make `id` the running task and stamp its selection time.
    pub fn mark_running(&mut self, id: usize, now: u64) {
        self.current = id;
        let slot = &mut self.slots[id];
        if slot.state != TaskState::Empty {
            slot.state = TaskState::Running;
            slot.last_run = now;
        }
    }

    /// Watchdog sweep: every occupied, non-sleeping task that has not
    /// yielded within `timeout_ms` is forced from `Running` back to
    /// `Ready` and has its yield stamp reset. Returns `(id, stale_ms)`
    /// for each offender so the kernel can log them.
    pub fn watchdog_scan(&mut self, now: u64, timeout_ms: u64) -> Vec<(usize, u64)> {
        let mut forced = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == TaskState::Empty || slot.state == TaskState::Sleeping {
                continue;
            }
            let stale = now.saturating_sub(slot.last_yield);
            if stale > timeout_ms {
                if slot.state == TaskState::Running {
                    slot.state = TaskState::Ready;
                }
                slot.last_yield = now;
                forced.push((i, stale));
            }
        }
        forced
    }

    /// Return a slot to the empty pool.
    pub fn release(&mut self, id: usize) {
        self.slots[id] = Task::vacant();
    }

    /// Occupied slot indices, in order.
    pub fn live_ids(&self) -> Vec<usize> {
        (0..MAX_TASKS)
            .filter(|&i| self.slots[i].state != TaskState::Empty)
            .collect()
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}
