//! Kernel sizing constants and runtime configuration
//!
//! The table sizes are compile-time constants; the heap size and the
//! watchdog tuning vary by target, so they travel in [`KernelConfig`].

/// Number of task slots, including the permanent idle task in slot 0.
pub const MAX_TASKS: usize = 8;

/// Entries in the kernel file-handle table.
pub const MAX_FILE_HANDLES: usize = 16;

/// Entries in the kernel directory-handle table.
pub const MAX_DIR_HANDLES: usize = 4;

/// Capacity of each per-task message ring.
pub const MAX_MESSAGE_QUEUE_SIZE: usize = 16;

/// Largest message payload, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64;

/// Entries in the semaphore table.
pub const MAX_SEMAPHORES: usize = 8;

/// Frames kept in a task's captured call-stack snapshot.
pub const MAX_STACK_TRACE_DEPTH: usize = 8;

/// Default watchdog deadline: a task that goes this long without
/// yielding is forced back to ready.
pub const WATCHDOG_TIMEOUT_MS: u64 = 5000;

/// Default heap size for the host profile. Real targets range from 2 KiB
/// (Uno-class) up to 512 KiB.
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024;

/// Per-kernel tunables.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Bytes reserved for the kernel heap.
    pub heap_size: usize,
    /// Watchdog deadline in milliseconds.
    pub watchdog_timeout_ms: u64,
    /// Whether the watchdog runs at all.
    pub watchdog_enabled: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            watchdog_timeout_ms: WATCHDOG_TIMEOUT_MS,
            watchdog_enabled: true,
        }
    }
}
