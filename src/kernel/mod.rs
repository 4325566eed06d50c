//! The kernel core - tasks, memory, IPC, and the syscall surface
//!
//! One component per file, leaves first:
//! - `clock` / `diag`: the time source and the line-oriented log sink
//! - `heap`: bump allocator with on-demand compaction
//! - `task`: the fixed task table and scheduler bookkeeping
//! - `mailbox` / `semaphore`: IPC primitives
//! - `handles`: file and directory handle tables
//! - `syscall`: the `Kernel` owning record and the numbered dispatcher
//!
//! There is no global state anywhere in this module: the `Kernel` struct
//! owns every table, and tests build as many independent kernels as they
//! need.

pub mod clock;
pub mod config;
pub mod diag;
pub mod handles;
pub mod heap;
pub mod mailbox;
pub mod semaphore;
pub mod syscall;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::KernelConfig;
pub use diag::{BufferSink, DiagSink, StderrSink};
pub use handles::{DirTable, FileTable};
pub use heap::{Heap, HeapError, MemoryInfo};
pub use mailbox::{Mailbox, MailboxError, Message};
pub use semaphore::{SemError, SemTable, Semaphore};
pub use syscall::{Arg, Kernel, KernelError, KernelResult, SyscallKind};
pub use task::{Caps, StackFrame, Task, TaskEntry, TaskId, TaskOptions, TaskState, TaskTable};
