//! The kernel record and the system-call surface
//!
//! `Kernel` owns every table in the system: tasks, heap, mailboxes,
//! semaphores, handle tables, and the platform adaptors. All resource
//! access from task code goes through the operations here, either as
//! typed methods or through the numbered [`Kernel::syscall`] dispatcher;
//! touching the tables any other way would bypass the capability checks
//! and the accounting.
//!
//! Results are `Result` at the typed layer; the dispatcher flattens them
//! to a signed integer where non-negative means success (often a length,
//! count, or handle) and negative is one of the stable error codes.

use super::clock::{Clock, SystemClock};
use super::config::{KernelConfig, MAX_DIR_HANDLES, MAX_FILE_HANDLES, MAX_TASKS};
use super::diag::{DiagSink, StderrSink};
use super::handles::{DirTable, FileTable};
use super::heap::{align4, Heap, HeapError, MemoryInfo};
use super::mailbox::{Mailbox, MailboxError};
use super::semaphore::{SemError, SemTable};
use super::task::{Caps, TaskEntry, TaskId, TaskOptions, TaskState, TaskTable};
use crate::hal::{GpioPort, HalError, I2cBus, PinMode, SimGpio, SimI2c, SimSpi, SpiBus};
use crate::storage::{DirEntry, StorageFs};
use std::io;

/// Success code for operations with no payload.
pub const SYS_OK: i64 = 0;

/// The error half of every kernel operation. Each variant has a stable
/// negative code on the numeric syscall surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Unknown or unimplemented syscall kind
    InvalidCall,
    /// Capability or owner mismatch
    Permission,
    /// Heap, handle table, mailbox, or task table full
    NoMemory,
    /// No such path, task, or semaphore
    NotFound,
    /// Underlying device failure or inconsistent kernel state
    Io,
    /// Range, alignment, or size check failed
    InvalidParam,
    /// Semaphore wait deadline reached
    Timeout,
    /// Non-blocking operation has nothing to report
    WouldBlock,
}

impl KernelError {
    /// The wire encoding.
    pub fn code(&self) -> i64 {
        match self {
            KernelError::InvalidCall => -1,
            KernelError::Permission => -2,
            KernelError::NoMemory => -3,
            KernelError::NotFound => -4,
            KernelError::Io => -5,
            KernelError::InvalidParam => -6,
            KernelError::Timeout => -7,
            KernelError::WouldBlock => -8,
        }
    }

    /// Decode a negative syscall result.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(KernelError::InvalidCall),
            -2 => Some(KernelError::Permission),
            -3 => Some(KernelError::NoMemory),
            -4 => Some(KernelError::NotFound),
            -5 => Some(KernelError::Io),
            -6 => Some(KernelError::InvalidParam),
            -7 => Some(KernelError::Timeout),
            -8 => Some(KernelError::WouldBlock),
            _ => None,
        }
    }
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::InvalidCall => write!(f, "invalid syscall"),
            KernelError::Permission => write!(f, "permission denied"),
            KernelError::NoMemory => write!(f, "out of memory"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::Io => write!(f, "I/O error"),
            KernelError::InvalidParam => write!(f, "invalid parameter"),
            KernelError::Timeout => write!(f, "timed out"),
            KernelError::WouldBlock => write!(f, "would block"),
        }
    }
}

impl From<MailboxError> for KernelError {
    fn from(e: MailboxError) -> Self {
        match e {
            MailboxError::Full => KernelError::NoMemory,
            MailboxError::Empty => KernelError::WouldBlock,
            MailboxError::Oversize => KernelError::InvalidParam,
            MailboxError::Inconsistent => KernelError::Io,
        }
    }
}

impl From<SemError> for KernelError {
    fn from(e: SemError) -> Self {
        match e {
            SemError::InvalidId => KernelError::InvalidParam,
            SemError::NotFound => KernelError::NotFound,
            SemError::InvalidValue => KernelError::InvalidParam,
            SemError::TableFull => KernelError::NoMemory,
            SemError::AtMax => KernelError::InvalidParam,
            SemError::NotOwner => KernelError::Permission,
        }
    }
}

impl From<HeapError> for KernelError {
    fn from(e: HeapError) -> Self {
        match e {
            HeapError::ZeroSize => KernelError::InvalidParam,
            HeapError::OutOfSpace => KernelError::NoMemory,
            HeapError::InvalidFree => KernelError::InvalidParam,
            HeapError::BadAddress => KernelError::InvalidParam,
            HeapError::Corrupt => KernelError::Io,
        }
    }
}

impl From<io::Error> for KernelError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => KernelError::NotFound,
            io::ErrorKind::PermissionDenied => KernelError::Permission,
            io::ErrorKind::InvalidInput => KernelError::InvalidParam,
            _ => KernelError::Io,
        }
    }
}

impl From<HalError> for KernelError {
    fn from(_: HalError) -> Self {
        KernelError::Io
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Stable numbering of the syscall surface. The display block is
/// reserved but unimplemented; its kinds report `InvalidCall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyscallKind {
    // File operations
    FileOpen = 0,
    FileClose = 1,
    FileRead = 2,
    FileWrite = 3,
    FileDelete = 4,
    FileExists = 5,
    FileSize = 6,

    // Directory operations
    DirOpen = 7,
    DirRead = 8,
    DirClose = 9,
    DirCreate = 10,
    DirRemove = 11,
    DirRewind = 12,

    // Memory operations
    MemAlloc = 13,
    MemFree = 14,
    MemInfo = 15,
    MemCompact = 16,

    // Display operations (reserved)
    DisplayClear = 17,
    DisplayPixel = 18,
    DisplayText = 19,
    DisplayRect = 20,
    DisplayUpdate = 21,

    // Task operations
    TaskCreate = 22,
    TaskKill = 23,
    TaskYield = 24,
    TaskSleep = 25,
    TaskList = 26,

    // IPC operations
    IpcSend = 27,
    IpcReceive = 28,
    IpcPoll = 29,
    SemCreate = 30,
    SemWait = 31,
    SemPost = 32,
    SemDestroy = 33,

    // GPIO operations
    GpioPinMode = 34,
    GpioWrite = 35,
    GpioRead = 36,
    GpioAnalogRead = 37,
    GpioAnalogWrite = 38,

    // I2C operations
    I2cBegin = 39,
    I2cWrite = 40,
    I2cRead = 41,
    I2cRequest = 42,

    // SPI operations
    SpiBegin = 43,
    SpiTransfer = 44,
    SpiEnd = 45,

    // System operations
    GetTime = 46,
    Print = 47,
    DebugPrint = 48,
}

impl SyscallKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use SyscallKind::*;
        Some(match raw {
            0 => FileOpen,
            1 => FileClose,
            2 => FileRead,
            3 => FileWrite,
            4 => FileDelete,
            5 => FileExists,
            6 => FileSize,
            7 => DirOpen,
            8 => DirRead,
            9 => DirClose,
            10 => DirCreate,
            11 => DirRemove,
            12 => DirRewind,
            13 => MemAlloc,
            14 => MemFree,
            15 => MemInfo,
            16 => MemCompact,
            17 => DisplayClear,
            18 => DisplayPixel,
            19 => DisplayText,
            20 => DisplayRect,
            21 => DisplayUpdate,
            22 => TaskCreate,
            23 => TaskKill,
            24 => TaskYield,
            25 => TaskSleep,
            26 => TaskList,
            27 => IpcSend,
            28 => IpcReceive,
            29 => IpcPoll,
            30 => SemCreate,
            31 => SemWait,
            32 => SemPost,
            33 => SemDestroy,
            34 => GpioPinMode,
            35 => GpioWrite,
            36 => GpioRead,
            37 => GpioAnalogRead,
            38 => GpioAnalogWrite,
            39 => I2cBegin,
            40 => I2cWrite,
            41 => I2cRead,
            42 => I2cRequest,
            43 => SpiBegin,
            44 => SpiTransfer,
            45 => SpiEnd,
            46 => GetTime,
            47 => Print,
            48 => DebugPrint,
            _ => return None,
        })
    }
}

/// One syscall argument. The dispatcher reconstructs the typed shape
/// each kind expects; a mismatch is `InvalidParam`.
pub enum Arg<'a> {
    None,
    Int(i64),
    Str(&'a str),
    /// Input buffer
    In(&'a [u8]),
    /// Output buffer
    Out(&'a mut [u8]),
    /// Output integer (e.g. the sender id from a receive)
    OutInt(&'a mut i64),
    /// Output directory entry
    OutDir(&'a mut DirEntry),
    /// A task entry point, for task creation
    Entry(TaskEntry),
}

impl<'a> Arg<'a> {
    fn int(self) -> KernelResult<i64> {
        match self {
            Arg::Int(v) => Ok(v),
            _ => Err(KernelError::InvalidParam),
        }
    }

    fn int_or(self, default: i64) -> KernelResult<i64> {
        match self {
            Arg::Int(v) => Ok(v),
            Arg::None => Ok(default),
            _ => Err(KernelError::InvalidParam),
        }
    }

    fn index(self) -> KernelResult<usize> {
        usize::try_from(self.int()?).map_err(|_| KernelError::InvalidParam)
    }

    fn byte(self) -> KernelResult<u8> {
        u8::try_from(self.int()?).map_err(|_| KernelError::InvalidParam)
    }

    fn str(self) -> KernelResult<&'a str> {
        match self {
            Arg::Str(s) => Ok(s),
            _ => Err(KernelError::InvalidParam),
        }
    }

    fn str_opt(self) -> KernelResult<Option<&'a str>> {
        match self {
            Arg::Str(s) => Ok(Some(s)),
            Arg::None => Ok(None),
            _ => Err(KernelError::InvalidParam),
        }
    }

    fn bytes(self) -> KernelResult<&'a [u8]> {
        match self {
            Arg::In(b) => Ok(b),
            _ => Err(KernelError::InvalidParam),
        }
    }

    fn bytes_or_empty(self) -> KernelResult<&'a [u8]> {
        match self {
            Arg::In(b) => Ok(b),
            Arg::None => Ok(&[]),
            _ => Err(KernelError::InvalidParam),
        }
    }

    fn bytes_mut(self) -> KernelResult<&'a mut [u8]> {
        match self {
            Arg::Out(b) => Ok(b),
            _ => Err(KernelError::InvalidParam),
        }
    }
}

/// The whole system: every kernel table plus the platform seams.
pub struct Kernel {
    cfg: KernelConfig,
    clock: Box<dyn Clock>,
    diag: Box<dyn DiagSink>,
    tasks: TaskTable,
    heap: Heap,
    mailboxes: Vec<Mailbox>,
    sems: SemTable,
    files: FileTable,
    dirs: DirTable,
    storage: Option<Box<dyn StorageFs>>,
    storage_ready: bool,
    gpio: Box<dyn GpioPort>,
    i2c: Box<dyn I2cBus>,
    spi: Box<dyn SpiBus>,
    watchdog_enabled: bool,
    watchdog_last_check: u64,
    initialized: bool,
    boot_time: u64,
}

impl Kernel {
    pub fn new(cfg: KernelConfig) -> Self {
        let heap = Heap::new(cfg.heap_size);
        Self {
            clock: Box::new(SystemClock::new()),
            diag: Box::new(StderrSink),
            tasks: TaskTable::new(),
            heap,
            mailboxes: (0..MAX_TASKS).map(|_| Mailbox::new()).collect(),
            sems: SemTable::new(),
            files: FileTable::new(),
            dirs: DirTable::new(),
            storage: None,
            storage_ready: false,
            gpio: Box::new(SimGpio::new()),
            i2c: Box::new(SimI2c::new()),
            spi: Box::new(SimSpi::new()),
            watchdog_enabled: cfg.watchdog_enabled,
            watchdog_last_check: 0,
            initialized: false,
            boot_time: 0,
            cfg,
        }
    }

    // ========== PLATFORM WIRING ==========

    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    pub fn set_diag(&mut self, diag: Box<dyn DiagSink>) {
        self.diag = diag;
    }

    /// Attach the storage medium. Mounted during `init`.
    pub fn attach_storage(&mut self, storage: Box<dyn StorageFs>) {
        self.storage = Some(storage);
    }

    pub fn set_gpio(&mut self, gpio: Box<dyn GpioPort>) {
        self.gpio = gpio;
    }

    pub fn set_i2c(&mut self, i2c: Box<dyn I2cBus>) {
        self.i2c = i2c;
    }

    pub fn set_spi(&mut self, spi: Box<dyn SpiBus>) {
        self.spi = spi;
    }

    // ========== BOOT ==========

    /// Boot the kernel: clear every table, mount storage, install the
    /// idle task, record the boot time. Calling it again is a no-op.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }

        self.diag
            .line(concat!("[kernel] coopkern ", env!("CARGO_PKG_VERSION")));
        self.diag.line("[kernel] initializing");

        self.tasks.reset();
        self.files.reset();
        self.dirs.reset();
        for mb in &mut self.mailboxes {
            *mb = Mailbox::new();
        }
        self.sems.reset();
        self.heap = Heap::new(self.cfg.heap_size);

        match self.storage.as_mut() {
            Some(fs) => match fs.mount() {
                Ok(()) => {
                    self.storage_ready = true;
                    self.diag.line("[kernel] mounting storage... ok");
                }
                Err(e) => {
                    self.diag
                        .line(&format!("[kernel] mounting storage... failed: {e}"));
                    self.diag.line("[kernel] warning: storage unavailable");
                }
            },
            None => self.diag.line("[kernel] no storage medium attached"),
        }

        let now = self.clock.now_ms();
        self.tasks.install_idle(now);
        self.boot_time = now;
        self.watchdog_last_check = now;
        self.initialized = true;
        self.diag.line("[kernel] initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Unrecoverable failure: dump the current task, its stack
    /// snapshot, the task table and the heap report, then halt. On a
    /// board the halt loop also blinks the status LED; on the host it
    /// is a Rust panic.
    pub fn panic(&mut self, message: &str) -> ! {
        self.diag.line("!!! KERNEL PANIC !!!");
        self.diag.line(message);

        let id = self.tasks.current_id();
        let current = self.tasks.current();
        let name = current.name.clone();
        let trace = current.stack_trace.clone();
        self.diag.line(&format!("current task: '{name}' (id {id})"));
        if trace.is_empty() {
            self.diag.line("no stack snapshot available");
        } else {
            self.diag.line("stack snapshot:");
            for (i, frame) in trace.iter().enumerate() {
                self.diag
                    .line(&format!("  [{i}] {} @ {:#x}", frame.function, frame.addr));
            }
        }

        self.print_task_list();
        self.print_memory_info();
        self.diag.line("system halted");
        panic!("kernel panic: {message}");
    }

    // ========== TIME ==========

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Milliseconds since boot.
    pub fn uptime(&self) -> u64 {
        self.now().saturating_sub(self.boot_time)
    }

    // ========== SCHEDULING ==========

    /// Advance the system by one quantum: run the watchdog, wake due
    /// sleepers, select the highest-priority ready task (idle when
    /// nothing else is), and invoke its entry point exactly once.
    pub fn schedule(&mut self) {
        if !self.initialized {
            return;
        }
        let now = self.now();
        self.check_watchdog(now);
        self.tasks.wake_sleepers(now);
        self.tasks.demote_running();

        let next = self.tasks.pick_ready();
        self.tasks.mark_running(next, now);

        let Some(mut entry) = self.tasks.slot_mut(next).entry.take() else {
            return;
        };
        entry(self);

        // A task that killed itself is reclaimed here, at the quantum
        // boundary; anyone else gets their entry point back.
        match self.tasks.slot_mut(next).state {
            TaskState::Zombie => self.tasks.release(next),
            TaskState::Empty => {}
            _ => self.tasks.slot_mut(next).entry = Some(entry),
        }
    }

    /// Give up the rest of the quantum: back to ready, yield stamp
    /// refreshed.
    pub fn task_yield(&mut self) {
        let now = self.now();
        let task = self.tasks.current_mut();
        if matches!(task.state, TaskState::Running | TaskState::Ready) {
            task.state = TaskState::Ready;
            task.last_yield = now;
        }
    }

    /// Sleep for at least `ms`. The scheduler will not select this task
    /// before the deadline; it never wakes early.
    pub fn sleep(&mut self, ms: u64) {
        let now = self.now();
        let task = self.tasks.current_mut();
        if matches!(task.state, TaskState::Running | TaskState::Ready) {
            task.state = TaskState::Sleeping;
            task.sleep_until = now + ms;
            task.last_yield = now;
        }
    }

    /// Create a task with default priority and capabilities.
    pub fn create_task(&mut self, name: &str, entry: TaskEntry) -> KernelResult<TaskId> {
        self.create_task_with(name, entry, TaskOptions::default())
    }

    /// Create a task with explicit priority and capability grants.
    pub fn create_task_with(
        &mut self,
        name: &str,
        entry: TaskEntry,
        options: TaskOptions,
    ) -> KernelResult<TaskId> {
        let id = self.tasks.alloc().ok_or(KernelError::NoMemory)?;
        let now = self.now();
        let addr = &*entry as *const dyn FnMut(&mut Kernel) as *const () as usize;

        let slot = self.tasks.slot_mut(id);
        slot.name = name.to_string();
        slot.state = TaskState::Ready;
        slot.entry = Some(entry);
        slot.priority = options.priority;
        slot.caps = options.caps;
        slot.last_run = 0;
        slot.last_yield = now;
        slot.sleep_until = 0;
        slot.memory_used = 0;
        slot.file_handles = [false; MAX_FILE_HANDLES];
        slot.dir_handles = [false; MAX_DIR_HANDLES];
        slot.capture_stack(addr);

        self.diag.line(&format!("[task] created '{name}' (id {id})"));
        Ok(TaskId(id))
    }

    /// Kill a task: its open file and directory handles are released
    /// immediately; heap blocks it owns stay where they are. Killing
    /// the running task takes effect when its entry returns. The idle
    /// task cannot be killed.
    pub fn kill_task(&mut self, id: TaskId) -> KernelResult<()> {
        if id.0 == 0 {
            return Err(KernelError::Permission);
        }
        let name = match self.tasks.get(id.0) {
            Some(t) => t.name.clone(),
            None => return Err(KernelError::NotFound),
        };

        for handle in self.files.owned_by(id) {
            if let Some(fs_handle) = self.files.release(handle) {
                if let Some(fs) = self.storage.as_mut() {
                    let _ = fs.close(fs_handle);
                }
            }
        }
        for handle in self.dirs.owned_by(id) {
            self.dirs.release(handle);
        }

        if id.0 == self.tasks.current_id() {
            self.tasks.slot_mut(id.0).state = TaskState::Zombie;
        } else {
            self.tasks.release(id.0);
        }
        self.diag
            .line(&format!("[task] killed '{name}' (id {})", id.0));
        Ok(())
    }

    pub fn current_task_id(&self) -> TaskId {
        TaskId(self.tasks.current_id())
    }

    /// Force the scheduler's current-task cursor. Setup and test
    /// plumbing; task code has no business calling it.
    pub fn set_current_task(&mut self, id: TaskId) -> KernelResult<()> {
        self.tasks.get(id.0).ok_or(KernelError::NotFound)?;
        let now = self.now();
        self.tasks.mark_running(id.0, now);
        Ok(())
    }

    /// Replace a task's capability grants.
    pub fn set_task_caps(&mut self, id: TaskId, caps: Caps) -> KernelResult<()> {
        let task = self.tasks.get_mut(id.0).ok_or(KernelError::NotFound)?;
        task.caps = caps;
        Ok(())
    }

    /// Read-only view of the task table.
    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    /// Dump the task table to the diagnostic sink.
    pub fn print_task_list(&mut self) {
        let now = self.now();
        let mut lines = vec![
            "=== tasks ===".to_string(),
            " id name             state     prio      mem  since-yield".to_string(),
        ];
        for id in self.tasks.live_ids() {
            if let Some(t) = self.tasks.get(id) {
                lines.push(format!(
                    "{:>3} {:<16} {:<9} {:>4} {:>7}B {:>10}ms",
                    id,
                    t.name,
                    t.state.to_string(),
                    t.priority,
                    t.memory_used,
                    now.saturating_sub(t.last_yield),
                ));
            }
        }
        for line in lines {
            self.diag.line(&line);
        }
    }

    // ========== WATCHDOG ==========

    pub fn enable_watchdog(&mut self, enable: bool) {
        self.watchdog_enabled = enable;
        self.diag.line(if enable {
            "[watchdog] enabled"
        } else {
            "[watchdog] disabled"
        });
    }

    /// Refresh the current task's yield stamp without giving up the
    /// quantum.
    pub fn feed_watchdog(&mut self) {
        let now = self.now();
        let task = self.tasks.current_mut();
        if task.state != TaskState::Empty {
            task.last_yield = now;
        }
    }

    /// Runs at most once per second. Never kills: a stale task is
    /// forced back to ready so the scheduler can pick someone else.
    fn check_watchdog(&mut self, now: u64) {
        if !self.watchdog_enabled {
            return;
        }
        if now.saturating_sub(self.watchdog_last_check) < 1000 {
            return;
        }
        self.watchdog_last_check = now;

        let forced = self.tasks.watchdog_scan(now, self.cfg.watchdog_timeout_ms);
        for (id, stale) in forced {
            let name = self
                .tasks
                .get(id)
                .map(|t| t.name.clone())
                .unwrap_or_default();
            self.diag.line(&format!(
                "[watchdog] task '{name}' (id {id}) has not yielded in {stale}ms, forcing reschedule"
            ));
        }
    }

    // ========== MEMORY ==========

    /// Allocate heap memory charged to the current task, compacting
    /// once if the first attempt does not fit. Returns the payload
    /// offset; read and write it through [`Kernel::mem_read`] and
    /// [`Kernel::mem_write`]. The offset goes stale if a later
    /// compaction moves the block; prefer [`Kernel::mem_alloc_handle`]
    /// for anything held across other allocations.
    pub fn mem_alloc(&mut self, size: usize) -> KernelResult<usize> {
        let owner = self.tasks.current_id();
        match self.heap.alloc(size, owner as i32) {
            Ok(payload) => {
                self.charge(owner, size);
                Ok(payload)
            }
            Err(HeapError::OutOfSpace) => {
                self.diag.line("[memory] out of space, compacting");
                self.compact_heap();
                match self.heap.alloc(size, owner as i32) {
                    Ok(payload) => {
                        self.charge(owner, size);
                        Ok(payload)
                    }
                    Err(HeapError::OutOfSpace) => {
                        self.diag.line("[memory] out of memory after compaction");
                        Err(KernelError::NoMemory)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Allocate behind a stable handle that survives compaction.
    pub fn mem_alloc_handle(&mut self, size: usize) -> KernelResult<u32> {
        let payload = self.mem_alloc(size)?;
        Ok(self.heap.register_handle(payload)?)
    }

    /// Current payload offset for a handle, revalidated after every
    /// compaction.
    pub fn mem_deref(&self, handle: u32) -> KernelResult<usize> {
        self.heap.deref(handle).ok_or(KernelError::NotFound)
    }

    /// Release a block. Freeing something that is not a live block is
    /// logged and otherwise ignored.
    pub fn mem_free(&mut self, payload: usize) -> KernelResult<()> {
        match self.heap.free(payload) {
            Ok((size, owner)) => {
                if owner >= 0 {
                    if let Some(task) = self.tasks.get_mut(owner as usize) {
                        task.memory_used = task.memory_used.saturating_sub(size);
                    }
                }
                Ok(())
            }
            Err(_) => {
                self.diag.line("[memory] warning: invalid free ignored");
                Ok(())
            }
        }
    }

    pub fn mem_read(&self, payload: usize, buf: &mut [u8]) -> KernelResult<usize> {
        Ok(self.heap.read(payload, buf)?)
    }

    pub fn mem_write(&mut self, payload: usize, buf: &[u8]) -> KernelResult<usize> {
        Ok(self.heap.write(payload, buf)?)
    }

    /// Bytes past the watermark. Freed-but-not-compacted space does not
    /// count.
    pub fn mem_available(&self) -> usize {
        self.heap.available()
    }

    pub fn mem_info(&self) -> MemoryInfo {
        self.heap.info()
    }

    /// Run a compaction sweep now.
    pub fn mem_compact(&mut self) {
        self.compact_heap();
    }

    /// Read-only view of the heap.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn charge(&mut self, owner: usize, size: usize) {
        if let Some(task) = self.tasks.get_mut(owner) {
            task.memory_used += align4(size);
        }
    }

    fn compact_heap(&mut self) {
        self.diag
            .line("[memory] compacting heap (held payload addresses may move)");
        let stats = match self.heap.compact() {
            Ok(stats) => stats,
            Err(_) => self.panic("Heap corruption detected during compaction"),
        };
        self.diag.line(&format!(
            "[memory] compaction complete: freed {} bytes, moved {} blocks",
            stats.freed_bytes, stats.moved_blocks
        ));
        if stats.moved_blocks > 0 {
            self.diag.line(&format!(
                "[memory] warning: {} blocks moved; release and reallocate any held addresses",
                stats.moved_blocks
            ));
        }
    }

    /// Dump heap statistics to the diagnostic sink.
    pub fn print_memory_info(&mut self) {
        let info = self.heap.info();
        self.diag.line("=== memory ===");
        self.diag
            .line(&format!("capacity:  {} bytes", info.capacity));
        self.diag.line(&format!("used:      {} bytes", info.used));
        self.diag
            .line(&format!("available: {} bytes", info.available));
        self.diag.line(&format!("live blocks: {}", info.live_blocks));
        self.diag.line(&format!("dead blocks: {}", info.dead_blocks));
        if info.dead_blocks > 0 {
            self.diag
                .line("fragmentation present, compaction will reclaim");
        }
    }

    // ========== IPC: MAILBOXES ==========

    /// Queue a message for task `to`. Fails cleanly when the
    /// destination ring is full.
    pub fn ipc_send(&mut self, to: TaskId, payload: &[u8]) -> KernelResult<()> {
        if to.0 >= MAX_TASKS {
            return Err(KernelError::InvalidParam);
        }
        if self.tasks.get(to.0).is_none() {
            return Err(KernelError::NotFound);
        }
        let from = TaskId(self.tasks.current_id());
        let now = self.now();
        self.mailboxes[to.0].push(from, to, payload, now)?;
        Ok(())
    }

    /// Take the oldest message from the current task's mailbox.
    /// Strictly non-blocking: an empty mailbox is `WouldBlock`. A
    /// message bigger than `buf` is `InvalidParam` and stays queued.
    pub fn ipc_receive(&mut self, buf: &mut [u8]) -> KernelResult<(usize, TaskId)> {
        let me = self.tasks.current_id();
        Ok(self.mailboxes[me].pop_into(buf)?)
    }

    /// Messages waiting for the current task.
    pub fn ipc_poll(&self) -> usize {
        self.mailboxes[self.tasks.current_id()].len()
    }

    /// Read-only view of a task's mailbox.
    pub fn mailbox(&self, id: TaskId) -> Option<&Mailbox> {
        self.mailboxes.get(id.0)
    }

    // ========== IPC: SEMAPHORES ==========

    /// Create a counting semaphore owned by the current task.
    pub fn sem_create(
        &mut self,
        initial: i32,
        max: i32,
        name: Option<&str>,
    ) -> KernelResult<usize> {
        let owner = TaskId(self.tasks.current_id());
        Ok(self.sems.create(initial, max, name, owner)?)
    }

    /// Wait for a unit, spin-yielding until one is available or the
    /// wall-clock deadline passes. `timeout_ms == 0` waits forever. The
    /// id is rechecked every turn so a concurrent destroy surfaces as
    /// `NotFound` instead of a stale read.
    pub fn sem_wait(&mut self, id: usize, timeout_ms: u64) -> KernelResult<()> {
        self.sems.get(id)?;
        let start = self.now();
        loop {
            if self.sems.try_take(id)? {
                return Ok(());
            }
            if timeout_ms > 0 && self.now().saturating_sub(start) >= timeout_ms {
                return Err(KernelError::Timeout);
            }
            self.task_yield();
        }
    }

    /// Release a unit. Posting past the maximum is refused.
    pub fn sem_post(&mut self, id: usize) -> KernelResult<()> {
        Ok(self.sems.post(id)?)
    }

    /// Destroy a semaphore. Owner or idle task only.
    pub fn sem_destroy(&mut self, id: usize) -> KernelResult<()> {
        let caller = TaskId(self.tasks.current_id());
        Ok(self.sems.destroy(id, caller)?)
    }

    /// Read-only view of the semaphore table.
    pub fn sems(&self) -> &SemTable {
        &self.sems
    }

    // ========== FILES ==========

    pub fn file_open(&mut self, path: &str, write: bool) -> KernelResult<usize> {
        if !self.storage_ready {
            return Err(KernelError::Io);
        }
        self.require(Caps::SD)?;
        let handle = self.files.alloc().ok_or(KernelError::NoMemory)?;
        let owner = TaskId(self.tasks.current_id());

        let fs = self.storage.as_mut().ok_or(KernelError::Io)?;
        let fs_handle = fs.open(path, write).map_err(|_| KernelError::NotFound)?;

        self.files.install(handle, fs_handle, owner, write);
        self.tasks.current_mut().file_handles[handle] = true;
        Ok(handle)
    }

    pub fn file_close(&mut self, handle: usize) -> KernelResult<()> {
        let me = TaskId(self.tasks.current_id());
        let slot = self.files.get(handle).ok_or(KernelError::InvalidParam)?;
        if slot.owner != me {
            return Err(KernelError::Permission);
        }

        if let Some(fs_handle) = self.files.release(handle) {
            if let Some(fs) = self.storage.as_mut() {
                let _ = fs.close(fs_handle);
            }
        }
        self.tasks.current_mut().file_handles[handle] = false;
        Ok(())
    }

    pub fn file_read(&mut self, handle: usize, buf: &mut [u8]) -> KernelResult<usize> {
        let me = TaskId(self.tasks.current_id());
        let slot = self.files.get(handle).ok_or(KernelError::InvalidParam)?;
        if slot.owner != me {
            return Err(KernelError::Permission);
        }
        let fs_handle = slot.fs_handle;
        let fs = self.storage.as_mut().ok_or(KernelError::Io)?;
        Ok(fs.read(fs_handle, buf)?)
    }

    pub fn file_write(&mut self, handle: usize, buf: &[u8]) -> KernelResult<usize> {
        let me = TaskId(self.tasks.current_id());
        let slot = self.files.get(handle).ok_or(KernelError::InvalidParam)?;
        if slot.owner != me || !slot.can_write {
            return Err(KernelError::Permission);
        }
        let fs_handle = slot.fs_handle;
        let fs = self.storage.as_mut().ok_or(KernelError::Io)?;
        Ok(fs.write(fs_handle, buf)?)
    }

    pub fn file_size(&mut self, handle: usize) -> KernelResult<u64> {
        let me = TaskId(self.tasks.current_id());
        let slot = self.files.get(handle).ok_or(KernelError::InvalidParam)?;
        if slot.owner != me {
            return Err(KernelError::Permission);
        }
        let fs_handle = slot.fs_handle;
        let fs = self.storage.as_ref().ok_or(KernelError::Io)?;
        Ok(fs.size(fs_handle)?)
    }

    pub fn file_delete(&mut self, path: &str) -> KernelResult<()> {
        if !self.storage_ready {
            return Err(KernelError::Io);
        }
        self.require(Caps::SD)?;
        let fs = self.storage.as_mut().ok_or(KernelError::Io)?;
        Ok(fs.remove_file(path)?)
    }

    pub fn file_exists(&mut self, path: &str) -> KernelResult<bool> {
        if !self.storage_ready {
            return Err(KernelError::Io);
        }
        self.require(Caps::SD)?;
        let fs = self.storage.as_ref().ok_or(KernelError::Io)?;
        Ok(fs.exists(path))
    }

    // ========== DIRECTORIES ==========

    pub fn dir_open(&mut self, path: &str) -> KernelResult<usize> {
        if !self.storage_ready {
            return Err(KernelError::Io);
        }
        self.require(Caps::SD)?;
        let handle = self.dirs.alloc().ok_or(KernelError::NoMemory)?;
        let owner = TaskId(self.tasks.current_id());

        let fs = self.storage.as_ref().ok_or(KernelError::Io)?;
        let entries = fs.read_dir(path)?;

        self.dirs.install(handle, entries, owner);
        self.tasks.current_mut().dir_handles[handle] = true;
        Ok(handle)
    }

    pub fn dir_close(&mut self, handle: usize) -> KernelResult<()> {
        let me = TaskId(self.tasks.current_id());
        let slot = self.dirs.get(handle).ok_or(KernelError::InvalidParam)?;
        if slot.owner != me {
            return Err(KernelError::Permission);
        }
        self.dirs.release(handle);
        self.tasks.current_mut().dir_handles[handle] = false;
        Ok(())
    }

    /// One listing entry per call; `None` at the end.
    pub fn dir_read(&mut self, handle: usize) -> KernelResult<Option<DirEntry>> {
        let me = TaskId(self.tasks.current_id());
        let slot = self.dirs.get_mut(handle).ok_or(KernelError::InvalidParam)?;
        if slot.owner != me {
            return Err(KernelError::Permission);
        }
        if slot.cursor >= slot.entries.len() {
            return Ok(None);
        }
        let entry = slot.entries[slot.cursor].clone();
        slot.cursor += 1;
        Ok(Some(entry))
    }

    /// Restart iteration from the first entry.
    pub fn dir_rewind(&mut self, handle: usize) -> KernelResult<()> {
        let me = TaskId(self.tasks.current_id());
        let slot = self.dirs.get_mut(handle).ok_or(KernelError::InvalidParam)?;
        if slot.owner != me {
            return Err(KernelError::Permission);
        }
        slot.cursor = 0;
        Ok(())
    }

    pub fn dir_create(&mut self, path: &str) -> KernelResult<()> {
        if !self.storage_ready {
            return Err(KernelError::Io);
        }
        self.require(Caps::SD)?;
        let fs = self.storage.as_mut().ok_or(KernelError::Io)?;
        Ok(fs.create_dir(path)?)
    }

    pub fn dir_remove(&mut self, path: &str) -> KernelResult<()> {
        if !self.storage_ready {
            return Err(KernelError::Io);
        }
        self.require(Caps::SD)?;
        let fs = self.storage.as_mut().ok_or(KernelError::Io)?;
        Ok(fs.remove_dir(path)?)
    }

    /// Read-only view of the file-handle table.
    pub fn files(&self) -> &FileTable {
        &self.files
    }

    /// Read-only view of the directory-handle table.
    pub fn dirs(&self) -> &DirTable {
        &self.dirs
    }

    // ========== GPIO ==========

    pub fn gpio_set_mode(&mut self, pin: u8, mode: PinMode) -> KernelResult<()> {
        self.require(Caps::GPIO)?;
        self.gpio.set_mode(pin, mode);
        Ok(())
    }

    pub fn gpio_write(&mut self, pin: u8, high: bool) -> KernelResult<()> {
        self.require(Caps::GPIO)?;
        self.gpio.write(pin, high);
        Ok(())
    }

    pub fn gpio_read(&mut self, pin: u8) -> KernelResult<bool> {
        self.require(Caps::GPIO)?;
        Ok(self.gpio.read(pin))
    }

    pub fn gpio_analog_read(&mut self, pin: u8) -> KernelResult<u16> {
        self.require(Caps::GPIO)?;
        Ok(self.gpio.analog_read(pin))
    }

    pub fn gpio_analog_write(&mut self, pin: u8, value: u8) -> KernelResult<()> {
        self.require(Caps::GPIO)?;
        self.gpio.analog_write(pin, value);
        Ok(())
    }

    // ========== I2C ==========

    pub fn i2c_begin(&mut self, address: u8) -> KernelResult<()> {
        self.require(Caps::I2C)?;
        self.i2c.begin(address);
        Ok(())
    }

    pub fn i2c_write(&mut self, address: u8, data: &[u8]) -> KernelResult<usize> {
        self.require(Caps::I2C)?;
        if data.is_empty() {
            return Err(KernelError::InvalidParam);
        }
        Ok(self.i2c.write(address, data)?)
    }

    pub fn i2c_read(&mut self, address: u8, buf: &mut [u8]) -> KernelResult<usize> {
        self.require(Caps::I2C)?;
        if buf.is_empty() {
            return Err(KernelError::InvalidParam);
        }
        Ok(self.i2c.read(address, buf)?)
    }

    pub fn i2c_request(&mut self, address: u8, quantity: usize) -> KernelResult<usize> {
        self.require(Caps::I2C)?;
        Ok(self.i2c.request(address, quantity)?)
    }

    // ========== SPI ==========

    pub fn spi_begin(&mut self) -> KernelResult<()> {
        self.require(Caps::SPI)?;
        self.spi.begin();
        Ok(())
    }

    /// Full-duplex transfer. Either side may be absent: send-only
    /// shifts `tx` out, receive-only shifts zeros and fills `rx`.
    pub fn spi_transfer(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
    ) -> KernelResult<usize> {
        self.require(Caps::SPI)?;
        match (tx, rx) {
            (Some(tx), Some(rx)) => {
                let n = tx.len().min(rx.len());
                if n == 0 {
                    return Err(KernelError::InvalidParam);
                }
                for i in 0..n {
                    rx[i] = self.spi.transfer_byte(tx[i]);
                }
                Ok(n)
            }
            (Some(tx), None) => {
                if tx.is_empty() {
                    return Err(KernelError::InvalidParam);
                }
                for &b in tx {
                    self.spi.transfer_byte(b);
                }
                Ok(tx.len())
            }
            (None, Some(rx)) => {
                if rx.is_empty() {
                    return Err(KernelError::InvalidParam);
                }
                for b in rx.iter_mut() {
                    *b = self.spi.transfer_byte(0);
                }
                Ok(rx.len())
            }
            (None, None) => Err(KernelError::InvalidParam),
        }
    }

    pub fn spi_end(&mut self) -> KernelResult<()> {
        self.require(Caps::SPI)?;
        self.spi.end();
        Ok(())
    }

    // ========== SYSTEM ==========

    /// Print a line prefixed with the current task's name.
    pub fn print(&mut self, message: &str) {
        let name = self.tasks.current().name.clone();
        self.diag.line(&format!("[{name}] {message}"));
    }

    pub fn debug_print(&mut self, message: &str) {
        self.diag.line(&format!("[debug] {message}"));
    }

    fn require(&self, cap: Caps) -> KernelResult<()> {
        if self.tasks.current().caps.contains(cap) {
            Ok(())
        } else {
            Err(KernelError::Permission)
        }
    }

    // ========== DISPATCHER ==========

    /// The numbered system-call entry point. Unknown kinds report
    /// `InvalidCall`; arguments of the wrong shape report
    /// `InvalidParam`. Non-negative results are successes.
    pub fn syscall(&mut self, kind: u32, a1: Arg<'_>, a2: Arg<'_>, a3: Arg<'_>, a4: Arg<'_>) -> i64 {
        match SyscallKind::from_raw(kind) {
            Some(kind) => match self.dispatch(kind, a1, a2, a3, a4) {
                Ok(value) => value,
                Err(e) => e.code(),
            },
            None => KernelError::InvalidCall.code(),
        }
    }

    fn dispatch(
        &mut self,
        kind: SyscallKind,
        a1: Arg<'_>,
        a2: Arg<'_>,
        a3: Arg<'_>,
        _a4: Arg<'_>,
    ) -> KernelResult<i64> {
        use SyscallKind::*;
        Ok(match kind {
            // File operations
            FileOpen => self.file_open(a1.str()?, a2.int_or(0)? != 0)? as i64,
            FileClose => {
                self.file_close(a1.index()?)?;
                SYS_OK
            }
            FileRead => self.file_read(a1.index()?, a2.bytes_mut()?)? as i64,
            FileWrite => self.file_write(a1.index()?, a2.bytes()?)? as i64,
            FileDelete => {
                self.file_delete(a1.str()?)?;
                SYS_OK
            }
            FileExists => self.file_exists(a1.str()?)? as i64,
            FileSize => self.file_size(a1.index()?)? as i64,

            // Directory operations
            DirOpen => self.dir_open(a1.str()?)? as i64,
            DirRead => {
                let handle = a1.index()?;
                match a2 {
                    Arg::OutDir(dst) => match self.dir_read(handle)? {
                        Some(entry) => {
                            *dst = entry;
                            1
                        }
                        None => 0,
                    },
                    _ => return Err(KernelError::InvalidParam),
                }
            }
            DirClose => {
                self.dir_close(a1.index()?)?;
                SYS_OK
            }
            DirCreate => {
                self.dir_create(a1.str()?)?;
                SYS_OK
            }
            DirRemove => {
                self.dir_remove(a1.str()?)?;
                SYS_OK
            }
            DirRewind => {
                self.dir_rewind(a1.index()?)?;
                SYS_OK
            }

            // Memory operations
            MemAlloc => self.mem_alloc(a1.index()?)? as i64,
            MemFree => {
                self.mem_free(a1.index()?)?;
                SYS_OK
            }
            MemInfo => self.mem_available() as i64,
            MemCompact => {
                self.mem_compact();
                SYS_OK
            }

            // Display operations are reserved, not implemented
            DisplayClear | DisplayPixel | DisplayText | DisplayRect | DisplayUpdate => {
                return Err(KernelError::InvalidCall);
            }

            // Task operations
            TaskCreate => {
                self.require(Caps::TASK_CREATE)?;
                let name = a1.str()?;
                match a2 {
                    Arg::Entry(entry) => self.create_task(name, entry)?.0 as i64,
                    _ => return Err(KernelError::InvalidParam),
                }
            }
            TaskKill => {
                self.require(Caps::TASK_CREATE)?;
                self.kill_task(TaskId(a1.index()?))?;
                SYS_OK
            }
            TaskYield => {
                self.task_yield();
                SYS_OK
            }
            TaskSleep => {
                self.sleep(a1.int_or(0)?.max(0) as u64);
                SYS_OK
            }
            TaskList => {
                self.print_task_list();
                SYS_OK
            }

            // IPC operations
            IpcSend => {
                self.ipc_send(TaskId(a1.index()?), a2.bytes_or_empty()?)?;
                SYS_OK
            }
            IpcReceive => {
                let buf = a1.bytes_mut()?;
                let (len, from) = self.ipc_receive(buf)?;
                match a2 {
                    Arg::OutInt(dst) => *dst = from.0 as i64,
                    Arg::None => {}
                    _ => return Err(KernelError::InvalidParam),
                }
                len as i64
            }
            IpcPoll => self.ipc_poll() as i64,

            // Semaphore operations
            SemCreate => {
                let initial = a1.int()? as i32;
                let max = a2.int_or(1)? as i32;
                self.sem_create(initial, max, a3.str_opt()?)? as i64
            }
            SemWait => {
                self.sem_wait(a1.index()?, a2.int_or(0)?.max(0) as u64)?;
                SYS_OK
            }
            SemPost => {
                self.sem_post(a1.index()?)?;
                SYS_OK
            }
            SemDestroy => {
                self.sem_destroy(a1.index()?)?;
                SYS_OK
            }

            // GPIO operations
            GpioPinMode => {
                let mode = PinMode::from_raw(a2.int()?).ok_or(KernelError::InvalidParam)?;
                self.gpio_set_mode(a1.byte()?, mode)?;
                SYS_OK
            }
            GpioWrite => {
                self.gpio_write(a1.byte()?, a2.int()? != 0)?;
                SYS_OK
            }
            GpioRead => self.gpio_read(a1.byte()?)? as i64,
            GpioAnalogRead => self.gpio_analog_read(a1.byte()?)? as i64,
            GpioAnalogWrite => {
                let value = u8::try_from(a2.int()?).map_err(|_| KernelError::InvalidParam)?;
                self.gpio_analog_write(a1.byte()?, value)?;
                SYS_OK
            }

            // I2C operations
            I2cBegin => {
                let address = match a1 {
                    Arg::None => 0,
                    other => other.byte()?,
                };
                self.i2c_begin(address)?;
                SYS_OK
            }
            I2cWrite => self.i2c_write(a1.byte()?, a2.bytes()?)? as i64,
            I2cRead => self.i2c_read(a1.byte()?, a2.bytes_mut()?)? as i64,
            I2cRequest => self.i2c_request(a1.byte()?, a2.index()?)? as i64,

            // SPI operations
            SpiBegin => {
                self.spi_begin()?;
                SYS_OK
            }
            SpiTransfer => {
                let tx = match a1 {
                    Arg::In(b) => Some(b),
                    Arg::None => None,
                    _ => return Err(KernelError::InvalidParam),
                };
                let rx = match a2 {
                    Arg::Out(b) => Some(b),
                    Arg::None => None,
                    _ => return Err(KernelError::InvalidParam),
                };
                self.spi_transfer(tx, rx)? as i64
            }
            SpiEnd => {
                self.spi_end()?;
                SYS_OK
            }

            // System operations
            GetTime => self.uptime() as i64,
            Print => {
                self.print(a1.str()?);
                SYS_OK
            }
            DebugPrint => {
                self.debug_print(a1.str()?);
                SYS_OK
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::clock::ManualClock;
    use crate::kernel::diag::BufferSink;
    use crate::kernel::heap::HEADER_SIZE;
    use crate::storage::{NoMedia, RamDisk};
    use std::cell::Cell;
    use std::rc::Rc;

    fn test_kernel() -> (Kernel, ManualClock, BufferSink) {
        let mut kernel = Kernel::new(KernelConfig {
            heap_size: 4096,
            ..KernelConfig::default()
        });
        let clock = ManualClock::new();
        let sink = BufferSink::new();
        kernel.set_clock(Box::new(clock.clone()));
        kernel.set_diag(Box::new(sink.clone()));
        kernel.attach_storage(Box::new(RamDisk::new()));
        kernel.init();
        (kernel, clock, sink)
    }

    fn noop() -> TaskEntry {
        Box::new(|_| {})
    }

    #[test]
    fn test_init_is_idempotent() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let id = kernel.create_task("keeper", noop()).unwrap();

        kernel.init();
        assert!(kernel.tasks().get(id.0).is_some());
    }

    #[test]
    fn test_boot_without_storage_is_not_fatal() {
        let mut kernel = Kernel::new(KernelConfig::default());
        let sink = BufferSink::new();
        kernel.set_diag(Box::new(sink.clone()));
        kernel.attach_storage(Box::new(NoMedia));
        kernel.init();

        assert!(kernel.is_initialized());
        assert!(sink.contains("mounting storage... failed"));
    }

    #[test]
    fn test_idle_task_installed_at_boot() {
        let (kernel, _clock, _sink) = test_kernel();
        let idle = kernel.tasks().get(0).unwrap();
        assert_eq!(idle.name, "idle");
        assert_eq!(idle.priority, 0);
        assert!(idle.caps.is_empty());
    }

    #[test]
    fn test_create_task_fills_table_then_no_memory() {
        let (mut kernel, _clock, _sink) = test_kernel();
        for i in 1..MAX_TASKS {
            let id = kernel.create_task("filler", noop()).unwrap();
            assert_eq!(id.0, i);
        }
        assert_eq!(
            kernel.create_task("overflow", noop()),
            Err(KernelError::NoMemory)
        );
    }

    #[test]
    fn test_kill_idle_rejected() {
        let (mut kernel, _clock, _sink) = test_kernel();
        assert_eq!(kernel.kill_task(TaskId(0)), Err(KernelError::Permission));
    }

    #[test]
    fn test_kill_unknown_rejected() {
        let (mut kernel, _clock, _sink) = test_kernel();
        assert_eq!(kernel.kill_task(TaskId(5)), Err(KernelError::NotFound));
    }

    #[test]
    fn test_scheduler_runs_highest_priority() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let runs = Rc::new(Cell::new(0u32));

        let counter = runs.clone();
        kernel
            .create_task_with(
                "worker",
                Box::new(move |k| {
                    counter.set(counter.get() + 1);
                    k.task_yield();
                }),
                TaskOptions {
                    priority: 20,
                    ..TaskOptions::default()
                },
            )
            .unwrap();

        for _ in 0..5 {
            kernel.schedule();
        }
        assert_eq!(runs.get(), 5);
    }

    #[test]
    fn test_scheduler_starves_lower_priority() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let low_runs = Rc::new(Cell::new(0u32));
        let high_runs = Rc::new(Cell::new(0u32));

        let low = low_runs.clone();
        kernel
            .create_task("low", Box::new(move |k| {
                low.set(low.get() + 1);
                k.task_yield();
            }))
            .unwrap();
        let high = high_runs.clone();
        kernel
            .create_task_with(
                "high",
                Box::new(move |k| {
                    high.set(high.get() + 1);
                    k.task_yield();
                }),
                TaskOptions {
                    priority: 20,
                    ..TaskOptions::default()
                },
            )
            .unwrap();

        for _ in 0..10 {
            kernel.schedule();
        }
        assert_eq!(high_runs.get(), 10);
        assert_eq!(low_runs.get(), 0);
    }

    #[test]
    fn test_sleep_holds_until_deadline() {
        let (mut kernel, clock, _sink) = test_kernel();
        let runs = Rc::new(Cell::new(0u32));

        let counter = runs.clone();
        kernel
            .create_task("napper", Box::new(move |k| {
                counter.set(counter.get() + 1);
                k.sleep(200);
            }))
            .unwrap();

        kernel.schedule();
        assert_eq!(runs.get(), 1);

        // Short of the deadline: only idle runs.
        clock.advance(199);
        kernel.schedule();
        assert_eq!(runs.get(), 1);

        clock.advance(1);
        kernel.schedule();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn test_task_kills_itself_at_yield_boundary() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let id = Rc::new(Cell::new(TaskId(0)));

        let me = id.clone();
        let created = kernel
            .create_task("ephemeral", Box::new(move |k| {
                let _ = k.kill_task(me.get());
            }))
            .unwrap();
        id.set(created);

        kernel.schedule();
        assert!(kernel.tasks().get(created.0).is_none());
    }

    #[test]
    fn test_watchdog_forces_non_yielding_task() {
        let (mut kernel, clock, sink) = test_kernel();
        kernel
            .create_task("hog", Box::new(|_| {}))
            .unwrap();

        // The hog never yields; run past the deadline.
        kernel.schedule();
        clock.advance(6000);
        kernel.schedule();

        assert!(sink.contains("[watchdog] task 'hog'"));
        assert!(sink.contains("forcing reschedule"));
    }

    #[test]
    fn test_watchdog_spares_yielding_task() {
        let (mut kernel, clock, sink) = test_kernel();
        kernel
            .create_task("polite", Box::new(|k| k.task_yield()))
            .unwrap();

        for _ in 0..8 {
            clock.advance(1100);
            kernel.schedule();
        }
        assert!(!sink.contains("[watchdog] task 'polite'"));
    }

    #[test]
    fn test_watchdog_disabled_never_forces() {
        let (mut kernel, clock, sink) = test_kernel();
        kernel.enable_watchdog(false);
        kernel.create_task("hog", Box::new(|_| {})).unwrap();

        kernel.schedule();
        clock.advance(60_000);
        kernel.schedule();
        assert!(!sink.contains("[watchdog] task"));
    }

    #[test]
    fn test_mem_alloc_charges_current_task() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let id = kernel.create_task("t", noop()).unwrap();
        kernel.set_current_task(id).unwrap();

        kernel.mem_alloc(100).unwrap();
        assert_eq!(kernel.tasks().get(id.0).unwrap().memory_used, 100);
    }

    #[test]
    fn test_mem_free_refunds_block_owner() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let id = kernel.create_task("t", noop()).unwrap();
        kernel.set_current_task(id).unwrap();

        let a = kernel.mem_alloc(100).unwrap();
        kernel.set_current_task(TaskId(0)).unwrap();
        kernel.mem_free(a).unwrap();
        assert_eq!(kernel.tasks().get(id.0).unwrap().memory_used, 0);
    }

    #[test]
    fn test_mem_invalid_free_logged_not_fatal() {
        let (mut kernel, _clock, sink) = test_kernel();
        kernel.mem_free(999).unwrap();
        assert!(sink.contains("invalid free"));
    }

    #[test]
    fn test_compaction_reclaims_and_warns() {
        let (mut kernel, _clock, sink) = test_kernel();
        let a = kernel.mem_alloc(100).unwrap();
        let _b = kernel.mem_alloc(100).unwrap();
        kernel.mem_free(a).unwrap();

        let before = kernel.mem_available();
        kernel.mem_compact();
        assert_eq!(kernel.mem_available(), before + 100 + HEADER_SIZE);
        assert!(sink.contains("moved 1 blocks"));
    }

    #[test]
    fn test_alloc_compacts_when_out_of_space() {
        let mut kernel = Kernel::new(KernelConfig {
            heap_size: 256,
            ..KernelConfig::default()
        });
        let sink = BufferSink::new();
        kernel.set_diag(Box::new(sink.clone()));
        kernel.init();

        // Fill, punch a hole, then ask for more than the tail holds.
        let a = kernel.mem_alloc(100).unwrap();
        let _b = kernel.mem_alloc(100).unwrap();
        kernel.mem_free(a).unwrap();

        let c = kernel.mem_alloc(80).unwrap();
        assert!(sink.contains("out of space, compacting"));
        kernel.mem_write(c, b"fits").unwrap();
    }

    #[test]
    fn test_mem_handle_survives_kernel_compaction() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let a = kernel.mem_alloc(64).unwrap();
        let h = kernel.mem_alloc_handle(64).unwrap();
        let before = kernel.mem_deref(h).unwrap();
        kernel.mem_write(before, b"payload").unwrap();

        kernel.mem_free(a).unwrap();
        kernel.mem_compact();

        let after = kernel.mem_deref(h).unwrap();
        assert_ne!(before, after);
        let mut buf = [0u8; 7];
        kernel.mem_read(after, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_ipc_round_trip() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let receiver = kernel.create_task("rx", noop()).unwrap();
        let sender = kernel.create_task("tx", noop()).unwrap();

        kernel.set_current_task(sender).unwrap();
        kernel.ipc_send(receiver, b"ping").unwrap();

        kernel.set_current_task(receiver).unwrap();
        assert_eq!(kernel.ipc_poll(), 1);
        let mut buf = [0u8; 16];
        let (len, from) = kernel.ipc_receive(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, sender);
    }

    #[test]
    fn test_ipc_send_to_dead_slot() {
        let (mut kernel, _clock, _sink) = test_kernel();
        assert_eq!(
            kernel.ipc_send(TaskId(5), b"x"),
            Err(KernelError::NotFound)
        );
        assert_eq!(
            kernel.ipc_send(TaskId(MAX_TASKS), b"x"),
            Err(KernelError::InvalidParam)
        );
    }

    #[test]
    fn test_ipc_receive_empty_would_block() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let mut buf = [0u8; 8];
        assert_eq!(
            kernel.ipc_receive(&mut buf),
            Err(KernelError::WouldBlock)
        );
    }

    #[test]
    fn test_sem_wait_immediate_when_available() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let id = kernel.sem_create(1, 1, None).unwrap();
        kernel.sem_wait(id, 0).unwrap();
        assert_eq!(kernel.sems().get(id).unwrap().value, 0);
    }

    #[test]
    fn test_sem_post_refuses_overflow() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let id = kernel.sem_create(1, 1, Some("gate")).unwrap();
        assert_eq!(kernel.sem_post(id), Err(KernelError::InvalidParam));
    }

    #[test]
    fn test_sem_destroy_owner_rules() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let owner = kernel.create_task("owner", noop()).unwrap();
        let other = kernel.create_task("other", noop()).unwrap();

        kernel.set_current_task(owner).unwrap();
        let id = kernel.sem_create(0, 1, None).unwrap();

        kernel.set_current_task(other).unwrap();
        assert_eq!(kernel.sem_destroy(id), Err(KernelError::Permission));

        // The idle task may always destroy.
        kernel.set_current_task(TaskId(0)).unwrap();
        kernel.sem_destroy(id).unwrap();
    }

    #[test]
    fn test_file_ops_require_sd_capability() {
        let (mut kernel, _clock, _sink) = test_kernel();
        // Idle has no capabilities.
        assert_eq!(
            kernel.file_open("/f", true),
            Err(KernelError::Permission)
        );
    }

    #[test]
    fn test_file_round_trip_and_owner_check() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let writer = kernel.create_task("writer", noop()).unwrap();
        let intruder = kernel.create_task("intruder", noop()).unwrap();

        kernel.set_current_task(writer).unwrap();
        let h = kernel.file_open("/data.txt", true).unwrap();
        assert_eq!(kernel.file_write(h, b"secret").unwrap(), 6);
        assert!(kernel.tasks().get(writer.0).unwrap().file_handles[h]);

        // Another task cannot touch the handle.
        kernel.set_current_task(intruder).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            kernel.file_read(h, &mut buf),
            Err(KernelError::Permission)
        );
        assert_eq!(kernel.file_close(h), Err(KernelError::Permission));

        kernel.set_current_task(writer).unwrap();
        kernel.file_close(h).unwrap();

        let h = kernel.file_open("/data.txt", false).unwrap();
        let n = kernel.file_read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"secret");
        assert_eq!(kernel.file_size(h).unwrap(), 6);
        kernel.file_close(h).unwrap();
    }

    #[test]
    fn test_read_only_handle_rejects_write() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let t = kernel.create_task("t", noop()).unwrap();
        kernel.set_current_task(t).unwrap();

        let h = kernel.file_open("/ro.txt", true).unwrap();
        kernel.file_close(h).unwrap();
        let h = kernel.file_open("/ro.txt", false).unwrap();
        assert_eq!(kernel.file_write(h, b"x"), Err(KernelError::Permission));
    }

    #[test]
    fn test_kill_reclaims_open_handles() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let t = kernel.create_task("leaky", noop()).unwrap();
        kernel.set_current_task(t).unwrap();
        let h = kernel.file_open("/leak.txt", true).unwrap();

        kernel.set_current_task(TaskId(0)).unwrap();
        kernel.kill_task(t).unwrap();

        // The handle slot is free again for the next open.
        let t2 = kernel.create_task("next", noop()).unwrap();
        kernel.set_current_task(t2).unwrap();
        let h2 = kernel.file_open("/fresh.txt", true).unwrap();
        assert_eq!(h2, h);
    }

    #[test]
    fn test_dir_listing_one_entry_per_call() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let t = kernel.create_task("ls", noop()).unwrap();
        kernel.set_current_task(t).unwrap();

        kernel.dir_create("/d").unwrap();
        let f = kernel.file_open("/d/one", true).unwrap();
        kernel.file_close(f).unwrap();
        let f = kernel.file_open("/d/two", true).unwrap();
        kernel.file_close(f).unwrap();

        let dh = kernel.dir_open("/d").unwrap();
        let first = kernel.dir_read(dh).unwrap().unwrap();
        let second = kernel.dir_read(dh).unwrap().unwrap();
        assert_eq!(first.name, "one");
        assert_eq!(second.name, "two");
        assert!(kernel.dir_read(dh).unwrap().is_none());

        kernel.dir_rewind(dh).unwrap();
        assert_eq!(kernel.dir_read(dh).unwrap().unwrap().name, "one");
        kernel.dir_close(dh).unwrap();
    }

    #[test]
    fn test_dir_open_missing_path() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let t = kernel.create_task("t", noop()).unwrap();
        kernel.set_current_task(t).unwrap();
        assert_eq!(kernel.dir_open("/missing"), Err(KernelError::NotFound));
    }

    #[test]
    fn test_gpio_permission_gate() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let gpio = crate::hal::SimGpio::new();
        kernel.set_gpio(Box::new(gpio.clone()));

        let bare = kernel
            .create_task_with("bare", noop(), TaskOptions {
                priority: 10,
                caps: Caps::empty(),
            })
            .unwrap();
        kernel.set_current_task(bare).unwrap();

        assert_eq!(
            kernel.gpio_write(13, true),
            Err(KernelError::Permission)
        );
        assert!(!gpio.level(13));

        kernel.set_task_caps(bare, Caps::GPIO).unwrap();
        kernel.gpio_write(13, true).unwrap();
        assert!(gpio.level(13));
    }

    #[test]
    fn test_i2c_requires_explicit_grant() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let t = kernel.create_task("t", noop()).unwrap();
        kernel.set_current_task(t).unwrap();

        // Default grant omits I2C.
        assert_eq!(kernel.i2c_begin(0), Err(KernelError::Permission));

        kernel
            .set_task_caps(t, Caps::USER_DEFAULT | Caps::I2C)
            .unwrap();
        kernel.i2c_begin(0).unwrap();
    }

    #[test]
    fn test_spi_loopback_via_kernel() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let t = kernel
            .create_task_with("t", noop(), TaskOptions {
                priority: 10,
                caps: Caps::SPI,
            })
            .unwrap();
        kernel.set_current_task(t).unwrap();

        kernel.spi_begin().unwrap();
        let tx = [1u8, 2, 3];
        let mut rx = [0u8; 3];
        let n = kernel.spi_transfer(Some(&tx), Some(&mut rx)).unwrap();
        assert_eq!(n, 3);
        assert_eq!(rx, tx);
        kernel.spi_end().unwrap();
    }

    #[test]
    fn test_syscall_unknown_kind() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let code = kernel.syscall(9999, Arg::None, Arg::None, Arg::None, Arg::None);
        assert_eq!(KernelError::from_code(code), Some(KernelError::InvalidCall));
    }

    #[test]
    fn test_syscall_display_reserved() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let code = kernel.syscall(
            SyscallKind::DisplayClear as u32,
            Arg::None,
            Arg::None,
            Arg::None,
            Arg::None,
        );
        assert_eq!(code, KernelError::InvalidCall.code());
    }

    #[test]
    fn test_syscall_wrong_arg_shape() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let code = kernel.syscall(
            SyscallKind::FileOpen as u32,
            Arg::Int(1),
            Arg::None,
            Arg::None,
            Arg::None,
        );
        assert_eq!(code, KernelError::InvalidParam.code());
    }

    #[test]
    fn test_syscall_file_round_trip() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let t = kernel.create_task("t", noop()).unwrap();
        kernel.set_current_task(t).unwrap();

        let h = kernel.syscall(
            SyscallKind::FileOpen as u32,
            Arg::Str("/via-syscall"),
            Arg::Int(1),
            Arg::None,
            Arg::None,
        );
        assert!(h >= 0);

        let wrote = kernel.syscall(
            SyscallKind::FileWrite as u32,
            Arg::Int(h),
            Arg::In(b"bytes"),
            Arg::None,
            Arg::None,
        );
        assert_eq!(wrote, 5);

        assert_eq!(
            kernel.syscall(
                SyscallKind::FileClose as u32,
                Arg::Int(h),
                Arg::None,
                Arg::None,
                Arg::None,
            ),
            SYS_OK
        );
    }

    #[test]
    fn test_syscall_ipc_reports_sender() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let rx = kernel.create_task("rx", noop()).unwrap();
        let tx = kernel.create_task("tx", noop()).unwrap();

        kernel.set_current_task(tx).unwrap();
        let code = kernel.syscall(
            SyscallKind::IpcSend as u32,
            Arg::Int(rx.0 as i64),
            Arg::In(b"hi"),
            Arg::None,
            Arg::None,
        );
        assert_eq!(code, SYS_OK);

        kernel.set_current_task(rx).unwrap();
        let mut buf = [0u8; 8];
        let mut from = -1i64;
        let len = kernel.syscall(
            SyscallKind::IpcReceive as u32,
            Arg::Out(&mut buf),
            Arg::OutInt(&mut from),
            Arg::None,
            Arg::None,
        );
        assert_eq!(len, 2);
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(from, tx.0 as i64);
    }

    #[test]
    fn test_syscall_task_create_needs_capability() {
        let (mut kernel, _clock, _sink) = test_kernel();
        let t = kernel.create_task("plain", noop()).unwrap();
        kernel.set_current_task(t).unwrap();

        let code = kernel.syscall(
            SyscallKind::TaskCreate as u32,
            Arg::Str("child"),
            Arg::Entry(noop()),
            Arg::None,
            Arg::None,
        );
        assert_eq!(code, KernelError::Permission.code());

        kernel
            .set_task_caps(t, Caps::USER_DEFAULT | Caps::TASK_CREATE)
            .unwrap();
        let code = kernel.syscall(
            SyscallKind::TaskCreate as u32,
            Arg::Str("child"),
            Arg::Entry(noop()),
            Arg::None,
            Arg::None,
        );
        assert!(code > 0);
    }

    #[test]
    fn test_syscall_get_time_tracks_uptime() {
        let (mut kernel, clock, _sink) = test_kernel();
        clock.advance(1234);
        let t = kernel.syscall(
            SyscallKind::GetTime as u32,
            Arg::None,
            Arg::None,
            Arg::None,
            Arg::None,
        );
        assert_eq!(t, 1234);
    }

    #[test]
    fn test_syscall_print_prefixes_task_name() {
        let (mut kernel, _clock, sink) = test_kernel();
        let t = kernel.create_task("talker", noop()).unwrap();
        kernel.set_current_task(t).unwrap();

        kernel.syscall(
            SyscallKind::Print as u32,
            Arg::Str("hello"),
            Arg::None,
            Arg::None,
            Arg::None,
        );
        assert!(sink.contains("[talker] hello"));

        kernel.syscall(
            SyscallKind::DebugPrint as u32,
            Arg::Str("state dump"),
            Arg::None,
            Arg::None,
            Arg::None,
        );
        assert!(sink.contains("[debug] state dump"));
    }

    #[test]
    fn test_panic_dumps_banner_tasks_and_memory() {
        let (mut kernel, _clock, sink) = test_kernel();
        kernel.mem_alloc(32).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            kernel.panic("Heap corruption detected during compaction");
        }));
        assert!(result.is_err());
        assert!(sink.contains("!!! KERNEL PANIC !!!"));
        assert!(sink.contains("Heap corruption detected during compaction"));
        assert!(sink.contains("=== tasks ==="));
        assert!(sink.contains("=== memory ==="));
        assert!(sink.contains("system halted"));
    }
}
