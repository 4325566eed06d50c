//! coopkern - a cooperative kernel core for microcontroller-class devices
//!
//! Design principles:
//! - Single hardware thread, single address space: tasks are in-process
//!   callables that cooperate through explicit yield points
//! - Everything the kernel owns lives in fixed-size tables; user code
//!   holds integer handles, never references into kernel state
//! - The platform (storage medium, GPIO/I2C/SPI buses, clock, diagnostic
//!   line) sits behind narrow trait seams so the core runs anywhere,
//!   including on the host under `cargo test`
//!
//! The [`kernel::Kernel`] struct is the whole system: construct one,
//! attach the platform pieces, call [`kernel::Kernel::init`], register
//! tasks, then drive [`kernel::Kernel::schedule`] from the host loop.

pub mod hal;
pub mod kernel;
pub mod storage;
