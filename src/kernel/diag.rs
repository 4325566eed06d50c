//! Line-oriented diagnostic sink
//!
//! The kernel reports through one serial-style line sink: boot banner,
//! watchdog warnings, memory warnings, task prints, and the panic dump
//! all flow through it. On a board this is the serial port; on the host
//! it is stderr; in tests it is a capture buffer.

use std::cell::RefCell;
use std::rc::Rc;

/// Destination for kernel diagnostic lines.
pub trait DiagSink {
    /// Emit one line, without a trailing newline.
    fn line(&mut self, line: &str);
}

/// Writes each line to stderr.
#[derive(Default)]
pub struct StderrSink;

impl DiagSink for StderrSink {
    fn line(&mut self, line: &str) {
        eprintln!("{line}");
    }
}

/// Captures lines in memory.
///
/// Cloning yields a handle onto the same buffer, so a test can keep one
/// clone and give the other to the kernel.
#[derive(Clone, Default)]
pub struct BufferSink {
    lines: Rc<RefCell<Vec<String>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything captured so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    /// Whether any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.borrow().iter().any(|l| l.contains(needle))
    }

    pub fn clear(&self) {
        self.lines.borrow_mut().clear();
    }
}

impl DiagSink for BufferSink {
    fn line(&mut self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
}
