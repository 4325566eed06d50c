//! File and directory handle tables
//!
//! Fixed kernel-owned arrays. Every entry is tagged with the task that
//! opened it; the owning task mirrors a per-handle bit so a kill can
//! reclaim everything the victim left open. User code only ever sees
//! the table index.

use super::config::{MAX_DIR_HANDLES, MAX_FILE_HANDLES};
use super::task::TaskId;
use crate::storage::DirEntry;

/// An open file: the backing storage handle plus ownership tags.
pub struct FileSlot {
    pub fs_handle: usize,
    pub owner: TaskId,
    pub can_write: bool,
    pub in_use: bool,
}

impl FileSlot {
    fn vacant() -> Self {
        Self {
            fs_handle: 0,
            owner: TaskId(0),
            can_write: false,
            in_use: false,
        }
    }
}

/// The fixed file-handle table.
pub struct FileTable {
    slots: Vec<FileSlot>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_FILE_HANDLES).map(|_| FileSlot::vacant()).collect(),
        }
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = FileSlot::vacant();
        }
    }

    /// Lowest free index.
    pub fn alloc(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.in_use)
    }

    pub fn get(&self, handle: usize) -> Option<&FileSlot> {
        self.slots.get(handle).filter(|s| s.in_use)
    }

    pub fn get_mut(&mut self, handle: usize) -> Option<&mut FileSlot> {
        self.slots.get_mut(handle).filter(|s| s.in_use)
    }

    /// Commit an entry at `handle`.
    pub fn install(&mut self, handle: usize, fs_handle: usize, owner: TaskId, can_write: bool) {
        self.slots[handle] = FileSlot {
            fs_handle,
            owner,
            can_write,
            in_use: true,
        };
    }

    /// Clear `handle`, returning the backing storage handle if the slot
    /// was live.
    pub fn release(&mut self, handle: usize) -> Option<usize> {
        let slot = self.slots.get_mut(handle)?;
        if !slot.in_use {
            return None;
        }
        let fs_handle = slot.fs_handle;
        *slot = FileSlot::vacant();
        Some(fs_handle)
    }

    /// Handles owned by `task`.
    pub fn owned_by(&self, task: TaskId) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].in_use && self.slots[i].owner == task)
            .collect()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// An open directory listing: a snapshot of the entries plus a cursor.
pub struct DirSlot {
    pub entries: Vec<DirEntry>,
    pub cursor: usize,
    pub owner: TaskId,
    pub in_use: bool,
}

impl DirSlot {
    fn vacant() -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            owner: TaskId(0),
            in_use: false,
        }
    }
}

/// The fixed directory-handle table.
pub struct DirTable {
    slots: Vec<DirSlot>,
}

impl DirTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_DIR_HANDLES).map(|_| DirSlot::vacant()).collect(),
        }
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = DirSlot::vacant();
        }
    }

    pub fn alloc(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.in_use)
    }

    pub fn get(&self, handle: usize) -> Option<&DirSlot> {
        self.slots.get(handle).filter(|s| s.in_use)
    }

    pub fn get_mut(&mut self, handle: usize) -> Option<&mut DirSlot> {
        self.slots.get_mut(handle).filter(|s| s.in_use)
    }

    pub fn install(&mut self, handle: usize, entries: Vec<DirEntry>, owner: TaskId) {
        self.slots[handle] = DirSlot {
            entries,
            cursor: 0,
            owner,
            in_use: true,
        };
    }

    pub fn release(&mut self, handle: usize) -> bool {
        match self.slots.get_mut(handle) {
            Some(slot) if slot.in_use => {
                *slot = DirSlot::vacant();
                true
            }
            _ => false,
        }
    }

    pub fn owned_by(&self, task: TaskId) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].in_use && self.slots[i].owner == task)
            .collect()
    }
}

impl Default for DirTable {
    fn default() -> Self {
        Self::new()
    }
}
