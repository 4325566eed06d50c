//! Counting semaphores
//!
//! A fixed table of counting semaphores with a bounded maximum value.
//! Creation records the calling task as owner; only the owner or the
//! idle task may destroy. The wait loop itself lives in the kernel
//! because it has to yield between polls; this module only holds the
//! table and the value arithmetic.

use super::config::MAX_SEMAPHORES;
use super::task::TaskId;

/// One semaphore slot.
pub struct Semaphore {
    pub value: i32,
    pub max_value: i32,
    pub in_use: bool,
    pub owner: TaskId,
    pub name: Option<String>,
}

impl Semaphore {
    fn vacant() -> Self {
        Self {
            value: 0,
            max_value: 0,
            in_use: false,
            owner: TaskId(0),
            name: None,
        }
    }
}

/// Semaphore failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemError {
    /// Id outside the table
    InvalidId,
    /// Slot exists but holds no semaphore
    NotFound,
    /// Creation arguments out of range
    InvalidValue,
    /// No free slot
    TableFull,
    /// Post would exceed the maximum
    AtMax,
    /// Caller is neither the owner nor the idle task
    NotOwner,
}

impl std::fmt::Display for SemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SemError::InvalidId => write!(f, "semaphore id out of range"),
            SemError::NotFound => write!(f, "no such semaphore"),
            SemError::InvalidValue => write!(f, "semaphore value out of range"),
            SemError::TableFull => write!(f, "semaphore table full"),
            SemError::AtMax => write!(f, "semaphore at maximum"),
            SemError::NotOwner => write!(f, "not the semaphore owner"),
        }
    }
}

/// The fixed semaphore table.
pub struct SemTable {
    slots: Vec<Semaphore>,
}

impl SemTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SEMAPHORES).map(|_| Semaphore::vacant()).collect(),
        }
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = Semaphore::vacant();
        }
    }

    /// Create a semaphore owned by `owner`. Returns its slot id.
    pub fn create(
        &mut self,
        initial: i32,
        max: i32,
        name: Option<&str>,
        owner: TaskId,
    ) -> Result<usize, SemError> {
        if initial < 0 || max < 1 || initial > max {
            return Err(SemError::InvalidValue);
        }
        let id = self
            .slots
            .iter()
            .position(|s| !s.in_use)
            .ok_or(SemError::TableFull)?;

        self.slots[id] = Semaphore {
            value: initial,
            max_value: max,
            in_use: true,
            owner,
            name: name.map(str::to_string),
        };
        Ok(id)
    }

    /// The live semaphore at `id`.
    pub fn get(&self, id: usize) -> Result<&Semaphore, SemError> {
        let slot = self.slots.get(id).ok_or(SemError::InvalidId)?;
        if slot.in_use {
            Ok(slot)
        } else {
            Err(SemError::NotFound)
        }
    }

    pub fn get_mut(&mut self, id: usize) -> Result<&mut Semaphore, SemError> {
        let slot = self.slots.get_mut(id).ok_or(SemError::InvalidId)?;
        if slot.in_use {
            Ok(slot)
        } else {
            Err(SemError::NotFound)
        }
    }

    /// Increment, refusing to pass the maximum.
    pub fn post(&mut self, id: usize) -> Result<(), SemError> {
        let sem = self.get_mut(id)?;
        if sem.value >= sem.max_value {
            return Err(SemError::AtMax);
        }
        sem.value += 1;
        Ok(())
    }

    /// Take one unit if any is available. The kernel loops over this,
    /// yielding in between.
    pub fn try_take(&mut self, id: usize) -> Result<bool, SemError> {
        let sem = self.get_mut(id)?;
        if sem.value > 0 {
            sem.value -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Destroy `id`. Only the owner or the idle task may.
    pub fn destroy(&mut self, id: usize, caller: TaskId) -> Result<(), SemError> {
        let sem = self.get(id)?;
        if sem.owner != caller && caller != TaskId(0) {
            return Err(SemError::NotOwner);
        }
        self.slots[id] = Semaphore::vacant();
        Ok(())
    }
}

impl Default for SemTable {
    fn default() -> Self {
        Self::new()
    }
}
