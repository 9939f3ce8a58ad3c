//! Host-side NOR flash simulator.
//!
//! Models the semantics the swap engine depends on: write-granularity
//! alignment, program-clears-bits-only, sector-aligned erase and lock
//! refcounting. Every mutating operation is counted so tests can schedule a
//! "power cut" after the Nth operation; once cut, all further mutations are
//! silently dropped, which freezes the array exactly as a real power loss
//! would.

use core::cell::{Cell, RefCell};

use crate::{FlashError, FlashInterface, MonotonicCounter};

pub struct MockFlash {
    mem: RefCell<Vec<u8>>,
    sector_size: usize,
    unlock_depth: Cell<isize>,
    mutations: Cell<usize>,
    cut_after: Cell<Option<usize>>,
    dead: Cell<bool>,
    /// Writes that attempted a 0→1 transition. Stays zero for a correct
    /// caller; asserted on by the trailer monotonicity tests.
    violations: Cell<usize>,
}

impl MockFlash {
    pub fn new(size: usize, sector_size: usize) -> Self {
        MockFlash {
            mem: RefCell::new(vec![0xFF; size]),
            sector_size,
            unlock_depth: Cell::new(0),
            mutations: Cell::new(0),
            cut_after: Cell::new(None),
            dead: Cell::new(false),
            violations: Cell::new(0),
        }
    }

    /// Raw load that bypasses NOR semantics, for test fixture setup only.
    pub fn load(&self, addr: usize, data: &[u8]) {
        self.mem.borrow_mut()[addr..addr + data.len()].copy_from_slice(data);
    }

    pub fn contents(&self, addr: usize, len: usize) -> Vec<u8> {
        self.mem.borrow()[addr..addr + len].to_vec()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.mem.borrow().clone()
    }

    pub fn restore(&self, snapshot: &[u8]) {
        self.mem.borrow_mut().copy_from_slice(snapshot);
        self.mutations.set(0);
        self.cut_after.set(None);
        self.dead.set(false);
    }

    /// Drop every mutation after the `n`th one from now on.
    pub fn power_cut_after(&self, n: usize) {
        self.mutations.set(0);
        self.cut_after.set(Some(n));
        self.dead.set(false);
    }

    /// Simulate the reset after a power cut: the array keeps its state, the
    /// cut schedule is cleared.
    pub fn power_on(&self) {
        self.cut_after.set(None);
        self.dead.set(false);
        self.mutations.set(0);
        self.unlock_depth.set(0);
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.get()
    }

    pub fn violation_count(&self) -> usize {
        self.violations.get()
    }

    fn note_mutation(&self) {
        let n = self.mutations.get() + 1;
        self.mutations.set(n);
        if let Some(limit) = self.cut_after.get() {
            if n >= limit {
                self.dead.set(true);
            }
        }
    }
}

impl FlashInterface for MockFlash {
    const WRITE_SIZE: usize = 4;

    fn hal_flash_read(&self, addr: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.mem.borrow()[addr..addr + buf.len()]);
    }

    fn hal_flash_write(&self, addr: usize, data: &[u8]) -> Result<(), FlashError> {
        if addr % Self::WRITE_SIZE != 0 || data.len() % Self::WRITE_SIZE != 0 {
            return Err(FlashError::Alignment);
        }
        assert!(self.unlock_depth.get() > 0, "flash write while locked");
        if self.dead.get() {
            return Ok(());
        }
        {
            let mem = self.mem.borrow();
            for (i, d) in data.iter().enumerate() {
                if mem[addr + i] & *d != *d {
                    self.violations.set(self.violations.get() + 1);
                    return Err(FlashError::Write);
                }
            }
        }
        let mut mem = self.mem.borrow_mut();
        for (i, d) in data.iter().enumerate() {
            mem[addr + i] &= *d;
        }
        drop(mem);
        self.note_mutation();
        Ok(())
    }

    fn hal_flash_erase(&self, addr: usize, len: usize) -> Result<(), FlashError> {
        if addr % self.sector_size != 0 || len % self.sector_size != 0 {
            return Err(FlashError::Alignment);
        }
        assert!(self.unlock_depth.get() > 0, "flash erase while locked");
        if self.dead.get() {
            return Ok(());
        }
        self.mem.borrow_mut()[addr..addr + len].fill(0xFF);
        self.note_mutation();
        Ok(())
    }

    fn hal_flash_unlock(&self) {
        self.unlock_depth.set(self.unlock_depth.get() + 1);
    }

    fn hal_flash_lock(&self) {
        self.unlock_depth.set(self.unlock_depth.get() - 1);
    }
}

/// RAM-backed monotonic counter for anti-rollback tests.
pub struct MockCounter(Cell<u32>);

impl MockCounter {
    pub fn new(value: u32) -> Self {
        MockCounter(Cell::new(value))
    }
}

impl MonotonicCounter for MockCounter {
    fn read(&self) -> u32 {
        self.0.get()
    }

    fn advance(&self, to: u32) -> Result<(), FlashError> {
        if to > self.0.get() {
            self.0.set(to);
        }
        Ok(())
    }
}
