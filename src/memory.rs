//! The guest's linear memory: one virtual-memory reservation made once at
//! startup, grown in place by `memory.grow` so pointers into it never move.
//!
//! Grounded on `wasmi`'s `core/src/vmem.rs` `VirtualMemory`, which reserves
//! its allocation's full size up front via `region::alloc` and exposes it as
//! a byte slice; the difference here is that `wazi` always reserves a fixed
//! 2 GiB ceiling (this interpreter targets one producer, not arbitrary wasm
//! memory limits) and tracks the *committed* length separately from that
//! reservation, since only memory below `memory_len` is guest-visible.

use region::{Allocation, Protection};

use crate::error::WaziError;
use crate::module::WASM_PAGE_SIZE;

/// Upper bound on a module's linear memory: 2 GiB of reserved address space,
/// matching `original_source/src/main.c`'s `max_memory`.
const RESERVATION_SIZE: usize = 2 * 1024 * 1024 * 1024;

pub struct Memory {
    allocation: Allocation,
    /// Bytes currently committed to the guest; always a multiple of the wasm
    /// page size. Bytes at or past this offset read as zero and are not
    /// writable through `grow`'s guarantees (though the reservation itself
    /// is already zeroed `READ_WRITE` memory).
    len: usize,
}

impl Memory {
    /// Reserves the full 2 GiB up front and commits `initial_pages` worth.
    pub fn new(initial_pages: u32) -> Result<Self, WaziError> {
        let allocation = region::alloc(RESERVATION_SIZE, Protection::READ_WRITE)
            .map_err(|e| WaziError::Io(std::io::Error::other(e)))?;
        Ok(Self {
            allocation,
            len: initial_pages as usize * WASM_PAGE_SIZE as usize,
        })
    }

    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.allocation.as_ptr(), self.len) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.allocation.as_mut_ptr::<u8>(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn pages(&self) -> u32 {
        (self.len / WASM_PAGE_SIZE as usize) as u32
    }

    /// Grows by `delta_pages`, returning the page count *before* the growth,
    /// or `None` if the reservation can't cover the new size.
    pub fn grow(&mut self, delta_pages: u32) -> Option<u32> {
        let old_pages = self.pages();
        let new_len = self.len + delta_pages as usize * WASM_PAGE_SIZE as usize;
        if new_len > self.allocation.len() {
            return None;
        }
        self.len = new_len;
        Some(old_pages)
    }

    /// Copies an active data segment's bytes into memory at `offset`.
    pub fn write_data_segment(&mut self, offset: u32, bytes: &[u8]) {
        let start = offset as usize;
        self.data_mut()[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_reports_previous_page_count_and_commits_new_pages() {
        let mut mem = Memory::new(0).unwrap();
        assert_eq!(mem.grow(1), Some(0));
        assert_eq!(mem.pages(), 1);
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.pages(), 2);
    }

    #[test]
    fn data_segment_lands_at_offset() {
        let mut mem = Memory::new(1).unwrap();
        mem.write_data_segment(10, b"hi");
        assert_eq!(&mem.data()[10..12], b"hi");
    }
}
