//! Register-file capability.
//!
//! All register access flows through [`RegisterFile`] so that the rest of
//! the driver never touches raw memory. The only unsafe code in the crate
//! is [`MappedMmio`], the production implementation over a mapped BAR.
//! [`SparseMmio`] is a software register space used by the test-suite; it
//! additionally journals writes so register-ordering requirements can be
//! checked.

use std::collections::BTreeMap;

/// A 32-bit register address space.
pub trait MmioSpace {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&mut self, offset: u32, value: u32);

    /// Downcast hook so the test-suite can reach the concrete space
    /// behind a [`RegisterFile`]. Production spaces stay opaque.
    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        None
    }
}

/// Typed register access for the display engine.
pub struct RegisterFile {
    space: Box<dyn MmioSpace + Send>,
}

impl RegisterFile {
    pub fn new(space: Box<dyn MmioSpace + Send>) -> Self {
        Self { space }
    }

    #[inline]
    pub fn read(&self, offset: u32) -> u32 {
        self.space.read32(offset)
    }

    #[inline]
    pub fn write(&mut self, offset: u32, value: u32) {
        self.space.write32(offset, value);
    }

    /// Read-modify-write: set `bits` in the register at `offset`.
    pub fn set_bits(&mut self, offset: u32, bits: u32) {
        let v = self.read(offset);
        self.write(offset, v | bits);
    }

    /// Read-modify-write: clear `bits` in the register at `offset`.
    pub fn clear_bits(&mut self, offset: u32, bits: u32) {
        let v = self.read(offset);
        self.write(offset, v & !bits);
    }

    /// Write a register back to itself. The display engine latches some
    /// plane state only on a write to the base register, so a posting
    /// read-then-write is the "flush changes" idiom after gating a plane.
    pub fn posting_write(&mut self, offset: u32) {
        let v = self.read(offset);
        self.write(offset, v);
    }

    /// The backing [`SparseMmio`], for journal assertions.
    #[cfg(test)]
    pub(crate) fn sparse_mut(&mut self) -> &mut SparseMmio {
        self.space
            .as_any_mut()
            .and_then(|a| a.downcast_mut::<SparseMmio>())
            .expect("test register space is SparseMmio")
    }
}

/// MMIO over a mapped PCI BAR. Offsets are byte offsets into the mapping.
pub struct MappedMmio {
    base: *mut u32,
    len: usize,
}

// SAFETY: the mapping is owned for the lifetime of the device and only
// ever used from the single control thread the value moves to.
unsafe impl Send for MappedMmio {}

impl MappedMmio {
    /// # Safety
    ///
    /// `base` must point to a live MMIO mapping of at least `len` bytes
    /// that stays mapped for the lifetime of the returned value, and no
    /// other code may access the mapping while this value exists.
    pub unsafe fn new(base: *mut u32, len: usize) -> Self {
        Self { base, len }
    }
}

impl MmioSpace for MappedMmio {
    fn read32(&self, offset: u32) -> u32 {
        debug_assert!((offset as usize) + 4 <= self.len);
        // SAFETY: the constructor contract guarantees `base..base+len` is a
        // live mapping and the bounds were checked above; MMIO registers
        // require volatile access so the read is not elided or reordered.
        unsafe { core::ptr::read_volatile(self.base.add(offset as usize / 4)) }
    }

    fn write32(&mut self, offset: u32, value: u32) {
        debug_assert!((offset as usize) + 4 <= self.len);
        // SAFETY: same mapping contract as read32; volatile so the write
        // reaches the device in program order.
        unsafe { core::ptr::write_volatile(self.base.add(offset as usize / 4), value) }
    }
}

/// Software register space backed by a map, with a write journal.
///
/// Unwritten registers read back zero. The journal records every write in
/// order, which is what the save/restore tests use to verify that timing
/// registers are rewritten before base addresses and palettes.
#[derive(Default)]
pub struct SparseMmio {
    regs: BTreeMap<u32, u32>,
    journal: Vec<(u32, u32)>,
}

impl SparseMmio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load a register value without journalling it.
    pub fn seed(&mut self, offset: u32, value: u32) {
        self.regs.insert(offset, value);
    }

    pub fn journal(&self) -> &[(u32, u32)] {
        &self.journal
    }

    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    /// Index into the journal of the first write to `offset`, if any.
    pub fn first_write_index(&self, offset: u32) -> Option<usize> {
        self.journal.iter().position(|&(o, _)| o == offset)
    }
}

impl MmioSpace for SparseMmio {
    fn read32(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&mut self, offset: u32, value: u32) {
        self.regs.insert(offset, value);
        self.journal.push((offset, value));
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_space_reads_back_writes() {
        let mut mmio = SparseMmio::new();
        mmio.write32(0x70180, 0x8000_0000);
        assert_eq!(mmio.read32(0x70180), 0x8000_0000);
        assert_eq!(mmio.read32(0x70184), 0, "unwritten registers read zero");
    }

    #[test]
    fn register_file_bit_helpers() {
        let mut regs = RegisterFile::new(Box::new(SparseMmio::new()));
        regs.write(0x10, 0b1010);
        regs.set_bits(0x10, 0b0001);
        assert_eq!(regs.read(0x10), 0b1011);
        regs.clear_bits(0x10, 0b1000);
        assert_eq!(regs.read(0x10), 0b0011);
    }

    #[test]
    fn journal_preserves_write_order() {
        let mut mmio = SparseMmio::new();
        mmio.write32(0x60000, 1);
        mmio.write32(0x70184, 2);
        mmio.write32(0x60000, 3);
        assert_eq!(mmio.journal(), &[(0x60000, 1), (0x70184, 2), (0x60000, 3)]);
        assert_eq!(mmio.first_write_index(0x70184), Some(1));
    }
}
