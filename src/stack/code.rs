//! Compiled-code metadata consumed by the walker.

use super::Method;

/// Which virtual registers hold references at a given bytecode offset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReferenceBitmap {
    bits: Vec<u8>,
}

impl ReferenceBitmap {
    pub fn new(bits: Vec<u8>) -> Self {
        Self { bits }
    }

    /// Bitmap with the given registers marked.
    pub fn from_registers(registers: &[u16]) -> Self {
        let width = registers.iter().map(|reg| *reg as usize / 8 + 1).max().unwrap_or(0);
        let mut bits = vec![0u8; width];
        for reg in registers {
            bits[*reg as usize / 8] |= 1 << (reg % 8);
        }
        Self { bits }
    }

    pub fn width_bits(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn is_set(&self, reg: usize) -> bool {
        self.bits
            .get(reg / 8)
            .is_some_and(|byte| byte & (1 << (reg % 8)) != 0)
    }
}

/// Where a virtual register of a compiled frame lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VRegLocation {
    /// Promoted to a callee-save register; the offset indexes the method's
    /// spilled registers.
    Context { vmap_offset: u32 },
    /// In the frame's stack slot.
    Stack { slot: usize },
}

/// Queries against compiled code and its side tables.
pub trait CodeIntrospection: Send + Sync {
    /// Source line for a bytecode offset, if the method has line information.
    fn line_number(&self, method: &Method, dex_pc: u32) -> Option<i32>;

    fn dex_pc_for_native_pc(&self, method: &Method, native_pc: usize) -> u32;

    fn native_pc_for_dex_pc(&self, method: &Method, dex_pc: u32) -> usize;

    /// Reference map at `dex_pc`. Compiled bytecode methods always have one.
    fn reference_bitmap(&self, method: &Method, dex_pc: u32) -> Option<ReferenceBitmap>;

    fn vreg_location(&self, method: &Method, vreg: u16) -> VRegLocation;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_from_registers() {
        let bitmap = ReferenceBitmap::from_registers(&[0, 3, 9]);
        assert_eq!(bitmap.width_bits(), 16);
        assert!(bitmap.is_set(0));
        assert!(bitmap.is_set(3));
        assert!(bitmap.is_set(9));
        assert!(!bitmap.is_set(1));
        assert!(!bitmap.is_set(200));
    }
}
