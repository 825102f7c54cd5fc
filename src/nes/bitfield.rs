//! Fixed-offset bit fields inside small register files.
//!
//! Bit offsets count from the most significant bit of the byte, matching the
//! way the 2A03/2C02 datasheets draw register layouts (`DDLC VVVV`).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    byte: usize,
    shift: u8,
    mask: u8,
}

impl Field {
    /// `bit_offset` is counted from bit 7 downwards; `width` is 1..=8.
    pub const fn new(byte: usize, bit_offset: u8, width: u8) -> Self {
        let mask = if width >= 8 { 0xFF } else { (1u8 << width) - 1 };
        Self {
            byte,
            shift: 8 - bit_offset - width,
            mask,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> Default for RegisterFile<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RegisterFile<N> {
    pub const fn new() -> Self {
        Self { bytes: [0; N] }
    }

    pub fn get(&self, field: Field) -> u8 {
        (self.bytes[field.byte] >> field.shift) & field.mask
    }

    pub fn flag(&self, field: Field) -> bool {
        self.get(field) != 0
    }

    pub fn set(&mut self, field: Field, value: u8) {
        let mask = field.mask << field.shift;
        let slot = &mut self.bytes[field.byte];
        *slot = (*slot & !mask) | ((value & field.mask) << field.shift);
    }

    /// Raw register write; out of range indices are ignored.
    pub fn write(&mut self, index: usize, value: u8) {
        if let Some(slot) = self.bytes.get_mut(index) {
            *slot = value;
        }
    }

    pub fn read(&self, index: usize) -> u8 {
        self.bytes.get(index).copied().unwrap_or(0)
    }
}

/// Reverse the bit order of a pattern byte (horizontal sprite flip).
pub const fn reverse_bits(value: u8) -> u8 {
    value.reverse_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUTY: Field = Field::new(0, 0, 2);
    const HALT: Field = Field::new(0, 2, 1);
    const VOLUME: Field = Field::new(0, 4, 4);
    const TIMER_HIGH: Field = Field::new(3, 5, 3);

    #[test]
    fn fields_follow_msb_first_layout() {
        let mut regs = RegisterFile::<4>::new();
        regs.write(0, 0b1011_0110);
        assert_eq!(regs.get(DUTY), 0b10);
        assert!(regs.flag(HALT));
        assert_eq!(regs.get(VOLUME), 0b0110);
    }

    #[test]
    fn set_only_touches_its_bits() {
        let mut regs = RegisterFile::<4>::new();
        regs.write(3, 0xF8);
        regs.set(TIMER_HIGH, 0x05);
        assert_eq!(regs.read(3), 0xFD);
        regs.set(TIMER_HIGH, 0xFF);
        assert_eq!(regs.get(TIMER_HIGH), 0x07);
        assert_eq!(regs.read(3) & 0xF8, 0xF8);
    }

    #[test]
    fn reverse_bits_mirrors_pattern_rows() {
        assert_eq!(reverse_bits(0b1000_0001), 0b1000_0001);
        assert_eq!(reverse_bits(0b1100_0000), 0b0000_0011);
    }
}
