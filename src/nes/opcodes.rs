//! 6502 instruction descriptors, one per opcode byte.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndexedIndirect,
    IndirectIndexed,
    Relative,
}

impl Mode {
    /// Operand bytes following the opcode.
    pub const fn operand_len(self) -> u16 {
        match self {
            Mode::Implied | Mode::Accumulator => 0,
            Mode::Absolute | Mode::AbsoluteX | Mode::AbsoluteY | Mode::Indirect => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
    /// Unofficial opcode: operands are consumed, nothing else happens.
    Illegal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub mode: Mode,
    pub cycles: u8,
    pub page_penalty: bool,
}

impl Instruction {
    const FILLER: Instruction = Instruction {
        op: Op::Illegal,
        mode: Mode::Implied,
        cycles: 2,
        page_penalty: false,
    };

    pub const fn is_illegal(&self) -> bool {
        matches!(self.op, Op::Illegal)
    }
}

pub fn instruction(opcode: u8) -> &'static Instruction {
    &INSTRUCTIONS[opcode as usize]
}

pub static INSTRUCTIONS: [Instruction; 256] = build_table();

use Mode::*;
use Op::*;

#[rustfmt::skip]
const OFFICIAL: [(u8, Op, Mode, u8, bool); 151] = [
    (0x69, Adc, Immediate, 2, false), (0x65, Adc, ZeroPage, 3, false),
    (0x75, Adc, ZeroPageX, 4, false), (0x6D, Adc, Absolute, 4, false),
    (0x7D, Adc, AbsoluteX, 4, true), (0x79, Adc, AbsoluteY, 4, true),
    (0x61, Adc, IndexedIndirect, 6, false), (0x71, Adc, IndirectIndexed, 5, true),

    (0x29, And, Immediate, 2, false), (0x25, And, ZeroPage, 3, false),
    (0x35, And, ZeroPageX, 4, false), (0x2D, And, Absolute, 4, false),
    (0x3D, And, AbsoluteX, 4, true), (0x39, And, AbsoluteY, 4, true),
    (0x21, And, IndexedIndirect, 6, false), (0x31, And, IndirectIndexed, 5, true),

    (0x0A, Asl, Accumulator, 2, false), (0x06, Asl, ZeroPage, 5, false),
    (0x16, Asl, ZeroPageX, 6, false), (0x0E, Asl, Absolute, 6, false),
    (0x1E, Asl, AbsoluteX, 7, false),

    (0x90, Bcc, Relative, 2, false), (0xB0, Bcs, Relative, 2, false),
    (0xF0, Beq, Relative, 2, false), (0x30, Bmi, Relative, 2, false),
    (0xD0, Bne, Relative, 2, false), (0x10, Bpl, Relative, 2, false),
    (0x50, Bvc, Relative, 2, false), (0x70, Bvs, Relative, 2, false),

    (0x24, Bit, ZeroPage, 3, false), (0x2C, Bit, Absolute, 4, false),
    (0x00, Brk, Implied, 7, false),

    (0x18, Clc, Implied, 2, false), (0xD8, Cld, Implied, 2, false),
    (0x58, Cli, Implied, 2, false), (0xB8, Clv, Implied, 2, false),

    (0xC9, Cmp, Immediate, 2, false), (0xC5, Cmp, ZeroPage, 3, false),
    (0xD5, Cmp, ZeroPageX, 4, false), (0xCD, Cmp, Absolute, 4, false),
    (0xDD, Cmp, AbsoluteX, 4, true), (0xD9, Cmp, AbsoluteY, 4, true),
    (0xC1, Cmp, IndexedIndirect, 6, false), (0xD1, Cmp, IndirectIndexed, 5, true),

    (0xE0, Cpx, Immediate, 2, false), (0xE4, Cpx, ZeroPage, 3, false),
    (0xEC, Cpx, Absolute, 4, false),
    (0xC0, Cpy, Immediate, 2, false), (0xC4, Cpy, ZeroPage, 3, false),
    (0xCC, Cpy, Absolute, 4, false),

    (0xC6, Dec, ZeroPage, 5, false), (0xD6, Dec, ZeroPageX, 6, false),
    (0xCE, Dec, Absolute, 6, false), (0xDE, Dec, AbsoluteX, 7, false),
    (0xCA, Dex, Implied, 2, false), (0x88, Dey, Implied, 2, false),

    (0x49, Eor, Immediate, 2, false), (0x45, Eor, ZeroPage, 3, false),
    (0x55, Eor, ZeroPageX, 4, false), (0x4D, Eor, Absolute, 4, false),
    (0x5D, Eor, AbsoluteX, 4, true), (0x59, Eor, AbsoluteY, 4, true),
    (0x41, Eor, IndexedIndirect, 6, false), (0x51, Eor, IndirectIndexed, 5, true),

    (0xE6, Inc, ZeroPage, 5, false), (0xF6, Inc, ZeroPageX, 6, false),
    (0xEE, Inc, Absolute, 6, false), (0xFE, Inc, AbsoluteX, 7, false),
    (0xE8, Inx, Implied, 2, false), (0xC8, Iny, Implied, 2, false),

    (0x4C, Jmp, Absolute, 3, false), (0x6C, Jmp, Indirect, 5, false),
    (0x20, Jsr, Absolute, 6, false),

    (0xA9, Lda, Immediate, 2, false), (0xA5, Lda, ZeroPage, 3, false),
    (0xB5, Lda, ZeroPageX, 4, false), (0xAD, Lda, Absolute, 4, false),
    (0xBD, Lda, AbsoluteX, 4, true), (0xB9, Lda, AbsoluteY, 4, true),
    (0xA1, Lda, IndexedIndirect, 6, false), (0xB1, Lda, IndirectIndexed, 5, true),

    (0xA2, Ldx, Immediate, 2, false), (0xA6, Ldx, ZeroPage, 3, false),
    (0xB6, Ldx, ZeroPageY, 4, false), (0xAE, Ldx, Absolute, 4, false),
    (0xBE, Ldx, AbsoluteY, 4, true),

    (0xA0, Ldy, Immediate, 2, false), (0xA4, Ldy, ZeroPage, 3, false),
    (0xB4, Ldy, ZeroPageX, 4, false), (0xAC, Ldy, Absolute, 4, false),
    (0xBC, Ldy, AbsoluteX, 4, true),

    (0x4A, Lsr, Accumulator, 2, false), (0x46, Lsr, ZeroPage, 5, false),
    (0x56, Lsr, ZeroPageX, 6, false), (0x4E, Lsr, Absolute, 6, false),
    (0x5E, Lsr, AbsoluteX, 7, false),

    (0xEA, Nop, Implied, 2, false),

    (0x09, Ora, Immediate, 2, false), (0x05, Ora, ZeroPage, 3, false),
    (0x15, Ora, ZeroPageX, 4, false), (0x0D, Ora, Absolute, 4, false),
    (0x1D, Ora, AbsoluteX, 4, true), (0x19, Ora, AbsoluteY, 4, true),
    (0x01, Ora, IndexedIndirect, 6, false), (0x11, Ora, IndirectIndexed, 5, true),

    (0x48, Pha, Implied, 3, false), (0x08, Php, Implied, 3, false),
    (0x68, Pla, Implied, 4, false), (0x28, Plp, Implied, 4, false),

    (0x2A, Rol, Accumulator, 2, false), (0x26, Rol, ZeroPage, 5, false),
    (0x36, Rol, ZeroPageX, 6, false), (0x2E, Rol, Absolute, 6, false),
    (0x3E, Rol, AbsoluteX, 7, false),

    (0x6A, Ror, Accumulator, 2, false), (0x66, Ror, ZeroPage, 5, false),
    (0x76, Ror, ZeroPageX, 6, false), (0x6E, Ror, Absolute, 6, false),
    (0x7E, Ror, AbsoluteX, 7, false),

    (0x40, Rti, Implied, 6, false), (0x60, Rts, Implied, 6, false),

    (0xE9, Sbc, Immediate, 2, false), (0xE5, Sbc, ZeroPage, 3, false),
    (0xF5, Sbc, ZeroPageX, 4, false), (0xED, Sbc, Absolute, 4, false),
    (0xFD, Sbc, AbsoluteX, 4, true), (0xF9, Sbc, AbsoluteY, 4, true),
    (0xE1, Sbc, IndexedIndirect, 6, false), (0xF1, Sbc, IndirectIndexed, 5, true),

    (0x38, Sec, Implied, 2, false), (0xF8, Sed, Implied, 2, false),
    (0x78, Sei, Implied, 2, false),

    (0x85, Sta, ZeroPage, 3, false), (0x95, Sta, ZeroPageX, 4, false),
    (0x8D, Sta, Absolute, 4, false), (0x9D, Sta, AbsoluteX, 5, false),
    (0x99, Sta, AbsoluteY, 5, false), (0x81, Sta, IndexedIndirect, 6, false),
    (0x91, Sta, IndirectIndexed, 6, false),

    (0x86, Stx, ZeroPage, 3, false), (0x96, Stx, ZeroPageY, 4, false),
    (0x8E, Stx, Absolute, 4, false),
    (0x84, Sty, ZeroPage, 3, false), (0x94, Sty, ZeroPageX, 4, false),
    (0x8C, Sty, Absolute, 4, false),

    (0xAA, Tax, Implied, 2, false), (0xA8, Tay, Implied, 2, false),
    (0xBA, Tsx, Implied, 2, false), (0x8A, Txa, Implied, 2, false),
    (0x9A, Txs, Implied, 2, false), (0x98, Tya, Implied, 2, false),
];

/// Unofficial opcodes outside the `cc == 3` block.
#[rustfmt::skip]
const UNOFFICIAL_NOPS: [(u8, Mode, u8, bool); 20] = [
    (0x80, Immediate, 2, false), (0x82, Immediate, 2, false), (0x89, Immediate, 2, false),
    (0xC2, Immediate, 2, false), (0xE2, Immediate, 2, false),
    (0x04, ZeroPage, 3, false), (0x44, ZeroPage, 3, false), (0x64, ZeroPage, 3, false),
    (0x14, ZeroPageX, 4, false), (0x34, ZeroPageX, 4, false), (0x54, ZeroPageX, 4, false),
    (0x74, ZeroPageX, 4, false), (0xD4, ZeroPageX, 4, false), (0xF4, ZeroPageX, 4, false),
    (0x0C, Absolute, 4, false),
    (0x1C, AbsoluteX, 4, true), (0x3C, AbsoluteX, 4, true), (0x5C, AbsoluteX, 4, true),
    (0x7C, AbsoluteX, 4, true), (0xDC, AbsoluteX, 4, true),
];

const fn unofficial_cc3(opcode: u8) -> Instruction {
    let aaa = opcode >> 5;
    let bbb = (opcode >> 2) & 0x07;
    // SAX/LAX index the zero page and the upper absolute form by Y.
    let y_indexed = aaa == 4 || aaa == 5;
    let (mode, cycles, page_penalty) = match (aaa, bbb) {
        (4, 0) | (5, 0) => (IndexedIndirect, 6, false),
        (_, 0) => (IndexedIndirect, 8, false),
        (4, 1) | (5, 1) => (ZeroPage, 3, false),
        (_, 1) => (ZeroPage, 5, false),
        (_, 2) => (Immediate, 2, false),
        (4, 3) | (5, 3) => (Absolute, 4, false),
        (_, 3) => (Absolute, 6, false),
        (4, 4) => (IndirectIndexed, 6, false),
        (5, 4) => (IndirectIndexed, 5, true),
        (_, 4) => (IndirectIndexed, 8, false),
        (_, 5) if y_indexed => (ZeroPageY, 4, false),
        (_, 5) => (ZeroPageX, 6, false),
        (4, 6) => (AbsoluteY, 5, false),
        (5, 6) => (AbsoluteY, 4, true),
        (_, 6) => (AbsoluteY, 7, false),
        (4, _) => (AbsoluteY, 5, false),
        (5, _) => (AbsoluteY, 4, true),
        _ => (AbsoluteX, 7, false),
    };
    Instruction {
        op: Illegal,
        mode,
        cycles,
        page_penalty,
    }
}

const fn build_table() -> [Instruction; 256] {
    let mut table = [Instruction::FILLER; 256];

    let mut opcode = 3usize;
    while opcode < 256 {
        table[opcode] = unofficial_cc3(opcode as u8);
        opcode += 4;
    }

    let mut i = 0;
    while i < UNOFFICIAL_NOPS.len() {
        let (opcode, mode, cycles, page_penalty) = UNOFFICIAL_NOPS[i];
        table[opcode as usize] = Instruction {
            op: Illegal,
            mode,
            cycles,
            page_penalty,
        };
        i += 1;
    }
    // SHY abs,X and SHX abs,Y
    table[0x9C] = Instruction {
        op: Illegal,
        mode: AbsoluteX,
        cycles: 5,
        page_penalty: false,
    };
    table[0x9E] = Instruction {
        op: Illegal,
        mode: AbsoluteY,
        cycles: 5,
        page_penalty: false,
    };

    let mut i = 0;
    while i < OFFICIAL.len() {
        let (opcode, op, mode, cycles, page_penalty) = OFFICIAL[i];
        table[opcode as usize] = Instruction {
            op,
            mode,
            cycles,
            page_penalty,
        };
        i += 1;
    }

    table
}
