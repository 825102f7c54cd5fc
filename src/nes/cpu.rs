use serde::Serialize;
use tracing::trace;

use super::opcodes::{Instruction, Mode, Op, instruction};

pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ZERO: u8 = 0x02;
pub const FLAG_INTERRUPT: u8 = 0x04;
pub const FLAG_DECIMAL: u8 = 0x08;
pub const FLAG_BREAK: u8 = 0x10;
pub const FLAG_UNUSED: u8 = 0x20;
pub const FLAG_OVERFLOW: u8 = 0x40;
pub const FLAG_NEGATIVE: u8 = 0x80;

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

const INTERRUPT_CYCLES: u8 = 7;
const RESET_CYCLES: u8 = 7;

/// Memory seen from the CPU side. Every access may have side effects.
pub trait CpuBus {
    fn cpu_read(&mut self, addr: u16) -> u8;
    fn cpu_write(&mut self, addr: u16, value: u8);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuState {
    pub pc: u16,
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub p: u8,
    pub cycles: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDebugCounters {
    pub instructions: u64,
    pub nmi_serviced: u64,
    pub irq_serviced: u64,
    pub illegal_opcodes: u64,
    pub last_illegal_opcode: u8,
    pub last_illegal_pc: u16,
    pub last_opcode_pc: u16,
}

#[derive(Debug, Clone, Copy)]
enum Operand {
    None,
    Accumulator,
    Memory(u16),
}

/// Instruction-granular 6502: the whole instruction runs on the tick that
/// fetches it, then the remaining cycles count down one per tick.
#[derive(Debug, Clone)]
pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub p: u8,
    pub pc: u16,
    cycles_remaining: u8,
    total_cycles: u64,
    nmi_pending: bool,
    irq_line: bool,
    debug: CpuDebugCounters,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
            pc: 0,
            cycles_remaining: 0,
            total_cycles: 0,
            nmi_pending: false,
            irq_line: false,
            debug: CpuDebugCounters::default(),
        }
    }

    /// Loads PC from the reset vector. The reset sequence itself occupies
    /// the next seven ticks.
    pub fn reset(&mut self, bus: &mut impl CpuBus) {
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.sp = 0xFD;
        self.p = FLAG_INTERRUPT | FLAG_UNUSED;
        self.pc = read_u16(bus, RESET_VECTOR);
        self.cycles_remaining = RESET_CYCLES;
        self.total_cycles = 0;
        self.nmi_pending = false;
        self.irq_line = false;
        self.debug = CpuDebugCounters::default();
    }

    /// Latches a non-maskable interrupt; serviced at the next instruction
    /// boundary.
    pub fn nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// Level of the shared IRQ line, sampled at each instruction boundary.
    pub fn irq(&mut self, asserted: bool) {
        self.irq_line = asserted;
    }

    pub fn instruction_done(&self) -> bool {
        self.cycles_remaining == 0
    }

    pub fn cycles_remaining(&self) -> u8 {
        self.cycles_remaining
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn debug_counters(&self) -> CpuDebugCounters {
        self.debug
    }

    pub fn state(&self) -> CpuState {
        CpuState {
            pc: self.pc,
            a: self.a,
            x: self.x,
            y: self.y,
            sp: self.sp,
            p: self.p,
            cycles: self.total_cycles,
        }
    }

    pub fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    pub fn tick(&mut self, bus: &mut impl CpuBus) {
        if self.cycles_remaining == 0 {
            self.cycles_remaining = if self.nmi_pending {
                self.nmi_pending = false;
                self.service_interrupt(bus, NMI_VECTOR);
                self.debug.nmi_serviced = self.debug.nmi_serviced.wrapping_add(1);
                INTERRUPT_CYCLES
            } else if self.irq_line && !self.get_flag(FLAG_INTERRUPT) {
                self.service_interrupt(bus, IRQ_VECTOR);
                self.debug.irq_serviced = self.debug.irq_serviced.wrapping_add(1);
                INTERRUPT_CYCLES
            } else {
                self.execute_next(bus)
            };
        }
        self.cycles_remaining -= 1;
        self.total_cycles += 1;
    }

    fn execute_next(&mut self, bus: &mut impl CpuBus) -> u8 {
        let opcode_pc = self.pc;
        let opcode = self.fetch_byte(bus);
        let instr = instruction(opcode);
        self.debug.instructions = self.debug.instructions.wrapping_add(1);
        self.debug.last_opcode_pc = opcode_pc;

        let (operand, page_crossed) = self.resolve(bus, instr);
        let extra = self.execute(bus, instr, opcode, opcode_pc, operand);
        let penalty = u8::from(instr.page_penalty && page_crossed);
        instr.cycles + penalty + extra
    }

    fn resolve(&mut self, bus: &mut impl CpuBus, instr: &Instruction) -> (Operand, bool) {
        match instr.mode {
            Mode::Implied => (Operand::None, false),
            Mode::Accumulator => (Operand::Accumulator, false),
            Mode::Immediate => {
                let addr = self.pc;
                self.pc = self.pc.wrapping_add(1);
                (Operand::Memory(addr), false)
            }
            Mode::ZeroPage => (Operand::Memory(self.fetch_byte(bus) as u16), false),
            Mode::ZeroPageX => {
                let base = self.fetch_byte(bus);
                (Operand::Memory(base.wrapping_add(self.x) as u16), false)
            }
            Mode::ZeroPageY => {
                let base = self.fetch_byte(bus);
                (Operand::Memory(base.wrapping_add(self.y) as u16), false)
            }
            Mode::Absolute => (Operand::Memory(self.fetch_word(bus)), false),
            Mode::AbsoluteX => {
                let base = self.fetch_word(bus);
                self.indexed(bus, instr, base, self.x)
            }
            Mode::AbsoluteY => {
                let base = self.fetch_word(bus);
                self.indexed(bus, instr, base, self.y)
            }
            Mode::Indirect => {
                let ptr = self.fetch_word(bus);
                (Operand::Memory(read_u16_bug(bus, ptr)), false)
            }
            Mode::IndexedIndirect => {
                let zp = self.fetch_byte(bus).wrapping_add(self.x);
                (Operand::Memory(read_zp_u16(bus, zp)), false)
            }
            Mode::IndirectIndexed => {
                let zp = self.fetch_byte(bus);
                let base = read_zp_u16(bus, zp);
                self.indexed(bus, instr, base, self.y)
            }
            Mode::Relative => {
                let offset = self.fetch_byte(bus) as i8;
                let target = self.pc.wrapping_add(offset as i16 as u16);
                (Operand::Memory(target), false)
            }
        }
    }

    fn indexed(
        &mut self,
        bus: &mut impl CpuBus,
        instr: &Instruction,
        base: u16,
        index: u8,
    ) -> (Operand, bool) {
        let addr = base.wrapping_add(index as u16);
        let crossed = (base & 0xFF00) != (addr & 0xFF00);
        // The un-carried address is read whenever the hardware needs the
        // fix-up cycle: stores and read-modify-writes always, loads on a
        // page cross only.
        if crossed || !instr.page_penalty {
            let _ = bus.cpu_read((base & 0xFF00) | (addr & 0x00FF));
        }
        (Operand::Memory(addr), crossed)
    }

    fn execute(
        &mut self,
        bus: &mut impl CpuBus,
        instr: &Instruction,
        opcode: u8,
        opcode_pc: u16,
        operand: Operand,
    ) -> u8 {
        match instr.op {
            Op::Lda => {
                self.a = self.load(bus, operand);
                self.update_zn(self.a);
            }
            Op::Ldx => {
                self.x = self.load(bus, operand);
                self.update_zn(self.x);
            }
            Op::Ldy => {
                self.y = self.load(bus, operand);
                self.update_zn(self.y);
            }
            Op::Sta => self.store(bus, operand, self.a),
            Op::Stx => self.store(bus, operand, self.x),
            Op::Sty => self.store(bus, operand, self.y),

            Op::Adc => {
                let value = self.load(bus, operand);
                self.adc(value);
            }
            Op::Sbc => {
                let value = self.load(bus, operand);
                self.adc(value ^ 0xFF);
            }
            Op::And => {
                self.a &= self.load(bus, operand);
                self.update_zn(self.a);
            }
            Op::Ora => {
                self.a |= self.load(bus, operand);
                self.update_zn(self.a);
            }
            Op::Eor => {
                self.a ^= self.load(bus, operand);
                self.update_zn(self.a);
            }
            Op::Bit => {
                let value = self.load(bus, operand);
                self.set_flag(FLAG_ZERO, (self.a & value) == 0);
                self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
                self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
            }
            Op::Cmp => {
                let value = self.load(bus, operand);
                self.compare(self.a, value);
            }
            Op::Cpx => {
                let value = self.load(bus, operand);
                self.compare(self.x, value);
            }
            Op::Cpy => {
                let value = self.load(bus, operand);
                self.compare(self.y, value);
            }

            Op::Asl => self.read_modify_write(bus, operand, Self::asl),
            Op::Lsr => self.read_modify_write(bus, operand, Self::lsr),
            Op::Rol => self.read_modify_write(bus, operand, Self::rol),
            Op::Ror => self.read_modify_write(bus, operand, Self::ror),
            Op::Inc => self.read_modify_write(bus, operand, |cpu, v| {
                let out = v.wrapping_add(1);
                cpu.update_zn(out);
                out
            }),
            Op::Dec => self.read_modify_write(bus, operand, |cpu, v| {
                let out = v.wrapping_sub(1);
                cpu.update_zn(out);
                out
            }),

            Op::Inx => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
            }
            Op::Iny => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
            }
            Op::Dex => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
            }
            Op::Dey => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
            }
            Op::Tax => {
                self.x = self.a;
                self.update_zn(self.x);
            }
            Op::Tay => {
                self.y = self.a;
                self.update_zn(self.y);
            }
            Op::Txa => {
                self.a = self.x;
                self.update_zn(self.a);
            }
            Op::Tya => {
                self.a = self.y;
                self.update_zn(self.a);
            }
            Op::Tsx => {
                self.x = self.sp;
                self.update_zn(self.x);
            }
            Op::Txs => self.sp = self.x,

            Op::Clc => self.set_flag(FLAG_CARRY, false),
            Op::Sec => self.set_flag(FLAG_CARRY, true),
            Op::Cli => self.set_flag(FLAG_INTERRUPT, false),
            Op::Sei => self.set_flag(FLAG_INTERRUPT, true),
            Op::Cld => self.set_flag(FLAG_DECIMAL, false),
            Op::Sed => self.set_flag(FLAG_DECIMAL, true),
            Op::Clv => self.set_flag(FLAG_OVERFLOW, false),

            Op::Bcc => return self.branch(operand, !self.get_flag(FLAG_CARRY)),
            Op::Bcs => return self.branch(operand, self.get_flag(FLAG_CARRY)),
            Op::Bne => return self.branch(operand, !self.get_flag(FLAG_ZERO)),
            Op::Beq => return self.branch(operand, self.get_flag(FLAG_ZERO)),
            Op::Bpl => return self.branch(operand, !self.get_flag(FLAG_NEGATIVE)),
            Op::Bmi => return self.branch(operand, self.get_flag(FLAG_NEGATIVE)),
            Op::Bvc => return self.branch(operand, !self.get_flag(FLAG_OVERFLOW)),
            Op::Bvs => return self.branch(operand, self.get_flag(FLAG_OVERFLOW)),

            Op::Jmp => {
                if let Operand::Memory(target) = operand {
                    self.pc = target;
                }
            }
            Op::Jsr => {
                if let Operand::Memory(target) = operand {
                    let ret = self.pc.wrapping_sub(1);
                    self.push_u16(bus, ret);
                    self.pc = target;
                }
            }
            Op::Rts => {
                self.pc = self.pop_u16(bus).wrapping_add(1);
            }
            Op::Rti => {
                let p = self.pop(bus);
                self.p = (p & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pop_u16(bus);
            }
            Op::Brk => {
                // Padding byte after BRK is skipped on return.
                self.pc = self.pc.wrapping_add(1);
                self.push_u16(bus, self.pc);
                self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_INTERRUPT, true);
                self.pc = read_u16(bus, IRQ_VECTOR);
            }

            Op::Pha => self.push(bus, self.a),
            Op::Php => self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED),
            Op::Pla => {
                self.a = self.pop(bus);
                self.update_zn(self.a);
            }
            Op::Plp => {
                let p = self.pop(bus);
                self.p = (p & !FLAG_BREAK) | FLAG_UNUSED;
            }

            Op::Nop => {}
            Op::Illegal => {
                self.debug.illegal_opcodes = self.debug.illegal_opcodes.wrapping_add(1);
                self.debug.last_illegal_opcode = opcode;
                self.debug.last_illegal_pc = opcode_pc;
                trace!(opcode, pc = opcode_pc, "unofficial opcode treated as no-op");
            }
        }
        0
    }

    fn load(&mut self, bus: &mut impl CpuBus, operand: Operand) -> u8 {
        match operand {
            Operand::Memory(addr) => bus.cpu_read(addr),
            Operand::Accumulator => self.a,
            Operand::None => 0,
        }
    }

    fn store(&mut self, bus: &mut impl CpuBus, operand: Operand, value: u8) {
        if let Operand::Memory(addr) = operand {
            bus.cpu_write(addr, value);
        }
    }

    fn read_modify_write(
        &mut self,
        bus: &mut impl CpuBus,
        operand: Operand,
        op: impl FnOnce(&mut Self, u8) -> u8,
    ) {
        match operand {
            Operand::Accumulator => self.a = op(self, self.a),
            Operand::Memory(addr) => {
                let value = bus.cpu_read(addr);
                // Unmodified value goes out first, as on hardware.
                bus.cpu_write(addr, value);
                let out = op(self, value);
                bus.cpu_write(addr, out);
            }
            Operand::None => {}
        }
    }

    /// Extra cycles: 1 when taken, 2 when the target is on another page.
    fn branch(&mut self, operand: Operand, condition: bool) -> u8 {
        let Operand::Memory(target) = operand else {
            return 0;
        };
        if !condition {
            return 0;
        }
        let crossed = (self.pc & 0xFF00) != (target & 0xFF00);
        self.pc = target;
        if crossed { 2 } else { 1 }
    }

    fn service_interrupt(&mut self, bus: &mut impl CpuBus, vector: u16) {
        self.push_u16(bus, self.pc);
        self.push(bus, (self.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = read_u16(bus, vector);
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(result);
    }

    fn adc(&mut self, value: u8) {
        let carry_in = u16::from(self.get_flag(FLAG_CARRY));
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, ((self.a ^ out) & (value ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(out);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.get_flag(FLAG_CARRY));
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn fetch_byte(&mut self, bus: &mut impl CpuBus) -> u8 {
        let byte = bus.cpu_read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }

    fn fetch_word(&mut self, bus: &mut impl CpuBus) -> u16 {
        let lo = self.fetch_byte(bus) as u16;
        let hi = self.fetch_byte(bus) as u16;
        (hi << 8) | lo
    }

    fn push(&mut self, bus: &mut impl CpuBus, value: u8) {
        bus.cpu_write(0x0100 | self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop(&mut self, bus: &mut impl CpuBus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.cpu_read(0x0100 | self.sp as u16)
    }

    fn push_u16(&mut self, bus: &mut impl CpuBus, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pop_u16(&mut self, bus: &mut impl CpuBus) -> u16 {
        let lo = self.pop(bus) as u16;
        let hi = self.pop(bus) as u16;
        (hi << 8) | lo
    }
}

fn read_u16(bus: &mut impl CpuBus, addr: u16) -> u16 {
    let lo = bus.cpu_read(addr) as u16;
    let hi = bus.cpu_read(addr.wrapping_add(1)) as u16;
    (hi << 8) | lo
}

/// JMP ($xxFF) takes its high byte from $xx00.
fn read_u16_bug(bus: &mut impl CpuBus, addr: u16) -> u16 {
    let lo = bus.cpu_read(addr) as u16;
    let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
    let hi = bus.cpu_read(hi_addr) as u16;
    (hi << 8) | lo
}

fn read_zp_u16(bus: &mut impl CpuBus, addr: u8) -> u16 {
    let lo = bus.cpu_read(addr as u16) as u16;
    let hi = bus.cpu_read(addr.wrapping_add(1) as u16) as u16;
    (hi << 8) | lo
}
