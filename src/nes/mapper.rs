use tracing::{trace, warn};

use super::cartridge::Cartridge;

pub const EXPANSION_START: u16 = 0x4020;
const EXPANSION_LEN: usize = 0x6000 - 0x4020;
const PRG_RAM_LEN: usize = 0x2000;
const TRAINER_OFFSET: usize = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
    FourScreen,
}

impl Mirroring {
    /// Physical VRAM offset for a nametable address in `$2000-$3EFF`.
    pub fn vram_index(self, addr: u16) -> usize {
        let index = (addr as usize - 0x2000) & 0x0FFF;
        let table = index / 0x400;
        let offset = index % 0x400;

        let mapped_table = match self {
            Mirroring::Horizontal => table >> 1,
            Mirroring::Vertical => table & 1,
            Mirroring::OneScreenLower => 0,
            Mirroring::OneScreenUpper => 1,
            Mirroring::FourScreen => table,
        };

        mapped_table * 0x400 + offset
    }
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        _ => "Unsupported (NROM fallback)",
    }
}

/// Memory every board carries regardless of its banking logic.
struct Board {
    prg_rom: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    prg_ram: Vec<u8>,
    expansion: Vec<u8>,
    vram: Box<[u8; 0x1000]>,
    mirroring: Mirroring,
    has_battery: bool,
}

impl Board {
    fn new(cart: Cartridge) -> Self {
        // Smaller RAM chips mirror across the $6000-$7FFF window.
        let prg_ram_len = if cart.trainer.is_some() {
            PRG_RAM_LEN
        } else {
            cart.prg_ram_size.clamp(1, PRG_RAM_LEN)
        };
        let mut prg_ram = vec![0; prg_ram_len];
        if let Some(trainer) = cart.trainer.as_deref() {
            let end = (TRAINER_OFFSET + trainer.len()).min(PRG_RAM_LEN);
            prg_ram[TRAINER_OFFSET..end].copy_from_slice(&trainer[..end - TRAINER_OFFSET]);
        }

        let mut prg_rom = cart.prg_rom;
        if prg_rom.is_empty() {
            prg_rom = vec![0; 0x4000];
        }
        let mut chr = cart.chr_data;
        if chr.is_empty() {
            chr = vec![0; 0x2000];
        }

        Self {
            prg_rom,
            chr,
            chr_is_ram: cart.chr_is_ram,
            prg_ram,
            expansion: vec![0; EXPANSION_LEN],
            vram: Box::new([0; 0x1000]),
            mirroring: cart.mirroring,
            has_battery: cart.has_battery_backed_ram,
        }
    }

    fn prg_banks(&self, bank_size: usize) -> usize {
        (self.prg_rom.len() / bank_size).max(1)
    }

    fn chr_banks(&self, bank_size: usize) -> usize {
        (self.chr.len() / bank_size).max(1)
    }

    fn read_prg(&self, bank_size: usize, bank: usize, offset: usize) -> u8 {
        let bank = bank % self.prg_banks(bank_size);
        let idx = bank * bank_size + (offset & (bank_size - 1));
        self.prg_rom[idx % self.prg_rom.len()]
    }

    fn chr_index(&self, bank_size: usize, bank: usize, offset: usize) -> usize {
        let bank = bank % self.chr_banks(bank_size);
        (bank * bank_size + (offset & (bank_size - 1))) % self.chr.len()
    }

    fn read_chr(&self, idx: usize) -> u8 {
        self.chr[idx]
    }

    fn write_chr(&mut self, idx: usize, value: u8) {
        if self.chr_is_ram {
            self.chr[idx] = value;
        }
    }

    fn read_expansion(&self, addr: u16) -> u8 {
        self.expansion[(addr - EXPANSION_START) as usize]
    }

    fn write_expansion(&mut self, addr: u16, value: u8) {
        self.expansion[(addr - EXPANSION_START) as usize] = value;
    }

    fn read_prg_ram(&self, addr: u16) -> u8 {
        self.prg_ram[(addr as usize - 0x6000) % self.prg_ram.len()]
    }

    fn write_prg_ram(&mut self, addr: u16, value: u8) {
        let len = self.prg_ram.len();
        self.prg_ram[(addr as usize - 0x6000) % len] = value;
    }

    fn read_nametable(&self, addr: u16, mirroring: Mirroring) -> u8 {
        self.vram[mirroring.vram_index(addr)]
    }

    fn write_nametable(&mut self, addr: u16, value: u8, mirroring: Mirroring) {
        self.vram[mirroring.vram_index(addr)] = value;
    }
}

#[derive(Debug, Clone)]
struct Mmc1 {
    shift_register: u8,
    control: u8,
    chr_bank0: u8,
    chr_bank1: u8,
    prg_bank: u8,
    cpu_cycle: u64,
    last_serial_write: Option<u64>,
}

impl Mmc1 {
    fn new() -> Self {
        Self {
            shift_register: 0x10,
            control: 0x0C,
            chr_bank0: 0,
            chr_bank1: 0,
            prg_bank: 0,
            cpu_cycle: 0,
            last_serial_write: None,
        }
    }

    fn ram_enabled(&self) -> bool {
        (self.prg_bank & 0x10) == 0
    }

    fn write_shift_register(&mut self, addr: u16, value: u8) {
        // Serial writes on back-to-back cycles (the two writes of a RMW
        // instruction) only register the first one.
        let back_to_back = self
            .last_serial_write
            .is_some_and(|last| self.cpu_cycle.saturating_sub(last) <= 1);
        self.last_serial_write = Some(self.cpu_cycle);
        if back_to_back {
            return;
        }

        if (value & 0x80) != 0 {
            self.shift_register = 0x10;
            self.control |= 0x0C;
            return;
        }

        let commit = (self.shift_register & 0x01) != 0;
        self.shift_register = (self.shift_register >> 1) | ((value & 0x01) << 4);

        if commit {
            let data = self.shift_register;
            match addr {
                0x8000..=0x9FFF => self.control = data,
                0xA000..=0xBFFF => self.chr_bank0 = data,
                0xC000..=0xDFFF => self.chr_bank1 = data,
                _ => self.prg_bank = data,
            }
            self.shift_register = 0x10;
        }
    }

    fn prg_read(&self, board: &Board, addr: u16) -> u8 {
        // 512K boards route CHR bank bit 4 to PRG A18.
        let outer = if board.prg_rom.len() > 0x40000 {
            self.chr_bank0 as usize & 0x10
        } else {
            0
        };
        let bank = (self.prg_bank & 0x0F) as usize;
        let offset = addr as usize & 0x3FFF;
        let inner_last = (board.prg_banks(0x4000) - 1).min(0x0F);

        let bank16 = match (self.control >> 2) & 0x03 {
            0 | 1 => (bank & !1) | usize::from(addr >= 0xC000),
            2 => {
                if addr < 0xC000 {
                    0
                } else {
                    bank
                }
            }
            _ => {
                if addr < 0xC000 {
                    bank
                } else {
                    inner_last
                }
            }
        };
        board.read_prg(0x4000, outer | bank16, offset)
    }

    fn chr_index(&self, board: &Board, addr: u16) -> usize {
        let offset = addr as usize & 0x1FFF;
        if (self.control & 0x10) == 0 {
            board.chr_index(0x2000, (self.chr_bank0 as usize & 0x1E) >> 1, offset)
        } else if offset < 0x1000 {
            board.chr_index(0x1000, self.chr_bank0 as usize, offset)
        } else {
            board.chr_index(0x1000, self.chr_bank1 as usize, offset)
        }
    }

    fn mirroring(&self) -> Mirroring {
        match self.control & 0x03 {
            0 => Mirroring::OneScreenLower,
            1 => Mirroring::OneScreenUpper,
            2 => Mirroring::Vertical,
            _ => Mirroring::Horizontal,
        }
    }
}

#[derive(Debug, Clone)]
struct Mmc3 {
    bank_select: u8,
    bank_regs: [u8; 8],
    mirroring: Mirroring,
    four_screen: bool,
    prg_ram_enabled: bool,
    prg_ram_write_protect: bool,

    irq_latch: u8,
    irq_counter: u8,
    irq_reload: bool,
    irq_enabled: bool,
    irq_pending: bool,
    last_a12: bool,
    a12_low_cycles: u32,
    irq_clocks: u64,
}

impl Mmc3 {
    /// CPU cycles A12 must stay low before a rising edge clocks the counter.
    const A12_LOW_FILTER: u32 = 3;

    fn new(mirroring: Mirroring, four_screen: bool) -> Self {
        Self {
            bank_select: 0,
            bank_regs: [0, 2, 4, 5, 6, 7, 0, 1],
            mirroring,
            four_screen,
            prg_ram_enabled: true,
            prg_ram_write_protect: false,
            irq_latch: 0,
            irq_counter: 0,
            irq_reload: false,
            irq_enabled: false,
            irq_pending: false,
            last_a12: false,
            a12_low_cycles: 0,
            irq_clocks: 0,
        }
    }

    fn prg_read(&self, board: &Board, addr: u16) -> u8 {
        let swap_fixed = (self.bank_select & 0x40) != 0;
        let banks = board.prg_banks(0x2000);
        let last = banks - 1;
        let second_last = banks.saturating_sub(2);
        let r6 = (self.bank_regs[6] & 0x3F) as usize;
        let r7 = (self.bank_regs[7] & 0x3F) as usize;

        let bank = match addr {
            0x8000..=0x9FFF => {
                if swap_fixed {
                    second_last
                } else {
                    r6
                }
            }
            0xA000..=0xBFFF => r7,
            0xC000..=0xDFFF => {
                if swap_fixed {
                    r6
                } else {
                    second_last
                }
            }
            _ => last,
        };
        board.read_prg(0x2000, bank, addr as usize & 0x1FFF)
    }

    fn chr_index(&self, board: &Board, addr: u16) -> usize {
        let r = &self.bank_regs;
        let (r0, r1) = (r[0] & 0xFE, r[1] & 0xFE);
        let two_k = [r0, r0 | 1, r1, r1 | 1];
        let one_k = [r[2], r[3], r[4], r[5]];

        let slot = (addr as usize & 0x1FFF) / 0x0400;
        let inverted = (self.bank_select & 0x80) != 0;
        let bank = match (inverted, slot) {
            (false, 0..=3) => two_k[slot],
            (false, _) => one_k[slot - 4],
            (true, 0..=3) => one_k[slot],
            (true, _) => two_k[slot - 4],
        };
        board.chr_index(0x0400, bank as usize, addr as usize)
    }

    fn write_register(&mut self, addr: u16, value: u8) {
        let even = (addr & 1) == 0;
        match (addr, even) {
            (0x8000..=0x9FFF, true) => self.bank_select = value,
            (0x8000..=0x9FFF, false) => {
                let target = (self.bank_select & 0x07) as usize;
                self.bank_regs[target] = if target <= 1 { value & 0xFE } else { value };
            }
            (0xA000..=0xBFFF, true) => {
                if !self.four_screen {
                    self.mirroring = if (value & 1) == 0 {
                        Mirroring::Vertical
                    } else {
                        Mirroring::Horizontal
                    };
                }
            }
            (0xA000..=0xBFFF, false) => {
                self.prg_ram_enabled = (value & 0x80) != 0;
                self.prg_ram_write_protect = (value & 0x40) != 0;
            }
            (0xC000..=0xDFFF, true) => self.irq_latch = value,
            (0xC000..=0xDFFF, false) => {
                self.irq_counter = 0;
                self.irq_reload = true;
            }
            (0xE000..=0xFFFF, true) => {
                self.irq_enabled = false;
                self.irq_pending = false;
            }
            (0xE000..=0xFFFF, false) => self.irq_enabled = true,
            _ => {}
        }
    }

    fn clock_irq_counter(&mut self) {
        self.irq_clocks = self.irq_clocks.wrapping_add(1);
        if self.irq_counter == 0 || self.irq_reload {
            self.irq_counter = self.irq_latch;
            self.irq_reload = false;
        } else {
            self.irq_counter -= 1;
        }

        if self.irq_counter == 0 && self.irq_enabled {
            if !self.irq_pending {
                trace!(latch = self.irq_latch, "MMC3 IRQ asserted");
            }
            self.irq_pending = true;
        }
    }

    fn observe_ppu_addr(&mut self, addr: u16) {
        let a12 = (addr & 0x1000) != 0;
        if a12 {
            if !self.last_a12 && self.a12_low_cycles >= Self::A12_LOW_FILTER {
                self.clock_irq_counter();
            }
            self.a12_low_cycles = 0;
        }
        self.last_a12 = a12;
    }

    fn tick_cpu_cycle(&mut self) {
        if !self.last_a12 {
            self.a12_low_cycles = self.a12_low_cycles.saturating_add(1);
        }
    }
}

#[derive(Debug, Clone)]
enum Variant {
    Nrom,
    Mmc1(Mmc1),
    Uxrom { bank_select: u8 },
    Cnrom { chr_bank: u8 },
    Mmc3(Mmc3),
}

/// The cartridge board: one banking variant plus the memory it switches.
pub struct Mapper {
    id: u16,
    board: Board,
    variant: Variant,
}

impl Mapper {
    pub fn new(cart: Cartridge) -> Self {
        let id = cart.mapper_id;
        let variant = match id {
            0 => Variant::Nrom,
            1 => Variant::Mmc1(Mmc1::new()),
            2 => Variant::Uxrom { bank_select: 0 },
            3 => Variant::Cnrom { chr_bank: 0 },
            4 => Variant::Mmc3(Mmc3::new(cart.mirroring, cart.four_screen)),
            other => {
                warn!(mapper_id = other, "unsupported mapper, falling back to NROM");
                Variant::Nrom
            }
        };
        Self {
            id,
            board: Board::new(cart),
            variant,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        match self.variant {
            Variant::Nrom if self.id != 0 => mapper_name(self.id),
            Variant::Nrom => "NROM",
            Variant::Mmc1(_) => "MMC1",
            Variant::Uxrom { .. } => "UxROM",
            Variant::Cnrom { .. } => "CNROM",
            Variant::Mmc3(_) => "MMC3",
        }
    }

    /// CPU space `$4020-$FFFF`. Addresses below that read 0.
    pub fn cpu_read(&self, addr: u16) -> u8 {
        let board = &self.board;
        match addr {
            0x0000..=0x401F => 0,
            0x4020..=0x5FFF => match &self.variant {
                Variant::Mmc1(mmc1) if !mmc1.ram_enabled() => 0,
                _ => board.read_expansion(addr),
            },
            0x6000..=0x7FFF => match &self.variant {
                Variant::Mmc1(mmc1) if !mmc1.ram_enabled() => 0,
                Variant::Mmc3(mmc3) if !mmc3.prg_ram_enabled => 0,
                _ => board.read_prg_ram(addr),
            },
            0x8000..=0xFFFF => match &self.variant {
                Variant::Nrom | Variant::Cnrom { .. } => {
                    board.read_prg(0x8000, 0, addr as usize - 0x8000)
                }
                Variant::Mmc1(mmc1) => mmc1.prg_read(board, addr),
                Variant::Uxrom { bank_select } => {
                    let bank = if addr < 0xC000 {
                        *bank_select as usize
                    } else {
                        board.prg_banks(0x4000) - 1
                    };
                    board.read_prg(0x4000, bank, addr as usize)
                }
                Variant::Mmc3(mmc3) => mmc3.prg_read(board, addr),
            },
        }
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8) {
        let board = &mut self.board;
        match addr {
            0x0000..=0x401F => {}
            0x4020..=0x5FFF => match &self.variant {
                Variant::Mmc1(mmc1) if !mmc1.ram_enabled() => {}
                _ => board.write_expansion(addr, value),
            },
            0x6000..=0x7FFF => match &self.variant {
                Variant::Mmc1(mmc1) if !mmc1.ram_enabled() => {}
                Variant::Mmc3(mmc3) if !mmc3.prg_ram_enabled || mmc3.prg_ram_write_protect => {}
                _ => board.write_prg_ram(addr, value),
            },
            0x8000..=0xFFFF => match &mut self.variant {
                Variant::Nrom => {}
                Variant::Mmc1(mmc1) => mmc1.write_shift_register(addr, value),
                Variant::Uxrom { bank_select } => *bank_select = value & 0x0F,
                Variant::Cnrom { chr_bank } => *chr_bank = value & 0x03,
                Variant::Mmc3(mmc3) => mmc3.write_register(addr, value),
            },
        }
    }

    /// PPU space `$0000-$3EFF`: pattern tables and nametables.
    pub fn ppu_read(&self, addr: u16) -> u8 {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => self.board.read_chr(self.chr_index(addr)),
            0x2000..=0x3EFF => self.board.read_nametable(addr, self.mirroring()),
            _ => 0,
        }
    }

    pub fn ppu_write(&mut self, addr: u16, value: u8) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => {
                let idx = self.chr_index(addr);
                self.board.write_chr(idx, value);
            }
            0x2000..=0x3EFF => {
                let mirroring = self.mirroring();
                self.board.write_nametable(addr, value, mirroring);
            }
            _ => {}
        }
    }

    fn chr_index(&self, addr: u16) -> usize {
        let board = &self.board;
        match &self.variant {
            Variant::Nrom | Variant::Uxrom { .. } => board.chr_index(0x2000, 0, addr as usize),
            Variant::Cnrom { chr_bank } => board.chr_index(0x2000, *chr_bank as usize, addr as usize),
            Variant::Mmc1(mmc1) => mmc1.chr_index(board, addr),
            Variant::Mmc3(mmc3) => mmc3.chr_index(board, addr),
        }
    }

    pub fn mirroring(&self) -> Mirroring {
        match &self.variant {
            Variant::Mmc1(mmc1) => mmc1.mirroring(),
            Variant::Mmc3(mmc3) if mmc3.four_screen => Mirroring::FourScreen,
            Variant::Mmc3(mmc3) => mmc3.mirroring,
            _ => self.board.mirroring,
        }
    }

    /// Every PPU bus address, for boards that watch A12.
    pub fn observe_ppu_addr(&mut self, addr: u16) {
        if let Variant::Mmc3(mmc3) = &mut self.variant {
            mmc3.observe_ppu_addr(addr);
        }
    }

    pub fn tick_cpu_cycle(&mut self) {
        match &mut self.variant {
            Variant::Mmc1(mmc1) => mmc1.cpu_cycle = mmc1.cpu_cycle.wrapping_add(1),
            Variant::Mmc3(mmc3) => mmc3.tick_cpu_cycle(),
            _ => {}
        }
    }

    pub fn irq_pending(&self) -> bool {
        matches!(&self.variant, Variant::Mmc3(mmc3) if mmc3.irq_pending)
    }

    pub fn has_battery(&self) -> bool {
        self.board.has_battery
    }

    pub fn save_ram(&self) -> &[u8] {
        &self.board.prg_ram
    }

    pub fn load_save_ram(&mut self, data: &[u8]) {
        let len = data.len().min(self.board.prg_ram.len());
        self.board.prg_ram[..len].copy_from_slice(&data[..len]);
    }

    pub fn debug_state(&self) -> String {
        match &self.variant {
            Variant::Nrom => format!("{} mirroring={:?}", self.name(), self.mirroring()),
            Variant::Mmc1(m) => format!(
                "MMC1 control=${:02X} chr=[{:02X},{:02X}] prg=${:02X} shift=${:02X}",
                m.control, m.chr_bank0, m.chr_bank1, m.prg_bank, m.shift_register
            ),
            Variant::Uxrom { bank_select } => format!("UxROM bank=${bank_select:02X}"),
            Variant::Cnrom { chr_bank } => format!("CNROM chr=${chr_bank:02X}"),
            Variant::Mmc3(m) => format!(
                "MMC3 bank_select=${:02X} regs={:02X?} irq_latch=${:02X} irq_counter=${:02X} reload={} en={} pending={} a12_low={} irq_clocks={}",
                m.bank_select,
                m.bank_regs,
                m.irq_latch,
                m.irq_counter,
                m.irq_reload,
                m.irq_enabled,
                m.irq_pending,
                m.a12_low_cycles,
                m.irq_clocks
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::HeaderFormat;

    fn patterned_banks(total_size: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; total_size];
        for (bank, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill((bank as u8).wrapping_add(1));
        }
        data
    }

    fn make_cart(mapper_id: u16, prg_rom: Vec<u8>, chr_data: Vec<u8>, chr_is_ram: bool) -> Cartridge {
        Cartridge {
            format: HeaderFormat::INes,
            mapper_id,
            submapper_id: 0,
            mirroring: Mirroring::Horizontal,
            four_screen: false,
            has_battery_backed_ram: false,
            trainer: None,
            prg_rom,
            chr_data,
            chr_is_ram,
            prg_ram_size: 8 * 1024,
        }
    }

    fn mmc1_write(mapper: &mut Mapper, addr: u16, value: u8) {
        for bit in 0..5 {
            mapper.tick_cpu_cycle();
            mapper.tick_cpu_cycle();
            mapper.cpu_write(addr, (value >> bit) & 1);
        }
    }

    fn mmc3_cart() -> Cartridge {
        make_cart(
            4,
            patterned_banks(8 * 0x2000, 0x2000),
            patterned_banks(16 * 0x0400, 0x0400),
            false,
        )
    }

    fn a12_pulse(mapper: &mut Mapper, low_cycles: u32) {
        mapper.observe_ppu_addr(0x0000);
        for _ in 0..low_cycles {
            mapper.tick_cpu_cycle();
        }
        mapper.observe_ppu_addr(0x1000);
    }

    #[test]
    fn nrom_mirrors_single_prg_bank() {
        let mapper = Mapper::new(make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000], false));
        assert_eq!(mapper.cpu_read(0x8000), 1);
        assert_eq!(mapper.cpu_read(0xC123), 1);
        assert_eq!(mapper.cpu_read(0x4000), 0);
    }

    #[test]
    fn unknown_mapper_falls_back_to_nrom() {
        let mut mapper = Mapper::new(make_cart(99, patterned_banks(0x8000, 0x4000), vec![0; 0x2000], false));
        assert_eq!(mapper.id(), 99);
        mapper.cpu_write(0x8000, 1);
        assert_eq!(mapper.cpu_read(0x8000), 1);
        assert_eq!(mapper.cpu_read(0xC000), 2);
    }

    #[test]
    fn expansion_and_save_ram_are_writable() {
        let mut mapper = Mapper::new(make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000], false));
        mapper.cpu_write(0x4020, 0x11);
        mapper.cpu_write(0x5FFF, 0x22);
        mapper.cpu_write(0x6000, 0x33);
        assert_eq!(mapper.cpu_read(0x4020), 0x11);
        assert_eq!(mapper.cpu_read(0x5FFF), 0x22);
        assert_eq!(mapper.cpu_read(0x6000), 0x33);
    }

    #[test]
    fn trainer_lands_at_7000() {
        let mut cart = make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000], false);
        cart.trainer = Some((0..512).map(|i| (i & 0xFF) as u8).collect());
        let mapper = Mapper::new(cart);
        assert_eq!(mapper.cpu_read(0x7000), 0);
        assert_eq!(mapper.cpu_read(0x7005), 5);
        assert_eq!(mapper.cpu_read(0x71FF), 0xFF);
    }

    #[test]
    fn small_save_ram_mirrors_across_window() {
        let mut cart = make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000], false);
        cart.prg_ram_size = 0x800;
        let mut mapper = Mapper::new(cart);
        assert_eq!(mapper.save_ram().len(), 0x800);
        mapper.cpu_write(0x6010, 0x5A);
        assert_eq!(mapper.cpu_read(0x6810), 0x5A);
        assert_eq!(mapper.cpu_read(0x7810), 0x5A);

        let mut cart = make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000], false);
        cart.prg_ram_size = 32 * 1024;
        assert_eq!(Mapper::new(cart).save_ram().len(), 0x2000);
    }

    #[test]
    fn uxrom_keeps_last_bank_fixed() {
        let prg = patterned_banks(3 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(2, prg, vec![0; 0x2000], true));

        mapper.cpu_write(0x8000, 1);
        assert_eq!(mapper.cpu_read(0x8000), 2);
        assert_eq!(mapper.cpu_read(0xC000), 3);
    }

    #[test]
    fn cnrom_switches_chr_bank() {
        let prg = patterned_banks(0x8000, 0x4000);
        let chr = patterned_banks(4 * 0x2000, 0x2000);
        let mut mapper = Mapper::new(make_cart(3, prg, chr, false));

        mapper.cpu_write(0x8000, 0x06);
        assert_eq!(mapper.ppu_read(0x0000), 3);
        assert_eq!(mapper.cpu_read(0xC000), 2);
    }

    #[test]
    fn chr_rom_ignores_writes_chr_ram_accepts_them() {
        let prg = patterned_banks(0x8000, 0x4000);
        let mut rom_board = Mapper::new(make_cart(0, prg.clone(), vec![7; 0x2000], false));
        rom_board.ppu_write(0x0010, 0xAB);
        assert_eq!(rom_board.ppu_read(0x0010), 7);

        let mut ram_board = Mapper::new(make_cart(0, prg, vec![0; 0x2000], true));
        ram_board.ppu_write(0x0010, 0xAB);
        assert_eq!(ram_board.ppu_read(0x0010), 0xAB);
    }

    #[test]
    fn nametable_mirroring_modes() {
        assert_eq!(Mirroring::Horizontal.vram_index(0x2400), 0x000);
        assert_eq!(Mirroring::Horizontal.vram_index(0x2800), 0x400);
        assert_eq!(Mirroring::Vertical.vram_index(0x2800), 0x000);
        assert_eq!(Mirroring::Vertical.vram_index(0x2C05), 0x405);
        assert_eq!(Mirroring::OneScreenUpper.vram_index(0x2000), 0x400);
        assert_eq!(Mirroring::FourScreen.vram_index(0x2C00), 0xC00);
        assert_eq!(Mirroring::Vertical.vram_index(0x3000), 0x000);
    }

    #[test]
    fn nametable_round_trip_through_mirror() {
        let mut cart = make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000], false);
        cart.mirroring = Mirroring::Vertical;
        let mut mapper = Mapper::new(cart);
        mapper.ppu_write(0x2005, 0x5A);
        assert_eq!(mapper.ppu_read(0x2005), 0x5A);
        assert_eq!(mapper.ppu_read(0x2805), 0x5A);
        assert_eq!(mapper.ppu_read(0x3005), 0x5A);
        assert_eq!(mapper.ppu_read(0x2405), 0x00);
    }

    #[test]
    fn mmc1_prg_modes() {
        let prg = patterned_banks(8 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(1, prg, vec![0; 0x2000], true));

        // Power-on: mode 3, last bank fixed at $C000.
        assert_eq!(mapper.cpu_read(0xC000), 8);
        mmc1_write(&mut mapper, 0xE000, 0x02);
        assert_eq!(mapper.cpu_read(0x8000), 3);

        // Mode 2: first bank fixed at $8000, switch $C000.
        mmc1_write(&mut mapper, 0x8000, 0x08);
        assert_eq!(mapper.cpu_read(0x8000), 1);
        assert_eq!(mapper.cpu_read(0xC000), 3);

        // Mode 0: 32K ignoring bit 0.
        mmc1_write(&mut mapper, 0x8000, 0x00);
        mmc1_write(&mut mapper, 0xE000, 0x05);
        assert_eq!(mapper.cpu_read(0x8000), 5);
        assert_eq!(mapper.cpu_read(0xC000), 6);
    }

    #[test]
    fn mmc1_mirroring_and_reset_bit() {
        let prg = patterned_banks(2 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(1, prg, vec![0; 0x2000], true));
        mmc1_write(&mut mapper, 0x8000, 0x02);
        assert_eq!(mapper.mirroring(), Mirroring::Vertical);
        mmc1_write(&mut mapper, 0x8000, 0x01);
        assert_eq!(mapper.mirroring(), Mirroring::OneScreenUpper);

        // Partial load then reset discards the shift register.
        mapper.tick_cpu_cycle();
        mapper.tick_cpu_cycle();
        mapper.cpu_write(0x8000, 0x01);
        mapper.tick_cpu_cycle();
        mapper.tick_cpu_cycle();
        mapper.cpu_write(0x8000, 0x80);
        mmc1_write(&mut mapper, 0x8000, 0x0F);
        assert_eq!(mapper.mirroring(), Mirroring::Horizontal);
    }

    #[test]
    fn mmc1_ignores_back_to_back_serial_writes() {
        let prg = patterned_banks(8 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(1, prg, vec![0; 0x2000], true));
        mapper.tick_cpu_cycle();
        mapper.cpu_write(0xE000, 0x01);
        mapper.cpu_write(0xE000, 0x00);
        for _ in 0..4 {
            mapper.tick_cpu_cycle();
            mapper.tick_cpu_cycle();
            mapper.cpu_write(0xE000, 0x00);
        }
        assert_eq!(mapper.cpu_read(0x8000), 2);
    }

    #[test]
    fn mmc1_ram_disable_gates_expansion_and_save_ram() {
        let prg = patterned_banks(2 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(1, prg, vec![0; 0x2000], true));
        mapper.cpu_write(0x6000, 0x12);
        mapper.cpu_write(0x5000, 0x34);

        mmc1_write(&mut mapper, 0xE000, 0x10);
        assert_eq!(mapper.cpu_read(0x6000), 0);
        assert_eq!(mapper.cpu_read(0x5000), 0);
        mapper.cpu_write(0x6000, 0xFF);
        mapper.cpu_write(0x5000, 0xFF);

        mmc1_write(&mut mapper, 0xE000, 0x00);
        assert_eq!(mapper.cpu_read(0x6000), 0x12);
        assert_eq!(mapper.cpu_read(0x5000), 0x34);
    }

    #[test]
    fn mmc1_chr_4k_mode() {
        let prg = patterned_banks(2 * 0x4000, 0x4000);
        let chr = patterned_banks(8 * 0x1000, 0x1000);
        let mut mapper = Mapper::new(make_cart(1, prg, chr, false));
        mmc1_write(&mut mapper, 0x8000, 0x1C);
        mmc1_write(&mut mapper, 0xA000, 0x03);
        mmc1_write(&mut mapper, 0xC000, 0x05);
        assert_eq!(mapper.ppu_read(0x0000), 4);
        assert_eq!(mapper.ppu_read(0x1000), 6);
    }

    #[test]
    fn mmc3_prg_mode_swaps_fixed_slot() {
        let mut mapper = Mapper::new(mmc3_cart());
        mapper.cpu_write(0x8000, 0x06);
        mapper.cpu_write(0x8001, 0x02);
        mapper.cpu_write(0x8000, 0x07);
        mapper.cpu_write(0x8001, 0x03);

        assert_eq!(mapper.cpu_read(0x8000), 3);
        assert_eq!(mapper.cpu_read(0xA000), 4);
        assert_eq!(mapper.cpu_read(0xC000), 7);
        assert_eq!(mapper.cpu_read(0xE000), 8);

        mapper.cpu_write(0x8000, 0x46);
        assert_eq!(mapper.cpu_read(0x8000), 7);
        assert_eq!(mapper.cpu_read(0xC000), 3);
        assert_eq!(mapper.cpu_read(0xE000), 8);
    }

    #[test]
    fn mmc3_chr_inversion() {
        let mut mapper = Mapper::new(mmc3_cart());
        mapper.cpu_write(0x8000, 0x00);
        mapper.cpu_write(0x8001, 0x05);
        mapper.cpu_write(0x8000, 0x02);
        mapper.cpu_write(0x8001, 0x09);

        assert_eq!(mapper.ppu_read(0x0000), 5);
        assert_eq!(mapper.ppu_read(0x0400), 6);
        assert_eq!(mapper.ppu_read(0x1000), 10);

        mapper.cpu_write(0x8000, 0x80);
        assert_eq!(mapper.ppu_read(0x0000), 10);
        assert_eq!(mapper.ppu_read(0x1000), 5);
        assert_eq!(mapper.ppu_read(0x1400), 6);
    }

    #[test]
    fn mmc3_save_ram_protect() {
        let mut mapper = Mapper::new(mmc3_cart());
        mapper.cpu_write(0xA001, 0x80);
        mapper.cpu_write(0x6000, 0xAA);
        assert_eq!(mapper.cpu_read(0x6000), 0xAA);

        mapper.cpu_write(0xA001, 0xC0);
        mapper.cpu_write(0x6000, 0x55);
        assert_eq!(mapper.cpu_read(0x6000), 0xAA);

        mapper.cpu_write(0xA001, 0x00);
        assert_eq!(mapper.cpu_read(0x6000), 0);
    }

    #[test]
    fn mmc3_four_screen_ignores_mirroring_writes() {
        let mut cart = mmc3_cart();
        cart.four_screen = true;
        cart.mirroring = Mirroring::FourScreen;
        let mut mapper = Mapper::new(cart);
        mapper.cpu_write(0xA000, 0x01);
        assert_eq!(mapper.mirroring(), Mirroring::FourScreen);
    }

    #[test]
    fn mmc3_irq_a12_edge_filtering() {
        let mut mapper = Mapper::new(mmc3_cart());
        mapper.cpu_write(0xC000, 0x01);
        mapper.cpu_write(0xC001, 0x00);
        mapper.cpu_write(0xE001, 0x00);

        // Too short a low period: filtered.
        a12_pulse(&mut mapper, 2);
        assert!(!mapper.irq_pending());

        // Reload from latch.
        a12_pulse(&mut mapper, 3);
        assert!(!mapper.irq_pending());

        // Decrement to zero raises the IRQ.
        a12_pulse(&mut mapper, 3);
        assert!(mapper.irq_pending());

        mapper.cpu_write(0xE000, 0x00);
        assert!(!mapper.irq_pending());
    }

    #[test]
    fn mmc3_disabled_irq_still_counts() {
        let mut mapper = Mapper::new(mmc3_cart());
        mapper.cpu_write(0xC000, 0x02);
        mapper.cpu_write(0xC001, 0x00);
        for _ in 0..3 {
            a12_pulse(&mut mapper, 4);
        }
        assert!(!mapper.irq_pending());
        assert!(mapper.debug_state().contains("irq_clocks=3"));
    }
}
