use tracing::trace;

use super::apu::Apu;
use super::cpu::CpuBus;
use super::io::{Buttons, ControllerSource};
use super::mapper::{EXPANSION_START, Mapper};
use super::ppu::{Ppu, palette_index_for};

pub const RAM_SIZE: usize = 0x0800;
pub const OAM_DMA_REGISTER: u16 = 0x4014;
pub const DMC_STALL_CYCLES: u8 = 4;

const CONTROLLER_OPEN_BUS: u8 = 0x40;

#[derive(Debug, Clone, Copy, Default)]
pub struct BusDebugCounters {
    pub cpu_reads: u64,
    pub cpu_writes: u64,
    pub oam_dma_transfers: u64,
    pub dma_cycles: u64,
    pub dmc_fetches: u64,
    pub dmc_stall_cycles: u64,
    pub last_dma_page: u8,
    pub last_dma_length: u16,
}

/// 256-byte copy into OAM: idle/alignment cycles, then a read and a write
/// per byte.
#[derive(Debug, Clone, Copy)]
struct OamDma {
    page: u8,
    idle: u8,
    index: u16,
    latch: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ControllerPort {
    shift: u8,
}

impl ControllerPort {
    fn read(&mut self, strobe: bool, live: u8) -> u8 {
        let bit = if strobe {
            live >> 7
        } else {
            let out = self.shift >> 7;
            self.shift = (self.shift << 1) | 0x01;
            out
        };
        CONTROLLER_OPEN_BUS | (bit & 0x01)
    }
}

/// The CPU's view of the machine: RAM, the PPU and APU register windows,
/// the controller ports and the cartridge.
pub struct Bus {
    ram: [u8; RAM_SIZE],
    pub ppu: Ppu,
    pub apu: Apu,
    pub mapper: Mapper,
    input: Box<dyn ControllerSource>,
    ports: [ControllerPort; 2],
    strobe: bool,
    oam_dma: Option<OamDma>,
    dmc_stall: u8,
    cycles: u64,
    events: Vec<String>,
    debug: BusDebugCounters,
}

impl Bus {
    pub fn new(mapper: Mapper, ppu: Ppu, apu: Apu) -> Self {
        Self {
            ram: [0; RAM_SIZE],
            ppu,
            apu,
            mapper,
            input: Box::new(Buttons::default()),
            ports: [ControllerPort::default(); 2],
            strobe: false,
            oam_dma: None,
            dmc_stall: 0,
            cycles: 0,
            events: Vec::new(),
            debug: BusDebugCounters::default(),
        }
    }

    pub fn set_controller_source(&mut self, source: Box<dyn ControllerSource>) {
        self.input = source;
    }

    pub fn into_controller_source(self) -> Box<dyn ControllerSource> {
        self.input
    }

    /// Reset line. RAM keeps its contents as on hardware.
    pub fn reset(&mut self) {
        self.ppu.reset();
        self.apu.reset();
        self.ports = [ControllerPort::default(); 2];
        self.strobe = false;
        self.oam_dma = None;
        self.dmc_stall = 0;
        self.cycles = 0;
    }

    /// CPU cycles elapsed, DMA stalls included.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn debug_counters(&self) -> BusDebugCounters {
        self.debug
    }

    pub fn take_events(&mut self) -> Vec<String> {
        std::mem::take(&mut self.events)
    }

    pub fn irq_line(&self) -> bool {
        self.mapper.irq_pending() || self.apu.irq_pending()
    }

    /// True while the CPU is locked out of the bus by OAM DMA or a DMC fetch.
    pub fn dma_active(&self) -> bool {
        self.oam_dma.is_some() || self.dmc_stall > 0
    }

    /// One stalled CPU cycle.
    pub fn dma_tick(&mut self) {
        self.debug.dma_cycles = self.debug.dma_cycles.wrapping_add(1);
        if self.dmc_stall > 0 {
            self.dmc_stall -= 1;
            return;
        }
        let Some(mut dma) = self.oam_dma.take() else {
            return;
        };
        if dma.idle > 0 {
            dma.idle -= 1;
        } else if let Some(value) = dma.latch.take() {
            self.ppu.write_oam_data(value);
            dma.index += 1;
            if dma.index == 256 {
                return;
            }
        } else {
            let addr = ((dma.page as u16) << 8) | dma.index;
            dma.latch = Some(self.cpu_read(addr));
        }
        self.oam_dma = Some(dma);
    }

    /// Work that follows every CPU phase: APU clock, DMC fetch, mapper
    /// cycle counter.
    pub fn end_cpu_cycle(&mut self) {
        self.apu.tick();
        if let Some(addr) = self.apu.take_dmc_dma_request() {
            let value = self.dmc_read(addr);
            self.apu.complete_dmc_dma(value);
            self.dmc_stall = self.dmc_stall.saturating_add(DMC_STALL_CYCLES);
            self.debug.dmc_fetches = self.debug.dmc_fetches.wrapping_add(1);
            self.debug.dmc_stall_cycles = self
                .debug
                .dmc_stall_cycles
                .wrapping_add(DMC_STALL_CYCLES as u64);
        }
        self.mapper.tick_cpu_cycle();
        self.cycles += 1;
    }

    fn dmc_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & (RAM_SIZE - 1)],
            EXPANSION_START..=0xFFFF => self.mapper.cpu_read(addr),
            _ => 0,
        }
    }

    fn start_oam_dma(&mut self, page: u8) {
        // One idle cycle, plus one to align when starting on an odd cycle.
        let idle = 1 + (self.cycles & 0x01) as u8;
        self.oam_dma = Some(OamDma {
            page,
            idle,
            index: 0,
            latch: None,
        });
        let length = 512 + idle as u16;
        self.debug.oam_dma_transfers = self.debug.oam_dma_transfers.wrapping_add(1);
        self.debug.last_dma_page = page;
        self.debug.last_dma_length = length;
        trace!(page, length, cycle = self.cycles, "OAM DMA start");
        self.events.push(format!(
            "OAM DMA page=${page:02X} cycle={} stall_cycles={length}",
            self.cycles
        ));
    }

    fn write_strobe(&mut self, value: u8) {
        let strobe = (value & 0x01) != 0;
        if self.strobe && !strobe {
            for (port, state) in self.ports.iter_mut().enumerate() {
                state.shift = self.input.buttons(port);
            }
        }
        self.strobe = strobe;
    }

    fn read_controller(&mut self, port: usize) -> u8 {
        let live = if self.strobe {
            self.input.buttons(port)
        } else {
            0
        };
        self.ports[port].read(self.strobe, live)
    }

    /// Side-effect-free read for debuggers.
    pub fn peek(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & (RAM_SIZE - 1)],
            0x2000..=0x3FFF => self.ppu.peek_register(0x2000 | (addr & 0x0007)),
            0x4015 => self.apu.peek_status(),
            0x4016 => CONTROLLER_OPEN_BUS | (self.ports[0].shift >> 7),
            0x4017 => CONTROLLER_OPEN_BUS | (self.ports[1].shift >> 7),
            0x4000..=0x401F => 0,
            _ => self.mapper.cpu_read(addr),
        }
    }

    /// PPU address space as the PPU sees it, without notifying the mapper.
    pub fn ppu_peek(&self, addr: u16) -> u8 {
        let addr = addr & 0x3FFF;
        if addr >= 0x3F00 {
            self.ppu.debug_peek_palette(palette_index_for(addr))
        } else {
            self.mapper.ppu_read(addr)
        }
    }
}

impl CpuBus for Bus {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        self.debug.cpu_reads = self.debug.cpu_reads.wrapping_add(1);
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & (RAM_SIZE - 1)],
            0x2000..=0x3FFF => self
                .ppu
                .cpu_read_register(0x2000 | (addr & 0x0007), &mut self.mapper),
            0x4015 => self.apu.read_status(),
            0x4016 => self.read_controller(0),
            0x4017 => self.read_controller(1),
            0x4000..=0x401F => 0,
            _ => self.mapper.cpu_read(addr),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        self.debug.cpu_writes = self.debug.cpu_writes.wrapping_add(1);
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & (RAM_SIZE - 1)] = value,
            0x2000..=0x3FFF => {
                self.ppu
                    .cpu_write_register(0x2000 | (addr & 0x0007), value, &mut self.mapper)
            }
            OAM_DMA_REGISTER => self.start_oam_dma(value),
            0x4016 => self.write_strobe(value),
            0x4000..=0x4013 | 0x4015 | 0x4017 => self.apu.write_register(addr, value),
            0x4018..=0x401F => {}
            _ => self.mapper.cpu_write(addr, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::{Cartridge, tests::ines_image};
    use crate::nes::io::{BUTTON_A, BUTTON_START};

    fn nrom_bus() -> Bus {
        let cart = Cartridge::from_bytes(&ines_image(0, 2, 1, 0)).unwrap();
        Bus::new(Mapper::new(cart), Ppu::new(), Apu::new())
    }

    fn run_dma(bus: &mut Bus) -> u32 {
        let mut cycles = 0;
        while bus.dma_active() {
            bus.dma_tick();
            bus.end_cpu_cycle();
            cycles += 1;
        }
        cycles
    }

    #[test]
    fn ram_is_mirrored_every_2k() {
        let mut bus = nrom_bus();
        bus.cpu_write(0x0001, 0x5A);
        assert_eq!(bus.cpu_read(0x0801), 0x5A);
        assert_eq!(bus.cpu_read(0x1801), 0x5A);
        bus.cpu_write(0x1FFF, 0x77);
        assert_eq!(bus.cpu_read(0x07FF), 0x77);
    }

    #[test]
    fn ppu_registers_mirror_through_3fff() {
        let mut bus = nrom_bus();
        // $3FFE/$3FFF alias PPUADDR/PPUDATA.
        bus.cpu_write(0x3FFE, 0x3F);
        bus.cpu_write(0x3FFE, 0x01);
        bus.cpu_write(0x3FFF, 0x2C);
        assert_eq!(bus.ppu_peek(0x3F01), 0x2C);
        bus.cpu_write(0x2006, 0x3F);
        bus.cpu_write(0x2006, 0x01);
        assert_eq!(bus.cpu_read(0x200F) & 0x3F, 0x2C);
    }

    #[test]
    fn cartridge_space_reaches_the_mapper() {
        let mut bus = nrom_bus();
        assert_eq!(bus.cpu_read(0x8000), 0xEA);
        assert_eq!(bus.cpu_read(0xFFFF), 0xEA);
        bus.cpu_write(0x6000, 0x42);
        assert_eq!(bus.cpu_read(0x6000), 0x42);
    }

    #[test]
    fn unmapped_io_reads_zero_and_ignores_writes() {
        let mut bus = nrom_bus();
        bus.cpu_write(0x4018, 0xFF);
        assert_eq!(bus.cpu_read(0x4018), 0);
        assert_eq!(bus.cpu_read(0x4000), 0);
    }

    #[test]
    fn controller_shifts_out_msb_first() {
        let mut bus = nrom_bus();
        let buttons = Buttons::default();
        buttons.set(0, BUTTON_A | BUTTON_START);
        bus.set_controller_source(Box::new(buttons.clone()));

        bus.cpu_write(0x4016, 1);
        bus.cpu_write(0x4016, 0);
        let bits: Vec<u8> = (0..10).map(|_| bus.cpu_read(0x4016) & 0x01).collect();
        assert_eq!(bits, vec![1, 0, 0, 1, 0, 0, 0, 0, 1, 1]);
        assert_eq!(bus.cpu_read(0x4017), 0x40);
    }

    #[test]
    fn strobe_high_reports_a_button() {
        let mut bus = nrom_bus();
        let buttons = Buttons::default();
        bus.set_controller_source(Box::new(buttons.clone()));
        bus.cpu_write(0x4016, 1);
        assert_eq!(bus.cpu_read(0x4016), 0x40);
        buttons.set(0, BUTTON_A);
        assert_eq!(bus.cpu_read(0x4016), 0x41);
        assert_eq!(bus.cpu_read(0x4016), 0x41);
    }

    #[test]
    fn oam_dma_takes_513_cycles_on_even_start() {
        let mut bus = nrom_bus();
        for i in 0..256u16 {
            bus.cpu_write(0x0200 + i, i as u8);
        }
        assert_eq!(bus.cycles() % 2, 0);
        bus.cpu_write(OAM_DMA_REGISTER, 0x02);
        assert_eq!(run_dma(&mut bus), 513);
        assert_eq!(bus.ppu.debug_peek_oam(0), 0);
        assert_eq!(bus.ppu.debug_peek_oam(5), 5);
        assert_eq!(bus.ppu.debug_peek_oam(255), 255);
        assert_eq!(bus.debug_counters().last_dma_length, 513);
    }

    #[test]
    fn oam_dma_takes_514_cycles_on_odd_start() {
        let mut bus = nrom_bus();
        bus.end_cpu_cycle();
        assert_eq!(bus.cycles() % 2, 1);
        bus.cpu_write(OAM_DMA_REGISTER, 0x03);
        assert_eq!(run_dma(&mut bus), 514);
    }

    #[test]
    fn dmc_fetch_stalls_four_cycles() {
        let mut bus = nrom_bus();
        // Rate 0, sample at $C000, one byte, then enable.
        bus.cpu_write(0x4010, 0x00);
        bus.cpu_write(0x4012, 0x00);
        bus.cpu_write(0x4013, 0x00);
        bus.cpu_write(0x4015, 0x10);
        for _ in 0..8 {
            if bus.dma_active() {
                break;
            }
            bus.end_cpu_cycle();
        }
        assert!(bus.dma_active());
        assert_eq!(run_dma(&mut bus), 4);
        assert_eq!(bus.debug_counters().dmc_fetches, 1);
    }

    #[test]
    fn peek_has_no_side_effects() {
        let mut bus = nrom_bus();
        let buttons = Buttons::default();
        buttons.set(0, BUTTON_A);
        bus.set_controller_source(Box::new(buttons));
        bus.cpu_write(0x4016, 1);
        bus.cpu_write(0x4016, 0);
        assert_eq!(bus.peek(0x4016), 0x41);
        assert_eq!(bus.peek(0x4016), 0x41);
        assert_eq!(bus.cpu_read(0x4016), 0x41);
        assert_eq!(bus.peek(0x4016), 0x40);
    }
}
