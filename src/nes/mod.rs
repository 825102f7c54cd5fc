pub mod apu;
pub mod bitfield;
pub mod bus;
pub mod cartridge;
pub mod cpu;
pub mod io;
pub mod mapper;
pub mod opcodes;
mod palette;
pub mod ppu;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, path::Path};
use tracing::{debug, info, trace};

use apu::{Apu, DEFAULT_SAMPLE_RATE, NTSC_CPU_CLOCK_HZ};
use bus::{Bus, BusDebugCounters};
use cartridge::Cartridge;
use cpu::{Cpu, CpuState};
use io::{AudioSink, ControllerSource, DisplaySink, NullAudio, NullDisplay};
use mapper::Mapper;
use ppu::{DOTS_PER_SCANLINE, Ppu, PpuDebugCounters, SCANLINES_PER_FRAME};

const MAX_DEBUG_EVENTS: usize = 512;
const PPU_DOTS_PER_CPU_CYCLE: u8 = 3;
/// Longest instruction plus a full OAM DMA, in dots.
const STEP_GUARD_DOTS: u64 = 4 * 1024 * 3;
const FRAME_GUARD_DOTS: u64 = 2 * DOTS_PER_SCANLINE as u64 * SCANLINES_PER_FRAME as u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub sample_rate: u32,
    pub cpu_clock_hz: f64,
    /// Hardware-style high/low-pass output filtering.
    pub output_filters: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            cpu_clock_hz: NTSC_CPU_CLOCK_HZ,
            output_filters: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NesDebugCounters {
    pub ppu_dots: u64,
    pub cpu_cycles: u64,
    pub dma_cycles: u64,
    pub apu_ticks: u64,
    pub frames: u64,
    pub nmi_edges: u64,
    pub irq_assertions: u64,
    pub samples: u64,
}

pub struct Nes {
    config: EmulatorConfig,
    cpu: Cpu,
    bus: Option<Bus>,
    display: Box<dyn DisplaySink>,
    audio: Box<dyn AudioSink>,
    detached_input: Option<Box<dyn ControllerSource>>,

    mapper_name: String,
    mapper_id: Option<u16>,

    cpu_phase: u8,
    irq_line: bool,
    debug: NesDebugCounters,
    debug_events: VecDeque<String>,
}

impl Default for Nes {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

impl Nes {
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            config,
            cpu: Cpu::new(),
            bus: None,
            display: Box::new(NullDisplay),
            audio: Box::new(NullAudio),
            detached_input: None,
            mapper_name: "No ROM loaded".to_string(),
            mapper_id: None,
            cpu_phase: 0,
            irq_line: false,
            debug: NesDebugCounters::default(),
            debug_events: VecDeque::with_capacity(MAX_DEBUG_EVENTS),
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn set_display_sink(&mut self, sink: Box<dyn DisplaySink>) {
        self.display = sink;
    }

    pub fn set_audio_sink(&mut self, sink: Box<dyn AudioSink>) {
        self.audio = sink;
    }

    pub fn set_controller_source(&mut self, source: Box<dyn ControllerSource>) {
        match self.bus.as_mut() {
            Some(bus) => bus.set_controller_source(source),
            None => self.detached_input = Some(source),
        }
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn mapper_id(&self) -> Option<u16> {
        self.mapper_id
    }

    pub fn has_rom(&self) -> bool {
        self.bus.is_some()
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path)?;
        self.load_cartridge(cart);
        Ok(())
    }

    pub fn load_rom_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let cart = Cartridge::from_bytes(bytes).context("failed to parse ROM image")?;
        self.load_cartridge(cart);
        Ok(())
    }

    pub fn load_cartridge(&mut self, cart: Cartridge) {
        let mapper = Mapper::new(cart);
        let mapper_id = mapper.id();
        self.mapper_name = format!("{} (mapper {mapper_id})", mapper.name());
        self.mapper_id = Some(mapper_id);
        info!(
            mapper_id,
            mapper = mapper.name(),
            mirroring = ?mapper.mirroring(),
            battery = mapper.has_battery(),
            "cartridge loaded"
        );

        let mut apu = Apu::new();
        apu.set_cpu_clock_hz(self.config.cpu_clock_hz);
        apu.set_sample_rate(self.config.sample_rate);
        apu.set_output_filters(self.config.output_filters);

        let input = match self.bus.take() {
            Some(old) => Some(old.into_controller_source()),
            None => self.detached_input.take(),
        };
        let mut bus = Bus::new(mapper, Ppu::new(), apu);
        if let Some(input) = input {
            bus.set_controller_source(input);
        }
        self.bus = Some(bus);
        self.reset();
        let event = format!("ROM loaded: {}", self.mapper_name);
        self.push_debug_event(event);
    }

    /// Reset line: every component returns to its power-on state and the
    /// CPU reloads PC from `$FFFC`.
    pub fn reset(&mut self) {
        let Some(bus) = self.bus.as_mut() else {
            return;
        };
        bus.reset();
        self.cpu.reset(bus);
        self.cpu_phase = 0;
        self.irq_line = false;
        self.debug = NesDebugCounters::default();
        self.debug_events.clear();
        info!(pc = format_args!("${:04X}", self.cpu.pc), "reset");
        let event = format!("CPU reset, PC=${:04X}", self.cpu.pc);
        self.push_debug_event(event);
    }

    /// Advance one master-clock tick (one PPU dot). Every third tick is also
    /// a CPU cycle. Returns whether the CPU itself ran on this tick.
    pub fn tick(&mut self) -> bool {
        let Some(bus) = self.bus.as_mut() else {
            return false;
        };
        let mut cpu_ran = false;

        if self.cpu_phase == 0 {
            if bus.dma_active() {
                bus.dma_tick();
                self.debug.dma_cycles = self.debug.dma_cycles.wrapping_add(1);
            } else {
                self.cpu.tick(bus);
                cpu_ran = true;
            }
            bus.end_cpu_cycle();
            self.debug.cpu_cycles = self.debug.cpu_cycles.wrapping_add(1);
            self.debug.apu_ticks = self.debug.apu_ticks.wrapping_add(1);

            if bus.ppu.take_nmi() {
                self.cpu.nmi();
                self.debug.nmi_edges = self.debug.nmi_edges.wrapping_add(1);
                let (scanline, dot) = bus.ppu.position();
                push_event(
                    &mut self.debug_events,
                    format!("PPU NMI edge at scanline/dot ({scanline}, {dot})"),
                );
            }

            let irq = bus.irq_line();
            if irq && !self.irq_line {
                self.debug.irq_assertions = self.debug.irq_assertions.wrapping_add(1);
                let source = if bus.mapper.irq_pending() {
                    "Mapper"
                } else {
                    "APU"
                };
                trace!(source, cycle = bus.cycles(), "IRQ asserted");
                push_event(
                    &mut self.debug_events,
                    format!("{source} IRQ pending at CPU cycle {}", bus.cycles()),
                );
            }
            self.irq_line = irq;
            self.cpu.irq(irq);

            for sample in bus.apu.drain_samples() {
                self.audio.push_sample(sample);
                self.debug.samples = self.debug.samples.wrapping_add(1);
            }
            for event in bus.take_events() {
                push_event(&mut self.debug_events, event);
            }
        }
        self.cpu_phase = (self.cpu_phase + 1) % PPU_DOTS_PER_CPU_CYCLE;

        bus.ppu.tick(&mut bus.mapper);
        self.debug.ppu_dots = self.debug.ppu_dots.wrapping_add(1);
        if bus.ppu.frame_complete() {
            bus.ppu.clear_frame_complete();
            self.display.present(bus.ppu.frame_buffer());
            self.debug.frames = self.debug.frames.wrapping_add(1);
        }

        cpu_ran
    }

    /// Runs master ticks until the CPU finishes an instruction (or interrupt
    /// entry). DMA stalls along the way are included.
    pub fn step_instruction(&mut self) {
        if self.bus.is_none() {
            return;
        }
        for _ in 0..STEP_GUARD_DOTS {
            if self.tick() && self.cpu.instruction_done() {
                return;
            }
        }
        self.push_debug_event("Instruction guard tripped");
    }

    /// Runs until the next frame has been handed to the display sink.
    pub fn run_frame(&mut self) {
        if self.bus.is_none() {
            return;
        }
        let start = self.debug.frames;
        for _ in 0..FRAME_GUARD_DOTS {
            self.tick();
            if self.debug.frames != start {
                return;
            }
        }
        debug!("frame guard tripped");
        self.push_debug_event("Frame guard tripped");
    }

    pub fn frame_buffer(&self) -> Option<&[u8]> {
        self.bus.as_ref().map(|bus| bus.ppu.frame_buffer())
    }

    pub fn cpu_state(&self) -> CpuState {
        self.cpu.state()
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn bus(&self) -> Option<&Bus> {
        self.bus.as_ref()
    }

    /// CPU-space read without side effects.
    pub fn peek_cpu(&self, addr: u16) -> u8 {
        self.bus.as_ref().map_or(0, |bus| bus.peek(addr))
    }

    /// PPU-space read without side effects.
    pub fn peek_ppu(&self, addr: u16) -> u8 {
        self.bus.as_ref().map_or(0, |bus| bus.ppu_peek(addr))
    }

    /// `(scanline, dot, frame)` of the next dot the PPU will run.
    pub fn ppu_position(&self) -> (u16, u16, u64) {
        self.bus.as_ref().map_or((0, 0, 0), |bus| {
            let (scanline, dot) = bus.ppu.position();
            (scanline, dot, bus.ppu.frame_count())
        })
    }

    pub fn has_battery(&self) -> bool {
        self.bus.as_ref().is_some_and(|bus| bus.mapper.has_battery())
    }

    pub fn save_ram(&self) -> Option<&[u8]> {
        self.bus.as_ref().map(|bus| bus.mapper.save_ram())
    }

    pub fn load_save_ram(&mut self, data: &[u8]) {
        if let Some(bus) = self.bus.as_mut() {
            bus.mapper.load_save_ram(data);
        }
    }

    pub fn debug_counters(&self) -> NesDebugCounters {
        self.debug
    }

    pub fn debug_ppu_counters(&self) -> PpuDebugCounters {
        self.bus
            .as_ref()
            .map(|bus| bus.ppu.debug_counters())
            .unwrap_or_default()
    }

    pub fn debug_bus_counters(&self) -> BusDebugCounters {
        self.bus
            .as_ref()
            .map(|bus| bus.debug_counters())
            .unwrap_or_default()
    }

    pub fn debug_mapper_state(&self) -> String {
        match self.bus.as_ref() {
            Some(bus) => bus.mapper.debug_state(),
            None => "No mapper".to_string(),
        }
    }

    pub fn debug_events(&self) -> &VecDeque<String> {
        &self.debug_events
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        self.debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn clear_debug_events(&mut self) {
        self.debug_events.clear();
    }

    fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        push_event(&mut self.debug_events, event.into());
    }
}

fn push_event(events: &mut VecDeque<String>, event: String) {
    if events.len() >= MAX_DEBUG_EVENTS {
        events.pop_front();
    }
    events.push_back(event);
}
