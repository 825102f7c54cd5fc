use std::{f32::consts::PI, sync::OnceLock};

use super::bitfield::{Field, RegisterFile};

pub const NTSC_CPU_CLOCK_HZ: f64 = 1_789_773.0;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 1, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 1, 0, 0, 0],
    [1, 0, 0, 1, 1, 1, 1, 1],
];

const TRI_TABLE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_RATE_TABLE: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

const FC_4STEP_Q1: u32 = 7_457;
const FC_4STEP_Q2_H2: u32 = 14_913;
const FC_4STEP_Q3: u32 = 22_371;
const FC_4STEP_Q4_H4_IRQ: u32 = 29_829;
const FC_4STEP_RESET: u32 = 29_830;

const FC_5STEP_Q1: u32 = 7_457;
const FC_5STEP_Q2_H2: u32 = 14_913;
const FC_5STEP_Q3: u32 = 22_371;
const FC_5STEP_Q4_H4: u32 = 37_281;
const FC_5STEP_RESET: u32 = 37_282;

// $4000-$4003 / $4004-$4007
const PULSE_DUTY: Field = Field::new(0, 0, 2);
const PULSE_HALT: Field = Field::new(0, 2, 1);
const PULSE_CONSTANT: Field = Field::new(0, 3, 1);
const PULSE_VOLUME: Field = Field::new(0, 4, 4);
const SWEEP_ENABLE: Field = Field::new(1, 0, 1);
const SWEEP_PERIOD: Field = Field::new(1, 1, 3);
const SWEEP_NEGATE: Field = Field::new(1, 4, 1);
const SWEEP_SHIFT: Field = Field::new(1, 5, 3);
const TIMER_LOW: Field = Field::new(2, 0, 8);
const LENGTH_LOAD: Field = Field::new(3, 0, 5);
const TIMER_HIGH: Field = Field::new(3, 5, 3);

// $4008-$400B
const TRI_CONTROL: Field = Field::new(0, 0, 1);
const TRI_LINEAR_LOAD: Field = Field::new(0, 1, 7);

// $400C-$400F
const NOISE_HALT: Field = Field::new(0, 2, 1);
const NOISE_CONSTANT: Field = Field::new(0, 3, 1);
const NOISE_VOLUME: Field = Field::new(0, 4, 4);
const NOISE_MODE: Field = Field::new(2, 0, 1);
const NOISE_PERIOD: Field = Field::new(2, 4, 4);

// $4010-$4013
const DMC_IRQ_ENABLE: Field = Field::new(0, 0, 1);
const DMC_LOOP: Field = Field::new(0, 1, 1);
const DMC_RATE: Field = Field::new(0, 4, 4);
const DMC_DIRECT_LOAD: Field = Field::new(1, 1, 7);
const DMC_SAMPLE_ADDR: Field = Field::new(2, 0, 8);
const DMC_SAMPLE_LEN: Field = Field::new(3, 0, 8);

/// Nonlinear DAC curves, indexed by summed channel levels.
pub struct MixerTables {
    pub pulse: [f32; 31],
    pub tnd: [f32; 203],
}

pub fn mixer_tables() -> &'static MixerTables {
    static TABLES: OnceLock<MixerTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut pulse = [0.0; 31];
        for (n, slot) in pulse.iter_mut().enumerate().skip(1) {
            *slot = 95.52 / (8128.0 / n as f32 + 100.0);
        }
        let mut tnd = [0.0; 203];
        for (n, slot) in tnd.iter_mut().enumerate().skip(1) {
            *slot = 163.67 / (24329.0 / n as f32 + 100.0);
        }
        MixerTables { pulse, tnd }
    })
}

/// Mix the five channel levels: `pulse[p1 + p2] + tnd[3t + 2n + d]`.
pub fn mix(pulse1: u8, pulse2: u8, triangle: u8, noise: u8, dmc: u8) -> f32 {
    let tables = mixer_tables();
    let pulse = tables.pulse[(pulse1 + pulse2) as usize];
    let tnd_index = 3 * triangle as usize + 2 * noise as usize + dmc as usize;
    pulse + tables.tnd[tnd_index]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApuDebugCounters {
    pub cycles: u64,
    pub samples: u64,
    pub frame_irqs: u64,
    pub dmc_irqs: u64,
    pub dmc_fetches: u64,
}

pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    dmc: DmcChannel,

    frame_counter: u32,
    frame_mode_5_step: bool,
    frame_irq_inhibit: bool,
    frame_irq_flag: bool,
    frame_counter_write_pending: bool,
    frame_counter_write_value: u8,
    frame_counter_write_delay: u8,

    cpu_cycle: u64,
    sample_rate: u32,
    cpu_clock_hz: f64,
    samples_owed: f64,
    samples: Vec<f32>,

    output_filters: bool,
    hp90_prev_in: f32,
    hp90_prev_out: f32,
    hp90_a: f32,
    hp440_prev_in: f32,
    hp440_prev_out: f32,
    hp440_a: f32,
    lp14k_prev_out: f32,
    lp14k_a: f32,

    dmc_dma_request: Option<u16>,
    debug: ApuDebugCounters,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

impl Apu {
    pub fn new() -> Self {
        let mut apu = Self {
            pulse1: PulseChannel::new(SweepNegate::OnesComplement),
            pulse2: PulseChannel::new(SweepNegate::TwosComplement),
            triangle: TriangleChannel::new(),
            noise: NoiseChannel::new(),
            dmc: DmcChannel::new(),
            frame_counter: 0,
            frame_mode_5_step: false,
            frame_irq_inhibit: false,
            frame_irq_flag: false,
            frame_counter_write_pending: false,
            frame_counter_write_value: 0,
            frame_counter_write_delay: 0,
            cpu_cycle: 0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            cpu_clock_hz: NTSC_CPU_CLOCK_HZ,
            samples_owed: 0.0,
            samples: Vec::with_capacity(2048),
            output_filters: false,
            hp90_prev_in: 0.0,
            hp90_prev_out: 0.0,
            hp90_a: 0.0,
            hp440_prev_in: 0.0,
            hp440_prev_out: 0.0,
            hp440_a: 0.0,
            lp14k_prev_out: 0.0,
            lp14k_a: 0.0,
            dmc_dma_request: None,
            debug: ApuDebugCounters::default(),
        };
        apu.update_filter_coeffs();
        apu
    }

    pub fn reset(&mut self) {
        self.pulse1 = PulseChannel::new(SweepNegate::OnesComplement);
        self.pulse2 = PulseChannel::new(SweepNegate::TwosComplement);
        self.triangle = TriangleChannel::new();
        self.noise = NoiseChannel::new();
        self.dmc = DmcChannel::new();
        self.frame_counter = 0;
        self.frame_mode_5_step = false;
        self.frame_irq_inhibit = false;
        self.frame_irq_flag = false;
        self.frame_counter_write_pending = false;
        self.frame_counter_write_value = 0;
        self.frame_counter_write_delay = 0;
        self.cpu_cycle = 0;
        self.samples_owed = 0.0;
        self.samples.clear();
        self.hp90_prev_in = 0.0;
        self.hp90_prev_out = 0.0;
        self.hp440_prev_in = 0.0;
        self.hp440_prev_out = 0.0;
        self.lp14k_prev_out = 0.0;
        self.dmc_dma_request = None;
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(8_000);
        self.update_filter_coeffs();
    }

    pub fn set_cpu_clock_hz(&mut self, cpu_clock_hz: f64) {
        if cpu_clock_hz > 0.0 {
            self.cpu_clock_hz = cpu_clock_hz;
        }
    }

    pub fn set_output_filters(&mut self, enabled: bool) {
        self.output_filters = enabled;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn debug_counters(&self) -> ApuDebugCounters {
        self.debug
    }

    /// Current level of each channel: pulse 1, pulse 2, triangle, noise, DMC.
    pub fn channel_samples(&self) -> [u8; 5] {
        [
            self.pulse1.sample(),
            self.pulse2.sample(),
            self.triangle.sample(),
            self.noise.sample(),
            self.dmc.sample(),
        ]
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000..=0x4003 => self.pulse1.write(addr as usize - 0x4000, value),
            0x4004..=0x4007 => self.pulse2.write(addr as usize - 0x4004, value),
            0x4008..=0x400B => self.triangle.write(addr as usize - 0x4008, value),
            0x400C..=0x400F => self.noise.write(addr as usize - 0x400C, value),
            0x4010..=0x4013 => self.dmc.write(addr as usize - 0x4010, value),
            0x4015 => self.write_status(value),
            0x4017 => self.write_frame_counter(value),
            _ => {}
        }
    }

    /// `$4015` read. Clears the frame interrupt flag.
    pub fn read_status(&mut self) -> u8 {
        let status = self.peek_status();
        self.frame_irq_flag = false;
        status
    }

    pub fn peek_status(&self) -> u8 {
        let mut status = 0u8;
        if self.pulse1.length_counter > 0 {
            status |= 0x01;
        }
        if self.pulse2.length_counter > 0 {
            status |= 0x02;
        }
        if self.triangle.length_counter > 0 {
            status |= 0x04;
        }
        if self.noise.length_counter > 0 {
            status |= 0x08;
        }
        if self.dmc.bytes_remaining > 0 {
            status |= 0x10;
        }
        if self.frame_irq_flag {
            status |= 0x40;
        }
        if self.dmc.irq_flag {
            status |= 0x80;
        }
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.frame_irq_flag || self.dmc.irq_flag
    }

    /// One CPU cycle.
    pub fn tick(&mut self) {
        self.cpu_cycle = self.cpu_cycle.wrapping_add(1);
        self.debug.cycles = self.debug.cycles.wrapping_add(1);

        if self.frame_counter_write_pending {
            self.frame_counter_write_delay = self.frame_counter_write_delay.saturating_sub(1);
            if self.frame_counter_write_delay == 0 {
                self.apply_frame_counter_write(self.frame_counter_write_value);
                self.frame_counter_write_pending = false;
            }
        }

        if (self.cpu_cycle & 1) == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
            self.noise.clock_timer();
        }
        self.triangle.clock_timer();
        self.dmc.clock_timer();
        self.request_dmc_fetch();

        self.clock_frame_counter();

        self.samples_owed += self.sample_rate as f64 / self.cpu_clock_hz;
        while self.samples_owed >= 1.0 {
            self.samples_owed -= 1.0;
            let [p1, p2, t, n, d] = self.channel_samples();
            let mut sample = mix(p1, p2, t, n, d);
            if self.output_filters {
                sample = self.apply_output_filters(sample);
            }
            self.samples.push(sample);
            self.debug.samples = self.debug.samples.wrapping_add(1);
        }
    }

    pub fn take_samples(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }

    pub fn drain_samples(&mut self) -> std::vec::Drain<'_, f32> {
        self.samples.drain(..)
    }

    /// Address the DMC reader wants fetched, if its buffer is empty.
    pub fn take_dmc_dma_request(&mut self) -> Option<u16> {
        self.dmc_dma_request.take()
    }

    pub fn complete_dmc_dma(&mut self, value: u8) {
        self.debug.dmc_fetches = self.debug.dmc_fetches.wrapping_add(1);
        let was_irq = self.dmc.irq_flag;
        self.dmc.consume_dma_byte(value);
        if self.dmc.irq_flag && !was_irq {
            self.debug.dmc_irqs = self.debug.dmc_irqs.wrapping_add(1);
        }
    }

    fn request_dmc_fetch(&mut self) {
        if self.dmc.needs_fetch() && self.dmc_dma_request.is_none() {
            self.dmc_dma_request = Some(self.dmc.current_addr);
        }
    }

    fn write_status(&mut self, value: u8) {
        self.dmc.irq_flag = false;
        self.pulse1.set_enabled((value & 0x01) != 0);
        self.pulse2.set_enabled((value & 0x02) != 0);
        self.triangle.set_enabled((value & 0x04) != 0);
        self.noise.set_enabled((value & 0x08) != 0);

        if (value & 0x10) == 0 {
            self.dmc.bytes_remaining = 0;
        } else if self.dmc.bytes_remaining == 0 {
            self.dmc.restart_sample();
            self.request_dmc_fetch();
        }
    }

    fn write_frame_counter(&mut self, value: u8) {
        if (value & 0x40) != 0 {
            self.frame_irq_flag = false;
        }
        self.frame_counter_write_pending = true;
        self.frame_counter_write_value = value;
        self.frame_counter_write_delay = if (self.cpu_cycle & 1) == 0 { 3 } else { 4 };
    }

    fn apply_frame_counter_write(&mut self, value: u8) {
        self.frame_mode_5_step = (value & 0x80) != 0;
        self.frame_irq_inhibit = (value & 0x40) != 0;
        if self.frame_irq_inhibit {
            self.frame_irq_flag = false;
        }
        self.frame_counter = 0;
        if self.frame_mode_5_step {
            self.clock_quarter_frame();
            self.clock_half_frame();
        }
    }

    fn raise_frame_irq(&mut self) {
        if !self.frame_irq_inhibit {
            if !self.frame_irq_flag {
                self.debug.frame_irqs = self.debug.frame_irqs.wrapping_add(1);
            }
            self.frame_irq_flag = true;
        }
    }

    fn clock_frame_counter(&mut self) {
        self.frame_counter = self.frame_counter.wrapping_add(1);

        if self.frame_mode_5_step {
            match self.frame_counter {
                FC_5STEP_Q1 | FC_5STEP_Q3 => self.clock_quarter_frame(),
                FC_5STEP_Q2_H2 | FC_5STEP_Q4_H4 => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                }
                FC_5STEP_RESET => self.frame_counter = 0,
                _ => {}
            }
        } else {
            match self.frame_counter {
                FC_4STEP_Q1 | FC_4STEP_Q3 => self.clock_quarter_frame(),
                FC_4STEP_Q2_H2 => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                }
                FC_4STEP_Q4_H4_IRQ => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                    self.raise_frame_irq();
                }
                FC_4STEP_RESET => {
                    self.raise_frame_irq();
                    self.frame_counter = 0;
                }
                _ => {}
            }
        }
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse1.clock_envelope();
        self.pulse2.clock_envelope();
        self.triangle.clock_linear_counter();
        self.noise.clock_envelope();
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.clock_length_and_sweep();
        self.pulse2.clock_length_and_sweep();
        self.triangle.clock_length_counter();
        self.noise.clock_length_counter();
    }

    fn update_filter_coeffs(&mut self) {
        let dt = 1.0f32 / self.sample_rate as f32;
        self.hp90_a = high_pass_alpha(90.0, dt);
        self.hp440_a = high_pass_alpha(440.0, dt);
        self.lp14k_a = low_pass_alpha(14_000.0, dt);
    }

    fn apply_output_filters(&mut self, mut sample: f32) -> f32 {
        let hp90 = self.hp90_a * (self.hp90_prev_out + sample - self.hp90_prev_in);
        self.hp90_prev_in = sample;
        self.hp90_prev_out = hp90;
        sample = hp90;

        let hp440 = self.hp440_a * (self.hp440_prev_out + sample - self.hp440_prev_in);
        self.hp440_prev_in = sample;
        self.hp440_prev_out = hp440;
        sample = hp440;

        self.lp14k_prev_out += self.lp14k_a * (sample - self.lp14k_prev_out);
        self.lp14k_prev_out.clamp(-1.0, 1.0)
    }
}

fn high_pass_alpha(cutoff_hz: f32, dt: f32) -> f32 {
    let rc = 1.0 / (2.0 * PI * cutoff_hz);
    rc / (rc + dt)
}

fn low_pass_alpha(cutoff_hz: f32, dt: f32) -> f32 {
    let rc = 1.0 / (2.0 * PI * cutoff_hz);
    dt / (rc + dt)
}

#[derive(Debug, Clone, Copy, Default)]
struct Envelope {
    start: bool,
    divider: u8,
    decay: u8,
}

impl Envelope {
    fn clock(&mut self, period: u8, looping: bool) {
        if self.start {
            self.start = false;
            self.decay = 15;
            self.divider = period;
            return;
        }

        if self.divider == 0 {
            self.divider = period;
            if self.decay > 0 {
                self.decay -= 1;
            } else if looping {
                self.decay = 15;
            }
        } else {
            self.divider -= 1;
        }
    }

    fn volume(&self, constant: bool, volume: u8) -> u8 {
        if constant { volume } else { self.decay }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepNegate {
    /// Pulse 1 subtracts `change + 1`.
    OnesComplement,
    TwosComplement,
}

#[derive(Debug, Clone, Copy)]
pub struct PulseChannel {
    regs: RegisterFile<4>,
    negate_mode: SweepNegate,
    enabled: bool,
    duty_step: u8,
    timer_counter: u16,
    length_counter: u8,
    envelope: Envelope,
    sweep_reload: bool,
    sweep_divider: u8,
}

impl PulseChannel {
    fn new(negate_mode: SweepNegate) -> Self {
        Self {
            regs: RegisterFile::new(),
            negate_mode,
            enabled: false,
            duty_step: 0,
            timer_counter: 0,
            length_counter: 0,
            envelope: Envelope::default(),
            sweep_reload: false,
            sweep_divider: 0,
        }
    }

    fn write(&mut self, index: usize, value: u8) {
        self.regs.write(index, value);
        match index {
            1 => self.sweep_reload = true,
            3 => {
                if self.enabled {
                    self.length_counter = LENGTH_TABLE[self.regs.get(LENGTH_LOAD) as usize];
                }
                self.duty_step = 0;
                self.envelope.start = true;
            }
            _ => {}
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    pub fn timer_period(&self) -> u16 {
        self.regs.get(TIMER_LOW) as u16 | ((self.regs.get(TIMER_HIGH) as u16) << 8)
    }

    fn set_timer_period(&mut self, period: u16) {
        self.regs.set(TIMER_LOW, period as u8);
        self.regs.set(TIMER_HIGH, (period >> 8) as u8);
    }

    /// Sweep target, recomputed continuously from the current period.
    pub fn sweep_target_period(&self) -> i32 {
        let period = self.timer_period() as i32;
        let change = period >> self.regs.get(SWEEP_SHIFT);
        if self.regs.flag(SWEEP_NEGATE) {
            match self.negate_mode {
                SweepNegate::OnesComplement => period - change - 1,
                SweepNegate::TwosComplement => period - change,
            }
        } else {
            period + change
        }
    }

    fn sweep_muted(&self) -> bool {
        self.timer_period() < 8 || self.sweep_target_period() > 0x07FF
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period();
            self.duty_step = (self.duty_step + 1) & 0x07;
        } else {
            self.timer_counter -= 1;
        }
    }

    fn clock_envelope(&mut self) {
        let period = self.regs.get(PULSE_VOLUME);
        let looping = self.regs.flag(PULSE_HALT);
        self.envelope.clock(period, looping);
    }

    fn clock_length_and_sweep(&mut self) {
        if !self.regs.flag(PULSE_HALT) && self.length_counter > 0 {
            self.length_counter -= 1;
        }

        if self.sweep_divider == 0
            && self.regs.flag(SWEEP_ENABLE)
            && self.regs.get(SWEEP_SHIFT) != 0
            && !self.sweep_muted()
        {
            self.set_timer_period(self.sweep_target_period().max(0) as u16);
        }
        if self.sweep_divider == 0 || self.sweep_reload {
            self.sweep_divider = self.regs.get(SWEEP_PERIOD);
            self.sweep_reload = false;
        } else {
            self.sweep_divider -= 1;
        }
    }

    /// Level 0-15.
    pub fn sample(&self) -> u8 {
        if self.length_counter == 0 || self.sweep_muted() {
            return 0;
        }
        if DUTY_TABLE[self.regs.get(PULSE_DUTY) as usize][self.duty_step as usize] == 0 {
            return 0;
        }
        self.envelope
            .volume(self.regs.flag(PULSE_CONSTANT), self.regs.get(PULSE_VOLUME))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TriangleChannel {
    regs: RegisterFile<4>,
    enabled: bool,
    linear_counter: u8,
    linear_reload_flag: bool,
    timer_counter: u16,
    length_counter: u8,
    seq_step: u8,
}

impl TriangleChannel {
    fn new() -> Self {
        Self {
            regs: RegisterFile::new(),
            enabled: false,
            linear_counter: 0,
            linear_reload_flag: false,
            timer_counter: 0,
            length_counter: 0,
            seq_step: 0,
        }
    }

    fn write(&mut self, index: usize, value: u8) {
        self.regs.write(index, value);
        if index == 3 {
            if self.enabled {
                self.length_counter = LENGTH_TABLE[self.regs.get(LENGTH_LOAD) as usize];
            }
            self.linear_reload_flag = true;
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    fn timer_period(&self) -> u16 {
        self.regs.get(TIMER_LOW) as u16 | ((self.regs.get(TIMER_HIGH) as u16) << 8)
    }

    fn clock_linear_counter(&mut self) {
        if self.linear_reload_flag {
            self.linear_counter = self.regs.get(TRI_LINEAR_LOAD);
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }
        if !self.regs.flag(TRI_CONTROL) {
            self.linear_reload_flag = false;
        }
    }

    fn clock_length_counter(&mut self) {
        if !self.regs.flag(TRI_CONTROL) && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period();
            if self.length_counter > 0 && self.linear_counter > 0 {
                self.seq_step = (self.seq_step + 1) & 0x1F;
            }
        } else {
            self.timer_counter -= 1;
        }
    }

    /// Level 0-15. A halted sequencer holds its last step; ultrasonic
    /// periods are silenced instead of aliasing.
    pub fn sample(&self) -> u8 {
        if self.timer_period() < 2 {
            0
        } else {
            TRI_TABLE[self.seq_step as usize]
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NoiseChannel {
    regs: RegisterFile<4>,
    enabled: bool,
    envelope: Envelope,
    timer_counter: u16,
    shift_register: u16,
    length_counter: u8,
}

impl NoiseChannel {
    fn new() -> Self {
        Self {
            regs: RegisterFile::new(),
            enabled: false,
            envelope: Envelope::default(),
            timer_counter: 0,
            shift_register: 1,
            length_counter: 0,
        }
    }

    fn write(&mut self, index: usize, value: u8) {
        self.regs.write(index, value);
        if index == 3 {
            if self.enabled {
                self.length_counter = LENGTH_TABLE[self.regs.get(LENGTH_LOAD) as usize];
            }
            self.envelope.start = true;
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = NOISE_PERIOD_TABLE[self.regs.get(NOISE_PERIOD) as usize];
            let tap = if self.regs.flag(NOISE_MODE) { 6 } else { 1 };
            let feedback = (self.shift_register ^ (self.shift_register >> tap)) & 0x0001;
            self.shift_register >>= 1;
            self.shift_register |= feedback << 14;
        } else {
            self.timer_counter -= 1;
        }
    }

    fn clock_envelope(&mut self) {
        let period = self.regs.get(NOISE_VOLUME);
        let looping = self.regs.flag(NOISE_HALT);
        self.envelope.clock(period, looping);
    }

    fn clock_length_counter(&mut self) {
        if !self.regs.flag(NOISE_HALT) && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    /// Level 0-15; silent while bit 0 of the shift register is set.
    pub fn sample(&self) -> u8 {
        if self.length_counter == 0 || (self.shift_register & 0x0001) != 0 {
            return 0;
        }
        self.envelope
            .volume(self.regs.flag(NOISE_CONSTANT), self.regs.get(NOISE_VOLUME))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DmcChannel {
    regs: RegisterFile<4>,
    irq_flag: bool,
    timer_counter: u16,
    output_level: u8,
    current_addr: u16,
    bytes_remaining: u16,
    sample_buffer: Option<u8>,
    shift_register: u8,
    bits_remaining: u8,
    silence: bool,
}

impl DmcChannel {
    fn new() -> Self {
        Self {
            regs: RegisterFile::new(),
            irq_flag: false,
            timer_counter: DMC_RATE_TABLE[0],
            output_level: 0,
            current_addr: 0xC000,
            bytes_remaining: 0,
            sample_buffer: None,
            shift_register: 0,
            bits_remaining: 8,
            silence: true,
        }
    }

    fn write(&mut self, index: usize, value: u8) {
        self.regs.write(index, value);
        match index {
            0 if !self.regs.flag(DMC_IRQ_ENABLE) => self.irq_flag = false,
            1 => self.output_level = self.regs.get(DMC_DIRECT_LOAD),
            _ => {}
        }
    }

    fn restart_sample(&mut self) {
        self.current_addr = 0xC000 | ((self.regs.get(DMC_SAMPLE_ADDR) as u16) << 6);
        self.bytes_remaining = ((self.regs.get(DMC_SAMPLE_LEN) as u16) << 4) | 0x0001;
    }

    fn needs_fetch(&self) -> bool {
        self.sample_buffer.is_none() && self.bytes_remaining > 0
    }

    fn consume_dma_byte(&mut self, byte: u8) {
        if self.bytes_remaining == 0 {
            return;
        }
        self.sample_buffer = Some(byte);
        self.current_addr = if self.current_addr == 0xFFFF {
            0x8000
        } else {
            self.current_addr + 1
        };
        self.bytes_remaining -= 1;

        if self.bytes_remaining == 0 {
            if self.regs.flag(DMC_LOOP) {
                self.restart_sample();
            } else if self.regs.flag(DMC_IRQ_ENABLE) {
                self.irq_flag = true;
            }
        }
    }

    fn clock_output_unit(&mut self) {
        if !self.silence {
            if (self.shift_register & 0x01) != 0 {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
        }

        self.shift_register >>= 1;
        self.bits_remaining = self.bits_remaining.saturating_sub(1);
        if self.bits_remaining == 0 {
            self.bits_remaining = 8;
            match self.sample_buffer.take() {
                Some(sample) => {
                    self.shift_register = sample;
                    self.silence = false;
                }
                None => self.silence = true,
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = DMC_RATE_TABLE[self.regs.get(DMC_RATE) as usize];
        }
        self.timer_counter -= 1;
        if self.timer_counter == 0 {
            self.clock_output_unit();
        }
    }

    /// Level 0-127.
    pub fn sample(&self) -> u8 {
        self.output_level & 0x7F
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_cycles(apu: &mut Apu, cycles: u32) {
        for _ in 0..cycles {
            apu.tick();
            if apu.take_dmc_dma_request().is_some() {
                apu.complete_dmc_dma(0xFF);
            }
        }
    }

    #[test]
    fn mixer_tables_start_at_zero() {
        let tables = mixer_tables();
        assert_eq!(tables.pulse[0], 0.0);
        assert_eq!(tables.tnd[0], 0.0);
        assert!((tables.pulse[30] - 95.52 / (8128.0 / 30.0 + 100.0)).abs() < 1e-6);
        assert!(tables.tnd[202] > tables.tnd[201]);
        assert_eq!(mix(0, 0, 0, 0, 0), 0.0);
    }

    #[test]
    fn silent_apu_emits_zero_samples_at_output_rate() {
        let mut apu = Apu::new();
        run_cycles(&mut apu, 1_789_773 / 10);
        let samples = apu.take_samples();
        assert!((4409..=4411).contains(&samples.len()), "{}", samples.len());
        assert!(samples.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn output_filters_remove_dc_offset() {
        let mut raw = Apu::new();
        let mut filtered = Apu::new();
        filtered.set_output_filters(true);
        for apu in [&mut raw, &mut filtered] {
            // Direct load parks the DMC output at a constant level.
            apu.write_register(0x4011, 0x40);
            run_cycles(apu, 1_789_773 / 10);
        }

        let level = mix(0, 0, 0, 0, 0x40);
        let raw = raw.take_samples();
        let filtered = filtered.take_samples();
        assert_eq!(raw.len(), filtered.len());
        assert!(raw.iter().all(|s| *s == level));

        // The step passes through at first, then the high-pass stages drain it.
        assert!(filtered[0] > 0.0);
        let tail = filtered[filtered.len() - 1];
        assert!(tail.abs() < level * 0.01, "tail {tail}, level {level}");
    }

    #[test]
    fn four_step_sequence_raises_frame_irq() {
        let mut apu = Apu::new();
        run_cycles(&mut apu, FC_4STEP_Q4_H4_IRQ - 1);
        assert!(!apu.irq_pending());
        run_cycles(&mut apu, 1);
        assert!(apu.irq_pending());
        assert_ne!(apu.read_status() & 0x40, 0);
        assert_eq!(apu.read_status() & 0x40, 0);
    }

    #[test]
    fn irq_inhibit_and_five_step_mode_stay_quiet() {
        let mut apu = Apu::new();
        apu.write_register(0x4017, 0x40);
        run_cycles(&mut apu, 40_000);
        assert!(!apu.irq_pending());

        let mut apu = Apu::new();
        apu.write_register(0x4017, 0x80);
        run_cycles(&mut apu, 80_000);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn length_counter_loads_only_when_enabled() {
        let mut apu = Apu::new();
        apu.write_register(0x4003, 0x08);
        assert_eq!(apu.peek_status() & 0x01, 0);

        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4003, 0x08);
        assert_eq!(apu.pulse1.length_counter, LENGTH_TABLE[1]);
        assert_ne!(apu.peek_status() & 0x01, 0);

        apu.write_register(0x4015, 0x00);
        assert_eq!(apu.peek_status() & 0x01, 0);
    }

    #[test]
    fn sweep_negate_differs_between_pulses() {
        let mut apu = Apu::new();
        for base in [0x4000u16, 0x4004] {
            apu.write_register(base + 1, 0x89);
            apu.write_register(base + 2, 0x00);
            apu.write_register(base + 3, 0x01);
        }
        // Period 0x100, shift 1: change 0x80.
        assert_eq!(apu.pulse1.sweep_target_period(), 0x7F);
        assert_eq!(apu.pulse2.sweep_target_period(), 0x80);
    }

    #[test]
    fn sweep_target_overflow_mutes_pulse() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0xBF);
        apu.write_register(0x4001, 0x00);
        apu.write_register(0x4002, 0x00);
        apu.write_register(0x4003, 0x07 | 0x08);
        // Shift 0 doubles the period: 0x700 -> 0xE00.
        assert!(apu.pulse1.sweep_target_period() > 0x7FF);
        for _ in 0..64 {
            apu.tick();
            assert_eq!(apu.pulse1.sample(), 0);
        }
    }

    #[test]
    fn pulse_outputs_constant_volume_on_high_duty_steps() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0xBF);
        apu.write_register(0x4002, 0x40);
        apu.write_register(0x4003, 0x08);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..4_000 {
            apu.tick();
            seen.insert(apu.pulse1.sample());
        }
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![0, 15]);
    }

    #[test]
    fn noise_is_silent_while_bit_zero_set() {
        let mut noise = NoiseChannel::new();
        noise.set_enabled(true);
        noise.write(0, 0x3F);
        noise.write(3, 0x08);
        assert_eq!(noise.shift_register & 1, 1);
        assert_eq!(noise.sample(), 0);
        noise.shift_register = 0x0002;
        assert_eq!(noise.sample(), 15);
    }

    #[test]
    fn dmc_level_steps_by_two_and_clamps() {
        let mut dmc = DmcChannel::new();
        dmc.write(1, 0x7E);
        dmc.silence = false;
        dmc.shift_register = 0xFF;
        dmc.clock_output_unit();
        assert_eq!(dmc.sample(), 0x7E);

        dmc.write(1, 0x01);
        dmc.shift_register = 0x00;
        dmc.clock_output_unit();
        assert_eq!(dmc.sample(), 0x01);

        dmc.write(1, 0x40);
        dmc.shift_register = 0x01;
        dmc.clock_output_unit();
        assert_eq!(dmc.sample(), 0x42);
    }

    #[test]
    fn dmc_reader_wraps_and_raises_irq() {
        let mut apu = Apu::new();
        apu.write_register(0x4010, 0x80);
        apu.write_register(0x4012, 0xFF);
        apu.write_register(0x4013, 0x00);
        apu.write_register(0x4015, 0x10);
        assert_eq!(apu.take_dmc_dma_request(), Some(0xFFC0));
        assert_ne!(apu.peek_status() & 0x10, 0);

        apu.complete_dmc_dma(0x55);
        assert_eq!(apu.peek_status() & 0x10, 0);
        assert!(apu.irq_pending());
        assert_ne!(apu.read_status() & 0x80, 0);

        apu.write_register(0x4015, 0x10);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn dmc_address_wraps_to_8000() {
        let mut dmc = DmcChannel::new();
        dmc.current_addr = 0xFFFF;
        dmc.bytes_remaining = 2;
        dmc.consume_dma_byte(0);
        assert_eq!(dmc.current_addr, 0x8000);
    }
}
