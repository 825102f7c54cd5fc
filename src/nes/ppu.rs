use super::bitfield::reverse_bits;
use super::mapper::Mapper;
use super::palette::rgb;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

pub const DOTS_PER_SCANLINE: u16 = 341;
pub const SCANLINES_PER_FRAME: u16 = 262;
const PRE_RENDER_LINE: u16 = 261;
const VBLANK_LINE: u16 = 241;
/// PPUCTRL ignores writes for this many dots after power-up.
const CTRL_WARMUP_DOTS: u32 = 30_000;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_VRAM_INC_32: u8 = 0x04;

const MASK_GRAYSCALE: u8 = 0x01;
const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

const SPRITE_ATTR_FLIP_V: u8 = 0x80;
const SPRITE_ATTR_FLIP_H: u8 = 0x40;
const SPRITE_ATTR_BEHIND_BG: u8 = 0x20;

#[derive(Debug, Clone, Copy, Default)]
pub struct PpuDebugCounters {
    pub ticks: u64,
    pub frames: u64,
    pub vblank_entries: u64,
    pub nmi_edges: u64,
    pub sprite_overflow_events: u64,
    pub sprite0_hit_events: u64,
    pub sprite0_hit_last_scanline: u16,
    pub sprite0_hit_last_dot: u16,
    pub status_reads: u64,
    pub pattern_reads: u64,
    pub nametable_reads: u64,
    pub palette_writes: u64,
}

/// Sprite-evaluation walk over primary OAM during dots 65-256.
#[derive(Debug, Clone, Copy, Default)]
struct SpriteEval {
    n: u8,
    m: u8,
    found: u8,
    copy_remaining: u8,
    done: bool,
    sprite0_found: bool,
}

pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,

    oam_addr: u8,
    oam: [u8; 256],
    secondary_oam: [u8; 32],
    palette_ram: [u8; 32],

    write_toggle: bool,
    v: u16,
    t: u16,
    fine_x: u8,
    read_buffer: u8,
    open_bus: u8,

    scanline: u16,
    dot: u16,
    odd_frame: bool,
    frame_complete: bool,
    frame_count: u64,
    nmi_pending: bool,
    nmi_line: bool,
    vblank_suppress: bool,

    next_tile_id: u8,
    next_tile_attr: u8,
    next_tile_lsb: u8,
    next_tile_msb: u8,
    bg_shift_pattern_lo: u16,
    bg_shift_pattern_hi: u16,
    bg_shift_attr_lo: u8,
    bg_shift_attr_hi: u8,
    bg_attr_latch_lo: bool,
    bg_attr_latch_hi: bool,

    eval: SpriteEval,
    sprite_count: usize,
    sprite_zero_in_line: bool,
    sprite_patterns_lo: [u8; 8],
    sprite_patterns_hi: [u8; 8],
    sprite_x: [u8; 8],
    sprite_attributes: [u8; 8],

    warmup_dots: u32,
    frame_buffer: Vec<u8>,
    debug: PpuDebugCounters,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam: [0; 256],
            secondary_oam: [0xFF; 32],
            palette_ram: [0x0F; 32],
            write_toggle: false,
            v: 0,
            t: 0,
            fine_x: 0,
            read_buffer: 0,
            open_bus: 0,
            scanline: 0,
            dot: 0,
            odd_frame: false,
            frame_complete: false,
            frame_count: 0,
            nmi_pending: false,
            nmi_line: false,
            vblank_suppress: false,
            next_tile_id: 0,
            next_tile_attr: 0,
            next_tile_lsb: 0,
            next_tile_msb: 0,
            bg_shift_pattern_lo: 0,
            bg_shift_pattern_hi: 0,
            bg_shift_attr_lo: 0,
            bg_shift_attr_hi: 0,
            bg_attr_latch_lo: false,
            bg_attr_latch_hi: false,
            eval: SpriteEval::default(),
            sprite_count: 0,
            sprite_zero_in_line: false,
            sprite_patterns_lo: [0; 8],
            sprite_patterns_hi: [0; 8],
            sprite_x: [0xFF; 8],
            sprite_attributes: [0; 8],
            warmup_dots: 0,
            frame_buffer: vec![0; FRAME_WIDTH * FRAME_HEIGHT * 3],
            debug: PpuDebugCounters::default(),
        }
    }

    /// Console reset: registers clear, OAM and palette RAM keep their contents.
    /// The power-up PPUCTRL lockout is not restarted.
    pub fn reset(&mut self) {
        self.ctrl = 0;
        self.mask = 0;
        self.status = 0;
        self.write_toggle = false;
        self.t = 0;
        self.fine_x = 0;
        self.read_buffer = 0;
        self.scanline = 0;
        self.dot = 0;
        self.odd_frame = false;
        self.frame_complete = false;
        self.nmi_pending = false;
        self.nmi_line = false;
        self.vblank_suppress = false;
        self.sprite_count = 0;
        self.sprite_zero_in_line = false;
    }

    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    pub fn frame_complete(&self) -> bool {
        self.frame_complete
    }

    pub fn clear_frame_complete(&mut self) {
        self.frame_complete = false;
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// `(scanline, dot)` of the next dot to execute.
    pub fn position(&self) -> (u16, u16) {
        (self.scanline, self.dot)
    }

    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_pending)
    }

    pub fn debug_ctrl(&self) -> u8 {
        self.ctrl
    }

    /// False until the power-up PPUCTRL lockout has elapsed.
    fn ctrl_writable(&self) -> bool {
        self.warmup_dots >= CTRL_WARMUP_DOTS
    }

    pub fn debug_status(&self) -> u8 {
        self.status
    }

    pub fn debug_vram_addr(&self) -> (u16, u16, u8) {
        (self.v, self.t, self.fine_x)
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.palette_ram[index % self.palette_ram.len()]
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.oam[index % self.oam.len()]
    }

    pub fn debug_secondary_oam(&self) -> &[u8; 32] {
        &self.secondary_oam
    }

    pub fn debug_counters(&self) -> PpuDebugCounters {
        self.debug
    }

    /// Register read without side effects, for debuggers.
    pub fn peek_register(&self, addr: u16) -> u8 {
        match 0x2000 | (addr & 0x0007) {
            0x2002 => (self.status & 0xE0) | (self.open_bus & 0x1F),
            0x2004 => self.oam[self.oam_addr as usize],
            0x2007 => self.read_buffer,
            _ => self.open_bus,
        }
    }

    /// CPU read of `$2000-$2007` (callers fold the `$3FFF` mirror).
    pub fn cpu_read_register(&mut self, addr: u16, mapper: &mut Mapper) -> u8 {
        let value = match 0x2000 | (addr & 0x0007) {
            0x2002 => {
                self.debug.status_reads = self.debug.status_reads.wrapping_add(1);
                // A read one dot before vblank starts loses that frame's flag and NMI.
                if self.scanline == VBLANK_LINE && self.dot == 1 {
                    self.vblank_suppress = true;
                }
                let value = (self.status & 0xE0) | (self.open_bus & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.write_toggle = false;
                self.update_nmi_line();
                value
            }
            0x2004 => {
                if self.in_sprite_clear_window() {
                    0xFF
                } else if self.oam_addr & 0x03 == 0x02 {
                    self.oam[self.oam_addr as usize] & 0xE3
                } else {
                    self.oam[self.oam_addr as usize]
                }
            }
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                let value = self.ppu_read(ppu_addr, mapper);
                let result = if ppu_addr >= 0x3F00 {
                    // Palette reads bypass the buffer; it picks up the nametable below.
                    self.read_buffer = self.ppu_read(ppu_addr - 0x1000, mapper);
                    (self.open_bus & 0xC0) | value
                } else {
                    std::mem::replace(&mut self.read_buffer, value)
                };
                self.increment_vram_addr_cpu_access();
                result
            }
            _ => self.open_bus,
        };
        self.open_bus = value;
        value
    }

    pub fn cpu_write_register(&mut self, addr: u16, value: u8, mapper: &mut Mapper) {
        self.open_bus = value;
        match 0x2000 | (addr & 0x0007) {
            0x2000 if !self.ctrl_writable() => {}
            0x2000 => {
                self.ctrl = value;
                self.t = (self.t & !0x0C00) | (((value as u16) & 0x03) << 10);
                self.update_nmi_line();
            }
            0x2001 => self.mask = value,
            0x2003 => self.oam_addr = value,
            0x2004 => self.write_oam_data(value),
            0x2005 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t = (self.t & !0x001F) | ((value as u16) >> 3);
                } else {
                    self.t = (self.t & !0x03E0) | (((value as u16) >> 3) << 5);
                    self.t = (self.t & !0x7000) | (((value as u16) & 0x07) << 12);
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2006 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value as u16) & 0x3F) << 8);
                } else {
                    self.t = (self.t & 0x7F00) | value as u16;
                    self.v = self.t;
                    mapper.observe_ppu_addr(self.v & 0x3FFF);
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                self.ppu_write(ppu_addr, value, mapper);
                self.increment_vram_addr_cpu_access();
            }
            _ => {}
        }
    }

    /// OAMDATA write path, shared by `$2004` and OAM DMA.
    pub fn write_oam_data(&mut self, value: u8) {
        self.oam[self.oam_addr as usize] = value;
        self.oam_addr = self.oam_addr.wrapping_add(1);
    }

    /// Advance one dot.
    pub fn tick(&mut self, mapper: &mut Mapper) {
        self.debug.ticks = self.debug.ticks.wrapping_add(1);
        if self.warmup_dots < CTRL_WARMUP_DOTS {
            self.warmup_dots += 1;
        }

        let visible_line = self.scanline < 240;
        let pre_render = self.scanline == PRE_RENDER_LINE;
        let render_line = visible_line || pre_render;
        let rendering_enabled = self.rendering_enabled();
        let dot = self.dot;

        if pre_render && dot == 1 {
            self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
            self.update_nmi_line();
        }

        if self.scanline == VBLANK_LINE && dot == 1 {
            if !self.vblank_suppress {
                self.status |= STATUS_VBLANK;
                self.debug.vblank_entries = self.debug.vblank_entries.wrapping_add(1);
            }
            self.vblank_suppress = false;
            self.frame_complete = true;
            self.frame_count = self.frame_count.wrapping_add(1);
            self.debug.frames = self.debug.frames.wrapping_add(1);
            self.update_nmi_line();
        }

        if render_line && rendering_enabled {
            if (2..=257).contains(&dot) || (322..=337).contains(&dot) {
                self.shift_background_registers();
            }
            if ((9..=257).contains(&dot) && (dot - 1) & 7 == 0) || dot == 329 || dot == 337 {
                self.load_background_shifters();
            }
        }

        if visible_line && (1..=256).contains(&dot) {
            self.render_pixel((dot - 1) as usize, self.scanline as usize);
            if rendering_enabled {
                self.shift_sprite_registers();
            }
        }

        if render_line && rendering_enabled {
            self.tick_background_fetch(dot, pre_render, mapper);
            self.tick_sprites(dot, visible_line, mapper);
        }

        if pre_render && rendering_enabled && self.odd_frame && dot == 339 {
            self.dot = 0;
            self.scanline = 0;
            self.odd_frame = false;
            return;
        }

        self.dot += 1;
        if self.dot >= DOTS_PER_SCANLINE {
            self.dot = 0;
            self.scanline += 1;
            if self.scanline >= SCANLINES_PER_FRAME {
                self.scanline = 0;
                self.odd_frame = !self.odd_frame;
            }
        }
    }

    fn tick_background_fetch(&mut self, dot: u16, pre_render: bool, mapper: &mut Mapper) {
        if (1..=256).contains(&dot) || (321..=336).contains(&dot) {
            match (dot - 1) & 0x07 {
                0 => {
                    self.next_tile_id = self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper);
                    self.debug.nametable_reads = self.debug.nametable_reads.wrapping_add(1);
                }
                2 => {
                    let addr = 0x23C0
                        | (self.v & 0x0C00)
                        | ((self.v >> 4) & 0x0038)
                        | ((self.v >> 2) & 0x0007);
                    let attr = self.ppu_read(addr, mapper);
                    let shift = ((self.v >> 4) & 0x04) | (self.v & 0x02);
                    self.next_tile_attr = (attr >> shift) & 0x03;
                }
                4 => {
                    let addr = self.background_pattern_addr();
                    self.next_tile_lsb = self.ppu_read(addr, mapper);
                }
                6 => {
                    let addr = self.background_pattern_addr() + 8;
                    self.next_tile_msb = self.ppu_read(addr, mapper);
                }
                7 => self.increment_coarse_x(),
                _ => {}
            }
        }

        if dot == 256 {
            self.increment_y();
        }
        if dot == 257 {
            self.copy_horizontal_bits();
        }
        if pre_render && (280..=304).contains(&dot) {
            self.copy_vertical_bits();
        }
        if dot == 337 || dot == 339 {
            self.next_tile_id = self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper);
        }
    }

    fn tick_sprites(&mut self, dot: u16, visible_line: bool, mapper: &mut Mapper) {
        match dot {
            1..=64 => {
                if dot & 1 == 1 {
                    self.secondary_oam[(dot as usize - 1) / 2] = 0xFF;
                }
            }
            65..=256 => {
                if !visible_line {
                    return;
                }
                if dot == 65 {
                    self.eval = SpriteEval::default();
                }
                if dot & 1 == 1 {
                    self.step_sprite_evaluation();
                }
            }
            257..=320 => {
                self.oam_addr = 0;
                if dot == 257 {
                    if visible_line {
                        self.sprite_count = self.eval.found as usize;
                        self.sprite_zero_in_line = self.eval.sprite0_found;
                    } else {
                        self.sprite_count = 0;
                        self.sprite_zero_in_line = false;
                    }
                }
                self.fetch_sprite_slot(dot, mapper);
            }
            _ => {}
        }
    }

    fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    fn in_sprite_clear_window(&self) -> bool {
        self.rendering_enabled()
            && (self.scanline < 240 || self.scanline == PRE_RENDER_LINE)
            && (1..=64).contains(&self.dot)
    }

    fn sprite_height(&self) -> u16 {
        if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 {
            16
        } else {
            8
        }
    }

    fn update_nmi_line(&mut self) {
        let line = (self.ctrl & CTRL_NMI_ENABLE) != 0 && (self.status & STATUS_VBLANK) != 0;
        if line && !self.nmi_line {
            self.nmi_pending = true;
            self.debug.nmi_edges = self.debug.nmi_edges.wrapping_add(1);
        }
        self.nmi_line = line;
    }

    fn render_pixel(&mut self, x: usize, y: usize) {
        let (bg_pixel, bg_palette) = self.background_sample(x);
        let (spr_pixel, spr_palette, spr_behind_bg, slot) = self.sprite_sample(x);

        if slot == Some(0)
            && self.sprite_zero_in_line
            && bg_pixel != 0
            && spr_pixel != 0
            && x != 255
            && (self.status & STATUS_SPRITE_ZERO_HIT) == 0
        {
            self.status |= STATUS_SPRITE_ZERO_HIT;
            self.debug.sprite0_hit_events = self.debug.sprite0_hit_events.wrapping_add(1);
            self.debug.sprite0_hit_last_scanline = self.scanline;
            self.debug.sprite0_hit_last_dot = self.dot;
        }

        let palette_index = match (bg_pixel != 0, spr_pixel != 0) {
            (false, false) => 0,
            (false, true) => 0x10 | (spr_palette << 2) | spr_pixel,
            (true, false) => (bg_palette << 2) | bg_pixel,
            (true, true) if spr_behind_bg => (bg_palette << 2) | bg_pixel,
            (true, true) => 0x10 | (spr_palette << 2) | spr_pixel,
        };

        let mut color = self.palette_ram[palette_index_for(palette_index as u16)];
        if (self.mask & MASK_GRAYSCALE) != 0 {
            color &= 0x30;
        }
        let pixel = (y * FRAME_WIDTH + x) * 3;
        self.frame_buffer[pixel..pixel + 3].copy_from_slice(&rgb(color));
    }

    fn background_sample(&self, x: usize) -> (u8, u8) {
        if (self.mask & MASK_SHOW_BG) == 0 {
            return (0, 0);
        }
        if x < 8 && (self.mask & MASK_SHOW_BG_LEFT) == 0 {
            return (0, 0);
        }

        let bit = 0x8000u16 >> self.fine_x;
        let p0 = ((self.bg_shift_pattern_lo & bit) != 0) as u8;
        let p1 = ((self.bg_shift_pattern_hi & bit) != 0) as u8;

        let attr_bit = 0x80u8 >> self.fine_x;
        let a0 = ((self.bg_shift_attr_lo & attr_bit) != 0) as u8;
        let a1 = ((self.bg_shift_attr_hi & attr_bit) != 0) as u8;

        ((p1 << 1) | p0, (a1 << 1) | a0)
    }

    /// First opaque sprite pixel at `x`: `(pixel, palette, behind_bg, slot)`.
    fn sprite_sample(&self, x: usize) -> (u8, u8, bool, Option<usize>) {
        if (self.mask & MASK_SHOW_SPRITES) == 0 {
            return (0, 0, false, None);
        }
        if x < 8 && (self.mask & MASK_SHOW_SPRITE_LEFT) == 0 {
            return (0, 0, false, None);
        }

        for i in 0..self.sprite_count {
            if self.sprite_x[i] != 0 {
                continue;
            }
            let p0 = (self.sprite_patterns_lo[i] & 0x80) >> 7;
            let p1 = (self.sprite_patterns_hi[i] & 0x80) >> 6;
            let pixel = p0 | p1;
            if pixel == 0 {
                continue;
            }
            let attributes = self.sprite_attributes[i];
            return (
                pixel,
                attributes & 0x03,
                (attributes & SPRITE_ATTR_BEHIND_BG) != 0,
                Some(i),
            );
        }

        (0, 0, false, None)
    }

    fn shift_background_registers(&mut self) {
        self.bg_shift_pattern_lo <<= 1;
        self.bg_shift_pattern_hi <<= 1;
        self.bg_shift_attr_lo = (self.bg_shift_attr_lo << 1) | self.bg_attr_latch_lo as u8;
        self.bg_shift_attr_hi = (self.bg_shift_attr_hi << 1) | self.bg_attr_latch_hi as u8;
    }

    fn load_background_shifters(&mut self) {
        self.bg_shift_pattern_lo = (self.bg_shift_pattern_lo & 0xFF00) | self.next_tile_lsb as u16;
        self.bg_shift_pattern_hi = (self.bg_shift_pattern_hi & 0xFF00) | self.next_tile_msb as u16;
        self.bg_attr_latch_lo = (self.next_tile_attr & 0x01) != 0;
        self.bg_attr_latch_hi = (self.next_tile_attr & 0x02) != 0;
    }

    fn shift_sprite_registers(&mut self) {
        for i in 0..self.sprite_count {
            if self.sprite_x[i] > 0 {
                self.sprite_x[i] -= 1;
            } else {
                self.sprite_patterns_lo[i] <<= 1;
                self.sprite_patterns_hi[i] <<= 1;
            }
        }
    }

    fn background_pattern_addr(&self) -> u16 {
        let fine_y = (self.v >> 12) & 0x07;
        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        };
        table + (self.next_tile_id as u16) * 16 + fine_y
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v += 1;
        }
    }

    fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v += 0x1000;
            return;
        }

        self.v &= !0x7000;
        let mut y = (self.v & 0x03E0) >> 5;
        if y == 29 {
            y = 0;
            self.v ^= 0x0800;
        } else if y == 31 {
            y = 0;
        } else {
            y += 1;
        }
        self.v = (self.v & !0x03E0) | (y << 5);
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & !0x041F) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & !0x7BE0) | (self.t & 0x7BE0);
    }

    fn sprite_in_range(&self, y: u8) -> bool {
        let row = self.scanline as i16 - y as i16;
        row >= 0 && row < self.sprite_height() as i16
    }

    /// One read/write pair of the evaluation walk (two dots).
    fn step_sprite_evaluation(&mut self) {
        if self.eval.done {
            return;
        }

        let n = self.eval.n as usize;
        let slot = self.eval.found as usize * 4;

        if self.eval.copy_remaining > 0 {
            self.eval.m += 1;
            let m = self.eval.m as usize;
            self.secondary_oam[slot + m] = self.oam[n * 4 + m];
            self.eval.copy_remaining -= 1;
            if self.eval.copy_remaining == 0 {
                self.eval.found += 1;
                self.eval.m = 0;
                self.advance_sprite_evaluation();
            }
            return;
        }

        if self.eval.found < 8 {
            let y = self.oam[n * 4];
            self.secondary_oam[slot] = y;
            if self.sprite_in_range(y) {
                if n == 0 {
                    self.eval.sprite0_found = true;
                }
                self.eval.copy_remaining = 3;
            } else {
                self.advance_sprite_evaluation();
            }
            return;
        }

        // Eight sprites already found: m advances with n, so later tile,
        // attribute and X bytes are compared as if they were Y.
        let value = self.oam[n * 4 + self.eval.m as usize];
        if self.sprite_in_range(value) {
            if (self.status & STATUS_SPRITE_OVERFLOW) == 0 {
                self.debug.sprite_overflow_events =
                    self.debug.sprite_overflow_events.wrapping_add(1);
            }
            self.status |= STATUS_SPRITE_OVERFLOW;
            self.eval.done = true;
        } else {
            self.eval.m = (self.eval.m + 1) & 0x03;
            self.advance_sprite_evaluation();
        }
    }

    fn advance_sprite_evaluation(&mut self) {
        self.eval.n += 1;
        if self.eval.n >= 64 {
            self.eval.done = true;
        }
    }

    /// Dots 257-320: eight 8-dot groups, one per secondary OAM slot.
    fn fetch_sprite_slot(&mut self, dot: u16, mapper: &mut Mapper) {
        let index = ((dot - 257) / 8) as usize;
        let base = index * 4;
        match (dot - 257) & 0x07 {
            0 | 2 => {
                self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper);
            }
            4 => {
                let addr = self.sprite_pattern_addr(index);
                self.sprite_patterns_lo[index] = self.ppu_read(addr, mapper);
            }
            6 => {
                let addr = self.sprite_pattern_addr(index) + 8;
                self.sprite_patterns_hi[index] = self.ppu_read(addr, mapper);
            }
            7 => {
                let attributes = self.secondary_oam[base + 2];
                if index >= self.sprite_count {
                    self.sprite_patterns_lo[index] = 0;
                    self.sprite_patterns_hi[index] = 0;
                    self.sprite_x[index] = 0xFF;
                    self.sprite_attributes[index] = 0;
                    return;
                }
                if (attributes & SPRITE_ATTR_FLIP_H) != 0 {
                    self.sprite_patterns_lo[index] = reverse_bits(self.sprite_patterns_lo[index]);
                    self.sprite_patterns_hi[index] = reverse_bits(self.sprite_patterns_hi[index]);
                }
                self.sprite_attributes[index] = attributes;
                self.sprite_x[index] = self.secondary_oam[base + 3];
            }
            _ => {}
        }
    }

    /// Pattern address for a secondary OAM slot. Empty slots hold $FF bytes
    /// and still fetch tile $FF, which keeps the A12 pattern MMC3 counts.
    fn sprite_pattern_addr(&self, index: usize) -> u16 {
        let base = index * 4;
        let y = self.secondary_oam[base];
        let tile = self.secondary_oam[base + 1];
        let attributes = self.secondary_oam[base + 2];
        let height = self.sprite_height();

        let mut row = (self.scanline.wrapping_sub(y as u16)) & (height - 1);
        if index < self.sprite_count && (attributes & SPRITE_ATTR_FLIP_V) != 0 {
            row = height - 1 - row;
        }

        if height == 16 {
            let table = ((tile & 0x01) as u16) * 0x1000;
            let tile = ((tile & 0xFE) as u16) + row / 8;
            table + tile * 16 + (row & 0x07)
        } else {
            let table = if (self.ctrl & CTRL_SPRITE_TABLE) != 0 {
                0x1000
            } else {
                0x0000
            };
            table + (tile as u16) * 16 + row
        }
    }

    fn increment_vram_addr_cpu_access(&mut self) {
        let render_line = self.scanline < 240 || self.scanline == PRE_RENDER_LINE;
        if self.rendering_enabled() && render_line {
            // Rendering owns v: the access bumps coarse X and Y together.
            self.increment_coarse_x();
            self.increment_y();
        } else if (self.ctrl & CTRL_VRAM_INC_32) != 0 {
            self.v = (self.v + 32) & 0x7FFF;
        } else {
            self.v = (self.v + 1) & 0x7FFF;
        }
    }

    fn ppu_read(&mut self, addr: u16, mapper: &mut Mapper) -> u8 {
        let addr = addr & 0x3FFF;
        if addr >= 0x3F00 {
            return self.palette_ram[palette_index_for(addr)] & 0x3F;
        }
        if addr < 0x2000 {
            self.debug.pattern_reads = self.debug.pattern_reads.wrapping_add(1);
        }
        mapper.observe_ppu_addr(addr);
        mapper.ppu_read(addr)
    }

    fn ppu_write(&mut self, addr: u16, value: u8, mapper: &mut Mapper) {
        let addr = addr & 0x3FFF;
        if addr >= 0x3F00 {
            self.debug.palette_writes = self.debug.palette_writes.wrapping_add(1);
            self.palette_ram[palette_index_for(addr)] = value & 0x3F;
            return;
        }
        mapper.observe_ppu_addr(addr);
        mapper.ppu_write(addr, value);
    }
}

/// Palette RAM slot for a `$3F00-$3FFF` address (or a raw 5-bit index);
/// `$3F10/$3F14/$3F18/$3F1C` alias the background entries.
pub fn palette_index_for(addr: u16) -> usize {
    let mut index = (addr & 0x1F) as usize;
    if index >= 16 && (index & 0x03) == 0 {
        index -= 16;
    }
    index
}
