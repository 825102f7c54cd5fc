//! Host-side collaborators the core calls into.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use super::ppu::{FRAME_HEIGHT, FRAME_WIDTH};

pub const FRAME_BYTES: usize = FRAME_WIDTH * FRAME_HEIGHT * 3;

pub const BUTTON_A: u8 = 0x80;
pub const BUTTON_B: u8 = 0x40;
pub const BUTTON_SELECT: u8 = 0x20;
pub const BUTTON_START: u8 = 0x10;
pub const BUTTON_UP: u8 = 0x08;
pub const BUTTON_DOWN: u8 = 0x04;
pub const BUTTON_LEFT: u8 = 0x02;
pub const BUTTON_RIGHT: u8 = 0x01;

/// Receives one RGB24 frame (`256 * 240 * 3` bytes) per completed picture.
pub trait DisplaySink {
    fn present(&mut self, frame: &[u8]);
}

/// Receives mixed samples in `0.0..=1.0` at the configured output rate.
pub trait AudioSink {
    fn push_sample(&mut self, sample: f32);
}

/// Polled when the controller strobe latches; returns the button byte for
/// `port` (0 or 1).
pub trait ControllerSource {
    fn buttons(&mut self, port: usize) -> u8;
}

pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn present(&mut self, _: &[u8]) {}
}

pub struct NullAudio;

impl AudioSink for NullAudio {
    fn push_sample(&mut self, _: f32) {}
}

/// Shared button state. Clones observe the same buttons, so a host can keep
/// one handle and install another on the emulator.
#[derive(Debug, Clone, Default)]
pub struct Buttons {
    state: Rc<Cell<[u8; 2]>>,
}

impl Buttons {
    pub fn set(&self, port: usize, value: u8) {
        let mut state = self.state.get();
        if let Some(slot) = state.get_mut(port) {
            *slot = value;
        }
        self.state.set(state);
    }

    pub fn get(&self, port: usize) -> u8 {
        self.state.get().get(port).copied().unwrap_or(0)
    }
}

impl ControllerSource for Buttons {
    fn buttons(&mut self, port: usize) -> u8 {
        self.get(port)
    }
}

/// Keeps a copy of the most recent frame and a running frame count.
#[derive(Debug, Clone, Default)]
pub struct FrameCapture {
    inner: Rc<RefCell<CapturedFrames>>,
}

#[derive(Debug, Default)]
struct CapturedFrames {
    last: Vec<u8>,
    count: u64,
}

impl FrameCapture {
    pub fn frame_count(&self) -> u64 {
        self.inner.borrow().count
    }

    pub fn last_frame(&self) -> Vec<u8> {
        self.inner.borrow().last.clone()
    }
}

impl DisplaySink for FrameCapture {
    fn present(&mut self, frame: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        inner.last.clear();
        inner.last.extend_from_slice(frame);
        inner.count += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct SampleCapture {
    samples: Rc<RefCell<Vec<f32>>>,
}

impl SampleCapture {
    pub fn len(&self) -> usize {
        self.samples.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.borrow().is_empty()
    }
}

impl AudioSink for SampleCapture {
    fn push_sample(&mut self, sample: f32) {
        self.samples.borrow_mut().push(sample);
    }
}
