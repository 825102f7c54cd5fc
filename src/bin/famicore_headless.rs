use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use famicore::nes::cpu::CpuState;
use famicore::nes::io::{Buttons, FrameCapture, SampleCapture};
use famicore::nes::{EmulatorConfig, Nes, NesDebugCounters};
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Debug, Clone)]
struct Config {
    rom: Option<PathBuf>,
    frames: u32,
    input: Vec<u8>,
    emulator: Option<PathBuf>,
    report: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rom: None,
            frames: 60,
            input: Vec::new(),
            emulator: None,
            report: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    rom: String,
    mapper: String,
    frames: u32,
    cpu: CpuState,
    frame_hashes: Vec<String>,
    audio_samples: usize,
    counters: NesDebugCounters,
    runtime_secs: f64,
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rom" => {
                let value = args
                    .next()
                    .context("--rom requires a path, e.g. --rom roms/nestest.nes")?;
                cfg.rom = Some(PathBuf::from(value));
            }
            "--frames" => {
                let value = args
                    .next()
                    .context("--frames requires an integer, e.g. --frames 120")?;
                cfg.frames = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --frames value: {value}"))?;
            }
            "--input" => {
                let value = args
                    .next()
                    .context("--input requires base64 controller bytes, e.g. --input AAAQ")?;
                cfg.input = BASE64_STANDARD
                    .decode(value.as_bytes())
                    .with_context(|| format!("invalid base64 in --input: {value}"))?;
            }
            "--config" => {
                let value = args
                    .next()
                    .context("--config requires a path to a JSON file")?;
                cfg.emulator = Some(PathBuf::from(value));
            }
            "--report" => {
                let value = args
                    .next()
                    .context("--report requires an output path, e.g. --report run.json")?;
                cfg.report = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
        }
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "famicore_headless\n\n\
         Runs a ROM without a window and prints a SHA-1 per frame.\n\n\
         Options:\n\
         \x20 --rom <path>       iNES / NES 2.0 image (required)\n\
         \x20 --frames <n>       frames to run (default 60)\n\
         \x20 --input <base64>   controller 1 bytes, one per frame, cycled\n\
         \x20 --config <json>    EmulatorConfig overrides\n\
         \x20 --report <json>    write a run report\n\
         \x20 -h, --help         show this help"
    );
}

fn load_emulator_config(cfg: &Config) -> Result<EmulatorConfig> {
    let Some(path) = cfg.emulator.as_ref() else {
        return Ok(EmulatorConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

fn hash_frame(frame: &[u8]) -> String {
    BASE64_STANDARD.encode(Sha1::digest(frame))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cfg = parse_args()?;
    let rom_path = cfg
        .rom
        .clone()
        .context("missing --rom <path>\nUse --help to view supported options.")?;
    let emulator_config = load_emulator_config(&cfg)?;

    let mut nes = Nes::new(emulator_config);
    let buttons = Buttons::default();
    let frames = FrameCapture::default();
    let samples = SampleCapture::default();
    nes.set_controller_source(Box::new(buttons.clone()));
    nes.set_display_sink(Box::new(frames.clone()));
    nes.set_audio_sink(Box::new(samples.clone()));
    nes.load_rom_from_path(&rom_path)
        .with_context(|| format!("failed to load ROM {}", rom_path.display()))?;
    info!(rom = %rom_path.display(), mapper = nes.mapper_name(), "running");

    let start = Instant::now();
    let mut frame_hashes = Vec::with_capacity(cfg.frames as usize);
    for frame in 0..cfg.frames {
        if !cfg.input.is_empty() {
            buttons.set(0, cfg.input[frame as usize % cfg.input.len()]);
        }
        nes.run_frame();
        let hash = hash_frame(&frames.last_frame());
        println!("frame {frame:>5} {hash}");
        frame_hashes.push(hash);
    }
    let elapsed = start.elapsed().as_secs_f64();

    let cpu = nes.cpu_state();
    println!();
    println!("Summary:");
    println!("- Mapper: {}", nes.mapper_name());
    println!("- Frames: {}", cfg.frames);
    println!(
        "- CPU: PC=${:04X} A=${:02X} X=${:02X} Y=${:02X} P=${:02X} SP=${:02X} cycles={}",
        cpu.pc, cpu.a, cpu.x, cpu.y, cpu.p, cpu.sp, cpu.cycles
    );
    println!("- Audio samples: {}", samples.len());
    println!("- Runtime: {:.2}s", elapsed);

    if let Some(report_path) = cfg.report.as_ref() {
        let report = Report {
            rom: rom_path.display().to_string(),
            mapper: nes.mapper_name().to_string(),
            frames: cfg.frames,
            cpu,
            frame_hashes,
            audio_samples: samples.len(),
            counters: nes.debug_counters(),
            runtime_secs: elapsed,
        };
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(report_path, json)
            .with_context(|| format!("failed to write report {}", report_path.display()))?;
    }

    Ok(())
}
