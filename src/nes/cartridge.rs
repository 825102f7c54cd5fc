use anyhow::{Context, Result};
use std::{fs, path::Path};
use thiserror::Error;
use tracing::debug;

use super::mapper::Mirroring;

pub const HEADER_LEN: usize = 16;
pub const TRAINER_LEN: usize = 512;
pub const PRG_UNIT: usize = 16 * 1024;
pub const CHR_UNIT: usize = 8 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CartridgeError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("ROM truncated: expected {expected} {section} bytes, found {actual}")]
    Truncated {
        section: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFormat {
    Archaic,
    INes,
    Nes20,
}

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub format: HeaderFormat,
    pub mapper_id: u16,
    pub submapper_id: u8,
    pub mirroring: Mirroring,
    pub four_screen: bool,
    pub has_battery_backed_ram: bool,
    pub trainer: Option<Vec<u8>>,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
    pub prg_ram_size: usize,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        let cart = Self::from_bytes(&bytes)
            .with_context(|| format!("failed to parse ROM: {}", path.display()))?;
        Ok(cart)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CartridgeError> {
        if bytes.len() < HEADER_LEN {
            return Err(CartridgeError::UnsupportedFormat(format!(
                "file is {} bytes, too small for a header",
                bytes.len()
            )));
        }
        if &bytes[0..4] != b"NES\x1A" {
            return Err(CartridgeError::UnsupportedFormat(
                "missing NES<EOF> signature".to_string(),
            ));
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let format = match flags7 & 0x0C {
            0x00 => HeaderFormat::INes,
            0x04 => HeaderFormat::Archaic,
            0x08 => HeaderFormat::Nes20,
            _ => {
                return Err(CartridgeError::UnsupportedFormat(
                    "reserved header variant bits".to_string(),
                ));
            }
        };

        let (mapper_id, submapper_id) = match format {
            HeaderFormat::Nes20 => (
                ((flags6 as u16) >> 4)
                    | ((flags7 as u16) & 0xF0)
                    | (((bytes[8] as u16) & 0x0F) << 8),
                bytes[8] >> 4,
            ),
            HeaderFormat::INes => (((flags6 as u16) >> 4) | ((flags7 as u16) & 0xF0), 0),
            // Bytes 7-15 of archaic dumps often carry a ripper's name.
            HeaderFormat::Archaic => ((flags6 as u16) >> 4, 0),
        };

        let four_screen = (flags6 & 0x08) != 0;
        let mirroring = if four_screen {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let trainer_present = (flags6 & 0x04) != 0;
        let has_battery_backed_ram = (flags6 & 0x02) != 0;

        let (prg_rom_size, chr_rom_size, prg_ram_size) = match format {
            HeaderFormat::Nes20 => {
                let prg = nes2_rom_size(bytes[4], bytes[9] & 0x0F, PRG_UNIT);
                let chr = nes2_rom_size(bytes[5], bytes[9] >> 4, CHR_UNIT);
                let volatile = shift_size(bytes[10] & 0x0F);
                let battery = shift_size(bytes[10] >> 4);
                let ram = volatile.max(battery);
                (prg, chr, if ram == 0 { 8 * 1024 } else { ram })
            }
            HeaderFormat::INes | HeaderFormat::Archaic => {
                let ram_units = if bytes[8] == 0 || format == HeaderFormat::Archaic {
                    1
                } else {
                    bytes[8] as usize
                };
                (
                    bytes[4] as usize * PRG_UNIT,
                    bytes[5] as usize * CHR_UNIT,
                    ram_units * 8 * 1024,
                )
            }
        };

        if prg_rom_size == 0 {
            return Err(CartridgeError::UnsupportedFormat(
                "header declares no PRG ROM".to_string(),
            ));
        }

        let mut cursor = HEADER_LEN;
        let trainer = if trainer_present {
            let block = take(bytes, cursor, TRAINER_LEN, "trainer")?;
            cursor += TRAINER_LEN;
            Some(block.to_vec())
        } else {
            None
        };

        let prg_rom = take(bytes, cursor, prg_rom_size, "PRG")?.to_vec();
        cursor += prg_rom_size;

        let (chr_data, chr_is_ram) = if chr_rom_size == 0 {
            (vec![0; CHR_UNIT], true)
        } else {
            (take(bytes, cursor, chr_rom_size, "CHR")?.to_vec(), false)
        };

        debug!(
            mapper_id,
            submapper_id,
            ?format,
            prg_rom = prg_rom.len(),
            chr = chr_data.len(),
            chr_is_ram,
            ?mirroring,
            trainer = trainer.is_some(),
            "parsed cartridge header"
        );

        Ok(Self {
            format,
            mapper_id,
            submapper_id,
            mirroring,
            four_screen,
            has_battery_backed_ram,
            trainer,
            prg_rom,
            chr_data,
            chr_is_ram,
            prg_ram_size,
        })
    }

    pub fn prg_banks_16k(&self) -> usize {
        self.prg_rom.len() / PRG_UNIT
    }

    pub fn chr_banks_8k(&self) -> usize {
        if self.chr_is_ram {
            0
        } else {
            self.chr_data.len() / CHR_UNIT
        }
    }
}

fn take<'a>(
    bytes: &'a [u8],
    start: usize,
    len: usize,
    section: &'static str,
) -> Result<&'a [u8], CartridgeError> {
    start
        .checked_add(len)
        .and_then(|end| bytes.get(start..end))
        .ok_or(CartridgeError::Truncated {
            section,
            expected: len,
            actual: bytes.len().saturating_sub(start),
        })
}

/// NES 2.0 ROM size: plain unit count, or `2^E * (M*2+1)` bytes when the MSB
/// nibble is 0xF.
fn nes2_rom_size(lsb: u8, msb_nibble: u8, unit: usize) -> usize {
    if msb_nibble == 0x0F {
        let exponent = (lsb >> 2) as u32;
        let multiplier = (lsb & 0x03) as usize * 2 + 1;
        2usize
            .checked_pow(exponent)
            .and_then(|base| base.checked_mul(multiplier))
            .unwrap_or(usize::MAX)
    } else {
        (((msb_nibble as usize) << 8) | lsb as usize) * unit
    }
}

fn shift_size(shift: u8) -> usize {
    if shift == 0 { 0 } else { 64usize << shift }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ines_image(mapper: u8, prg_banks: u8, chr_banks: u8, flags6_low: u8) -> Vec<u8> {
        let mut rom = vec![
            b'N',
            b'E',
            b'S',
            0x1A,
            prg_banks,
            chr_banks,
            (mapper << 4) | (flags6_low & 0x0F),
            mapper & 0xF0,
        ];
        rom.resize(HEADER_LEN, 0);
        if flags6_low & 0x04 != 0 {
            rom.extend((0..TRAINER_LEN).map(|i| i as u8));
        }
        rom.extend(std::iter::repeat_n(0xEA, prg_banks as usize * PRG_UNIT));
        rom.extend(std::iter::repeat_n(0x33, chr_banks as usize * CHR_UNIT));
        rom
    }

    #[test]
    fn rejects_bad_signature() {
        let mut rom = ines_image(0, 1, 1, 0);
        rom[3] = 0x00;
        let err = Cartridge::from_bytes(&rom).unwrap_err();
        assert!(matches!(err, CartridgeError::UnsupportedFormat(_)));
    }

    #[test]
    fn rejects_short_file() {
        let err = Cartridge::from_bytes(b"NES\x1A").unwrap_err();
        assert!(matches!(err, CartridgeError::UnsupportedFormat(_)));
    }

    #[test]
    fn reports_truncated_prg() {
        let mut rom = ines_image(0, 2, 0, 0);
        rom.truncate(HEADER_LEN + PRG_UNIT);
        let err = Cartridge::from_bytes(&rom).unwrap_err();
        assert_eq!(
            err,
            CartridgeError::Truncated {
                section: "PRG",
                expected: 2 * PRG_UNIT,
                actual: PRG_UNIT,
            }
        );
    }

    #[test]
    fn parses_ines_header_fields() {
        let rom = ines_image(0x42, 2, 1, 0x01 | 0x02);
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.format, HeaderFormat::INes);
        assert_eq!(cart.mapper_id, 0x42);
        assert_eq!(cart.mirroring, Mirroring::Vertical);
        assert!(cart.has_battery_backed_ram);
        assert_eq!(cart.prg_banks_16k(), 2);
        assert_eq!(cart.chr_banks_8k(), 1);
        assert!(!cart.chr_is_ram);
    }

    #[test]
    fn keeps_trainer_and_allocates_chr_ram() {
        let rom = ines_image(0, 1, 0, 0x04);
        let cart = Cartridge::from_bytes(&rom).unwrap();
        let trainer = cart.trainer.as_deref().unwrap();
        assert_eq!(trainer.len(), TRAINER_LEN);
        assert_eq!(trainer[3], 3);
        assert_eq!(cart.prg_rom[0], 0xEA);
        assert!(cart.chr_is_ram);
        assert_eq!(cart.chr_data.len(), CHR_UNIT);
    }

    #[test]
    fn four_screen_overrides_mirroring_bit() {
        let rom = ines_image(4, 2, 1, 0x08 | 0x01);
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert!(cart.four_screen);
        assert_eq!(cart.mirroring, Mirroring::FourScreen);
    }

    #[test]
    fn parses_nes2_extended_fields() {
        let mut rom = ines_image(4, 2, 1, 0);
        rom[7] |= 0x08;
        rom[8] = 0x31;
        rom[10] = 0x07;
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.format, HeaderFormat::Nes20);
        assert_eq!(cart.mapper_id, 0x104);
        assert_eq!(cart.submapper_id, 3);
        assert_eq!(cart.prg_ram_size, 8 * 1024);
    }

    #[test]
    fn nes2_exponent_sizes() {
        assert_eq!(nes2_rom_size(0x02, 0, PRG_UNIT), 2 * PRG_UNIT);
        assert_eq!(nes2_rom_size(0x01, 1, CHR_UNIT), 0x101 * CHR_UNIT);
        // 2^14 * 3
        assert_eq!(nes2_rom_size((14 << 2) | 1, 0x0F, PRG_UNIT), 49_152);
    }

    #[test]
    fn archaic_header_ignores_upper_mapper_nibble() {
        let mut rom = ines_image(0x02, 1, 1, 0);
        rom[7] = 0x44;
        rom[12..16].copy_from_slice(b"Dude");
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.format, HeaderFormat::Archaic);
        assert_eq!(cart.mapper_id, 0x02);
    }

    #[test]
    fn reserved_header_variant_is_unsupported() {
        let mut rom = ines_image(0, 1, 1, 0);
        rom[7] |= 0x0C;
        let err = Cartridge::from_bytes(&rom).unwrap_err();
        assert!(matches!(err, CartridgeError::UnsupportedFormat(_)));
    }
}
