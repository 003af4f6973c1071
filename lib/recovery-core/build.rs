// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::io::Write;

fn main() -> Result<()> {
    let board = build_util::board_config_or_default::<Board>()?;
    board.check()?;

    let dest_path = build_util::out_dir().join("board_config.rs");
    let mut out = std::fs::File::create(dest_path)
        .context("creating board_config.rs")?;

    writeln!(out, "/// Transfer block size in bytes.")?;
    writeln!(out, "pub const BLOCK_LEN: usize = {};", board.block_len)?;
    writeln!(out, "/// File names shown per page of the file list.")?;
    writeln!(
        out,
        "pub const NAMES_ON_SCREEN: usize = {};",
        board.names_on_screen
    )?;

    let Flash {
        base,
        size,
        bootloader_size,
        page_size,
    } = board.flash;
    writeln!(out, "/// Parameters of the `{}` board.", board.name)?;
    writeln!(out, "pub const BOARD: BoardConfig = BoardConfig {{")?;
    writeln!(out, "    name: {:?},", board.name)?;
    writeln!(out, "    flash: FlashConfig {{")?;
    writeln!(out, "        base: {base:#x},")?;
    writeln!(out, "        size: {size:#x},")?;
    writeln!(out, "        bootloader_size: {bootloader_size:#x},")?;
    writeln!(out, "        page_size: {page_size},")?;
    writeln!(out, "    }},")?;
    match board.eeprom {
        Some(e) => {
            writeln!(out, "    eeprom: Some(EepromConfig {{")?;
            writeln!(out, "        size: {:#x},", e.size)?;
            writeln!(out, "        version: {},", e.version)?;
            writeln!(out, "        header_len: {:#x},", e.header_len)?;
            writeln!(out, "        block_size: {:#x},", e.block_size)?;
            writeln!(out, "    }}),")?;
        }
        None => writeln!(out, "    eeprom: None,")?,
    }
    let s = board.signature;
    writeln!(out, "    signature: SignatureConfig {{")?;
    writeln!(out, "        stack_mask: {:#x},", s.stack_mask)?;
    writeln!(out, "        stack_base: {:#x},", s.stack_base)?;
    writeln!(out, "        vector_mask: {:#x},", s.vector_mask)?;
    writeln!(out, "        vector_base: {:#x},", s.vector_base)?;
    writeln!(out, "    }},")?;
    let i = board.input;
    writeln!(out, "    input: InputConfig {{")?;
    writeln!(out, "        boot_keys: {:#x},", i.boot_keys)?;
    writeln!(
        out,
        "        encoder_granularity: {:?},",
        i.encoder_granularity
    )?;
    writeln!(
        out,
        "        power_up_delay_ticks: {},",
        i.power_up_delay_ticks
    )?;
    writeln!(out, "        timing: KeyTiming {{")?;
    writeln!(out, "            long_delay: {},", i.long_delay)?;
    writeln!(out, "            repeat_delay: {},", i.repeat_delay)?;
    writeln!(out, "            repeat_trigger: {},", i.repeat_trigger)?;
    writeln!(out, "        }},")?;
    writeln!(out, "    }},")?;
    writeln!(out, "}};")?;

    Ok(())
}

/// Board description, as found in `boards/<name>.toml`.
#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Board {
    name: String,
    block_len: u32,
    names_on_screen: u32,
    flash: Flash,
    eeprom: Option<Eeprom>,
    signature: Signature,
    input: Input,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Flash {
    base: u32,
    size: u32,
    bootloader_size: u32,
    page_size: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Eeprom {
    size: u32,
    version: u8,
    header_len: u8,
    block_size: u8,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Signature {
    stack_mask: u32,
    stack_base: u32,
    vector_mask: u32,
    vector_base: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Input {
    boot_keys: u8,
    #[serde(default)]
    encoder_granularity: Option<i32>,
    #[serde(default = "default_power_up_delay")]
    power_up_delay_ticks: u16,
    #[serde(default = "default_long_delay")]
    long_delay: u8,
    #[serde(default = "default_repeat_delay")]
    repeat_delay: u8,
    #[serde(default = "default_repeat_trigger")]
    repeat_trigger: u8,
}

fn default_power_up_delay() -> u16 {
    20
}

fn default_long_delay() -> u8 {
    32
}

fn default_repeat_delay() -> u8 {
    40
}

fn default_repeat_trigger() -> u8 {
    48
}

/// With no board selected we build for the Taranis X9D, which is also what
/// host tests run against.
impl Default for Board {
    fn default() -> Self {
        Self {
            name: "x9d".to_string(),
            block_len: 4096,
            names_on_screen: 6,
            flash: Flash {
                base: 0x0800_0000,
                size: 0x8_0000,
                bootloader_size: 0x8000,
                page_size: 256,
            },
            eeprom: Some(Eeprom {
                size: 0x8000,
                version: 5,
                header_len: 0x40,
                block_size: 0x40,
            }),
            signature: Signature {
                stack_mask: 0xFFFE_3000,
                stack_base: 0x2000_0000,
                vector_mask: 0xFFF0_0000,
                vector_base: 0x0800_0000,
            },
            input: Input {
                boot_keys: 0x42,
                encoder_granularity: None,
                power_up_delay_ticks: default_power_up_delay(),
                long_delay: default_long_delay(),
                repeat_delay: default_repeat_delay(),
                repeat_trigger: default_repeat_trigger(),
            },
        }
    }
}

impl Board {
    /// Catches board files that would otherwise fail deep inside the
    /// generated code's static assertions.
    fn check(&self) -> Result<()> {
        if self.flash.page_size == 0 || self.flash.page_size % 4 != 0 {
            bail!("flash page-size must be a non-zero multiple of 4");
        }
        if self.block_len % self.flash.page_size != 0 {
            bail!("block-len must be a multiple of the flash page-size");
        }
        if self.flash.bootloader_size >= self.flash.size {
            bail!("bootloader-size must be smaller than the flash");
        }
        if self.input.encoder_granularity.is_some_and(|g| g <= 0) {
            bail!("encoder-granularity must be positive");
        }
        if self.input.long_delay >= self.input.repeat_delay {
            bail!("long-delay must be shorter than repeat-delay");
        }
        Ok(())
    }
}
