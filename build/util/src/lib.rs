// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-script helpers for the recovery loader.
//!
//! Board parameters live in TOML, either as a file under `boards/` at the
//! workspace root (selected by `RECOVERY_BOARD`) or as a literal document in
//! `RECOVERY_BOARD_CONFIG`. The literal document wins if both are set, which
//! is handy for one-off builds against an unusual flash layout.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::env;
use std::path::{Path, PathBuf};

const BOARD_VAR: &str = "RECOVERY_BOARD";
const BOARD_CONFIG_VAR: &str = "RECOVERY_BOARD_CONFIG";

/// Returns the build script's output directory.
pub fn out_dir() -> PathBuf {
    PathBuf::from(env::var("OUT_DIR").unwrap())
}

/// Returns the name of the selected board, if any.
pub fn target_board() -> Option<String> {
    env::var(BOARD_VAR).ok()
}

///
/// Pulls the board configuration for purposes of a build script. As with
/// app-wide configuration, `T` should only describe the parts of the board
/// file that a particular build script cares about; unknown keys must not be
/// rejected at the top level.
///
/// If neither `RECOVERY_BOARD_CONFIG` nor `RECOVERY_BOARD` is set, this
/// returns `T::default()`. If either is set but can't be read or parsed, this
/// fails with `Err`.
///
pub fn board_config_or_default<T: DeserializeOwned + Default>() -> Result<T> {
    // We want to emit these whether or not the env vars are present, so that
    // we'll be re-run if one becomes present.
    println!("cargo:rerun-if-env-changed={}", BOARD_CONFIG_VAR);
    println!("cargo:rerun-if-env-changed={}", BOARD_VAR);

    if let Ok(text) = env::var(BOARD_CONFIG_VAR) {
        println!("--- toml for ${} ---", BOARD_CONFIG_VAR);
        println!("{}", text);
        return parse(&text);
    }

    let Some(board) = target_board() else {
        println!("--- no board selected, using default ---");
        return Ok(T::default());
    };

    let path = board_file(&board)?;
    println!("cargo:rerun-if-changed={}", path.display());
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading board file {}", path.display()))?;
    println!("--- toml for board {} ---", board);
    println!("{}", text);
    parse(&text)
}

fn parse<T: DeserializeOwned>(text: &str) -> Result<T> {
    let rval = toml::from_str(text).context("parsing board toml")?;
    Ok(rval)
}

/// Finds `boards/<board>.toml` by walking up from the crate being built.
fn board_file(board: &str) -> Result<PathBuf> {
    let manifest = env::var("CARGO_MANIFEST_DIR")?;
    let name = format!("{board}.toml");
    Path::new(&manifest)
        .ancestors()
        .map(|dir| dir.join("boards").join(&name))
        .find(|candidate| candidate.is_file())
        .with_context(|| format!("no board file {name} found under boards/"))
}
