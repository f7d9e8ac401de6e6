// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    error::ParseError,
    tpm::{NV_INDEX_FIRST, NV_INDEX_LAST},
};
use tpm2_protocol::{TpmBuild, TpmErrorKind, TpmWriter, TPM_MAX_COMMAND_SIZE};

/// Parses a hex string (with or without a "0x" prefix) into a u32.
///
/// # Errors
///
/// Returns a `ParseError` if the string is not a valid hex integer.
pub fn parse_hex_u32(s: &str) -> Result<u32, ParseError> {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    Ok(u32::from_str_radix(s, 16)?)
}

/// Parses an NV index (decimal, or hex with a "0x" prefix).
///
/// Values below the NV handle range are offsets into it, i.e. `0x1500016`
/// and `0x500016` name the same index.
///
/// # Errors
///
/// Returns a `ParseError` if the string is not an integer or the value is
/// outside the NV handle range.
pub fn parse_nv_index(s: &str) -> Result<u32, ParseError> {
    let value = if s.starts_with("0x") || s.starts_with("0X") {
        parse_hex_u32(s)?
    } else {
        s.parse::<u32>()?
    };

    let index = if value < NV_INDEX_FIRST {
        NV_INDEX_FIRST | value
    } else {
        value
    };

    if (NV_INDEX_FIRST..=NV_INDEX_LAST).contains(&index) {
        Ok(index)
    } else {
        Err(ParseError::Custom(format!(
            "'{s}' is not an NV index ({NV_INDEX_FIRST:#010x}..={NV_INDEX_LAST:#010x})"
        )))
    }
}

/// A helper to build a `TpmBuild` type into a `Vec<u8>`.
///
/// # Errors
///
/// Returns a `TpmErrorKind` if the object cannot be serialized into the buffer.
pub fn build_to_vec<T: TpmBuild>(obj: &T) -> Result<Vec<u8>, TpmErrorKind> {
    let mut buf = [0u8; TPM_MAX_COMMAND_SIZE];
    let len = {
        let mut writer = TpmWriter::new(&mut buf);
        obj.build(&mut writer)?;
        writer.len()
    };
    Ok(buf[..len].to_vec())
}
