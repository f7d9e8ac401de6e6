// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Handle ranges and header layout used alongside `tpm2_protocol`.

pub const TPM_HEADER_SIZE: usize = 10;

pub const TPM_RS_PW: u32 = 0x4000_0009;

pub const TPM_HT_NV_INDEX: u8 = 0x01;
pub const TPM_HT_HMAC_SESSION: u8 = 0x02;
pub const TPM_HT_POLICY_SESSION: u8 = 0x03;

pub const NV_INDEX_FIRST: u32 = 0x0100_0000;
pub const NV_INDEX_LAST: u32 = 0x01ff_ffff;

/// Returns the handle type, i.e. the most significant octet of a handle.
#[must_use]
pub const fn handle_type(handle: u32) -> u8 {
    handle.to_be_bytes()[0]
}

/// Reads the raw response code from a response header.
#[must_use]
pub fn response_code(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(6..TPM_HEADER_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}
