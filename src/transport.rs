// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{device::TpmDeviceError, tpm::TPM_HEADER_SIZE};
use std::{
    fs::File,
    io::{Read, Write},
};
use tpm2_protocol::TPM_MAX_COMMAND_SIZE;

/// A trait for a transport layer capable of sending and receiving full TPM commands.
pub trait Transport: Send + std::fmt::Debug {
    /// Sends a complete command buffer to the TPM.
    ///
    /// # Errors
    ///
    /// Returns a `TpmDeviceError` on I/O failure.
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TpmDeviceError>;

    /// Receives a complete response buffer from the TPM.
    ///
    /// This method is responsible for handling TPM response framing, i.e., reading
    /// the header to determine the full message size and then reading the
    /// remainder of the message.
    ///
    /// # Errors
    ///
    /// Returns a `TpmDeviceError` on I/O failure or if the response is malformed.
    fn receive(&mut self) -> Result<Vec<u8>, TpmDeviceError>;
}

/// A transport implementation that wraps a `std::fs::File`, e.g. `/dev/tpmrm0`.
#[derive(Debug)]
pub struct FileTransport(pub File);

impl Transport for FileTransport {
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TpmDeviceError> {
        self.0.write_all(command_bytes)?;
        self.0.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TpmDeviceError> {
        let mut header = [0u8; TPM_HEADER_SIZE];
        self.0.read_exact(&mut header)?;

        let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        if size < header.len() {
            return Err(TpmDeviceError::ResponseUnderflow);
        }
        if size > TPM_MAX_COMMAND_SIZE {
            return Err(TpmDeviceError::ResponseOverflow);
        }

        let mut resp_buf = header.to_vec();
        resp_buf.resize(size, 0);
        self.0.read_exact(&mut resp_buf[header.len()..])?;
        Ok(resp_buf)
    }
}
