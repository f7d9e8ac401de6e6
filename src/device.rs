// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{tpm::response_code, transport::Transport};
use indicatif::{ProgressBar, ProgressStyle};
use log::{trace, warn};
use std::{
    io::{self, IsTerminal},
    time::Duration,
};
use thiserror::Error;
use tpm2_protocol::{
    data::{TpmCc, TpmRc, TpmSt, TpmsAuthCommand, TpmsNvPublic},
    message::{
        tpm_build_command, tpm_parse_response, TpmAuthResponses, TpmHeader,
        TpmNvReadPublicCommand, TpmResponseBody,
    },
    TpmErrorKind, TpmWriter, TPM_MAX_COMMAND_SIZE,
};

#[derive(Debug, Error)]
pub enum TpmDeviceError {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),

    #[error("mismatched response for {command:?}")]
    MismatchedResponse { command: TpmCc },

    #[error("protocol: {0}")]
    Protocol(TpmErrorKind),

    #[error("response overflow")]
    ResponseOverflow,

    #[error("response underflow")]
    ResponseUnderflow,

    #[error("{0}")]
    TpmRc(TpmRc),

    #[error("TPM_RC {0:#05x}")]
    UnknownRc(u32),
}

impl From<TpmErrorKind> for TpmDeviceError {
    fn from(err: TpmErrorKind) -> Self {
        Self::Protocol(err)
    }
}

pub struct TpmDevice {
    transport: Box<dyn Transport>,
}

impl std::fmt::Debug for TpmDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmDevice")
            .field("transport", &self.transport)
            .finish()
    }
}

impl TpmDevice {
    #[must_use]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Sends a command to the TPM and waits for the response.
    ///
    /// Displays a spinner on stderr if the operation is long-running.
    ///
    /// # Errors
    ///
    /// This function will return an error if building the command fails, I/O
    /// with the device fails, or the TPM returns any response code other than
    /// `TPM_RC_SUCCESS`. Warnings are errors: the command was not executed.
    pub fn execute<C: TpmHeader>(
        &mut self,
        command: &C,
        sessions: &[TpmsAuthCommand],
    ) -> Result<(TpmResponseBody, TpmAuthResponses), TpmDeviceError> {
        let mut command_buf = [0u8; TPM_MAX_COMMAND_SIZE];
        let len = {
            let mut writer = TpmWriter::new(&mut command_buf);
            let tag = if sessions.is_empty() {
                TpmSt::NoSessions
            } else {
                TpmSt::Sessions
            };
            tpm_build_command(command, tag, sessions, &mut writer)?;
            writer.len()
        };
        let command_bytes = &command_buf[..len];

        let maybe_pb = if io::stderr().is_terminal() {
            let pb = ProgressBar::new_spinner();
            pb.enable_steady_tick(Duration::from_millis(100));
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg}") {
                pb.set_style(
                    style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
                );
            }
            pb.set_message("Waiting for TPM...");
            Some(pb)
        } else {
            None
        };

        trace!(target: "nvundefine::device", "Command: {}", hex::encode(command_bytes));
        let result = self
            .transport
            .send(command_bytes)
            .and_then(|()| self.transport.receive());

        if let Some(pb) = maybe_pb {
            pb.finish_and_clear();
        }

        let resp_buf = result?;
        trace!(target: "nvundefine::device", "Response: {}", hex::encode(&resp_buf));

        let raw_rc = response_code(&resp_buf).ok_or(TpmDeviceError::ResponseUnderflow)?;
        if raw_rc != 0 {
            let rc = TpmRc::try_from(raw_rc).map_err(|_| TpmDeviceError::UnknownRc(raw_rc))?;
            if rc.is_warning() {
                warn!(target: "nvundefine::device", "{:?} was not executed: {rc}", C::COMMAND);
            }
            return Err(TpmDeviceError::TpmRc(rc));
        }

        match tpm_parse_response(C::COMMAND, &resp_buf)? {
            Ok((_, response, auth)) => Ok((response, auth)),
            Err((rc, _)) => Err(TpmDeviceError::TpmRc(rc)),
        }
    }

    /// Reads the public area and the Name of an NV index.
    ///
    /// # Errors
    ///
    /// Returns a `TpmDeviceError` if the command fails or the response does
    /// not parse.
    pub fn nv_read_public(
        &mut self,
        nv_index: u32,
    ) -> Result<(TpmsNvPublic, Vec<u8>), TpmDeviceError> {
        let cmd = TpmNvReadPublicCommand {
            nv_index: nv_index.into(),
        };
        let (resp, _) = self.execute(&cmd, &[])?;
        let resp = resp
            .NvReadPublic()
            .map_err(|_| TpmDeviceError::MismatchedResponse {
                command: TpmCc::NvReadPublic,
            })?;
        Ok((resp.nv_public.inner, resp.nv_name.to_vec()))
    }
}
