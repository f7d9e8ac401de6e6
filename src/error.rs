// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::device::TpmDeviceError;
use std::{io::Error as IoError, num::ParseIntError};
use thiserror::Error;
use tpm2_protocol::TpmErrorKind;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}")]
    Custom(String),
    #[error("hex decoding failed: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("integer parsing failed: {0}")]
    Int(#[from] ParseIntError),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("TPM protocol: {0}")]
    Build(TpmErrorKind),

    #[error("Execution: {0}")]
    Execution(String),

    #[error("'{0}': {1}")]
    File(String, #[source] IoError),

    #[error("I/O: {0}")]
    Io(#[from] IoError),

    #[error("Parser: {0}")]
    Parse(#[from] ParseError),

    #[error("'{path}': {source} ({state})")]
    PartialOutput {
        path: String,
        state: &'static str,
        #[source]
        source: IoError,
    },

    #[error("Session '{0}': {1}")]
    Teardown(String, #[source] Box<CliError>),

    #[error("{step}: {source}")]
    Tpm {
        step: &'static str,
        #[source]
        source: TpmDeviceError,
    },

    #[error("Usage: {0}")]
    Usage(String),
}

/// Classes of failure, each with its own exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalid input, detected before the TPM state is touched.
    Configuration,
    /// The TPM rejected a command.
    Anchor,
    /// Talking to the TPM failed.
    Transport,
    /// A digest was computed, or the NV index undefined, but the digest
    /// could not be written.
    PartialOutput,
    /// A session could not be closed.
    Teardown,
    General,
}

impl ErrorClass {
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::General | Self::Teardown => 1,
            Self::Configuration => 2,
            Self::Anchor => 3,
            Self::Transport => 4,
            Self::PartialOutput => 5,
        }
    }
}

impl CliError {
    /// Wraps a device error with the name of the step that failed.
    #[must_use]
    pub fn tpm(step: &'static str) -> impl FnOnce(TpmDeviceError) -> Self {
        move |source| Self::Tpm { step, source }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Usage(_) | Self::Parse(_) => ErrorClass::Configuration,
            Self::Tpm {
                source: TpmDeviceError::TpmRc(_) | TpmDeviceError::UnknownRc(_),
                ..
            } => ErrorClass::Anchor,
            Self::Tpm { .. } => ErrorClass::Transport,
            Self::PartialOutput { .. } => ErrorClass::PartialOutput,
            Self::Teardown(..) => ErrorClass::Teardown,
            Self::Build(_) | Self::Execution(_) | Self::File(..) | Self::Io(_) => {
                ErrorClass::General
            }
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.class().exit_code()
    }
}

impl From<TpmErrorKind> for CliError {
    fn from(err: TpmErrorKind) -> Self {
        CliError::Build(err)
    }
}
