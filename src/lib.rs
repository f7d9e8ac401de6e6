// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

#![deny(clippy::all)]
#![deny(clippy::pedantic)]

pub mod cli;
pub mod crypto;
pub mod device;
pub mod error;
pub mod hierarchy;
pub mod mocktpm;
pub mod nv;
pub mod output;
pub mod phash;
pub mod session;
pub mod tpm;
pub mod transport;
pub mod undefine;
pub mod util;

pub use crate::error::CliError;

use crate::{
    cli::Cli,
    device::TpmDevice,
    output::FileOutput,
    session::FileSessionStore,
    transport::FileTransport,
    undefine::{Outcome, UndefineRequest},
};
use clap::Parser;
use std::fs::OpenOptions;

/// Parses command-line arguments and undefines the NV index.
///
/// # Errors
///
/// Returns a `CliError` if opening the device, or any stage of the run fails.
pub fn execute_cli() -> Result<Outcome, CliError> {
    let cli = Cli::parse();
    let request = UndefineRequest::from(&cli);

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.device)
        .map_err(|e| CliError::File(cli.device.clone(), e))?;
    let mut device = TpmDevice::new(Box::new(FileTransport(file)));

    undefine::run(
        &request,
        &mut device,
        &mut FileSessionStore,
        &mut FileOutput,
    )
}
