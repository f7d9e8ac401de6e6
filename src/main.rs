// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024-2025 Jarkko Sakkinen
// Copyright (c) 2025 Opinsys Oy

use log::error;
use nvundefine::execute_cli;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    if let Err(err) = execute_cli() {
        error!("{err}");
        std::process::exit(err.exit_code());
    }
}
