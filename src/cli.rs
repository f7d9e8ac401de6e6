// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    hierarchy::Hierarchy, phash::DigestOutputs, undefine::UndefineRequest, util::parse_nv_index,
};
use clap::{
    builder::styling::{AnsiColor, Color, Style, Styles},
    Parser,
};
use std::path::PathBuf;

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .literal(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Green))))
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))));

const HELP_TEMPLATE: &str = "
{about-with-newline}
{usage-heading} {usage}

{positionals}

{options-heading}
{options}
";

/// Remove a TPM 2.0 NV index
#[derive(Parser, Debug, Default)]
#[command(version, about, styles = STYLES, help_template = HELP_TEMPLATE)]
pub struct Cli {
    #[arg(
        short = 'd',
        long,
        default_value = "/dev/tpmrm0",
        help = "TPM device path"
    )]
    pub device: String,

    #[arg(
        short = 'C',
        long,
        value_name = "HIERARCHY",
        help = "Authorizing hierarchy: o|owner|p|platform (default: from the NV attributes)"
    )]
    pub hierarchy: Option<Hierarchy>,

    #[arg(
        short = 'P',
        long,
        value_name = "AUTH",
        help = "Hierarchy authorization: str:VALUE, hex:HEX, file:PATH or session:PATH"
    )]
    pub auth: Option<String>,

    #[arg(
        short = 'S',
        long,
        value_name = "PATH",
        help = "Session file, repeatable. The first is the policy session for TPMA_NV_POLICY_DELETE"
    )]
    pub session: Vec<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Write the command parameter hash")]
    pub cphash: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Write the response parameter hash")]
    pub rphash: Option<PathBuf>,

    #[arg(value_parser = parse_nv_index, help = "NV index or offset, e.g. 0x1500016")]
    pub nv_index: u32,
}

impl From<&Cli> for UndefineRequest {
    fn from(cli: &Cli) -> Self {
        Self {
            nv_index: cli.nv_index,
            hierarchy: cli.hierarchy,
            auth: cli.auth.clone(),
            sessions: cli.session.clone(),
            outputs: DigestOutputs {
                cp_hash: cli.cphash.clone(),
                rp_hash: cli.rphash.clone(),
            },
        }
    }
}
