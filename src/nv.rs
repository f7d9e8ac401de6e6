// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::{
    crypto::HashAlg,
    device::TpmDevice,
    hierarchy::Hierarchy,
    util::build_to_vec,
    CliError,
};
use log::{debug, error};
use std::fmt;
use tpm2_protocol::data::{TpmCc, TpmaNv, TpmsNvPublic};

/// Computes the Name of an NV index: `nameAlg || H_nameAlg(TPMS_NV_PUBLIC)`.
///
/// # Errors
///
/// Returns a `CliError` if the name algorithm is not supported or the public
/// area cannot be marshaled.
pub fn nv_name(public: &TpmsNvPublic) -> Result<Vec<u8>, CliError> {
    let alg = HashAlg::try_from(public.name_alg)?;
    let marshaled = build_to_vec(public)?;
    let mut name = (public.name_alg as u16).to_be_bytes().to_vec();
    name.extend_from_slice(&alg.digest(&[&marshaled]));
    Ok(name)
}

/// An NV index as read from the TPM.
#[derive(Debug, Clone)]
pub struct NvIndexDescriptor {
    pub index: u32,
    pub public: TpmsNvPublic,
    pub name: Vec<u8>,
}

impl NvIndexDescriptor {
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn attributes(&self) -> TpmaNv {
        self.public.attributes
    }
}

/// Reads the public area of an NV index.
///
/// The Name returned by the TPM is cross-checked with the public area when
/// its name algorithm is known.
///
/// # Errors
///
/// Returns `CliError::Tpm` if the index cannot be read, and
/// `CliError::Execution` if the returned Name does not match the public area.
pub fn probe(device: &mut TpmDevice, nv_index: u32) -> Result<NvIndexDescriptor, CliError> {
    let (public, name) = device.nv_read_public(nv_index).map_err(|e| {
        error!("Failed to read the public part of NV index {nv_index:#010x}");
        CliError::tpm("NV_ReadPublic")(e)
    })?;

    match nv_name(&public) {
        Ok(expected) if expected != name => {
            return Err(CliError::Execution(format!(
                "NV index {nv_index:#010x}: Name does not match the public area"
            )));
        }
        Ok(_) => {}
        Err(err) => debug!("NV index {nv_index:#010x}: Name not verified: {err}"),
    }

    debug!(
        "NV index {nv_index:#010x}: attributes={:#010x} name_alg={:?}",
        public.attributes.bits(),
        public.name_alg
    );
    Ok(NvIndexDescriptor {
        index: nv_index,
        public,
        name,
    })
}

/// The command used to undefine the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `TPM2_NV_UndefineSpace`, authorized by owner or platform.
    Undefine,
    /// `TPM2_NV_UndefineSpaceSpecial`, authorized by a policy session for the
    /// index and by platform.
    UndefineSpecial,
}

impl Operation {
    #[must_use]
    pub const fn command_code(self) -> TpmCc {
        match self {
            Self::Undefine => TpmCc::NvUndefineSpace,
            Self::UndefineSpecial => TpmCc::NvUndefineSpaceSpecial,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Undefine => "NV_UndefineSpace",
            Self::UndefineSpecial => "NV_UndefineSpaceSpecial",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDecision {
    pub operation: Operation,
    pub hierarchy: Hierarchy,
}

/// Chooses the undefine command and the authorization hierarchy from the NV
/// attributes.
///
/// `TPMA_NV_POLICY_DELETE` selects `NV_UndefineSpaceSpecial`. Either
/// `TPMA_NV_POLICY_DELETE` or `TPMA_NV_PLATFORMCREATE` makes platform the
/// default hierarchy. An explicitly requested hierarchy is always used as is.
#[must_use]
pub fn select(attributes: TpmaNv, requested: Option<Hierarchy>) -> DispatchDecision {
    let policy_delete = attributes.contains(TpmaNv::POLICY_DELETE);
    let platform_required = policy_delete || attributes.contains(TpmaNv::PLATFORMCREATE);

    let operation = if policy_delete {
        Operation::UndefineSpecial
    } else {
        Operation::Undefine
    };
    let hierarchy = requested.unwrap_or(if platform_required {
        Hierarchy::Platform
    } else {
        Hierarchy::Owner
    });

    DispatchDecision {
        operation,
        hierarchy,
    }
}
