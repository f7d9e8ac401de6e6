// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Command and response parameter hashes.

use crate::{
    crypto::HashAlg,
    hierarchy::Hierarchy,
    nv::{NvIndexDescriptor, Operation},
    session::AuthSession,
};
use std::path::PathBuf;
use tpm2_protocol::data::TpmRcBase;

/// Where the parameter hashes go, if anywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestOutputs {
    pub cp_hash: Option<PathBuf>,
    pub rp_hash: Option<PathBuf>,
}

impl DigestOutputs {
    /// The command is only withheld when the caller asks for the cpHash
    /// alone. An rpHash can only be computed over a real response.
    #[must_use]
    pub fn dispatch_required(&self) -> bool {
        !(self.cp_hash.is_some() && self.rp_hash.is_none())
    }
}

/// Picks the parameter hash algorithm: the `authHash` of the first present
/// session, or SHA-256.
#[must_use]
pub fn select_algorithm(sessions: &[Option<&AuthSession>]) -> HashAlg {
    sessions
        .iter()
        .flatten()
        .map(|session| session.auth_hash)
        .next()
        .unwrap_or(HashAlg::Sha256)
}

/// A fully resolved undefine command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndefineCall {
    pub operation: Operation,
    pub hierarchy: Hierarchy,
    pub nv_index: u32,
    pub nv_name: Vec<u8>,
}

impl UndefineCall {
    #[must_use]
    pub fn new(operation: Operation, hierarchy: Hierarchy, nv: &NvIndexDescriptor) -> Self {
        Self {
            operation,
            hierarchy,
            nv_index: nv.index(),
            nv_name: nv.name.clone(),
        }
    }

    /// The handle area: `(authHandle, nvIndex)` for `NV_UndefineSpace` and
    /// `(nvIndex, platform)` for `NV_UndefineSpaceSpecial`.
    #[must_use]
    pub fn handles(&self) -> [u32; 2] {
        match self.operation {
            Operation::Undefine => [self.hierarchy.handle(), self.nv_index],
            Operation::UndefineSpecial => [self.nv_index, self.hierarchy.handle()],
        }
    }

    #[must_use]
    pub fn names(&self) -> [Vec<u8>; 2] {
        match self.operation {
            Operation::Undefine => [self.hierarchy.name(), self.nv_name.clone()],
            Operation::UndefineSpecial => [self.nv_name.clone(), self.hierarchy.name()],
        }
    }

    /// `H(commandCode || Name1 || Name2)`. Both commands are parameterless.
    #[must_use]
    pub fn cp_hash(&self, alg: HashAlg) -> Vec<u8> {
        let [name1, name2] = self.names();
        alg.digest(&[
            &(self.operation.command_code() as u32).to_be_bytes(),
            &name1,
            &name2,
        ])
    }

    /// `H(responseCode || commandCode)` for a successful response without
    /// parameters.
    #[must_use]
    pub fn rp_hash(&self, alg: HashAlg) -> Vec<u8> {
        alg.digest(&[
            &(TpmRcBase::Success as u32).to_be_bytes(),
            &(self.operation.command_code() as u32).to_be_bytes(),
        ])
    }
}

/// The parameter hashes of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterHash {
    pub algorithm: HashAlg,
    pub cp_hash: Vec<u8>,
    pub rp_hash: Vec<u8>,
}

impl ParameterHash {
    #[must_use]
    pub fn compute(call: &UndefineCall, algorithm: HashAlg) -> Self {
        Self {
            algorithm,
            cp_hash: call.cp_hash(algorithm),
            rp_hash: call.rp_hash(algorithm),
        }
    }
}
