// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::{
    device::{TpmDevice, TpmDeviceError},
    hierarchy::{AuthHierarchy, Hierarchy, HierarchyAuth},
    nv::{self, DispatchDecision, Operation},
    output::OutputWriter,
    phash::{select_algorithm, DigestOutputs, ParameterHash, UndefineCall},
    session::{password_auth, AuthSlot, SessionSet, SessionStore},
    CliError,
};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use tpm2_protocol::{
    data::{TpmCc, TpmsAuthCommand},
    message::{TpmAuthResponses, TpmNvUndefineSpaceCommand, TpmNvUndefineSpaceSpecialCommand},
};

const CP_HASH_STATE: &str = "nothing was sent to the TPM";
const RP_HASH_STATE: &str = "the NV index has already been undefined";

/// The caller's request, as given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndefineRequest {
    pub nv_index: u32,
    pub hierarchy: Option<Hierarchy>,
    pub auth: Option<String>,
    pub sessions: Vec<PathBuf>,
    pub outputs: DigestOutputs,
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub decision: DispatchDecision,
    pub parameter_hash: ParameterHash,
    pub dispatched: bool,
}

/// State owned by a single run.
#[derive(Debug)]
pub struct RunContext {
    nv_index: u32,
    requested: Option<Hierarchy>,
    auth: HierarchyAuth,
    sessions: SessionSet,
    outputs: DigestOutputs,
}

impl RunContext {
    /// Validates the parts of the request that do not need the TPM.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the authorization cannot be parsed or too
    /// many sessions are given.
    pub fn new(request: &UndefineRequest) -> Result<Self, CliError> {
        let auth = request
            .auth
            .as_deref()
            .map(HierarchyAuth::parse)
            .transpose()?
            .unwrap_or_default();
        Ok(Self {
            nv_index: request.nv_index,
            requested: request.hierarchy,
            auth,
            sessions: SessionSet::new(&request.sessions)?,
            outputs: request.outputs.clone(),
        })
    }

    fn execute(
        &mut self,
        device: &mut TpmDevice,
        store: &mut dyn SessionStore,
        output: &mut dyn OutputWriter,
    ) -> Result<Outcome, CliError> {
        let descriptor = nv::probe(device, self.nv_index)?;

        let decision = nv::select(descriptor.attributes(), self.requested);
        info!(
            "NV index {:#010x}: {} with {} authorization",
            self.nv_index, decision.operation, decision.hierarchy
        );

        let auth = AuthHierarchy {
            hierarchy: decision.hierarchy,
            auth: self.auth.clone(),
        };
        if let Some(path) = auth.session_path() {
            self.sessions.bind_hierarchy(path.clone());
        }
        if decision.operation == Operation::UndefineSpecial {
            self.sessions.promote_policy()?;
        }
        self.sessions.open(store)?;
        self.sessions.check_policy()?;

        let call = UndefineCall::new(decision.operation, decision.hierarchy, &descriptor);
        let algorithm = select_algorithm(&self.sessions.phash_order());
        let parameter_hash = ParameterHash::compute(&call, algorithm);
        debug!(
            "{}: cpHash={} rpHash={}",
            algorithm,
            hex::encode(&parameter_hash.cp_hash),
            hex::encode(&parameter_hash.rp_hash)
        );

        if let Some(path) = &self.outputs.cp_hash {
            output
                .write_digest(path, &parameter_hash.cp_hash)
                .map_err(|source| CliError::PartialOutput {
                    path: path.display().to_string(),
                    state: CP_HASH_STATE,
                    source,
                })?;
            info!("cpHash ({algorithm}) written to '{}'", path.display());
        }

        let dispatched = self.outputs.dispatch_required();
        if dispatched {
            invoke(device, &call, &auth, &mut self.sessions)?;
            info!("NV index {:#010x} undefined", self.nv_index);
        } else {
            info!("cpHash requested without rpHash, {} not sent", call.operation);
        }

        if let Some(path) = &self.outputs.rp_hash {
            output
                .write_digest(path, &parameter_hash.rp_hash)
                .map_err(|source| CliError::PartialOutput {
                    path: path.display().to_string(),
                    state: RP_HASH_STATE,
                    source,
                })?;
            info!("rpHash ({algorithm}) written to '{}'", path.display());
        }

        Ok(Outcome {
            decision,
            parameter_hash,
            dispatched,
        })
    }
}

/// Undefines an NV index.
///
/// Sessions are released at the end of every run, whatever the outcome. An
/// error from an earlier stage takes precedence over a teardown error.
///
/// # Errors
///
/// Returns a `CliError` from the first stage that failed.
pub fn run(
    request: &UndefineRequest,
    device: &mut TpmDevice,
    store: &mut dyn SessionStore,
    output: &mut dyn OutputWriter,
) -> Result<Outcome, CliError> {
    let mut context = RunContext::new(request)?;
    let result = context.execute(device, store, output);
    let teardown = context.sessions.close_all(store);

    match (result, teardown) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
        (Err(err), Err(teardown)) => {
            warn!("{teardown}");
            Err(err)
        }
    }
}

/// Sends the undefine command with its authorization area.
///
/// The response authorizations of HMAC sessions are verified before their
/// nonces are taken into use.
///
/// # Errors
///
/// Returns `CliError::Tpm` if the TPM rejects the command or the exchange
/// fails, and `CliError::Execution` if a session slot was not opened or a
/// response HMAC does not match.
pub fn invoke(
    device: &mut TpmDevice,
    call: &UndefineCall,
    auth: &AuthHierarchy,
    sessions: &mut SessionSet,
) -> Result<(), CliError> {
    let slots = sessions.command_slots(call.operation);
    let mut auths: Vec<TpmsAuthCommand> = Vec::with_capacity(slots.len());
    for slot in &slots {
        let auth_command = match (slot, sessions.get_mut(*slot)) {
            (_, Some(session)) => {
                let cp_hash = call.cp_hash(session.auth_hash);
                session.authorize(&cp_hash, slot_auth_value(auth, *slot))?
            }
            (AuthSlot::Hierarchy, None) => password_auth(auth.auth_value())?,
            (_, None) => {
                return Err(CliError::Execution(format!(
                    "{}: {slot:?} session is not open",
                    call.operation
                )))
            }
        };
        auths.push(auth_command);
    }

    let response_auths = dispatch(device, call, &auths)
        .inspect_err(|_| error!("Failed to undefine NV index {:#010x}", call.nv_index))?;

    if response_auths.len() != slots.len() {
        warn!(
            "{}: {} authorizations in the response, expected {}",
            call.operation,
            response_auths.len(),
            slots.len()
        );
    }
    for (slot, auth_response) in slots.iter().zip(response_auths.iter()) {
        if let Some(session) = sessions.get_mut(*slot) {
            let rp_hash = call.rp_hash(session.auth_hash);
            session.refresh(&rp_hash, slot_auth_value(auth, *slot), auth_response)?;
        }
    }
    Ok(())
}

/// Only the hierarchy is authorized with a secret.
fn slot_auth_value(auth: &AuthHierarchy, slot: AuthSlot) -> &[u8] {
    match slot {
        AuthSlot::Hierarchy => auth.auth_value(),
        AuthSlot::Policy | AuthSlot::Auxiliary(_) => &[],
    }
}

fn dispatch(
    device: &mut TpmDevice,
    call: &UndefineCall,
    auths: &[TpmsAuthCommand],
) -> Result<TpmAuthResponses, CliError> {
    let [first, second] = call.handles();
    let step = call.operation.name();
    match call.operation {
        Operation::Undefine => {
            let cmd = TpmNvUndefineSpaceCommand {
                auth_handle: first.into(),
                nv_index: second.into(),
            };
            let (resp, response_auths) =
                device.execute(&cmd, auths).map_err(CliError::tpm(step))?;
            resp.NvUndefineSpace()
                .map_err(|_| mismatched(step, TpmCc::NvUndefineSpace))?;
            Ok(response_auths)
        }
        Operation::UndefineSpecial => {
            let cmd = TpmNvUndefineSpaceSpecialCommand {
                nv_index: first.into(),
                platform: second.into(),
            };
            let (resp, response_auths) =
                device.execute(&cmd, auths).map_err(CliError::tpm(step))?;
            resp.NvUndefineSpaceSpecial()
                .map_err(|_| mismatched(step, TpmCc::NvUndefineSpaceSpecial))?;
            Ok(response_auths)
        }
    }
}

fn mismatched(step: &'static str, command: TpmCc) -> CliError {
    CliError::tpm(step)(TpmDeviceError::MismatchedResponse { command })
}
