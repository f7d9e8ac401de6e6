// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! An in-process TPM simulator covering the NV undefine commands.

use crate::{
    crypto::HashAlg,
    device::{TpmDevice, TpmDeviceError},
    hierarchy::Hierarchy,
    nv::nv_name,
    session::{trim_auth_value, AuthSession, SessionType},
    tpm::{handle_type, TPM_HT_HMAC_SESSION, TPM_HT_NV_INDEX, TPM_HT_POLICY_SESSION, TPM_RS_PW},
    transport::Transport,
};
use log::{debug, error};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tpm2_protocol::{
    data::{
        Tpm2bAuth, Tpm2bName, Tpm2bNonce, Tpm2bNvPublic, TpmCc, TpmRc, TpmRcBase, TpmSe,
        TpmaNv, TpmaSession, TpmsAuthCommand, TpmsAuthResponse, TpmsNvPublic,
    },
    message::{
        tpm_build_response, tpm_parse_command, TpmAuthResponses, TpmCommandBody,
        TpmNvReadPublicCommand, TpmNvReadPublicResponse, TpmNvUndefineSpaceCommand,
        TpmNvUndefineSpaceResponse, TpmNvUndefineSpaceSpecialCommand,
        TpmNvUndefineSpaceSpecialResponse, TpmResponseBody,
    },
    TpmWriter, TPM_MAX_COMMAND_SIZE,
};

type MockTpmResult = Result<(TpmRc, TpmResponseBody, TpmAuthResponses), TpmRc>;

fn rc(base: TpmRcBase) -> TpmRc {
    TpmRc::from(base)
}

#[derive(Debug, Clone)]
struct MockNvIndex {
    public: TpmsNvPublic,
}

#[derive(Debug, Clone)]
struct MockSession {
    session_type: TpmSe,
    auth_hash: HashAlg,
    nonce_tpm: Vec<u8>,
    session_key: Vec<u8>,
    policy_digest: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    nv: HashMap<u32, MockNvIndex>,
    sessions: HashMap<u32, MockSession>,
    hierarchy_auth: HashMap<u32, Vec<u8>>,
    next_session: u32,
    calls: Vec<TpmCc>,
    failures: Vec<(TpmCc, TpmRc)>,
    broken: Vec<TpmCc>,
    tampered: Vec<TpmCc>,
}

/// A simulated TPM. Clones share the same state, so a test can keep a handle
/// for inspection after passing one to a `TpmDevice`.
#[derive(Debug, Clone, Default)]
pub struct MockTpm {
    state: Arc<Mutex<MockState>>,
    pending: Option<Vec<u8>>,
}

impl MockTpm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A device talking to this simulator.
    #[must_use]
    pub fn device(&self) -> TpmDevice {
        TpmDevice::new(Box::new(Self {
            state: Arc::clone(&self.state),
            pending: None,
        }))
    }

    pub fn define_nv(&self, nv_index: u32, public: TpmsNvPublic) {
        self.state().nv.insert(nv_index, MockNvIndex { public });
    }

    #[must_use]
    pub fn has_nv(&self, nv_index: u32) -> bool {
        self.state().nv.contains_key(&nv_index)
    }

    pub fn set_hierarchy_auth(&self, hierarchy: Hierarchy, auth: &[u8]) {
        self.state()
            .hierarchy_auth
            .insert(hierarchy.handle(), auth.to_vec());
    }

    /// Starts a session and returns its state as the client sees it. Policy
    /// sessions start with a zero policy digest.
    #[must_use]
    pub fn start_session(
        &self,
        session_type: SessionType,
        auth_hash: HashAlg,
        attributes: TpmaSession,
    ) -> AuthSession {
        let mut state = self.state();
        let kind = match session_type {
            SessionType::Hmac => TPM_HT_HMAC_SESSION,
            SessionType::Policy | SessionType::Trial => TPM_HT_POLICY_SESSION,
        };
        let handle = (u32::from(kind) << 24) | state.next_session;
        state.next_session += 1;

        let session = MockSession {
            session_type: session_type.into(),
            auth_hash,
            nonce_tpm: auth_hash.nonce(),
            session_key: match session_type {
                SessionType::Hmac => auth_hash.nonce(),
                SessionType::Policy | SessionType::Trial => Vec::new(),
            },
            policy_digest: vec![0; auth_hash.size()],
        };
        let client = AuthSession {
            handle,
            session_type,
            auth_hash,
            nonce_tpm: session.nonce_tpm.clone(),
            attributes: attributes.bits(),
            session_key: session.session_key.clone(),
            nonce_caller: Vec::new(),
            consumed: false,
        };
        state.sessions.insert(handle, session);
        client
    }

    /// Sets the policy digest of a session, as a sequence of policy commands
    /// would.
    pub fn set_policy_digest(&self, handle: u32, digest: &[u8]) {
        if let Some(session) = self.state().sessions.get_mut(&handle) {
            session.policy_digest = digest.to_vec();
        }
    }

    #[must_use]
    pub fn is_session_loaded(&self, handle: u32) -> bool {
        self.state().sessions.contains_key(&handle)
    }

    #[must_use]
    pub fn nonce_tpm(&self, handle: u32) -> Option<Vec<u8>> {
        self.state()
            .sessions
            .get(&handle)
            .map(|session| session.nonce_tpm.clone())
    }

    /// Commands received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<TpmCc> {
        self.state().calls.clone()
    }

    #[must_use]
    pub fn call_count(&self, command: TpmCc) -> usize {
        self.state().calls.iter().filter(|&&cc| cc == command).count()
    }

    /// Makes every later `command` fail with `rc`.
    pub fn fail_command(&self, command: TpmCc, rc: TpmRc) {
        self.state().failures.push((command, rc));
    }

    /// Makes the transport fail when `command` is sent.
    pub fn break_transport(&self, command: TpmCc) {
        self.state().broken.push(command);
    }

    /// Executes `command` but corrupts the HMAC of its response
    /// authorizations.
    pub fn tamper_response(&self, command: TpmCc) {
        self.state().tampered.push(command);
    }
}

impl Transport for MockTpm {
    fn send(&mut self, command_bytes: &[u8]) -> Result<(), TpmDeviceError> {
        let response = self.state().execute(command_bytes)?;
        self.pending = Some(response);
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TpmDeviceError> {
        self.pending.take().ok_or(TpmDeviceError::ResponseUnderflow)
    }
}

fn mocktpm_command_code(body: &TpmCommandBody) -> Option<TpmCc> {
    match body {
        TpmCommandBody::NvReadPublic(_) => Some(TpmCc::NvReadPublic),
        TpmCommandBody::NvUndefineSpace(_) => Some(TpmCc::NvUndefineSpace),
        TpmCommandBody::NvUndefineSpaceSpecial(_) => Some(TpmCc::NvUndefineSpaceSpecial),
        _ => None,
    }
}

fn mocktpm_build_response(response: MockTpmResult) -> Result<Vec<u8>, TpmDeviceError> {
    let mut buf = [0u8; TPM_MAX_COMMAND_SIZE];
    let len = {
        let mut writer = TpmWriter::new(&mut buf);
        match response {
            Ok((rc, TpmResponseBody::NvReadPublic(resp), auths)) => {
                tpm_build_response(&resp, &auths, rc, &mut writer)?;
            }
            Ok((rc, TpmResponseBody::NvUndefineSpace(resp), auths)) => {
                tpm_build_response(&resp, &auths, rc, &mut writer)?;
            }
            Ok((rc, TpmResponseBody::NvUndefineSpaceSpecial(resp), auths)) => {
                tpm_build_response(&resp, &auths, rc, &mut writer)?;
            }
            Ok(_) => {
                tpm_build_response(
                    &TpmNvUndefineSpaceResponse {},
                    &[],
                    rc(TpmRcBase::Failure),
                    &mut writer,
                )?;
            }
            Err(rc) => {
                debug!("mock TPM: {rc}");
                tpm_build_response(&TpmNvUndefineSpaceResponse {}, &[], rc, &mut writer)?;
            }
        }
        writer.len()
    };
    Ok(buf[..len].to_vec())
}

impl MockState {
    fn execute(&mut self, command_bytes: &[u8]) -> Result<Vec<u8>, TpmDeviceError> {
        let response = match tpm_parse_command(command_bytes) {
            Ok((_, body, sessions)) => match mocktpm_command_code(&body) {
                Some(code) => {
                    self.calls.push(code);
                    if self.broken.contains(&code) {
                        return Err(TpmDeviceError::Io(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "mock TPM disconnected",
                        )));
                    }
                    self.dispatch(code, &body, &sessions)
                }
                None => Err(rc(TpmRcBase::CommandCode)),
            },
            Err(e) => {
                error!("{e}");
                Err(rc(TpmRcBase::Size))
            }
        };
        mocktpm_build_response(response)
    }

    fn dispatch(
        &mut self,
        code: TpmCc,
        body: &TpmCommandBody,
        sessions: &[TpmsAuthCommand],
    ) -> MockTpmResult {
        if let Some((_, failure)) = self.failures.iter().find(|(cc, _)| *cc == code) {
            return Err(*failure);
        }
        let result = match body {
            TpmCommandBody::NvReadPublic(cmd) => self.nv_read_public(cmd),
            TpmCommandBody::NvUndefineSpace(cmd) => self.nv_undefine_space(cmd, sessions),
            TpmCommandBody::NvUndefineSpaceSpecial(cmd) => {
                self.nv_undefine_space_special(cmd, sessions)
            }
            _ => Err(rc(TpmRcBase::CommandCode)),
        };
        if self.tampered.contains(&code) {
            return result.map(|(rc, body, auths)| (rc, body, mocktpm_tamper(&auths)));
        }
        result
    }

    fn nv_name(&self, nv_index: u32) -> Result<Vec<u8>, TpmRc> {
        let nv = self.nv.get(&nv_index).ok_or(rc(TpmRcBase::Handle))?;
        nv_name(&nv.public).map_err(|_| rc(TpmRcBase::Failure))
    }

    fn nv_read_public(&self, cmd: &TpmNvReadPublicCommand) -> MockTpmResult {
        let nv_index = cmd.nv_index.0;
        if handle_type(nv_index) != TPM_HT_NV_INDEX {
            return Err(rc(TpmRcBase::Handle));
        }
        let nv = self.nv.get(&nv_index).ok_or(rc(TpmRcBase::Handle))?;
        let name = self.nv_name(nv_index)?;

        let resp = TpmNvReadPublicResponse {
            nv_public: Tpm2bNvPublic {
                inner: nv.public.clone(),
            },
            nv_name: Tpm2bName::try_from(name.as_slice()).map_err(|_| rc(TpmRcBase::Size))?,
        };
        Ok((
            rc(TpmRcBase::Success),
            TpmResponseBody::NvReadPublic(resp),
            TpmAuthResponses::default(),
        ))
    }

    fn nv_undefine_space(
        &mut self,
        cmd: &TpmNvUndefineSpaceCommand,
        sessions: &[TpmsAuthCommand],
    ) -> MockTpmResult {
        let (auth_handle, nv_index) = (cmd.auth_handle.0, cmd.nv_index.0);
        let owner = Hierarchy::Owner.handle();
        let platform = Hierarchy::Platform.handle();
        if auth_handle != owner && auth_handle != platform {
            return Err(rc(TpmRcBase::Hierarchy));
        }
        let attributes = self
            .nv
            .get(&nv_index)
            .ok_or(rc(TpmRcBase::Handle))?
            .public
            .attributes;
        if attributes.contains(TpmaNv::POLICY_DELETE) {
            return Err(rc(TpmRcBase::Attributes));
        }
        if attributes.contains(TpmaNv::PLATFORMCREATE) != (auth_handle == platform) {
            return Err(rc(TpmRcBase::NvAuthorization));
        }

        let auth = sessions.first().ok_or(rc(TpmRcBase::AuthMissing))?;
        let names = [auth_handle.to_be_bytes().to_vec(), self.nv_name(nv_index)?];
        let entity_auth = self.entity_auth(auth_handle);
        self.check_auth(auth, &entity_auth, TpmCc::NvUndefineSpace, &names)?;
        self.check_auxiliary(&sessions[1..], TpmCc::NvUndefineSpace, &names)?;

        self.nv.remove(&nv_index);
        let mut entity_auths = vec![entity_auth];
        entity_auths.resize(sessions.len(), Vec::new());
        let auths = self.respond(TpmCc::NvUndefineSpace, sessions, &entity_auths)?;
        Ok((
            rc(TpmRcBase::Success),
            TpmResponseBody::NvUndefineSpace(TpmNvUndefineSpaceResponse {}),
            auths,
        ))
    }

    fn nv_undefine_space_special(
        &mut self,
        cmd: &TpmNvUndefineSpaceSpecialCommand,
        sessions: &[TpmsAuthCommand],
    ) -> MockTpmResult {
        let (nv_index, platform) = (cmd.nv_index.0, cmd.platform.0);
        let nv = self.nv.get(&nv_index).ok_or(rc(TpmRcBase::Handle))?;
        if platform != Hierarchy::Platform.handle() {
            return Err(rc(TpmRcBase::Hierarchy));
        }
        if !nv.public.attributes.contains(TpmaNv::POLICY_DELETE) {
            return Err(rc(TpmRcBase::Attributes));
        }
        let auth_policy = nv.public.auth_policy.to_vec();

        if sessions.len() < 2 {
            return Err(rc(TpmRcBase::AuthMissing));
        }
        let policy = &sessions[0];
        let session = self
            .sessions
            .get(&policy.session_handle.0)
            .filter(|session| session.session_type == TpmSe::Policy)
            .ok_or(rc(TpmRcBase::AuthType))?;
        if session.policy_digest != auth_policy {
            return Err(rc(TpmRcBase::PolicyFail));
        }

        let code = TpmCc::NvUndefineSpaceSpecial;
        let names = [self.nv_name(nv_index)?, platform.to_be_bytes().to_vec()];
        let entity_auth = self.entity_auth(platform);
        self.check_auth(&sessions[1], &entity_auth, code, &names)?;
        self.check_auxiliary(&sessions[2..], code, &names)?;

        self.nv.remove(&nv_index);
        let mut entity_auths = vec![Vec::new(), entity_auth];
        entity_auths.resize(sessions.len(), Vec::new());
        let auths = self.respond(code, sessions, &entity_auths)?;
        Ok((
            rc(TpmRcBase::Success),
            TpmResponseBody::NvUndefineSpaceSpecial(TpmNvUndefineSpaceSpecialResponse {}),
            auths,
        ))
    }

    fn entity_auth(&self, handle: u32) -> Vec<u8> {
        self.hierarchy_auth.get(&handle).cloned().unwrap_or_default()
    }

    fn check_hmac(
        &self,
        auth: &TpmsAuthCommand,
        entity_auth: &[u8],
        code: TpmCc,
        names: &[Vec<u8>],
    ) -> Result<(), TpmRc> {
        let session = self
            .sessions
            .get(&auth.session_handle.0)
            .ok_or(rc(TpmRcBase::Handle))?;
        if session.session_type != TpmSe::Hmac {
            return Err(rc(TpmRcBase::AuthType));
        }

        let code = (code as u32).to_be_bytes();
        let mut chunks: Vec<&[u8]> = vec![&code];
        chunks.extend(names.iter().map(Vec::as_slice));
        let cp_hash = session.auth_hash.digest(&chunks);

        let mut key = session.session_key.clone();
        key.extend_from_slice(trim_auth_value(entity_auth));
        let expected = session
            .auth_hash
            .hmac(
                &key,
                &[
                    &cp_hash,
                    &auth.nonce.to_vec(),
                    &session.nonce_tpm,
                    &[auth.session_attributes.bits()],
                ],
            )
            .map_err(|_| rc(TpmRcBase::Failure))?;
        if expected != auth.hmac.to_vec() {
            return Err(rc(TpmRcBase::AuthFail));
        }
        Ok(())
    }

    fn check_auth(
        &self,
        auth: &TpmsAuthCommand,
        entity_auth: &[u8],
        code: TpmCc,
        names: &[Vec<u8>],
    ) -> Result<(), TpmRc> {
        if auth.session_handle.0 == TPM_RS_PW {
            if trim_auth_value(&auth.hmac.to_vec()) != trim_auth_value(entity_auth) {
                return Err(rc(TpmRcBase::AuthFail));
            }
            return Ok(());
        }
        self.check_hmac(auth, entity_auth, code, names)
    }

    /// Sessions that do not authorize a handle must be loaded, and HMAC
    /// sessions among them must carry a valid HMAC.
    fn check_auxiliary(
        &self,
        auths: &[TpmsAuthCommand],
        code: TpmCc,
        names: &[Vec<u8>],
    ) -> Result<(), TpmRc> {
        for auth in auths {
            let session = self
                .sessions
                .get(&auth.session_handle.0)
                .ok_or(rc(TpmRcBase::Handle))?;
            if session.session_type == TpmSe::Hmac {
                self.check_hmac(auth, &[], code, names)?;
            }
        }
        Ok(())
    }

    /// Rolls the nonces of the sessions used by the command, signs the
    /// response for HMAC sessions and flushes the sessions without
    /// `continueSession`.
    fn respond(
        &mut self,
        code: TpmCc,
        sessions: &[TpmsAuthCommand],
        entity_auths: &[Vec<u8>],
    ) -> Result<TpmAuthResponses, TpmRc> {
        let mut auths = TpmAuthResponses::default();

        for (auth, entity_auth) in sessions.iter().zip(entity_auths) {
            let handle = auth.session_handle.0;
            let response = if handle == TPM_RS_PW {
                TpmsAuthResponse {
                    nonce: Tpm2bNonce::default(),
                    session_attributes: TpmaSession::CONTINUE_SESSION,
                    hmac: Tpm2bAuth::default(),
                }
            } else {
                let session = self
                    .sessions
                    .get_mut(&handle)
                    .ok_or(rc(TpmRcBase::Failure))?;
                session.nonce_tpm = session.auth_hash.nonce();
                let hmac = if session.session_type == TpmSe::Hmac {
                    let rp_hash = session.auth_hash.digest(&[
                        &(TpmRcBase::Success as u32).to_be_bytes(),
                        &(code as u32).to_be_bytes(),
                    ]);
                    let mut key = session.session_key.clone();
                    key.extend_from_slice(trim_auth_value(entity_auth));
                    session
                        .auth_hash
                        .hmac(
                            &key,
                            &[
                                &rp_hash,
                                &session.nonce_tpm,
                                &auth.nonce.to_vec(),
                                &[auth.session_attributes.bits()],
                            ],
                        )
                        .map_err(|_| rc(TpmRcBase::Failure))?
                } else {
                    Vec::new()
                };
                TpmsAuthResponse {
                    nonce: Tpm2bNonce::try_from(session.nonce_tpm.as_slice())
                        .map_err(|_| rc(TpmRcBase::Size))?,
                    session_attributes: auth.session_attributes,
                    hmac: Tpm2bAuth::try_from(hmac.as_slice()).map_err(|_| rc(TpmRcBase::Size))?,
                }
            };
            auths
                .try_push(response)
                .map_err(|_| rc(TpmRcBase::Size))?;
            if handle != TPM_RS_PW
                && !auth
                    .session_attributes
                    .contains(TpmaSession::CONTINUE_SESSION)
            {
                self.sessions.remove(&handle);
            }
        }
        Ok(auths)
    }
}

/// Flips a bit in every non-empty response HMAC.
fn mocktpm_tamper(auths: &TpmAuthResponses) -> TpmAuthResponses {
    let mut tampered = TpmAuthResponses::default();
    for auth in auths.iter() {
        let mut hmac = auth.hmac.to_vec();
        if let Some(byte) = hmac.first_mut() {
            *byte ^= 0x01;
        }
        let hmac = Tpm2bAuth::try_from(hmac.as_slice()).unwrap_or_default();
        if tampered
            .try_push(TpmsAuthResponse {
                nonce: auth.nonce,
                session_attributes: auth.session_attributes,
                hmac,
            })
            .is_err()
        {
            break;
        }
    }
    tampered
}
