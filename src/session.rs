// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    crypto::HashAlg,
    error::ParseError,
    nv::Operation,
    tpm::{handle_type, TPM_HT_HMAC_SESSION, TPM_HT_POLICY_SESSION, TPM_RS_PW},
    CliError,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};
use tpm2_protocol::{
    data::{Tpm2bAuth, Tpm2bNonce, TpmSe, TpmaSession, TpmsAuthCommand, TpmsAuthResponse},
    TpmSession,
};

/// Sessions that can be given on the command line. With the hierarchy
/// session this adds up to three, the maximum a command can carry.
pub const MAX_AUX_SESSIONS: usize = 2;
pub const MAX_SESSIONS: usize = 3;

const SESSION_VERSION: u32 = 1;
const SESSION_OBJECT_TYPE: &str = "session";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Hmac,
    Policy,
    Trial,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hmac => write!(f, "hmac"),
            Self::Policy => write!(f, "policy"),
            Self::Trial => write!(f, "trial"),
        }
    }
}

impl From<SessionType> for TpmSe {
    fn from(val: SessionType) -> Self {
        match val {
            SessionType::Hmac => Self::Hmac,
            SessionType::Policy => Self::Policy,
            SessionType::Trial => Self::Trial,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    #[serde(rename = "type")]
    object_type: String,
    data: AuthSession,
}

/// Manages the state of an active authorization session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub handle: u32,
    pub session_type: SessionType,
    pub auth_hash: HashAlg,
    #[serde(with = "hex")]
    pub nonce_tpm: Vec<u8>,
    pub attributes: u8,
    #[serde(default, with = "hex")]
    pub session_key: Vec<u8>,
    /// The caller nonce of the last authorization, needed to verify the
    /// response.
    #[serde(skip)]
    pub nonce_caller: Vec<u8>,
    /// Set when the TPM has flushed the session after use.
    #[serde(skip)]
    pub consumed: bool,
}

impl AuthSession {
    #[must_use]
    pub fn attributes(&self) -> TpmaSession {
        TpmaSession::from_bits_truncate(self.attributes)
    }

    /// Loads a session from a JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the file cannot be read, or is not a valid
    /// session object.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let bytes =
            std::fs::read(path).map_err(|e| CliError::File(path.display().to_string(), e))?;
        let envelope: Envelope = serde_json::from_slice(&bytes).map_err(ParseError::from)?;
        if envelope.version != SESSION_VERSION || envelope.object_type != SESSION_OBJECT_TYPE {
            return Err(ParseError::Custom(format!(
                "'{}': not a session object (type '{}', version {})",
                path.display(),
                envelope.object_type,
                envelope.version
            ))
            .into());
        }
        envelope.data.validate()?;
        Ok(envelope.data)
    }

    /// Saves the session as a JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), CliError> {
        let envelope = Envelope {
            version: SESSION_VERSION,
            object_type: SESSION_OBJECT_TYPE.to_string(),
            data: self.clone(),
        };
        let json = serde_json::to_vec(&envelope).map_err(ParseError::from)?;
        std::fs::write(path, json).map_err(|e| CliError::File(path.display().to_string(), e))
    }

    fn validate(&self) -> Result<(), ParseError> {
        let expected = match self.session_type {
            SessionType::Hmac => TPM_HT_HMAC_SESSION,
            SessionType::Policy | SessionType::Trial => TPM_HT_POLICY_SESSION,
        };
        if handle_type(self.handle) != expected {
            return Err(ParseError::Custom(format!(
                "{:#010x} is not a {} session handle",
                self.handle, self.session_type
            )));
        }
        Ok(())
    }

    /// Builds the command authorization for this session.
    ///
    /// `cp_hash` must be computed with the session's hash algorithm. Policy
    /// sessions carry an empty HMAC. The caller nonce is kept for `refresh`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the HMAC cannot be computed.
    pub fn authorize(
        &mut self,
        cp_hash: &[u8],
        auth_value: &[u8],
    ) -> Result<TpmsAuthCommand, CliError> {
        let nonce_caller = self.auth_hash.nonce();
        let attributes = self.attributes();

        let hmac = match self.session_type {
            SessionType::Hmac => self.auth_hash.hmac(
                &self.hmac_key(auth_value),
                &[cp_hash, &nonce_caller, &self.nonce_tpm, &[attributes.bits()]],
            )?,
            SessionType::Policy | SessionType::Trial => Vec::new(),
        };

        debug!(
            target: "nvundefine::session",
            "authorizing with session {:#010x} ({})",
            self.handle,
            self.session_type
        );
        let auth = TpmsAuthCommand {
            session_handle: TpmSession(self.handle),
            nonce: Tpm2bNonce::try_from(nonce_caller.as_slice())?,
            session_attributes: attributes,
            hmac: Tpm2bAuth::try_from(hmac.as_slice())?,
        };
        self.nonce_caller = nonce_caller;
        Ok(auth)
    }

    /// Verifies the response authorization of an HMAC session and picks up
    /// the fresh TPM nonce.
    ///
    /// The response HMAC covers `rpHash || nonceTPM || nonceCaller ||
    /// sessionAttributes`, keyed like the command HMAC.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Execution` if the response HMAC does not match. The
    /// session state is left unchanged in that case.
    pub fn refresh(
        &mut self,
        rp_hash: &[u8],
        auth_value: &[u8],
        response: &TpmsAuthResponse,
    ) -> Result<(), CliError> {
        let nonce_tpm = response.nonce.to_vec();
        if self.session_type == SessionType::Hmac {
            self.auth_hash
                .hmac_verify(
                    &self.hmac_key(auth_value),
                    &[
                        rp_hash,
                        &nonce_tpm,
                        &self.nonce_caller,
                        &[response.session_attributes.bits()],
                    ],
                    &response.hmac.to_vec(),
                )
                .map_err(|_| {
                    CliError::Execution(format!(
                        "session {:#010x}: response HMAC mismatch",
                        self.handle
                    ))
                })?;
        }

        self.nonce_tpm = nonce_tpm;
        if !self.attributes().contains(TpmaSession::CONTINUE_SESSION) {
            self.consumed = true;
        }
        Ok(())
    }

    fn hmac_key(&self, auth_value: &[u8]) -> Vec<u8> {
        let mut key = self.session_key.clone();
        key.extend_from_slice(trim_auth_value(auth_value));
        key
    }
}

/// Builds the authorization area for a password-based session.
///
/// # Errors
///
/// Returns `CliError::Usage` if the password does not fit an authorization
/// value.
pub fn password_auth(password: &[u8]) -> Result<TpmsAuthCommand, CliError> {
    debug!(
        target: "nvundefine::session",
        "building password session: password_len = {}",
        password.len()
    );
    Ok(TpmsAuthCommand {
        session_handle: TpmSession(TPM_RS_PW),
        nonce: Tpm2bNonce::default(),
        session_attributes: TpmaSession::CONTINUE_SESSION,
        hmac: Tpm2bAuth::try_from(password).map_err(|e| {
            CliError::Usage(format!("hierarchy password: {e}"))
        })?,
    })
}

/// Trailing zero octets are not part of an authorization value.
pub(crate) fn trim_auth_value(auth_value: &[u8]) -> &[u8] {
    let len = auth_value
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    &auth_value[..len]
}

/// Loads and releases the sessions referenced by path.
pub trait SessionStore {
    /// Restores a session.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the session cannot be restored.
    fn open(&mut self, path: &Path) -> Result<AuthSession, CliError>;

    /// Releases a session restored with `open`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the session state cannot be saved.
    fn close(&mut self, path: &Path, session: &AuthSession) -> Result<(), CliError>;
}

/// Sessions stored as JSON envelopes. A session that is still alive in the
/// TPM is written back so that its nonce stays in sync.
#[derive(Debug, Default)]
pub struct FileSessionStore;

impl SessionStore for FileSessionStore {
    fn open(&mut self, path: &Path) -> Result<AuthSession, CliError> {
        AuthSession::load(path)
    }

    fn close(&mut self, path: &Path, session: &AuthSession) -> Result<(), CliError> {
        if session.consumed {
            debug!(
                target: "nvundefine::session",
                "session {:#010x} was flushed by the TPM",
                session.handle
            );
            return Ok(());
        }
        session.save(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Hierarchy,
    Policy,
    Auxiliary,
}

#[derive(Debug)]
enum SlotState {
    Assigned,
    Open(AuthSession),
    Closed,
}

/// A session source path and the role it was assigned.
#[derive(Debug)]
pub struct SessionSlot {
    path: PathBuf,
    role: SessionRole,
    state: SlotState,
}

impl SessionSlot {
    fn new(path: PathBuf, role: SessionRole) -> Self {
        Self {
            path,
            role,
            state: SlotState::Assigned,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn role(&self) -> SessionRole {
        self.role
    }

    #[must_use]
    pub fn session(&self) -> Option<&AuthSession> {
        match &self.state {
            SlotState::Open(session) => Some(session),
            SlotState::Assigned | SlotState::Closed => None,
        }
    }

    fn session_mut(&mut self) -> Option<&mut AuthSession> {
        match &mut self.state {
            SlotState::Open(session) => Some(session),
            SlotState::Assigned | SlotState::Closed => None,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, SlotState::Open(_))
    }

    fn open(&mut self, store: &mut dyn SessionStore) -> Result<(), CliError> {
        if let SlotState::Assigned = self.state {
            let session = store.open(&self.path)?;
            debug!(
                target: "nvundefine::session",
                "opened {:?} session {:#010x} from '{}'",
                self.role,
                session.handle,
                self.path.display()
            );
            self.state = SlotState::Open(session);
        }
        Ok(())
    }

    fn close(&mut self, store: &mut dyn SessionStore) -> Result<(), CliError> {
        match std::mem::replace(&mut self.state, SlotState::Closed) {
            SlotState::Open(session) => store
                .close(&self.path, &session)
                .map_err(|e| CliError::Teardown(self.path.display().to_string(), Box::new(e))),
            SlotState::Assigned | SlotState::Closed => Ok(()),
        }
    }
}

/// Position of an authorization in a command's authorization area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSlot {
    Hierarchy,
    Policy,
    Auxiliary(usize),
}

/// The sessions of a run: an optional hierarchy session, an optional policy
/// session and up to two auxiliary sessions.
#[derive(Debug, Default)]
pub struct SessionSet {
    hierarchy: Option<SessionSlot>,
    policy: Option<SessionSlot>,
    auxiliary: Vec<SessionSlot>,
}

impl SessionSet {
    /// Assigns the `-S` paths, in order, to auxiliary slots.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Usage` if more than `MAX_AUX_SESSIONS` paths are
    /// given.
    pub fn new(paths: &[PathBuf]) -> Result<Self, CliError> {
        if paths.len() > MAX_AUX_SESSIONS {
            return Err(CliError::Usage(format!(
                "Specify a max of {MAX_SESSIONS} sessions: {} given with --session, at most {MAX_AUX_SESSIONS} allowed",
                paths.len()
            )));
        }
        Ok(Self {
            hierarchy: None,
            policy: None,
            auxiliary: paths
                .iter()
                .map(|path| SessionSlot::new(path.clone(), SessionRole::Auxiliary))
                .collect(),
        })
    }

    /// Binds the session authorizing the hierarchy.
    pub fn bind_hierarchy(&mut self, path: PathBuf) {
        self.hierarchy = Some(SessionSlot::new(path, SessionRole::Hierarchy));
    }

    /// Moves the first auxiliary slot to the policy role. The remaining
    /// auxiliary slots shift left by one.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Usage` if no session path was given.
    pub fn promote_policy(&mut self) -> Result<(), CliError> {
        if self.policy.is_some() {
            return Ok(());
        }
        if self.auxiliary.is_empty() {
            return Err(CliError::Usage(
                "NV Spaces with attribute TPMA_NV_POLICY_DELETE require a policy session to be specified via --session"
                    .to_string(),
            ));
        }
        let mut slot = self.auxiliary.remove(0);
        slot.role = SessionRole::Policy;
        self.policy = Some(slot);
        Ok(())
    }

    #[must_use]
    pub fn hierarchy(&self) -> Option<&SessionSlot> {
        self.hierarchy.as_ref()
    }

    #[must_use]
    pub fn policy(&self) -> Option<&SessionSlot> {
        self.policy.as_ref()
    }

    #[must_use]
    pub fn auxiliary(&self) -> &[SessionSlot] {
        &self.auxiliary
    }

    /// Number of slots, in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.hierarchy.is_some())
            + usize::from(self.policy.is_some())
            + self.auxiliary.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slots_mut(&mut self) -> impl Iterator<Item = &mut SessionSlot> {
        self.hierarchy
            .iter_mut()
            .chain(self.policy.iter_mut())
            .chain(self.auxiliary.iter_mut())
    }

    /// Opens the hierarchy, policy and auxiliary sessions, in that order.
    /// Stops at the first failure. Slots opened so far stay open and are
    /// released by `close_all`.
    ///
    /// # Errors
    ///
    /// Returns the error of the first session that fails to open.
    pub fn open(&mut self, store: &mut dyn SessionStore) -> Result<(), CliError> {
        for slot in self.slots_mut() {
            slot.open(store)?;
        }
        Ok(())
    }

    /// Checks that the policy slot holds a policy session.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Usage` on a role mismatch.
    pub fn check_policy(&self) -> Result<(), CliError> {
        let Some(session) = self.policy.as_ref().and_then(SessionSlot::session) else {
            return Ok(());
        };
        if session.session_type != SessionType::Policy {
            return Err(CliError::Usage(format!(
                "Expected a policy session when NV index has attribute TPMA_NV_POLICY_DELETE set, got a {} session. Also note that the policy session must be specified first with --session",
                session.session_type
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, slot: AuthSlot) -> Option<&AuthSession> {
        match slot {
            AuthSlot::Hierarchy => self.hierarchy.as_ref().and_then(SessionSlot::session),
            AuthSlot::Policy => self.policy.as_ref().and_then(SessionSlot::session),
            AuthSlot::Auxiliary(i) => self.auxiliary.get(i).and_then(SessionSlot::session),
        }
    }

    pub fn get_mut(&mut self, slot: AuthSlot) -> Option<&mut AuthSession> {
        match slot {
            AuthSlot::Hierarchy => self.hierarchy.as_mut().and_then(SessionSlot::session_mut),
            AuthSlot::Policy => self.policy.as_mut().and_then(SessionSlot::session_mut),
            AuthSlot::Auxiliary(i) => self.auxiliary.get_mut(i).and_then(SessionSlot::session_mut),
        }
    }

    /// The sessions considered for the parameter hash algorithm: the
    /// hierarchy session, then the policy session (or the first auxiliary),
    /// then the last auxiliary.
    #[must_use]
    pub fn phash_order(&self) -> [Option<&AuthSession>; MAX_SESSIONS] {
        let (second, third) = if self.policy.is_some() {
            (AuthSlot::Policy, AuthSlot::Auxiliary(0))
        } else {
            (AuthSlot::Auxiliary(0), AuthSlot::Auxiliary(1))
        };
        [
            self.get(AuthSlot::Hierarchy),
            self.get(second),
            self.get(third),
        ]
    }

    /// The authorization area layout of `operation`.
    #[must_use]
    pub fn command_slots(&self, operation: Operation) -> Vec<AuthSlot> {
        let mut slots = match operation {
            Operation::Undefine => vec![AuthSlot::Hierarchy],
            Operation::UndefineSpecial => vec![AuthSlot::Policy, AuthSlot::Hierarchy],
        };
        slots.extend((0..self.auxiliary.len()).map(AuthSlot::Auxiliary));
        slots
    }

    /// Closes every open session. A failure does not stop the remaining
    /// sessions from being closed. Calling this again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first `CliError::Teardown` encountered.
    pub fn close_all(&mut self, store: &mut dyn SessionStore) -> Result<(), CliError> {
        let mut result = Ok(());
        for slot in self.slots_mut() {
            if let Err(err) = slot.close(store) {
                warn!(target: "nvundefine::session", "{err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}
