// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy

#![allow(dead_code)]

use nvundefine::{
    crypto::HashAlg,
    output::OutputWriter,
    session::{AuthSession, SessionStore, SessionType},
    CliError,
};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};
use tpm2_protocol::data::{Tpm2bDigest, TpmaNv, TpmaSession, TpmsNvPublic};

pub const NV_INDEX: u32 = 0x0150_0016;

pub fn nv_public(attributes: TpmaNv, auth_policy: &[u8]) -> TpmsNvPublic {
    TpmsNvPublic {
        nv_index: NV_INDEX.into(),
        name_alg: HashAlg::Sha256.alg_id(),
        attributes: attributes | TpmaNv::AUTHREAD | TpmaNv::AUTHWRITE,
        auth_policy: Tpm2bDigest::try_from(auth_policy).unwrap(),
        data_size: 32,
    }
}

pub fn auth_session(handle: u32, session_type: SessionType, auth_hash: HashAlg) -> AuthSession {
    AuthSession {
        handle,
        session_type,
        auth_hash,
        nonce_tpm: vec![0x11; auth_hash.size()],
        attributes: TpmaSession::CONTINUE_SESSION.bits(),
        session_key: Vec::new(),
        nonce_caller: Vec::new(),
        consumed: false,
    }
}

pub fn save_session(dir: &Path, name: &str, session: &AuthSession) -> PathBuf {
    let path = dir.join(name);
    session.save(&path).unwrap();
    path
}

/// A session store kept in memory that records every close attempt.
#[derive(Debug, Default)]
pub struct CountingStore {
    pub sessions: HashMap<PathBuf, AuthSession>,
    pub opened: Vec<PathBuf>,
    pub closed: Vec<PathBuf>,
    pub fail_close: Vec<PathBuf>,
}

impl CountingStore {
    pub fn with(mut self, path: &str, session: AuthSession) -> Self {
        self.sessions.insert(PathBuf::from(path), session);
        self
    }
}

impl SessionStore for CountingStore {
    fn open(&mut self, path: &Path) -> Result<AuthSession, CliError> {
        let session = self
            .sessions
            .get(path)
            .cloned()
            .ok_or_else(|| CliError::Usage(format!("no session at '{}'", path.display())))?;
        self.opened.push(path.to_path_buf());
        Ok(session)
    }

    fn close(&mut self, path: &Path, _session: &AuthSession) -> Result<(), CliError> {
        self.closed.push(path.to_path_buf());
        if self.fail_close.iter().any(|p| p == path) {
            return Err(CliError::Execution("close failed".to_string()));
        }
        Ok(())
    }
}

/// Writes digests to disk, except to `fail`.
#[derive(Debug, Default)]
pub struct FailingOutput {
    pub fail: PathBuf,
    pub written: Vec<PathBuf>,
}

impl OutputWriter for FailingOutput {
    fn write_digest(&mut self, path: &Path, digest: &[u8]) -> io::Result<()> {
        if path == self.fail {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
        }
        self.written.push(path.to_path_buf());
        std::fs::write(path, digest)
    }
}
