// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{error::ParseError, CliError};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use tpm2_protocol::data::TpmAlgId;

/// Hash algorithms usable for names, sessions and parameter hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    #[must_use]
    pub const fn alg_id(self) -> TpmAlgId {
        match self {
            Self::Sha1 => TpmAlgId::Sha1,
            Self::Sha256 => TpmAlgId::Sha256,
            Self::Sha384 => TpmAlgId::Sha384,
            Self::Sha512 => TpmAlgId::Sha512,
        }
    }

    /// Digest size in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `chunks`.
    #[must_use]
    pub fn digest(self, chunks: &[&[u8]]) -> Vec<u8> {
        macro_rules! do_digest {
            ($digest:ty) => {{
                let mut hasher = <$digest as Digest>::new();
                for chunk in chunks {
                    hasher.update(chunk);
                }
                hasher.finalize().to_vec()
            }};
        }

        match self {
            Self::Sha1 => do_digest!(Sha1),
            Self::Sha256 => do_digest!(Sha256),
            Self::Sha384 => do_digest!(Sha384),
            Self::Sha512 => do_digest!(Sha512),
        }
    }

    /// Computes an HMAC over the concatenation of `chunks`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError::Execution` if the HMAC cannot be initialized.
    pub fn hmac(self, key: &[u8], chunks: &[&[u8]]) -> Result<Vec<u8>, CliError> {
        macro_rules! do_hmac {
            ($digest:ty) => {{
                let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                    .map_err(|e| CliError::Execution(format!("HMAC init error: {e}")))?;
                for chunk in chunks {
                    mac.update(chunk);
                }
                Ok(mac.finalize().into_bytes().to_vec())
            }};
        }

        match self {
            Self::Sha1 => do_hmac!(Sha1),
            Self::Sha256 => do_hmac!(Sha256),
            Self::Sha384 => do_hmac!(Sha384),
            Self::Sha512 => do_hmac!(Sha512),
        }
    }

    /// Checks `expected` against the HMAC of `chunks` in constant time.
    ///
    /// # Errors
    ///
    /// Returns a `CliError::Execution` if the HMAC does not match.
    pub fn hmac_verify(
        self,
        key: &[u8],
        chunks: &[&[u8]],
        expected: &[u8],
    ) -> Result<(), CliError> {
        macro_rules! do_verify {
            ($digest:ty) => {{
                let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                    .map_err(|e| CliError::Execution(format!("HMAC init error: {e}")))?;
                for chunk in chunks {
                    mac.update(chunk);
                }
                mac.verify_slice(expected)
                    .map_err(|_| CliError::Execution("HMAC mismatch".to_string()))
            }};
        }

        match self {
            Self::Sha1 => do_verify!(Sha1),
            Self::Sha256 => do_verify!(Sha256),
            Self::Sha384 => do_verify!(Sha384),
            Self::Sha512 => do_verify!(Sha512),
        }
    }

    /// Returns a random nonce of the digest size.
    #[must_use]
    pub fn nonce(self) -> Vec<u8> {
        let mut nonce = vec![0; self.size()];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }
}

impl TryFrom<TpmAlgId> for HashAlg {
    type Error = ParseError;

    fn try_from(alg_id: TpmAlgId) -> Result<Self, Self::Error> {
        match alg_id {
            TpmAlgId::Sha1 => Ok(Self::Sha1),
            TpmAlgId::Sha256 => Ok(Self::Sha256),
            TpmAlgId::Sha384 => Ok(Self::Sha384),
            TpmAlgId::Sha512 => Ok(Self::Sha512),
            _ => Err(ParseError::Custom(format!(
                "unsupported hash algorithm: {alg_id:?}"
            ))),
        }
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => write!(f, "sha1"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha384 => write!(f, "sha384"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}
