// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::{error::ParseError, util::parse_hex_u32, CliError};
use std::{fmt, path::PathBuf, str::FromStr};
use tpm2_protocol::data::TpmRh;

/// Hierarchies allowed to authorize an NV undefine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Hierarchy {
    #[default]
    Owner,
    Platform,
}

impl Hierarchy {
    #[must_use]
    pub const fn handle(self) -> u32 {
        match self {
            Self::Owner => TpmRh::Owner as u32,
            Self::Platform => TpmRh::Platform as u32,
        }
    }

    /// The Name of a permanent handle is the handle itself.
    #[must_use]
    pub fn name(self) -> Vec<u8> {
        self.handle().to_be_bytes().to_vec()
    }
}

impl FromStr for Hierarchy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "o" | "owner" => Ok(Self::Owner),
            "p" | "platform" => Ok(Self::Platform),
            _ => match parse_hex_u32(s) {
                Ok(handle) if handle == Self::Owner.handle() => Ok(Self::Owner),
                Ok(handle) if handle == Self::Platform.handle() => Ok(Self::Platform),
                _ => Err(ParseError::Custom(format!(
                    "'{s}' is not an owner or platform hierarchy"
                ))),
            },
        }
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Platform => write!(f, "platform"),
        }
    }
}

/// How the hierarchy is authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HierarchyAuth {
    Password(Vec<u8>),
    Session(PathBuf),
}

impl Default for HierarchyAuth {
    fn default() -> Self {
        Self::Password(Vec::new())
    }
}

impl HierarchyAuth {
    /// Parses an authorization value: `str:VALUE`, `hex:HEX`, `file:PATH`,
    /// `session:PATH`, or a bare password.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the value is malformed, a file cannot be read,
    /// or the scheme is not supported.
    pub fn parse(auth: &str) -> Result<Self, CliError> {
        if let Some(value) = auth.strip_prefix("str:") {
            Ok(Self::Password(value.as_bytes().to_vec()))
        } else if let Some(value) = auth.strip_prefix("hex:") {
            Ok(Self::Password(hex::decode(value).map_err(ParseError::from)?))
        } else if let Some(path) = auth.strip_prefix("file:") {
            std::fs::read(path)
                .map(Self::Password)
                .map_err(|e| CliError::File(path.to_string(), e))
        } else if let Some(path) = auth.strip_prefix("session:") {
            Ok(Self::Session(PathBuf::from(path)))
        } else if auth.starts_with("pcr:") {
            Err(CliError::Usage(
                "PCR policy authorization is not supported for hierarchies".to_string(),
            ))
        } else {
            Ok(Self::Password(auth.as_bytes().to_vec()))
        }
    }
}

/// The hierarchy authorizing the undefine, with its authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHierarchy {
    pub hierarchy: Hierarchy,
    pub auth: HierarchyAuth,
}

impl AuthHierarchy {
    /// The secret mixed into the authorization HMAC or sent as a password.
    #[must_use]
    pub fn auth_value(&self) -> &[u8] {
        match &self.auth {
            HierarchyAuth::Password(value) => value,
            HierarchyAuth::Session(_) => &[],
        }
    }

    #[must_use]
    pub fn session_path(&self) -> Option<&PathBuf> {
        match &self.auth {
            HierarchyAuth::Session(path) => Some(path),
            HierarchyAuth::Password(_) => None,
        }
    }
}
