//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common types used throughout the library.

use std::fmt;

pub mod actor;

/// Common Result type, using `anyhow::Error` for Error.
pub type Result<T> = anyhow::Result<T>;

/// Identifies one region of the virtual world.
pub type RegionHandle = u64;

/// Each VoiceSession has a handle for logging and for tagging events
/// passed to the observer. It's just very convenient to have.
pub type SessionHandle = u32;

/// The kind of voice channel a session is provisioned for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionType {
    /// Region-local spatial voice; the server picks the channel from the
    /// avatar's parcel.
    Local,
    /// A named multi-agent channel (group or ad-hoc conference) joined with
    /// explicit credentials.
    MultiAgent,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Local => write!(f, "local"),
            SessionType::MultiAgent => write!(f, "multiagent"),
        }
    }
}

/// Identity and credentials of a multi-agent voice channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub credentials: Option<String>,
}

impl ChannelInfo {
    pub fn new(id: impl Into<String>, credentials: Option<String>) -> Self {
        Self {
            id: id.into(),
            credentials,
        }
    }
}
