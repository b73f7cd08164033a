//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common error codes.

use thiserror::Error;

/// Platform independent error conditions.
#[derive(Error, Debug)]
pub enum VoiceError {
    // Project wide common error codes
    #[error("Mutex poisoned: {0}")]
    MutexPoisoned(String),
    #[error("Couldn't start an actor: {0}")]
    StartActor(String),

    // Provisioning error codes
    #[error("Provisioning failed after {0} attempts")]
    ProvisioningFailed(u32),
    #[error("Provisioning rejected by server: {0}")]
    ProvisioningRejected(String),
    #[error("Invalid provisioning answer: {0}")]
    InvalidAnswer(String),

    // Offer / answer error codes
    #[error("Unable to rewrite SDP audio parameters")]
    MungeSdp,
}

impl VoiceError {
    /// True for the provisioning rejections that cannot succeed on retry
    /// and should reset any stored channel credentials.
    pub fn is_provisioning_rejection(&self) -> bool {
        matches!(self, VoiceError::ProvisioningRejected(_))
    }
}
