//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Audio device abstraction.
//!
//! Capture, playback, and per-source controls are provided by the
//! application's audio stack. Every control here is an explicit capability
//! method; implementations for engines that lack a control should return an
//! error, which callers treat as a quality issue and log.

use crate::common::Result;
use crate::webrtc::peer_connection::Ssrc;

pub trait AudioDevice: Send + Sync {
    fn start_capture(&self) -> Result<()>;
    fn stop_capture(&self);
    fn start_playback(&self) -> Result<()>;
    fn stop_playback(&self);

    /// Mute or unmute one remote audio source.
    fn set_source_muted(&self, ssrc: Ssrc, muted: bool) -> Result<()>;
    /// Set the playback gain for one remote audio source; 1.0 is unity.
    fn set_source_gain(&self, ssrc: Ssrc, gain: f32) -> Result<()>;
    /// Mute and forget a source whose peer has left.
    fn clear_source(&self, ssrc: Ssrc) -> Result<()>;
}
