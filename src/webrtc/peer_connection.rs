//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Peer connection abstraction.
//!
//! The RTP/ICE/DTLS engine lives behind these traits. This crate drives the
//! offer/answer exchange and the data channel; everything below the SDP
//! boundary is the engine's problem.

use std::fmt;

use crate::common::Result;

/// A numeric identifier tagging which media source a stream of audio
/// packets belongs to.
pub type Ssrc = u32;

/// A proposed network path gathered locally during connection
/// establishment.
#[derive(Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: i32,
    pub sdp: String,
}

impl IceCandidate {
    pub fn new(sdp_mid: String, sdp_mline_index: i32, sdp: String) -> Self {
        Self {
            sdp_mid,
            sdp_mline_index,
            sdp,
        }
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Candidate SDP carries addresses; don't log it wholesale.
        write!(
            f,
            "sdp_mid: {}, sdp_mline: {}, sdp: {} bytes",
            self.sdp_mid,
            self.sdp_mline_index,
            self.sdp.len()
        )
    }
}

impl fmt::Debug for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Rust version of the RTCIceGatheringState enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Rust version of the RTCPeerConnectionState enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One peer connection, created per session attempt and replaced wholesale
/// on reprovision. SDP is exchanged as text.
pub trait PeerConnection: Send {
    fn create_offer(&self) -> Result<String>;
    fn set_local_description(&self, sdp: &str) -> Result<()>;
    fn set_remote_description(&self, sdp: &str) -> Result<()>;
    fn send_data_channel_message(&self, message: &str) -> Result<()>;
    fn close(&self);
}

/// Callbacks from the engine. Implementations must not block: they are
/// invoked on the engine's threads and should hand off to an actor.
pub trait PeerConnectionObserverTrait: Send {
    fn handle_ice_candidate_gathered(&mut self, candidate: IceCandidate);
    fn handle_ice_gathering_state_changed(&mut self, state: IceGatheringState);
    fn handle_connection_state_changed(&mut self, state: PeerConnectionState);
    fn handle_data_channel_opened(&mut self);
    fn handle_data_channel_closed(&mut self);
    fn handle_data_channel_message(&mut self, message: String);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create_peer_connection(
        &self,
        observer: Box<dyn PeerConnectionObserverTrait>,
    ) -> Result<Box<dyn PeerConnection>>;
}
