//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! # worldvoice -- A Rust virtual-world voice session core
//!
//! This crate negotiates WebRTC-style voice sessions with a virtual-world
//! region server: capability-based offer/answer provisioning, ICE candidate
//! trickling, a JSON data-channel protocol tracking per-peer audio and
//! position state, and bounded-retry reprovisioning after connectivity loss.
//!
//! The media engine, audio devices, HTTP transport, and world client are
//! consumed through traits; see the [`webrtc`], [`lite`], and [`core::world`]
//! modules.

#[macro_use]
extern crate log;

pub mod common;

pub mod error;

/// Core, platform independent functionality.
pub mod core {
    pub mod candidate_queue;
    pub mod peer_registry;
    pub mod protocol;
    pub mod provisioning;
    pub mod sdp;
    pub mod session;
    pub mod session_manager;
    pub mod voice_mutex;
    pub mod world;
}

/// Capability transport abstraction used to reach the region server.
pub mod lite {
    pub mod caps;
}

/// Interfaces onto the media engine and audio devices.
pub mod webrtc {
    pub mod audio_device;
    pub mod peer_connection;
}

#[cfg(any(test, feature = "sim"))]
pub mod sim;
