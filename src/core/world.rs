//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The world client seam.
//!
//! Region topology, parcel state, and the avatar's spatial frame come from
//! the wider client. The handle is passed explicitly into every component
//! that needs it so the voice core can be tested without a live world
//! connection.

use crate::common::{ChannelInfo, RegionHandle};

/// Position in region-local meters.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// True when any component differs by more than `threshold`.
    pub fn differs_from(&self, other: &Vec3, threshold: f32) -> bool {
        (self.x - other.x).abs() > threshold
            || (self.y - other.y).abs() > threshold
            || (self.z - other.z).abs() > threshold
    }
}

/// Heading as a unit quaternion.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

impl Quaternion {
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn differs_from(&self, other: &Quaternion, threshold: f32) -> bool {
        (self.x - other.x).abs() > threshold
            || (self.y - other.y).abs() > threshold
            || (self.z - other.z).abs() > threshold
            || (self.w - other.w).abs() > threshold
    }
}

/// One sample of where the avatar is speaking from and listening from.
/// Sender and listener differ when the camera is detached from the avatar.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct SpatialFrame {
    pub sender_position: Vec3,
    pub sender_heading: Quaternion,
    pub listener_position: Vec3,
    pub listener_heading: Quaternion,
}

/// A region the client is connected to, with the capability URIs this crate
/// needs from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub handle: RegionHandle,
    /// Capability for the offer/answer provisioning exchange.
    pub provision_url: String,
    /// Capability for ICE signaling and session logout.
    pub signaling_url: String,
}

pub trait WorldClient: Send + Sync {
    /// The region the avatar currently stands in, if any.
    fn current_region(&self) -> Option<RegionInfo>;
    /// Every simulator the client currently holds a connection to,
    /// including the current region.
    fn connected_regions(&self) -> Vec<RegionInfo>;
    /// The multi-agent voice channel of the current parcel, if the parcel
    /// overrides region-local voice.
    fn parcel_voice_channel(&self) -> Option<ChannelInfo>;
    /// The current parcel's local id, sent with local provisioning requests.
    fn parcel_local_id(&self) -> Option<i32>;
    /// Sample the avatar's current spatial frame.
    fn spatial_frame(&self) -> SpatialFrame;
}
