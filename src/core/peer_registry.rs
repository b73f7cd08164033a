//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Tracks the remote participants of one voice session.
//!
//! The registry is shared between the session actor and the data-channel
//! receive path, so every mutating operation takes the one internal lock.
//! The peer↔SSRC mapping is bijective: binding rebinds atomically, in a
//! single critical section.
//!
//! No operation here returns an error across the public boundary. The
//! receive loop processes a continuous stream of untrusted traffic; one bad
//! message must never take it down, so internal failures are logged and
//! swallowed.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::core::protocol::QuantizedTransform;
use crate::core::voice_mutex::VoiceMutex;
use crate::webrtc::audio_device::AudioDevice;
use crate::webrtc::peer_connection::Ssrc;

pub type PeerId = Uuid;

/// Last known audio state of a peer, as reported over the data channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerAudioState {
    pub power: i32,
    pub voice_active: bool,
    pub joined_primary: bool,
}

#[derive(Clone, Debug)]
pub struct Peer {
    pub id: PeerId,
    pub ssrc: Option<Ssrc>,
    pub audio: PeerAudioState,
    pub sender_transform: Option<QuantizedTransform>,
    pub listener_transform: Option<QuantizedTransform>,
}

impl Peer {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            ssrc: None,
            audio: PeerAudioState::default(),
            sender_transform: None,
            listener_transform: None,
        }
    }
}

/// What a snapshot reconciliation changed, so the caller can fire exactly
/// one joined/left notification per change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotDelta {
    pub joined: Vec<PeerId>,
    pub left: Vec<PeerId>,
}

struct Inner {
    peers: HashMap<PeerId, Peer>,
    peer_by_ssrc: HashMap<Ssrc, PeerId>,
}

#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<VoiceMutex<Inner>>,
    audio_device: Arc<dyn AudioDevice>,
}

impl PeerRegistry {
    pub fn new(audio_device: Arc<dyn AudioDevice>) -> Self {
        Self {
            inner: Arc::new(VoiceMutex::new(
                Inner {
                    peers: HashMap::new(),
                    peer_by_ssrc: HashMap::new(),
                },
                "peer_registry",
            )),
            audio_device,
        }
    }

    /// Inserts if absent. Returns true when the peer was newly added.
    pub fn upsert_peer(&self, id: PeerId) -> bool {
        match self.inner.lock() {
            Ok(mut inner) => {
                if inner.peers.contains_key(&id) {
                    false
                } else {
                    inner.peers.insert(id, Peer::new(id));
                    true
                }
            }
            Err(err) => {
                error!("upsert_peer: {}", err);
                false
            }
        }
    }

    /// Binds `id` to `ssrc`, unbinding any stale mapping first so the
    /// relation stays bijective. Idempotent for a repeated (id, ssrc) pair.
    pub fn bind_ssrc(&self, id: PeerId, ssrc: Ssrc) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(err) => {
                error!("bind_ssrc: {}", err);
                return;
            }
        };
        // Whole rebind happens under the one lock; no intermediate state
        // is ever visible.
        if let Some(previous_peer) = inner.peer_by_ssrc.insert(ssrc, id) {
            if previous_peer != id {
                if let Some(peer) = inner.peers.get_mut(&previous_peer) {
                    peer.ssrc = None;
                }
            }
        }
        let previous_ssrc = {
            let peer = inner.peers.entry(id).or_insert_with(|| Peer::new(id));
            std::mem::replace(&mut peer.ssrc, Some(ssrc))
        };
        if let Some(previous_ssrc) = previous_ssrc {
            if previous_ssrc != ssrc {
                inner.peer_by_ssrc.remove(&previous_ssrc);
            }
        }
    }

    pub fn lookup_by_ssrc(&self, ssrc: Ssrc) -> Option<PeerId> {
        match self.inner.lock() {
            Ok(inner) => inner.peer_by_ssrc.get(&ssrc).copied(),
            Err(err) => {
                error!("lookup_by_ssrc: {}", err);
                None
            }
        }
    }

    pub fn ssrc_of(&self, id: PeerId) -> Option<Ssrc> {
        match self.inner.lock() {
            Ok(inner) => inner.peers.get(&id).and_then(|peer| peer.ssrc),
            Err(err) => {
                error!("ssrc_of: {}", err);
                None
            }
        }
    }

    /// Removes the peer and any SSRC binding. Returns true when a peer was
    /// actually removed, so the caller fires exactly one "left"
    /// notification; a second call is a no-op.
    pub fn remove_peer(&self, id: PeerId) -> bool {
        let removed_ssrc = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(err) => {
                    error!("remove_peer: {}", err);
                    return false;
                }
            };
            match inner.peers.remove(&id) {
                None => return false,
                Some(peer) => {
                    if let Some(ssrc) = peer.ssrc {
                        inner.peer_by_ssrc.remove(&ssrc);
                    }
                    peer.ssrc
                }
            }
        };
        // A missed mute is a quality issue, not a correctness one.
        if let Some(ssrc) = removed_ssrc {
            if let Err(err) = self.audio_device.clear_source(ssrc) {
                warn!("couldn't clear audio source {}: {}", ssrc, err);
            }
        }
        true
    }

    /// Applies an update to a peer's audio state, returning the new state.
    /// None if the peer is unknown.
    pub fn update_audio(
        &self,
        id: PeerId,
        update: impl FnOnce(&mut PeerAudioState),
    ) -> Option<PeerAudioState> {
        match self.inner.lock() {
            Ok(mut inner) => inner.peers.get_mut(&id).map(|peer| {
                update(&mut peer.audio);
                peer.audio
            }),
            Err(err) => {
                error!("update_audio: {}", err);
                None
            }
        }
    }

    pub fn update_transforms(
        &self,
        id: PeerId,
        sender: Option<QuantizedTransform>,
        listener: Option<QuantizedTransform>,
    ) -> bool {
        match self.inner.lock() {
            Ok(mut inner) => match inner.peers.get_mut(&id) {
                Some(peer) => {
                    if sender.is_some() {
                        peer.sender_transform = sender;
                    }
                    if listener.is_some() {
                        peer.listener_transform = listener;
                    }
                    true
                }
                None => false,
            },
            Err(err) => {
                error!("update_transforms: {}", err);
                false
            }
        }
    }

    /// Replaces the membership with the authoritative snapshot: every id in
    /// `ids` is upserted and every known id absent from it is removed.
    /// Runs under one lock so a snapshot is never interleaved with another
    /// mutation.
    pub fn reconcile_snapshot(&self, ids: &[PeerId]) -> SnapshotDelta {
        let mut delta = SnapshotDelta::default();
        let mut cleared_ssrcs = Vec::new();
        {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(err) => {
                    error!("reconcile_snapshot: {}", err);
                    return delta;
                }
            };
            let left: Vec<PeerId> = inner
                .peers
                .keys()
                .filter(|known| !ids.contains(known))
                .copied()
                .collect();
            for id in left {
                if let Some(peer) = inner.peers.remove(&id) {
                    if let Some(ssrc) = peer.ssrc {
                        inner.peer_by_ssrc.remove(&ssrc);
                        cleared_ssrcs.push(ssrc);
                    }
                }
                delta.left.push(id);
            }
            for id in ids {
                if !inner.peers.contains_key(id) {
                    inner.peers.insert(*id, Peer::new(*id));
                    delta.joined.push(*id);
                }
            }
        }
        for ssrc in cleared_ssrcs {
            if let Err(err) = self.audio_device.clear_source(ssrc) {
                warn!("couldn't clear audio source {}: {}", ssrc, err);
            }
        }
        delta
    }

    /// Removes every peer and SSRC binding; used on session teardown and
    /// reprovision.
    pub fn clear_all(&self) {
        let cleared_ssrcs: Vec<Ssrc> = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(err) => {
                    error!("clear_all: {}", err);
                    return;
                }
            };
            inner.peers.clear();
            inner.peer_by_ssrc.drain().map(|(ssrc, _)| ssrc).collect()
        };
        for ssrc in cleared_ssrcs {
            if let Err(err) = self.audio_device.clear_source(ssrc) {
                warn!("couldn't clear audio source {}: {}", ssrc, err);
            }
        }
    }

    pub fn contains(&self, id: PeerId) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.peers.contains_key(&id),
            Err(_) => false,
        }
    }

    pub fn known_peers(&self) -> Vec<Peer> {
        match self.inner.lock() {
            Ok(inner) => inner.peers.values().cloned().collect(),
            Err(err) => {
                error!("known_peers: {}", err);
                Vec::new()
            }
        }
    }

    pub fn known_ids(&self) -> Vec<PeerId> {
        match self.inner.lock() {
            Ok(inner) => inner.peers.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.peers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::FakeAudioDevice;

    fn registry() -> (PeerRegistry, Arc<FakeAudioDevice>) {
        let audio = Arc::new(FakeAudioDevice::default());
        (PeerRegistry::new(audio.clone()), audio)
    }

    fn id(n: u128) -> PeerId {
        Uuid::from_u128(n)
    }

    #[test]
    fn upsert_is_idempotent() {
        let (registry, _audio) = registry();
        assert!(registry.upsert_peer(id(1)));
        assert!(!registry.upsert_peer(id(1)));
        assert_eq!(1, registry.len());
    }

    #[test]
    fn bind_ssrc_is_bijective() {
        let (registry, _audio) = registry();
        registry.upsert_peer(id(1));
        registry.upsert_peer(id(2));

        registry.bind_ssrc(id(1), 100);
        assert_eq!(Some(id(1)), registry.lookup_by_ssrc(100));
        assert_eq!(Some(100), registry.ssrc_of(id(1)));

        // Same pair again: no change.
        registry.bind_ssrc(id(1), 100);
        assert_eq!(Some(id(1)), registry.lookup_by_ssrc(100));

        // Peer 1 moves to a new SSRC: 100 must be unbound.
        registry.bind_ssrc(id(1), 200);
        assert_eq!(None, registry.lookup_by_ssrc(100));
        assert_eq!(Some(id(1)), registry.lookup_by_ssrc(200));
        assert_eq!(Some(200), registry.ssrc_of(id(1)));

        // Peer 2 takes over SSRC 200: peer 1 must lose it.
        registry.bind_ssrc(id(2), 200);
        assert_eq!(Some(id(2)), registry.lookup_by_ssrc(200));
        assert_eq!(None, registry.ssrc_of(id(1)));
        assert_eq!(Some(200), registry.ssrc_of(id(2)));
    }

    #[test]
    fn remove_peer_is_idempotent_and_clears_audio_source() {
        let (registry, audio) = registry();
        registry.upsert_peer(id(1));
        registry.bind_ssrc(id(1), 42);

        assert!(registry.remove_peer(id(1)));
        assert!(!registry.remove_peer(id(1)));
        assert_eq!(None, registry.lookup_by_ssrc(42));
        assert_eq!(vec![42], audio.cleared_sources());
    }

    #[test]
    fn reconcile_snapshot_is_a_set_replace() {
        let (registry, _audio) = registry();
        for n in [1, 2, 3] {
            registry.upsert_peer(id(n));
        }

        let mut delta = registry.reconcile_snapshot(&[id(2), id(3), id(4)]);
        delta.joined.sort();
        delta.left.sort();
        assert_eq!(vec![id(4)], delta.joined);
        assert_eq!(vec![id(1)], delta.left);

        let mut known = registry.known_ids();
        known.sort();
        assert_eq!(vec![id(2), id(3), id(4)], known);
    }

    #[test]
    fn reconcile_snapshot_with_no_changes_is_empty() {
        let (registry, _audio) = registry();
        registry.upsert_peer(id(1));
        let delta = registry.reconcile_snapshot(&[id(1)]);
        assert_eq!(SnapshotDelta::default(), delta);
    }

    #[test]
    fn clear_all_empties_everything() {
        let (registry, audio) = registry();
        registry.upsert_peer(id(1));
        registry.bind_ssrc(id(1), 7);
        registry.clear_all();
        assert!(registry.is_empty());
        assert_eq!(None, registry.lookup_by_ssrc(7));
        assert_eq!(vec![7], audio.cleared_sources());
    }
}
