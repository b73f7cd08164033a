//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Fake collaborators for tests and integration harnesses.
//!
//! Every trait the crate consumes has a recording fake here: the
//! capability transport, the peer connection engine, the audio device, the
//! world client, and the session observer. The fakes answer synchronously
//! unless put into a manual mode, and record everything for assertions.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Condvar, Mutex,
};
use std::time::Duration;

use anyhow::anyhow;

use crate::common::{ChannelInfo, Result, SessionHandle};
use crate::core::peer_registry::{PeerAudioState, PeerId};
use crate::core::protocol::QuantizedTransform;
use crate::core::session::{EndReason, SessionObserver};
use crate::core::world::{RegionInfo, SpatialFrame, WorldClient};
use crate::lite::caps;
use crate::webrtc::audio_device::AudioDevice;
use crate::webrtc::peer_connection::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerConnectionObserverTrait, Ssrc,
};

/// A one-shot latch a test can block on.
#[derive(Default)]
pub struct Event {
    set: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub fn set(&self) {
        let mut set = self.set.lock().unwrap();
        *set = true;
        self.condvar.notify_all();
    }

    /// True if the event was set within `timeout`.
    pub fn wait(&self, timeout: Duration) -> bool {
        let set = self.set.lock().unwrap();
        let (set, _) = self
            .condvar
            .wait_timeout_while(set, timeout, |set| !*set)
            .unwrap();
        *set
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap()
    }
}

/// Capability transport fake. By default each request is answered
/// immediately from the queued responses (or with a transport failure when
/// the queue is empty); in manual mode requests are held until the test
/// releases them with [`FakeCapsClient::respond_next`].
#[derive(Default)]
pub struct FakeCapsClient {
    requests: Mutex<Vec<caps::Request>>,
    responses: Mutex<VecDeque<Option<caps::Response>>>,
    manual: AtomicBool,
    pending: Mutex<VecDeque<caps::ResponseCallback>>,
}

impl FakeCapsClient {
    pub fn push_response(&self, response: Option<caps::Response>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Answers the oldest held request. False if none is pending.
    pub fn respond_next(&self, response: Option<caps::Response>) -> bool {
        let callback = self.pending.lock().unwrap().pop_front();
        match callback {
            Some(callback) => {
                callback(response);
                true
            }
            None => false,
        }
    }

    pub fn requests(&self) -> Vec<caps::Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl caps::Client for FakeCapsClient {
    fn send_request(&self, request: caps::Request, callback: caps::ResponseCallback) {
        self.requests.lock().unwrap().push(request);
        let queued = self.responses.lock().unwrap().pop_front();
        if let Some(response) = queued {
            callback(response);
            return;
        }
        if self.manual.load(Ordering::SeqCst) {
            self.pending.lock().unwrap().push_back(callback);
        } else {
            callback(None);
        }
    }
}

const FAKE_OFFER: &str = "v=0\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    a=rtpmap:111 opus/48000/2\r\n\
    a=fmtp:111 minptime=10;useinbandfec=1\r\n";

/// The recording half of a fake peer connection, shared between the
/// connection handed to the session and the test.
pub struct FakePeerConnectionCore {
    offer: String,
    local_descriptions: Mutex<Vec<String>>,
    remote_descriptions: Mutex<Vec<String>>,
    data_messages: Mutex<Vec<String>>,
    closed: AtomicBool,
    fail_data_channel: AtomicBool,
}

impl Default for FakePeerConnectionCore {
    fn default() -> Self {
        Self {
            offer: FAKE_OFFER.to_string(),
            local_descriptions: Mutex::default(),
            remote_descriptions: Mutex::default(),
            data_messages: Mutex::default(),
            closed: AtomicBool::new(false),
            fail_data_channel: AtomicBool::new(false),
        }
    }
}

impl FakePeerConnectionCore {
    pub fn local_descriptions(&self) -> Vec<String> {
        self.local_descriptions.lock().unwrap().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<String> {
        self.remote_descriptions.lock().unwrap().clone()
    }

    pub fn data_messages(&self) -> Vec<String> {
        self.data_messages.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_fail_data_channel(&self, fail: bool) {
        self.fail_data_channel.store(fail, Ordering::SeqCst);
    }
}

struct FakePeerConnection {
    core: Arc<FakePeerConnectionCore>,
}

impl PeerConnection for FakePeerConnection {
    fn create_offer(&self) -> Result<String> {
        Ok(self.core.offer.clone())
    }

    fn set_local_description(&self, sdp: &str) -> Result<()> {
        self.core
            .local_descriptions
            .lock()
            .unwrap()
            .push(sdp.to_string());
        Ok(())
    }

    fn set_remote_description(&self, sdp: &str) -> Result<()> {
        self.core
            .remote_descriptions
            .lock()
            .unwrap()
            .push(sdp.to_string());
        Ok(())
    }

    fn send_data_channel_message(&self, message: &str) -> Result<()> {
        if self.core.fail_data_channel.load(Ordering::SeqCst) {
            return Err(anyhow!("fake data channel send failure"));
        }
        self.core
            .data_messages
            .lock()
            .unwrap()
            .push(message.to_string());
        Ok(())
    }

    fn close(&self) {
        self.core.closed.store(true, Ordering::SeqCst);
    }
}

/// A created fake connection plus the observer the session registered on
/// it, so tests can drive engine events.
#[derive(Clone)]
pub struct FakeConnection {
    pub core: Arc<FakePeerConnectionCore>,
    observer: Arc<Mutex<Box<dyn PeerConnectionObserverTrait>>>,
}

impl FakeConnection {
    /// Invokes engine callbacks the way the real engine would, from
    /// whatever thread the caller is on.
    pub fn drive(&self, f: impl FnOnce(&mut dyn PeerConnectionObserverTrait)) {
        let mut observer = self.observer.lock().unwrap();
        f(observer.as_mut());
    }
}

#[derive(Default)]
pub struct FakePeerConnectionFactory {
    connections: Mutex<Vec<FakeConnection>>,
    fail_next: AtomicBool,
}

impl FakePeerConnectionFactory {
    pub fn set_fail_next(&self, fail: bool) {
        self.fail_next.store(fail, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn latest(&self) -> Option<FakeConnection> {
        self.connections.lock().unwrap().last().cloned()
    }
}

impl PeerConnectionFactory for FakePeerConnectionFactory {
    fn create_peer_connection(
        &self,
        observer: Box<dyn PeerConnectionObserverTrait>,
    ) -> Result<Box<dyn PeerConnection>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("fake peer connection factory failure"));
        }
        let core = Arc::new(FakePeerConnectionCore::default());
        let connection = FakeConnection {
            core: core.clone(),
            observer: Arc::new(Mutex::new(observer)),
        };
        self.connections.lock().unwrap().push(connection);
        Ok(Box::new(FakePeerConnection { core }))
    }
}

#[derive(Default)]
pub struct FakeAudioDevice {
    capture_running: AtomicBool,
    playback_running: AtomicBool,
    mutes: Mutex<Vec<(Ssrc, bool)>>,
    gains: Mutex<Vec<(Ssrc, f32)>>,
    cleared: Mutex<Vec<Ssrc>>,
    fail_controls: AtomicBool,
}

impl FakeAudioDevice {
    pub fn capture_running(&self) -> bool {
        self.capture_running.load(Ordering::SeqCst)
    }

    pub fn playback_running(&self) -> bool {
        self.playback_running.load(Ordering::SeqCst)
    }

    pub fn mutes(&self) -> Vec<(Ssrc, bool)> {
        self.mutes.lock().unwrap().clone()
    }

    pub fn gains(&self) -> Vec<(Ssrc, f32)> {
        self.gains.lock().unwrap().clone()
    }

    pub fn cleared_sources(&self) -> Vec<Ssrc> {
        self.cleared.lock().unwrap().clone()
    }

    pub fn set_fail_controls(&self, fail: bool) {
        self.fail_controls.store(fail, Ordering::SeqCst);
    }

    fn control_result(&self) -> Result<()> {
        if self.fail_controls.load(Ordering::SeqCst) {
            Err(anyhow!("fake audio control failure"))
        } else {
            Ok(())
        }
    }
}

impl AudioDevice for FakeAudioDevice {
    fn start_capture(&self) -> Result<()> {
        self.capture_running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_capture(&self) {
        self.capture_running.store(false, Ordering::SeqCst);
    }

    fn start_playback(&self) -> Result<()> {
        self.playback_running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_playback(&self) {
        self.playback_running.store(false, Ordering::SeqCst);
    }

    fn set_source_muted(&self, ssrc: Ssrc, muted: bool) -> Result<()> {
        self.control_result()?;
        self.mutes.lock().unwrap().push((ssrc, muted));
        Ok(())
    }

    fn set_source_gain(&self, ssrc: Ssrc, gain: f32) -> Result<()> {
        self.control_result()?;
        self.gains.lock().unwrap().push((ssrc, gain));
        Ok(())
    }

    fn clear_source(&self, ssrc: Ssrc) -> Result<()> {
        self.control_result()?;
        self.cleared.lock().unwrap().push(ssrc);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeWorldClient {
    current_region: Mutex<Option<RegionInfo>>,
    connected_regions: Mutex<Vec<RegionInfo>>,
    parcel_voice_channel: Mutex<Option<ChannelInfo>>,
    parcel_local_id: Mutex<Option<i32>>,
    spatial_frame: Mutex<SpatialFrame>,
}

impl FakeWorldClient {
    pub fn set_current_region(&self, region: Option<RegionInfo>) {
        *self.current_region.lock().unwrap() = region;
    }

    pub fn set_connected_regions(&self, regions: Vec<RegionInfo>) {
        *self.connected_regions.lock().unwrap() = regions;
    }

    pub fn set_parcel_voice_channel(&self, channel: Option<ChannelInfo>) {
        *self.parcel_voice_channel.lock().unwrap() = channel;
    }

    pub fn set_parcel_local_id(&self, id: Option<i32>) {
        *self.parcel_local_id.lock().unwrap() = id;
    }

    pub fn set_spatial_frame(&self, frame: SpatialFrame) {
        *self.spatial_frame.lock().unwrap() = frame;
    }
}

impl WorldClient for FakeWorldClient {
    fn current_region(&self) -> Option<RegionInfo> {
        self.current_region.lock().unwrap().clone()
    }

    fn connected_regions(&self) -> Vec<RegionInfo> {
        self.connected_regions.lock().unwrap().clone()
    }

    fn parcel_voice_channel(&self) -> Option<ChannelInfo> {
        self.parcel_voice_channel.lock().unwrap().clone()
    }

    fn parcel_local_id(&self) -> Option<i32> {
        *self.parcel_local_id.lock().unwrap()
    }

    fn spatial_frame(&self) -> SpatialFrame {
        *self.spatial_frame.lock().unwrap()
    }
}

#[derive(Default)]
pub struct FakeSessionObserver {
    joined: Mutex<Vec<PeerId>>,
    left: Mutex<Vec<PeerId>>,
    audio_updates: Mutex<Vec<(PeerId, PeerAudioState)>>,
    position_updates: Mutex<Vec<PeerId>>,
    peer_lists: Mutex<Vec<Vec<PeerId>>>,
    mute_maps: Mutex<Vec<Vec<(PeerId, bool)>>>,
    gain_maps: Mutex<Vec<Vec<(PeerId, i32)>>>,
    connection_ready: Event,
    data_channel_ready: Event,
    connection_closed_count: AtomicU32,
    reprovision_succeeded_count: AtomicU32,
    reprovision_failed_count: AtomicU32,
    ended: Mutex<Vec<EndReason>>,
}

impl FakeSessionObserver {
    pub fn joined(&self) -> Vec<PeerId> {
        self.joined.lock().unwrap().clone()
    }

    pub fn left(&self) -> Vec<PeerId> {
        self.left.lock().unwrap().clone()
    }

    pub fn audio_updates(&self) -> Vec<(PeerId, PeerAudioState)> {
        self.audio_updates.lock().unwrap().clone()
    }

    pub fn position_updates(&self) -> Vec<PeerId> {
        self.position_updates.lock().unwrap().clone()
    }

    pub fn peer_lists(&self) -> Vec<Vec<PeerId>> {
        self.peer_lists.lock().unwrap().clone()
    }

    pub fn mute_maps(&self) -> Vec<Vec<(PeerId, bool)>> {
        self.mute_maps.lock().unwrap().clone()
    }

    pub fn gain_maps(&self) -> Vec<Vec<(PeerId, i32)>> {
        self.gain_maps.lock().unwrap().clone()
    }

    pub fn wait_for_connection_ready(&self, timeout: Duration) -> bool {
        self.connection_ready.wait(timeout)
    }

    pub fn wait_for_data_channel_ready(&self, timeout: Duration) -> bool {
        self.data_channel_ready.wait(timeout)
    }

    pub fn connection_closed_count(&self) -> u32 {
        self.connection_closed_count.load(Ordering::SeqCst)
    }

    pub fn reprovision_succeeded_count(&self) -> u32 {
        self.reprovision_succeeded_count.load(Ordering::SeqCst)
    }

    pub fn reprovision_failed_count(&self) -> u32 {
        self.reprovision_failed_count.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> Vec<EndReason> {
        self.ended.lock().unwrap().clone()
    }
}

impl SessionObserver for FakeSessionObserver {
    fn handle_peer_joined(&self, _handle: SessionHandle, id: PeerId) {
        self.joined.lock().unwrap().push(id);
    }

    fn handle_peer_left(&self, _handle: SessionHandle, id: PeerId) {
        self.left.lock().unwrap().push(id);
    }

    fn handle_peer_audio_updated(&self, _handle: SessionHandle, id: PeerId, audio: PeerAudioState) {
        self.audio_updates.lock().unwrap().push((id, audio));
    }

    fn handle_peer_position_updated(
        &self,
        _handle: SessionHandle,
        id: PeerId,
        _sender: Option<QuantizedTransform>,
        _listener: Option<QuantizedTransform>,
    ) {
        self.position_updates.lock().unwrap().push(id);
    }

    fn handle_peer_list_updated(&self, _handle: SessionHandle, ids: Vec<PeerId>) {
        self.peer_lists.lock().unwrap().push(ids);
    }

    fn handle_mute_map_received(&self, _handle: SessionHandle, entries: Vec<(PeerId, bool)>) {
        self.mute_maps.lock().unwrap().push(entries);
    }

    fn handle_gain_map_received(&self, _handle: SessionHandle, entries: Vec<(PeerId, i32)>) {
        self.gain_maps.lock().unwrap().push(entries);
    }

    fn handle_data_channel_ready(&self, _handle: SessionHandle) {
        self.data_channel_ready.set();
    }

    fn handle_connection_ready(&self, _handle: SessionHandle) {
        self.connection_ready.set();
    }

    fn handle_connection_closed(&self, _handle: SessionHandle) {
        self.connection_closed_count.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_reprovision_succeeded(&self, _handle: SessionHandle) {
        self.reprovision_succeeded_count
            .fetch_add(1, Ordering::SeqCst);
    }

    fn handle_reprovision_failed(&self, _handle: SessionHandle) {
        self.reprovision_failed_count.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_session_ended(&self, _handle: SessionHandle, reason: EndReason) {
        self.ended.lock().unwrap().push(reason);
    }
}

/// A ready-made ICE candidate for tests.
pub fn fake_candidate(n: i32) -> IceCandidate {
    IceCandidate::new(
        "audio".to_string(),
        0,
        format!("candidate:{n} 1 udp 2122260223 10.0.0.1 {n} typ host"),
    )
}
