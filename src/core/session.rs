//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! One voice session: the peer-connection lifecycle for one region.
//!
//! ```text
//! Created -> Offering -> AwaitingAnswer -> AnswerReceived -> IceGathering
//!     -> Connected -> DataChannelOpen -> Closing -> Closed
//! ```
//!
//! Any connectivity failure (ICE failure, disconnect, connect watchdog)
//! takes the `Failed` edge instead of ending the session: the peer
//! connection is torn down and rebuilt with backoff, preserving channel
//! identity. Connectivity loss is an expected condition here, not an error
//! surfaced to the application.
//!
//! All state lives on the session's actor. Engine callbacks arrive on the
//! media engine's threads and are forwarded as closures; each carries the
//! peer-connection epoch so events from a connection that has since been
//! replaced are ignored.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crate::common::actor::{Actor, Stopper};
use crate::common::{ChannelInfo, Result, SessionHandle, SessionType};
use crate::core::candidate_queue::CandidateQueue;
use crate::core::peer_registry::{Peer, PeerAudioState, PeerId, PeerRegistry};
use crate::core::protocol::{self, ProtocolEvents, QuantizedTransform};
use crate::core::provisioning::{
    self, ProvisionAnswer, ProvisionRequest, ProvisioningClient, RetryPolicy,
};
use crate::core::sdp;
use crate::core::world::{RegionInfo, SpatialFrame, WorldClient};
use crate::error::VoiceError;
use crate::lite::caps;
use crate::webrtc::audio_device::AudioDevice;
use crate::webrtc::peer_connection::{
    IceCandidate, IceGatheringState, PeerConnection, PeerConnectionFactory,
    PeerConnectionObserverTrait, PeerConnectionState,
};

const TICK_INTERVAL: Duration = Duration::from_millis(25);
const POSITION_INTERVAL: Duration = Duration::from_millis(100);
/// Let the join message be processed before position traffic competes
/// with it.
const POSITION_SETTLE_DELAY: Duration = Duration::from_millis(100);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// How hard a session fights to stay connected: the connect watchdog and the
/// bounded reprovision schedule. Injectable so recovery is testable without
/// multi-second waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub connect_watchdog: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            connect_watchdog: Duration::from_secs(8),
        }
    }
}

impl RecoveryPolicy {
    /// Doubling backoff from `base_delay`, capped at `max_delay`.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        std::cmp::min(self.base_delay * 2u32.pow(exponent), self.max_delay)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    Created,
    Offering,
    AwaitingAnswer,
    AnswerReceived,
    IceGathering,
    Connected,
    DataChannelOpen,
    Failed,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum EndReason {
    /// The application asked for the session to close.
    Closed,
    /// The server broke the offer/answer contract.
    InvalidAnswer,
    /// Recovery gave up after the bounded reprovision attempts.
    ReprovisionFailed,
}

/// Events surfaced to the application layer. Callbacks run on the
/// session's actor thread and must not block.
pub trait SessionObserver: Send + Sync {
    fn handle_peer_joined(&self, handle: SessionHandle, id: PeerId);
    fn handle_peer_left(&self, handle: SessionHandle, id: PeerId);
    fn handle_peer_audio_updated(&self, handle: SessionHandle, id: PeerId, audio: PeerAudioState);
    fn handle_peer_position_updated(
        &self,
        handle: SessionHandle,
        id: PeerId,
        sender: Option<QuantizedTransform>,
        listener: Option<QuantizedTransform>,
    );
    fn handle_peer_list_updated(&self, handle: SessionHandle, ids: Vec<PeerId>);
    fn handle_mute_map_received(&self, handle: SessionHandle, entries: Vec<(PeerId, bool)>);
    fn handle_gain_map_received(&self, handle: SessionHandle, entries: Vec<(PeerId, i32)>);
    fn handle_data_channel_ready(&self, handle: SessionHandle);
    fn handle_connection_ready(&self, handle: SessionHandle);
    fn handle_connection_closed(&self, handle: SessionHandle);
    fn handle_reprovision_succeeded(&self, handle: SessionHandle);
    fn handle_reprovision_failed(&self, handle: SessionHandle);
    fn handle_session_ended(&self, handle: SessionHandle, reason: EndReason);
}

/// The collaborators a session consumes, passed explicitly so the whole
/// core runs against fakes in tests.
#[derive(Clone)]
pub struct Collaborators {
    pub http_client: Arc<dyn caps::Client>,
    pub peer_connection_factory: Arc<dyn PeerConnectionFactory>,
    pub audio_device: Arc<dyn AudioDevice>,
    pub world_client: Arc<dyn WorldClient>,
    pub observer: Arc<dyn SessionObserver>,
}

#[derive(Clone)]
pub struct SessionConfig {
    pub handle: SessionHandle,
    pub session_type: SessionType,
    pub region: RegionInfo,
    /// MultiAgent only; Local sessions get their channel from the parcel.
    pub channel: Option<ChannelInfo>,
    /// Whether this is the avatar's current region, as opposed to an
    /// adjacent one.
    pub primary: bool,
    pub retry_policy: RetryPolicy,
    pub recovery: RecoveryPolicy,
}

/// Decides when a sampled spatial frame is worth a wire send.
///
/// Three gates: the sample must differ from the last observed one by more
/// than the thresholds (or an earlier sample must have left the reporter
/// dirty), and the rendered payload must differ from the last one sent.
/// Catching small cumulative drift and never re-sending identical payloads
/// both matter; either check alone misses one of them.
#[derive(Default)]
pub struct PositionReporter {
    last_observed: Option<SpatialFrame>,
    dirty: bool,
    last_sent: Option<String>,
}

const POSITION_THRESHOLD_METERS: f32 = 0.01;
const HEADING_THRESHOLD: f32 = 0.0005;

impl PositionReporter {
    pub fn report(&mut self, frame: &SpatialFrame) -> Option<String> {
        let moved = match &self.last_observed {
            None => true,
            Some(last) => {
                frame
                    .sender_position
                    .differs_from(&last.sender_position, POSITION_THRESHOLD_METERS)
                    || frame
                        .sender_heading
                        .differs_from(&last.sender_heading, HEADING_THRESHOLD)
                    || frame
                        .listener_position
                        .differs_from(&last.listener_position, POSITION_THRESHOLD_METERS)
                    || frame
                        .listener_heading
                        .differs_from(&last.listener_heading, HEADING_THRESHOLD)
            }
        };
        self.last_observed = Some(*frame);
        if moved {
            self.dirty = true;
        }
        if !self.dirty {
            return None;
        }
        let (sender, listener) = protocol::quantize_frame(frame);
        let message = protocol::position_message(&sender, &listener);
        self.dirty = false;
        if self.last_sent.as_deref() == Some(message.as_str()) {
            return None;
        }
        self.last_sent = Some(message.clone());
        Some(message)
    }
}

/// Forwards engine callbacks onto the session actor, tagged with the
/// epoch of the connection they came from.
struct PcForwarder {
    actor: Actor<SessionState>,
    epoch: u64,
}

impl PeerConnectionObserverTrait for PcForwarder {
    fn handle_ice_candidate_gathered(&mut self, candidate: IceCandidate) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| state.handle_ice_candidate_gathered(epoch, candidate));
    }

    fn handle_ice_gathering_state_changed(&mut self, gathering_state: IceGatheringState) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| state.handle_ice_gathering_state_changed(epoch, gathering_state));
    }

    fn handle_connection_state_changed(&mut self, pc_state: PeerConnectionState) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| state.handle_connection_state_changed(epoch, pc_state));
    }

    fn handle_data_channel_opened(&mut self) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| state.handle_data_channel_opened(epoch));
    }

    fn handle_data_channel_closed(&mut self) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| state.handle_data_channel_closed(epoch));
    }

    fn handle_data_channel_message(&mut self, message: String) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| state.handle_data_channel_message(epoch, message));
    }
}

struct SessionState {
    handle: SessionHandle,
    session_type: SessionType,
    primary: bool,
    region: RegionInfo,
    channel: Option<ChannelInfo>,

    actor: Actor<SessionState>,
    http_client: Arc<dyn caps::Client>,
    peer_connection_factory: Arc<dyn PeerConnectionFactory>,
    audio_device: Arc<dyn AudioDevice>,
    world_client: Arc<dyn WorldClient>,
    observer: Arc<dyn SessionObserver>,
    provisioning: ProvisioningClient,

    registry: PeerRegistry,
    candidate_queue: CandidateQueue,
    position_reporter: PositionReporter,

    peer_connection: Option<Box<dyn PeerConnection>>,
    /// Bumped every time the peer connection is replaced; events tagged
    /// with an older epoch are stale and dropped.
    pc_epoch: u64,
    connection_state: ConnectionState,
    answer_received: bool,
    viewer_session: Option<String>,
    ice_gathering_complete: bool,
    trickle_complete_sent: bool,
    join_sent: bool,

    tick_running: bool,
    position_enabled_at: Option<Instant>,
    next_position_time: Option<Instant>,
    next_keepalive_time: Option<Instant>,

    recovery: RecoveryPolicy,
    reprovision_attempts: u32,
    reprovision_guard: Arc<AtomicBool>,
}

/// Handle to a running session. Operations are posted to the session
/// actor; `known_peers` reads the shared registry directly.
pub struct VoiceSession {
    handle: SessionHandle,
    actor: Actor<SessionState>,
    registry: PeerRegistry,
    reprovision_guard: Arc<AtomicBool>,
    stopper: Stopper,
}

impl VoiceSession {
    pub fn start(
        config: SessionConfig,
        collaborators: Collaborators,
        stopper: Stopper,
    ) -> Result<Self> {
        info!(
            "session {}: starting {} voice for region {:#x}",
            config.handle, config.session_type, config.region.handle
        );
        let registry = PeerRegistry::new(collaborators.audio_device.clone());
        let reprovision_guard = Arc::new(AtomicBool::new(false));

        let handle = config.handle;
        let registry_for_state = registry.clone();
        let guard_for_state = reprovision_guard.clone();
        let stopper_for_state = stopper.clone();
        let actor = Actor::start("voice_session", stopper.clone(), move |actor| {
            let provisioning = ProvisioningClient::new(
                collaborators.http_client.clone(),
                config.retry_policy,
                &stopper_for_state,
            )?;
            Ok(SessionState {
                handle: config.handle,
                session_type: config.session_type,
                primary: config.primary,
                region: config.region,
                channel: config.channel,
                actor,
                http_client: collaborators.http_client,
                peer_connection_factory: collaborators.peer_connection_factory,
                audio_device: collaborators.audio_device,
                world_client: collaborators.world_client,
                observer: collaborators.observer,
                provisioning,
                registry: registry_for_state,
                candidate_queue: CandidateQueue::new(),
                position_reporter: PositionReporter::default(),
                peer_connection: None,
                pc_epoch: 0,
                connection_state: ConnectionState::Created,
                answer_received: false,
                viewer_session: None,
                ice_gathering_complete: false,
                trickle_complete_sent: false,
                join_sent: false,
                tick_running: false,
                position_enabled_at: None,
                next_position_time: None,
                next_keepalive_time: None,
                recovery: config.recovery,
                reprovision_attempts: 0,
                reprovision_guard: guard_for_state,
            })
        })?;
        Ok(Self {
            handle,
            actor,
            registry,
            reprovision_guard,
            stopper,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// The session's cancellation scope; the owner stops it (with a
    /// bounded join) after `close`.
    pub fn stopper(&self) -> &Stopper {
        &self.stopper
    }

    pub fn connect(&self) {
        info!("session {}: connect()", self.handle);
        self.actor.send(|state| state.connect());
    }

    pub fn close(&self) {
        info!("session {}: close()", self.handle);
        self.actor.send(|state| state.end_session(EndReason::Closed));
    }

    /// Closes the session and stops its actors, waiting at most `timeout`
    /// for the close to run and again for the threads to end. A stuck
    /// background task cannot hang the caller.
    pub fn close_and_stop(&self, timeout: Duration) -> bool {
        info!("session {}: close_and_stop()", self.handle);
        let (done_sender, done_receiver) = std::sync::mpsc::channel();
        self.actor.send(move |state| {
            state.end_session(EndReason::Closed);
            let _ = done_sender.send(());
        });
        if done_receiver.recv_timeout(timeout).is_err() {
            warn!("session {}: close didn't finish in {:?}", self.handle, timeout);
        }
        self.stopper.stop_all_and_join_with_timeout(timeout)
    }

    /// Sends an arbitrary string on the data channel, if it is open.
    pub fn send_data(&self, message: String) {
        self.actor.send(move |state| {
            state.send_on_data_channel(&message);
        });
    }

    pub fn set_peer_mute(&self, id: PeerId, muted: bool) {
        debug!("session {}: set_peer_mute({}, {})", self.handle, id, muted);
        self.actor.send(move |state| state.set_peer_mute(id, muted));
    }

    /// Gain is a percentage in 0..=200; 100 is unity.
    pub fn set_peer_gain(&self, id: PeerId, gain: i32) {
        debug!("session {}: set_peer_gain({}, {})", self.handle, id, gain);
        self.actor.send(move |state| state.set_peer_gain(id, gain));
    }

    pub fn known_peers(&self) -> Vec<Peer> {
        self.registry.known_peers()
    }

    /// Tears down and rebuilds the peer connection. Only one reprovision
    /// runs at a time; a concurrent trigger finds the guard held, logs,
    /// and returns without side effects.
    pub fn reprovision(&self) {
        if self
            .reprovision_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(
                "session {}: reprovision already in progress; ignoring",
                self.handle
            );
            return;
        }
        info!("session {}: reprovision()", self.handle);
        self.actor.send(|state| {
            if !state.closed() {
                state.run_reprovision();
            }
            state.reprovision_guard.store(false, Ordering::Release);
        });
    }
}

impl SessionState {
    fn closed(&self) -> bool {
        matches!(
            self.connection_state,
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    fn set_connection_state(&mut self, new_state: ConnectionState) {
        if self.connection_state != new_state {
            info!(
                "session {}: {} -> {}",
                self.handle, self.connection_state, new_state
            );
            self.connection_state = new_state;
        }
    }

    fn connect(&mut self) {
        if self.connection_state != ConnectionState::Created {
            warn!(
                "session {}: connect() in state {}; ignoring",
                self.handle, self.connection_state
            );
            return;
        }
        if let Err(err) = self.start_connection() {
            warn!("session {}: couldn't start connection: {}", self.handle, err);
            self.enter_failed();
        }
    }

    fn start_connection(&mut self) -> Result<()> {
        self.set_connection_state(ConnectionState::Offering);
        let forwarder = PcForwarder {
            actor: self.actor.clone(),
            epoch: self.pc_epoch,
        };
        let peer_connection = self
            .peer_connection_factory
            .create_peer_connection(Box::new(forwarder))?;
        let offer = peer_connection.create_offer()?;
        let offer = sdp::rewrite_opus_parameters(&offer)?;
        peer_connection.set_local_description(&offer)?;
        self.peer_connection = Some(peer_connection);
        self.set_connection_state(ConnectionState::AwaitingAnswer);

        let request = ProvisionRequest {
            session_type: self.session_type,
            sdp_offer: offer,
            channel: match self.session_type {
                SessionType::MultiAgent => self.channel.clone(),
                SessionType::Local => None,
            },
            parcel_local_id: match self.session_type {
                SessionType::Local => self.world_client.parcel_local_id(),
                SessionType::MultiAgent => None,
            },
        };
        let actor = self.actor.clone();
        let epoch = self.pc_epoch;
        self.provisioning.provision(
            self.region.provision_url.clone(),
            request,
            Box::new(move |result| {
                actor.send(move |state| state.handle_provision_result(epoch, result));
            }),
        );
        self.ensure_tick();
        Ok(())
    }

    fn handle_provision_result(&mut self, epoch: u64, result: Result<ProvisionAnswer>) {
        if self.closed() || epoch != self.pc_epoch {
            debug!("session {}: stale provisioning result", self.handle);
            return;
        }
        match result {
            Ok(answer) => {
                if answer.channel.is_some() {
                    // Server may refresh channel identity and credentials.
                    self.channel = answer.channel.clone();
                }
                self.accept_answer(answer);
            }
            Err(err) => match err.downcast::<VoiceError>() {
                Ok(VoiceError::ProvisioningRejected(reason)) => {
                    warn!(
                        "session {}: channel rejected ({}); clearing credentials",
                        self.handle, reason
                    );
                    self.channel = None;
                    self.enter_failed();
                }
                Ok(VoiceError::InvalidAnswer(reason)) => {
                    error!(
                        "session {}: server broke the answer contract: {}",
                        self.handle, reason
                    );
                    self.end_session(EndReason::InvalidAnswer);
                }
                Ok(err) => {
                    warn!("session {}: provisioning failed: {}", self.handle, err);
                    self.enter_failed();
                }
                Err(err) => {
                    warn!("session {}: provisioning failed: {}", self.handle, err);
                    self.enter_failed();
                }
            },
        }
    }

    fn accept_answer(&mut self, answer: ProvisionAnswer) {
        let sanitized = sdp::drop_zero_port_candidates(&answer.sdp);
        let set_result = match &self.peer_connection {
            Some(peer_connection) => peer_connection.set_remote_description(&sanitized),
            None => return,
        };
        if let Err(err) = set_result {
            error!(
                "session {}: couldn't apply remote answer: {}",
                self.handle, err
            );
            self.end_session(EndReason::InvalidAnswer);
            return;
        }
        self.viewer_session = Some(answer.viewer_session);
        self.set_connection_state(ConnectionState::AnswerReceived);
        // The flag must flip before the flush; draining first would race a
        // candidate send against a session the server hasn't acknowledged.
        self.answer_received = true;
        self.flush_candidates();

        let epoch = self.pc_epoch;
        self.actor
            .send_delayed(self.recovery.connect_watchdog, move |state| {
                state.check_connect_watchdog(epoch)
            });
    }

    fn check_connect_watchdog(&mut self, epoch: u64) {
        if self.closed() || epoch != self.pc_epoch {
            return;
        }
        if !matches!(
            self.connection_state,
            ConnectionState::Connected | ConnectionState::DataChannelOpen
        ) {
            warn!(
                "session {}: not connected within {:?} of provisioning",
                self.handle, self.recovery.connect_watchdog
            );
            self.enter_failed();
        }
    }

    fn ensure_tick(&mut self) {
        if self.tick_running {
            return;
        }
        self.tick_running = true;
        self.actor.send_delayed(TICK_INTERVAL, |state| state.tick());
    }

    fn tick(&mut self) {
        if self.closed() {
            self.tick_running = false;
            return;
        }
        if self.answer_received && !self.trickle_complete_sent {
            self.flush_candidates();
            if self.ice_gathering_complete {
                // Queue was just drained; tell the server we're done.
                self.send_trickle_complete();
                self.trickle_complete_sent = true;
            }
        }
        if self.connection_state == ConnectionState::DataChannelOpen {
            let now = Instant::now();
            if self.position_enabled_at.is_some_and(|at| now >= at)
                && self.next_position_time.map_or(true, |at| now >= at)
            {
                self.sample_and_send_position();
                self.next_position_time = Some(now + POSITION_INTERVAL);
            }
            if self.next_keepalive_time.is_some_and(|at| now >= at) {
                self.send_on_data_channel(&protocol::ping_message());
                self.next_keepalive_time = Some(now + KEEPALIVE_INTERVAL);
            }
        }
        self.actor.send_delayed(TICK_INTERVAL, |state| state.tick());
    }

    fn sample_and_send_position(&mut self) {
        let frame = self.world_client.spatial_frame();
        if let Some(message) = self.position_reporter.report(&frame) {
            self.send_on_data_channel(&message);
        }
    }

    /// The only path by which candidates reach the wire; gated on the
    /// accepted answer and the server-assigned session id.
    fn flush_candidates(&mut self) {
        if !self.answer_received {
            return;
        }
        let viewer_session = match &self.viewer_session {
            Some(viewer_session) => viewer_session.clone(),
            None => return,
        };
        let candidates = self.candidate_queue.drain_all();
        if candidates.is_empty() {
            return;
        }
        debug!(
            "session {}: sending {} ICE candidate(s)",
            self.handle,
            candidates.len()
        );
        let body = provisioning::candidate_batch_body(&viewer_session, &candidates);
        self.post_signaling(&body, "trickle");
    }

    fn send_trickle_complete(&mut self) {
        let viewer_session = match &self.viewer_session {
            Some(viewer_session) => viewer_session.clone(),
            None => return,
        };
        debug!("session {}: ICE gathering complete", self.handle);
        let body = provisioning::trickle_complete_body(&viewer_session);
        self.post_signaling(&body, "trickle complete");
    }

    fn post_signaling(&self, body: &serde_json::Value, what: &'static str) {
        self.http_client.send_request(
            caps::Request::json_post(&self.region.signaling_url, body),
            Box::new(move |response| {
                if response.map(|r| r.status.is_success()) != Some(true) {
                    warn!("{} POST failed", what);
                }
            }),
        );
    }

    fn handle_ice_candidate_gathered(&mut self, epoch: u64, candidate: IceCandidate) {
        if epoch != self.pc_epoch || self.closed() {
            debug!("session {}: dropping stale candidate", self.handle);
            return;
        }
        trace!("session {}: gathered candidate ({})", self.handle, candidate);
        self.candidate_queue.enqueue(candidate);
    }

    fn handle_ice_gathering_state_changed(
        &mut self,
        epoch: u64,
        gathering_state: IceGatheringState,
    ) {
        if epoch != self.pc_epoch || self.closed() {
            return;
        }
        debug!(
            "session {}: ICE gathering {:?}",
            self.handle, gathering_state
        );
        match gathering_state {
            IceGatheringState::Gathering => {
                if self.connection_state == ConnectionState::AnswerReceived {
                    self.set_connection_state(ConnectionState::IceGathering);
                }
            }
            IceGatheringState::Complete => self.ice_gathering_complete = true,
            IceGatheringState::New => {}
        }
    }

    fn handle_connection_state_changed(&mut self, epoch: u64, pc_state: PeerConnectionState) {
        if epoch != self.pc_epoch || self.closed() {
            return;
        }
        debug!("session {}: peer connection {:?}", self.handle, pc_state);
        match pc_state {
            PeerConnectionState::Connected => {
                if self.connection_state != ConnectionState::DataChannelOpen {
                    self.set_connection_state(ConnectionState::Connected);
                }
                if let Err(err) = self.audio_device.start_capture() {
                    warn!("session {}: couldn't start capture: {}", self.handle, err);
                }
                if let Err(err) = self.audio_device.start_playback() {
                    warn!("session {}: couldn't start playback: {}", self.handle, err);
                }
                self.observer.handle_connection_ready(self.handle);
                if self.reprovision_attempts > 0 {
                    self.reprovision_attempts = 0;
                    self.observer.handle_reprovision_succeeded(self.handle);
                }
            }
            PeerConnectionState::Disconnected | PeerConnectionState::Failed => {
                warn!("session {}: connection lost ({:?})", self.handle, pc_state);
                self.enter_failed();
            }
            PeerConnectionState::New
            | PeerConnectionState::Connecting
            | PeerConnectionState::Closed => {}
        }
    }

    fn handle_data_channel_opened(&mut self, epoch: u64) {
        if epoch != self.pc_epoch || self.closed() {
            return;
        }
        self.set_connection_state(ConnectionState::DataChannelOpen);
        if !self.join_sent {
            // Guaranteed first application message on the channel.
            self.send_on_data_channel(&protocol::join_message(self.primary));
            self.join_sent = true;
        }
        let now = Instant::now();
        self.position_enabled_at = Some(now + POSITION_SETTLE_DELAY);
        self.next_position_time = None;
        self.next_keepalive_time = Some(now + KEEPALIVE_INTERVAL);
        self.observer.handle_data_channel_ready(self.handle);
    }

    fn handle_data_channel_closed(&mut self, epoch: u64) {
        if epoch != self.pc_epoch || self.closed() {
            return;
        }
        warn!("session {}: data channel closed", self.handle);
        // The channel is gone but the connection may survive; stop the
        // position and keepalive loops until it reopens.
        if self.connection_state == ConnectionState::DataChannelOpen {
            self.set_connection_state(ConnectionState::Connected);
        }
        self.position_enabled_at = None;
        self.next_position_time = None;
        self.next_keepalive_time = None;
    }

    fn handle_data_channel_message(&mut self, epoch: u64, message: String) {
        if epoch != self.pc_epoch || self.closed() {
            return;
        }
        let registry = self.registry.clone();
        protocol::dispatch(&message, &registry, self);
    }

    fn send_on_data_channel(&mut self, message: &str) -> bool {
        match &self.peer_connection {
            Some(peer_connection) if self.connection_state == ConnectionState::DataChannelOpen => {
                match peer_connection.send_data_channel_message(message) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("session {}: data channel send failed: {}", self.handle, err);
                        false
                    }
                }
            }
            _ => {
                debug!(
                    "session {}: data channel not open; dropping send",
                    self.handle
                );
                false
            }
        }
    }

    fn set_peer_mute(&mut self, id: PeerId, muted: bool) {
        self.send_on_data_channel(&protocol::mute_message(id, muted));
        if let Some(ssrc) = self.registry.ssrc_of(id) {
            if let Err(err) = self.audio_device.set_source_muted(ssrc, muted) {
                warn!("session {}: couldn't mute source {}: {}", self.handle, ssrc, err);
            }
        }
    }

    fn set_peer_gain(&mut self, id: PeerId, gain: i32) {
        let gain = gain.clamp(0, 200);
        self.send_on_data_channel(&protocol::gain_message(id, gain));
        if let Some(ssrc) = self.registry.ssrc_of(id) {
            if let Err(err) = self
                .audio_device
                .set_source_gain(ssrc, gain as f32 / 100.0)
            {
                warn!("session {}: couldn't set gain on {}: {}", self.handle, ssrc, err);
            }
        }
    }

    fn enter_failed(&mut self) {
        if self.closed() {
            return;
        }
        if self.connection_state == ConnectionState::Failed {
            // A recovery attempt is already scheduled.
            return;
        }
        self.set_connection_state(ConnectionState::Failed);
        self.observer.handle_connection_closed(self.handle);
        self.reprovision_attempts += 1;
        if self.reprovision_attempts > self.recovery.max_attempts {
            error!(
                "session {}: giving up after {} reprovision attempts",
                self.handle, self.recovery.max_attempts
            );
            self.observer.handle_reprovision_failed(self.handle);
            self.end_session(EndReason::ReprovisionFailed);
            return;
        }
        let delay = self.recovery.delay_for_attempt(self.reprovision_attempts);
        warn!(
            "session {}: reprovisioning in {:?} (attempt {}/{})",
            self.handle, delay, self.reprovision_attempts, self.recovery.max_attempts
        );
        self.actor
            .send_delayed(delay, |state| state.try_scheduled_reprovision());
    }

    fn try_scheduled_reprovision(&mut self) {
        if self.closed() {
            return;
        }
        if self
            .reprovision_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(
                "session {}: reprovision already running; skipping scheduled attempt",
                self.handle
            );
            return;
        }
        self.run_reprovision();
        self.reprovision_guard.store(false, Ordering::Release);
    }

    /// Tears the connection down and starts over: new peer connection, new
    /// offer, new provisioning run. Channel identity is preserved unless a
    /// rejection already cleared it. Caller holds the reprovision guard.
    fn run_reprovision(&mut self) {
        info!("session {}: reprovisioning", self.handle);
        self.audio_device.stop_capture();
        self.audio_device.stop_playback();
        self.registry.clear_all();
        if let Some(peer_connection) = self.peer_connection.take() {
            peer_connection.close();
        }
        self.pc_epoch += 1;
        self.answer_received = false;
        self.viewer_session = None;
        self.ice_gathering_complete = false;
        self.trickle_complete_sent = false;
        self.join_sent = false;
        self.position_enabled_at = None;
        self.next_position_time = None;
        self.next_keepalive_time = None;
        self.position_reporter = PositionReporter::default();
        // Candidates gathered by the old connection are useless now.
        self.candidate_queue.drain_all();
        self.set_connection_state(ConnectionState::Created);
        if let Err(err) = self.start_connection() {
            warn!(
                "session {}: reprovision couldn't start connection: {}",
                self.handle, err
            );
            self.enter_failed();
        }
    }

    fn end_session(&mut self, reason: EndReason) {
        if self.closed() {
            debug!("session {}: already closed", self.handle);
            return;
        }
        info!("session {}: ending ({})", self.handle, reason);
        let data_channel_was_open = self.connection_state == ConnectionState::DataChannelOpen;
        self.set_connection_state(ConnectionState::Closing);
        self.audio_device.stop_capture();
        self.audio_device.stop_playback();
        self.registry.clear_all();
        self.candidate_queue.drain_all();
        if let Some(peer_connection) = self.peer_connection.take() {
            if data_channel_was_open {
                let _ = peer_connection.send_data_channel_message(&protocol::leave_message());
            }
            peer_connection.close();
        }
        if let Some(viewer_session) = &self.viewer_session {
            // Best effort; the server also times sessions out.
            let body = provisioning::logout_body(viewer_session);
            self.post_signaling(&body, "logout");
        }
        self.observer.handle_session_ended(self.handle, reason);
        self.set_connection_state(ConnectionState::Closed);
    }
}

impl ProtocolEvents for SessionState {
    fn handle_peer_joined(&mut self, id: PeerId) {
        self.observer.handle_peer_joined(self.handle, id);
    }

    fn handle_peer_left(&mut self, id: PeerId) {
        self.observer.handle_peer_left(self.handle, id);
    }

    fn handle_peer_audio_updated(&mut self, id: PeerId, audio: PeerAudioState) {
        self.observer.handle_peer_audio_updated(self.handle, id, audio);
    }

    fn handle_peer_position_updated(
        &mut self,
        id: PeerId,
        sender: Option<QuantizedTransform>,
        listener: Option<QuantizedTransform>,
    ) {
        self.observer
            .handle_peer_position_updated(self.handle, id, sender, listener);
    }

    fn handle_peer_list_updated(&mut self, ids: &[PeerId]) {
        self.observer.handle_peer_list_updated(self.handle, ids.to_vec());
    }

    fn handle_mute_map(&mut self, entries: &[(PeerId, bool)]) {
        self.observer
            .handle_mute_map_received(self.handle, entries.to_vec());
    }

    fn handle_gain_map(&mut self, entries: &[(PeerId, i32)]) {
        self.observer
            .handle_gain_map_received(self.handle, entries.to_vec());
    }

    fn handle_ping(&mut self) {
        self.send_on_data_channel(&protocol::pong_message());
    }
}
