//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Orchestrates the primary voice session and the adjacent-region ones.
//!
//! The primary session follows the avatar's current region; adjacent
//! sessions are keyed by region handle and reconciled every few seconds
//! against the set of simulators the client is connected to. Region
//! transitions are serialized by a non-blocking guard: a duplicate signal
//! arriving mid-transition is dropped, not queued.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::channel,
    Arc,
};
use std::time::Duration;

use crate::common::actor::{Actor, Stopper};
use crate::common::{ChannelInfo, RegionHandle, Result, SessionHandle, SessionType};
use crate::core::provisioning::RetryPolicy;
use crate::core::session::{Collaborators, RecoveryPolicy, SessionConfig, VoiceSession};
use crate::core::world::RegionInfo;

const ADJACENT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);
/// Bound on waiting for one session's teardown.
const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// One session the manager tracks, with its own cancellation scope so it
/// can be torn down without touching the others.
struct RegionVoiceSession {
    region_handle: RegionHandle,
    session: VoiceSession,
}

/// Diagnostic snapshot of what the manager is running.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagerStatus {
    pub primary_region: Option<RegionHandle>,
    pub adjacent_regions: Vec<RegionHandle>,
    pub multi_agent_channel: Option<String>,
}

struct ManagerState {
    actor: Actor<ManagerState>,
    collaborators: Collaborators,
    retry_policy: RetryPolicy,
    next_handle: SessionHandle,
    primary: Option<RegionVoiceSession>,
    adjacent: HashMap<RegionHandle, RegionVoiceSession>,
    /// The multi-agent channel the avatar is in, if any. Preserved across
    /// a region change whose parcel reports no channel, for continuity.
    active_channel: Option<ChannelInfo>,
    transition_guard: Arc<AtomicBool>,
    closed: bool,
}

pub struct SessionManager {
    actor: Actor<ManagerState>,
    stopper: Stopper,
    transition_guard: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn start(collaborators: Collaborators, retry_policy: RetryPolicy) -> Result<Self> {
        info!("session manager: starting");
        let stopper = Stopper::new();
        let transition_guard = Arc::new(AtomicBool::new(false));
        let guard_for_state = transition_guard.clone();
        let actor = Actor::start("session_manager", stopper.clone(), move |actor| {
            Ok(ManagerState {
                actor,
                collaborators,
                retry_policy,
                next_handle: 1,
                primary: None,
                adjacent: HashMap::new(),
                active_channel: None,
                transition_guard: guard_for_state,
                closed: false,
            })
        })?;
        actor.send_delayed(ADJACENT_RECONCILE_INTERVAL, |state| {
            state.reconcile_adjacent()
        });
        Ok(Self {
            actor,
            stopper,
            transition_guard,
        })
    }

    /// The avatar moved to a new region: tear the primary session down and
    /// provision a new one there. A signal arriving while a transition is
    /// already running is dropped.
    pub fn handle_region_changed(&self) {
        if self
            .transition_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("session manager: region transition in progress; dropping duplicate signal");
            return;
        }
        info!("session manager: handle_region_changed()");
        self.actor.send(|state| {
            state.region_changed();
            state.transition_guard.store(false, Ordering::Release);
        });
    }

    /// The avatar joined (or left) a multi-agent channel; the primary
    /// session is rebuilt for it.
    pub fn set_multi_agent_channel(&self, channel: Option<ChannelInfo>) {
        info!(
            "session manager: set_multi_agent_channel(present: {})",
            channel.is_some()
        );
        self.actor.send(move |state| {
            if state.closed {
                return;
            }
            state.active_channel = channel;
            state.rebuild_primary();
        });
    }

    pub fn status(&self) -> ManagerStatus {
        let (sender, receiver) = channel();
        self.actor.send(move |state| {
            let mut adjacent_regions: Vec<RegionHandle> = state.adjacent.keys().copied().collect();
            adjacent_regions.sort_unstable();
            let _ = sender.send(ManagerStatus {
                primary_region: state.primary.as_ref().map(|p| p.region_handle),
                adjacent_regions,
                multi_agent_channel: state.active_channel.as_ref().map(|c| c.id.clone()),
            });
        });
        receiver
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_default()
    }

    /// Tears everything down with bounded joins.
    pub fn close_all(&self) {
        info!("session manager: close_all()");
        let (done_sender, done_receiver) = channel();
        self.actor.send(move |state| {
            state.close_all();
            let _ = done_sender.send(());
        });
        if done_receiver.recv_timeout(Duration::from_secs(30)).is_err() {
            warn!("session manager: close_all didn't finish in time");
        }
        self.stopper
            .stop_all_and_join_with_timeout(SESSION_STOP_TIMEOUT);
    }
}

impl ManagerState {
    fn region_changed(&mut self) {
        if self.closed {
            return;
        }
        match self.collaborators.world_client.parcel_voice_channel() {
            Some(channel) => self.active_channel = Some(channel),
            None => {
                if self.active_channel.is_some() {
                    // Dropping to local voice here would silently kick the
                    // avatar out of their conference.
                    info!("session manager: parcel has no channel; keeping the previous one");
                }
            }
        }
        self.rebuild_primary();
    }

    fn rebuild_primary(&mut self) {
        let region = match self.collaborators.world_client.current_region() {
            Some(region) => region,
            None => {
                warn!("session manager: no current region; tearing down primary");
                if let Some(previous) = self.primary.take() {
                    teardown(previous);
                }
                return;
            }
        };
        if let Some(previous) = self.primary.take() {
            teardown(previous);
        }
        let (session_type, channel) = match &self.active_channel {
            Some(channel) => (SessionType::MultiAgent, Some(channel.clone())),
            None => (SessionType::Local, None),
        };
        match self.start_session(region, session_type, channel, true) {
            Ok(region_session) => self.primary = Some(region_session),
            Err(err) => error!("session manager: couldn't start primary session: {}", err),
        }
    }

    fn start_session(
        &mut self,
        region: RegionInfo,
        session_type: SessionType,
        channel: Option<ChannelInfo>,
        primary: bool,
    ) -> Result<RegionVoiceSession> {
        let handle = self.next_handle;
        self.next_handle += 1;
        let session = VoiceSession::start(
            SessionConfig {
                handle,
                session_type,
                region: region.clone(),
                channel,
                primary,
                retry_policy: self.retry_policy,
                recovery: RecoveryPolicy::default(),
            },
            self.collaborators.clone(),
            Stopper::new(),
        )?;
        session.connect();
        Ok(RegionVoiceSession {
            region_handle: region.handle,
            session,
        })
    }

    /// Reconciles the adjacent-session set against the currently-connected
    /// simulator list; reschedules itself.
    fn reconcile_adjacent(&mut self) {
        if self.closed {
            return;
        }
        let current = self
            .collaborators
            .world_client
            .current_region()
            .map(|region| region.handle);
        let wanted: HashMap<RegionHandle, RegionInfo> = self
            .collaborators
            .world_client
            .connected_regions()
            .into_iter()
            .filter(|region| Some(region.handle) != current)
            .map(|region| (region.handle, region))
            .collect();

        let stale: Vec<RegionHandle> = self
            .adjacent
            .keys()
            .filter(|handle| !wanted.contains_key(handle))
            .copied()
            .collect();
        for handle in stale {
            if let Some(region_session) = self.adjacent.remove(&handle) {
                info!(
                    "session manager: region {:#x} no longer adjacent; tearing down",
                    handle
                );
                teardown(region_session);
            }
        }

        for (handle, region) in wanted {
            if self.adjacent.contains_key(&handle) {
                continue;
            }
            info!("session manager: provisioning adjacent region {:#x}", handle);
            match self.start_session(region, SessionType::Local, None, false) {
                Ok(region_session) => {
                    self.adjacent.insert(handle, region_session);
                }
                Err(err) => {
                    warn!(
                        "session manager: couldn't start adjacent session for {:#x}: {}",
                        handle, err
                    );
                }
            }
        }

        self.actor.send_delayed(ADJACENT_RECONCILE_INTERVAL, |state| {
            state.reconcile_adjacent()
        });
    }

    fn close_all(&mut self) {
        self.closed = true;
        if let Some(primary) = self.primary.take() {
            teardown(primary);
        }
        for (_, region_session) in self.adjacent.drain() {
            teardown(region_session);
        }
    }
}

fn teardown(region_session: RegionVoiceSession) {
    if !region_session
        .session
        .close_and_stop(SESSION_STOP_TIMEOUT)
    {
        warn!(
            "session {} for region {:#x} didn't stop cleanly",
            region_session.session.handle(),
            region_session.region_handle
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::sim::{
        FakeAudioDevice, FakeCapsClient, FakePeerConnectionFactory, FakeSessionObserver,
        FakeWorldClient,
    };

    struct Harness {
        caps: Arc<FakeCapsClient>,
        factory: Arc<FakePeerConnectionFactory>,
        world: Arc<FakeWorldClient>,
        manager: SessionManager,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.manager.close_all();
        }
    }

    fn region(handle: RegionHandle) -> RegionInfo {
        RegionInfo {
            handle,
            provision_url: format!("https://sim{handle}.example/caps/provision"),
            signaling_url: format!("https://sim{handle}.example/caps/signal"),
        }
    }

    fn harness() -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let caps = Arc::new(FakeCapsClient::default());
        caps.set_manual(true);
        let factory = Arc::new(FakePeerConnectionFactory::default());
        let world = Arc::new(FakeWorldClient::default());
        world.set_current_region(Some(region(0xA)));
        world.set_connected_regions(vec![region(0xA)]);
        let manager = SessionManager::start(
            Collaborators {
                http_client: caps.clone(),
                peer_connection_factory: factory.clone(),
                audio_device: Arc::new(FakeAudioDevice::default()),
                world_client: world.clone(),
                observer: Arc::new(FakeSessionObserver::default()),
            },
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        )
        .unwrap();
        Harness {
            caps,
            factory,
            world,
            manager,
        }
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn region_change_builds_a_local_primary() {
        let h = harness();
        h.manager.handle_region_changed();
        assert!(wait_until(Duration::from_secs(2), || {
            h.factory.created_count() == 1
        }));
        let status = h.manager.status();
        assert_eq!(Some(0xA), status.primary_region);
        assert_eq!(None, status.multi_agent_channel);
        assert!(wait_until(Duration::from_secs(2), || {
            h.caps.request_count() == 1
        }));
    }

    #[test]
    fn duplicate_transition_signal_is_dropped() {
        let h = harness();
        // Keep the actor busy so the first transition can't finish before
        // the duplicate arrives.
        let (busy_sender, busy_receiver) = channel::<()>();
        h.manager.actor.send(move |_state| {
            let _ = busy_receiver.recv_timeout(Duration::from_millis(300));
        });
        h.manager.handle_region_changed();
        h.manager.handle_region_changed();
        drop(busy_sender);

        assert!(wait_until(Duration::from_secs(2), || {
            h.factory.created_count() == 1
        }));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(1, h.factory.created_count());
    }

    #[test]
    fn channel_survives_a_region_change_without_parcel_channel() {
        let h = harness();
        h.world
            .set_parcel_voice_channel(Some(ChannelInfo::new("group-1", None)));
        h.manager.handle_region_changed();
        assert!(wait_until(Duration::from_secs(2), || {
            h.manager.status().multi_agent_channel == Some("group-1".to_string())
        }));

        // Move to a region whose parcel reports no channel.
        h.world.set_current_region(Some(region(0xB)));
        h.world.set_parcel_voice_channel(None);
        h.manager.handle_region_changed();
        assert!(wait_until(Duration::from_secs(2), || {
            h.manager.status().primary_region == Some(0xB)
        }));
        assert_eq!(
            Some("group-1".to_string()),
            h.manager.status().multi_agent_channel
        );
        // Both provisioning requests carried the channel.
        assert!(wait_until(Duration::from_secs(2), || {
            h.caps.request_count() >= 2
        }));
        for request in h.caps.requests() {
            let body: serde_json::Value =
                serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
            if body.get("channel_type").is_some() {
                assert_eq!("group-1", body["channel"]);
            }
        }
    }

    #[test]
    fn leaving_the_channel_drops_back_to_local() {
        let h = harness();
        h.manager
            .set_multi_agent_channel(Some(ChannelInfo::new("group-1", None)));
        assert!(wait_until(Duration::from_secs(2), || {
            h.manager.status().multi_agent_channel.is_some()
        }));
        h.manager.set_multi_agent_channel(None);
        assert!(wait_until(Duration::from_secs(2), || {
            h.manager.status().multi_agent_channel.is_none()
        }));
        // A fresh primary was built for each change; the second session's
        // connect is posted to its actor, so wait for it.
        assert!(wait_until(Duration::from_secs(2), || {
            h.factory.created_count() == 2
        }));
    }

    #[test]
    fn adjacent_sessions_follow_the_connected_region_set() {
        let h = harness();
        h.manager.handle_region_changed();
        assert!(wait_until(Duration::from_secs(2), || {
            h.manager.status().primary_region == Some(0xA)
        }));

        h.world
            .set_connected_regions(vec![region(0xA), region(0xB), region(0xC)]);
        h.manager.actor.send(|state| state.reconcile_adjacent());
        assert!(wait_until(Duration::from_secs(2), || {
            h.manager.status().adjacent_regions == vec![0xB, 0xC]
        }));

        // A neighbor goes away; its session is torn down.
        h.world
            .set_connected_regions(vec![region(0xA), region(0xC)]);
        h.manager.actor.send(|state| state.reconcile_adjacent());
        assert!(wait_until(Duration::from_secs(2), || {
            h.manager.status().adjacent_regions == vec![0xC]
        }));
        // The primary is untouched.
        assert_eq!(Some(0xA), h.manager.status().primary_region);
    }

    #[test]
    fn close_all_is_idempotent() {
        let h = harness();
        h.manager.handle_region_changed();
        assert!(wait_until(Duration::from_secs(2), || {
            h.manager.status().primary_region.is_some()
        }));
        h.manager.close_all();
        h.manager.close_all();
    }
}
