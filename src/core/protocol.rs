//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The JSON protocol spoken over the voice data channel.
//!
//! Keys are short codes to keep frames small. Two inbound shapes exist:
//! a per-peer update map whose top-level keys are all peer ids, and a
//! generic control message (`j`, `l`, `sp`/`sh`, `lp`/`lh`, `m`, `ug`,
//! `av`/`a`, `ping`/`pong`). Parsing is best-effort field by field; a
//! malformed field is skipped, never fatal, and unknown keys are ignored.
//!
//! Spatial values are carried as integers in a x100 fixed-point encoding
//! (centimeters for positions). Floats never appear in spatial wire fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::peer_registry::{PeerAudioState, PeerId, PeerRegistry};
use crate::core::world::{Quaternion, SpatialFrame, Vec3};
use crate::webrtc::peer_connection::Ssrc;

/// Position in x100 fixed point (integer centimeters).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizedVector {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// Heading as a unit quaternion with components x100.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizedRotation {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub w: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuantizedTransform {
    pub position: QuantizedVector,
    pub heading: QuantizedRotation,
}

/// The one quantization rule for the whole wire protocol: widen to f64,
/// scale by 100, round half away from zero. The server compares payloads
/// textually, so the rule must be bit-exact across every call site.
pub fn quantize(value: f32) -> i32 {
    (f64::from(value) * 100.0).round() as i32
}

pub fn quantize_vector(v: &Vec3) -> QuantizedVector {
    QuantizedVector {
        x: quantize(v.x),
        y: quantize(v.y),
        z: quantize(v.z),
    }
}

pub fn quantize_rotation(q: &Quaternion) -> QuantizedRotation {
    QuantizedRotation {
        x: quantize(q.x),
        y: quantize(q.y),
        z: quantize(q.z),
        w: quantize(q.w),
    }
}

/// Quantizes a sampled frame into the (sender, listener) transform pair the
/// position message carries.
pub fn quantize_frame(frame: &SpatialFrame) -> (QuantizedTransform, QuantizedTransform) {
    (
        QuantizedTransform {
            position: quantize_vector(&frame.sender_position),
            heading: quantize_rotation(&frame.sender_heading),
        },
        QuantizedTransform {
            position: quantize_vector(&frame.listener_position),
            heading: quantize_rotation(&frame.listener_heading),
        },
    )
}

/// One peer's entry in a per-peer update map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    pub power: Option<i32>,
    pub voice_active: Option<bool>,
    pub ssrc: Option<Ssrc>,
    /// Join marker; the value is the "joined primary" flag.
    pub joined: Option<bool>,
    pub left: bool,
    pub sender_transform: Option<QuantizedTransform>,
    pub listener_transform: Option<QuantizedTransform>,
}

/// A generic (non-per-peer) control message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlMessage {
    pub join: bool,
    pub leave: bool,
    pub sender_transform: Option<QuantizedTransform>,
    pub listener_transform: Option<QuantizedTransform>,
    pub mute_map: Vec<(PeerId, bool)>,
    pub gain_map: Vec<(PeerId, i32)>,
    /// Authoritative full peer list, from `av` or `a`.
    pub snapshot: Option<Vec<PeerId>>,
    pub ping: bool,
    pub pong: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    PeerUpdates(Vec<(PeerId, PeerUpdate)>),
    Control(ControlMessage),
}

/// Events raised while applying inbound frames to the registry.
/// Implementations hand off to the application observer; on `handle_ping`
/// they reply with a pong on the same channel.
pub trait ProtocolEvents {
    fn handle_peer_joined(&mut self, id: PeerId);
    fn handle_peer_left(&mut self, id: PeerId);
    fn handle_peer_audio_updated(&mut self, id: PeerId, audio: PeerAudioState);
    fn handle_peer_position_updated(
        &mut self,
        id: PeerId,
        sender: Option<QuantizedTransform>,
        listener: Option<QuantizedTransform>,
    );
    fn handle_peer_list_updated(&mut self, ids: &[PeerId]);
    fn handle_mute_map(&mut self, entries: &[(PeerId, bool)]);
    fn handle_gain_map(&mut self, entries: &[(PeerId, i32)]);
    fn handle_ping(&mut self);
}

fn parse_i32(value: &Value) -> Option<i32> {
    value.as_i64().and_then(|n| i32::try_from(n).ok())
}

fn parse_vector(value: &Value) -> Option<QuantizedVector> {
    Some(QuantizedVector {
        x: parse_i32(value.get("x")?)?,
        y: parse_i32(value.get("y")?)?,
        z: parse_i32(value.get("z")?)?,
    })
}

fn parse_rotation(value: &Value) -> Option<QuantizedRotation> {
    Some(QuantizedRotation {
        x: parse_i32(value.get("x")?)?,
        y: parse_i32(value.get("y")?)?,
        z: parse_i32(value.get("z")?)?,
        w: parse_i32(value.get("w")?)?,
    })
}

fn parse_transform(position: Option<&Value>, heading: Option<&Value>) -> Option<QuantizedTransform> {
    let position = position.and_then(parse_vector);
    let heading = heading.and_then(parse_rotation);
    if position.is_none() && heading.is_none() {
        return None;
    }
    Some(QuantizedTransform {
        position: position.unwrap_or_default(),
        heading: heading.unwrap_or_default(),
    })
}

fn parse_peer_update(value: &Value) -> PeerUpdate {
    let mut update = PeerUpdate::default();
    let object = match value.as_object() {
        Some(object) => object,
        None => return update,
    };
    for (key, value) in object {
        match key.as_str() {
            "p" => update.power = parse_i32(value),
            // Both spellings occur in the wild.
            "v" | "V" => update.voice_active = value.as_bool(),
            "s" | "ssrc" => update.ssrc = value.as_u64().and_then(|n| u32::try_from(n).ok()),
            "j" => {
                update.joined = Some(
                    value
                        .get("p")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                )
            }
            "l" => update.left = value.as_bool().unwrap_or(false),
            "sp" | "sh" | "lp" | "lh" => {}
            _ => trace!("ignoring unknown peer update key {:?}", key),
        }
    }
    update.sender_transform = parse_transform(object.get("sp"), object.get("sh"));
    update.listener_transform = parse_transform(object.get("lp"), object.get("lh"));
    update
}

fn parse_control(object: &serde_json::Map<String, Value>) -> ControlMessage {
    let mut control = ControlMessage::default();
    for (key, value) in object {
        match key.as_str() {
            "j" => control.join = true,
            "l" => control.leave = value.as_bool().unwrap_or(true),
            "ping" => control.ping = value.as_bool().unwrap_or(false),
            "pong" => control.pong = value.as_bool().unwrap_or(false),
            "m" => {
                if let Some(map) = value.as_object() {
                    for (peer, muted) in map {
                        match (Uuid::parse_str(peer), muted.as_bool()) {
                            (Ok(id), Some(muted)) => control.mute_map.push((id, muted)),
                            _ => debug!("skipping malformed mute entry"),
                        }
                    }
                }
            }
            "ug" => {
                if let Some(map) = value.as_object() {
                    for (peer, gain) in map {
                        match (Uuid::parse_str(peer), parse_i32(gain)) {
                            (Ok(id), Some(gain)) => control.gain_map.push((id, gain)),
                            _ => debug!("skipping malformed gain entry"),
                        }
                    }
                }
            }
            "av" => {
                if let Some(ids) = value.as_array() {
                    control.snapshot = Some(
                        ids.iter()
                            .filter_map(|id| id.as_str())
                            .filter_map(|id| Uuid::parse_str(id).ok())
                            .collect(),
                    );
                }
            }
            "a" => {
                if let Some(map) = value.as_object() {
                    // An empty-object or empty-string value marks that
                    // peer's removal; everyone else is present.
                    control.snapshot = Some(
                        map.iter()
                            .filter(|(_, value)| !is_removal_marker(value))
                            .filter_map(|(id, _)| Uuid::parse_str(id).ok())
                            .collect(),
                    );
                }
            }
            "sp" | "sh" | "lp" | "lh" => {}
            _ => trace!("ignoring unknown control key {:?}", key),
        }
    }
    control.sender_transform = parse_transform(object.get("sp"), object.get("sh"));
    control.listener_transform = parse_transform(object.get("lp"), object.get("lh"));
    control
}

fn is_removal_marker(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Parses one inbound text frame. None when the frame isn't a JSON object
/// at all; such frames are logged and dropped by the caller.
///
/// Shape detection: if every top-level key of a non-empty object parses as
/// a peer id, the frame is a per-peer update map. This is a heuristic, not
/// a type tag in the protocol; a control message whose only keys happened
/// to be valid uuids would be misclassified. The servers never emit such a
/// message today, and changing the rule would break wire compatibility, so
/// it stays.
pub fn parse(message: &str) -> Option<Inbound> {
    let value: Value = match serde_json::from_str(message) {
        Ok(value) => value,
        Err(err) => {
            debug!("dropping unparseable data channel frame: {}", err);
            return None;
        }
    };
    let object = value.as_object()?;
    let all_keys_are_peer_ids =
        !object.is_empty() && object.keys().all(|key| Uuid::parse_str(key).is_ok());
    if all_keys_are_peer_ids {
        Some(Inbound::PeerUpdates(
            object
                .iter()
                .filter_map(|(key, value)| {
                    Uuid::parse_str(key).ok().map(|id| (id, parse_peer_update(value)))
                })
                .collect(),
        ))
    } else {
        Some(Inbound::Control(parse_control(object)))
    }
}

/// Applies one inbound frame to the registry and raises the corresponding
/// events. Runs to completion before the caller dequeues the next frame,
/// so a snapshot reconciliation is never interleaved with other mutations.
pub fn dispatch(message: &str, registry: &PeerRegistry, events: &mut dyn ProtocolEvents) {
    let inbound = match parse(message) {
        Some(inbound) => inbound,
        None => return,
    };
    match inbound {
        Inbound::PeerUpdates(updates) => {
            for (id, update) in updates {
                apply_peer_update(id, &update, registry, events);
            }
        }
        Inbound::Control(control) => apply_control(&control, registry, events),
    }
}

fn apply_peer_update(
    id: PeerId,
    update: &PeerUpdate,
    registry: &PeerRegistry,
    events: &mut dyn ProtocolEvents,
) {
    if update.left {
        if registry.remove_peer(id) {
            events.handle_peer_left(id);
        }
        return;
    }
    if registry.upsert_peer(id) {
        events.handle_peer_joined(id);
    }
    if let Some(ssrc) = update.ssrc {
        registry.bind_ssrc(id, ssrc);
    }
    if update.power.is_some() || update.voice_active.is_some() || update.joined.is_some() {
        let audio = registry.update_audio(id, |audio| {
            if let Some(power) = update.power {
                audio.power = power;
            }
            if let Some(voice_active) = update.voice_active {
                audio.voice_active = voice_active;
            }
            if let Some(primary) = update.joined {
                audio.joined_primary = primary;
            }
        });
        if let Some(audio) = audio {
            events.handle_peer_audio_updated(id, audio);
        }
    }
    if update.sender_transform.is_some() || update.listener_transform.is_some() {
        registry.update_transforms(id, update.sender_transform, update.listener_transform);
        events.handle_peer_position_updated(id, update.sender_transform, update.listener_transform);
    }
}

fn apply_control(
    control: &ControlMessage,
    registry: &PeerRegistry,
    events: &mut dyn ProtocolEvents,
) {
    if control.ping {
        events.handle_ping();
    }
    if let Some(ids) = &control.snapshot {
        let delta = registry.reconcile_snapshot(ids);
        for id in &delta.joined {
            events.handle_peer_joined(*id);
        }
        for id in &delta.left {
            events.handle_peer_left(*id);
        }
        events.handle_peer_list_updated(ids);
    }
    if !control.mute_map.is_empty() {
        events.handle_mute_map(&control.mute_map);
    }
    if !control.gain_map.is_empty() {
        events.handle_gain_map(&control.gain_map);
    }
    // Sender-less join/leave/position frames are the client's own outbound
    // format; the servers key remote state by peer. Log and move on.
    if control.join || control.leave {
        debug!(
            "ignoring generic join/leave frame (join: {}, leave: {})",
            control.join, control.leave
        );
    }
    if control.sender_transform.is_some() || control.listener_transform.is_some() {
        debug!("ignoring generic position frame");
    }
}

fn vector_value(v: &QuantizedVector) -> Value {
    serde_json::json!({"x": v.x, "y": v.y, "z": v.z})
}

fn rotation_value(q: &QuantizedRotation) -> Value {
    serde_json::json!({"x": q.x, "y": q.y, "z": q.z, "w": q.w})
}

pub fn join_message(primary: bool) -> String {
    serde_json::json!({"j": {"p": primary}}).to_string()
}

pub fn leave_message() -> String {
    serde_json::json!({"l": true}).to_string()
}

pub fn position_message(sender: &QuantizedTransform, listener: &QuantizedTransform) -> String {
    serde_json::json!({
        "sp": vector_value(&sender.position),
        "sh": rotation_value(&sender.heading),
        "lp": vector_value(&listener.position),
        "lh": rotation_value(&listener.heading),
    })
    .to_string()
}

pub fn mute_message(id: PeerId, muted: bool) -> String {
    serde_json::json!({ "m": { (id.to_string()): muted } }).to_string()
}

/// Gain is a percentage, clamped to the protocol's 0..=200 range.
pub fn gain_message(id: PeerId, gain: i32) -> String {
    serde_json::json!({ "ug": { (id.to_string()): gain.clamp(0, 200) } }).to_string()
}

pub fn ping_message() -> String {
    serde_json::json!({"ping": true}).to_string()
}

pub fn pong_message() -> String {
    serde_json::json!({"pong": true}).to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sim::FakeAudioDevice;

    fn id(n: u128) -> PeerId {
        Uuid::from_u128(n)
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Arc::new(FakeAudioDevice::default()))
    }

    #[derive(Default)]
    struct RecordingEvents {
        joined: Vec<PeerId>,
        left: Vec<PeerId>,
        audio: Vec<(PeerId, PeerAudioState)>,
        positions: Vec<PeerId>,
        peer_lists: Vec<Vec<PeerId>>,
        mute_maps: Vec<Vec<(PeerId, bool)>>,
        gain_maps: Vec<Vec<(PeerId, i32)>>,
        pings: u32,
    }

    impl ProtocolEvents for RecordingEvents {
        fn handle_peer_joined(&mut self, id: PeerId) {
            self.joined.push(id);
        }
        fn handle_peer_left(&mut self, id: PeerId) {
            self.left.push(id);
        }
        fn handle_peer_audio_updated(&mut self, id: PeerId, audio: PeerAudioState) {
            self.audio.push((id, audio));
        }
        fn handle_peer_position_updated(
            &mut self,
            id: PeerId,
            _sender: Option<QuantizedTransform>,
            _listener: Option<QuantizedTransform>,
        ) {
            self.positions.push(id);
        }
        fn handle_peer_list_updated(&mut self, ids: &[PeerId]) {
            self.peer_lists.push(ids.to_vec());
        }
        fn handle_mute_map(&mut self, entries: &[(PeerId, bool)]) {
            self.mute_maps.push(entries.to_vec());
        }
        fn handle_gain_map(&mut self, entries: &[(PeerId, i32)]) {
            self.gain_maps.push(entries.to_vec());
        }
        fn handle_ping(&mut self) {
            self.pings += 1;
        }
    }

    #[test]
    fn quantization_rounds_half_away_from_zero() {
        // 112.5 is exactly representable; the half must go away from zero.
        assert_eq!(113, quantize(1.125));
        assert_eq!(-113, quantize(-1.125));
        assert_eq!(-200, quantize(-2.0));
        assert_eq!(0, quantize(0.0));
        // 1.005f32 is just below the half after widening.
        assert_eq!(100, quantize(1.005));
    }

    #[test]
    fn position_message_carries_only_integers() {
        let frame = SpatialFrame {
            sender_position: Vec3::new(1.005, -2.0, 0.0),
            sender_heading: Quaternion::default(),
            listener_position: Vec3::new(0.5, 0.5, 0.5),
            listener_heading: Quaternion::default(),
        };
        let (sender, listener) = quantize_frame(&frame);
        let message = position_message(&sender, &listener);
        let value: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(Some(100), value["sp"]["x"].as_i64().map(|n| n as i32));
        assert_eq!(Some(-200), value["sp"]["y"].as_i64().map(|n| n as i32));
        assert_eq!(Some(0), value["sp"]["z"].as_i64().map(|n| n as i32));
        assert_eq!(Some(100), value["sh"]["w"].as_i64().map(|n| n as i32));
        assert_eq!(Some(50), value["lp"]["x"].as_i64().map(|n| n as i32));
        // No float sneaks onto the wire.
        assert!(!message.contains('.'));
    }

    #[test]
    fn detects_per_peer_update_map() {
        let message = format!(r#"{{"{}": {{"p": 42, "v": true}}}}"#, id(1));
        match parse(&message) {
            Some(Inbound::PeerUpdates(updates)) => {
                assert_eq!(1, updates.len());
                assert_eq!(id(1), updates[0].0);
                assert_eq!(Some(42), updates[0].1.power);
                assert_eq!(Some(true), updates[0].1.voice_active);
            }
            other => panic!("wrong shape: {:?}", other),
        }
    }

    #[test]
    fn non_uuid_key_means_control_message() {
        match parse(r#"{"ping": true}"#) {
            Some(Inbound::Control(control)) => assert!(control.ping),
            other => panic!("wrong shape: {:?}", other),
        }
        // Empty objects are control no-ops, not empty update maps.
        assert_eq!(
            Some(Inbound::Control(ControlMessage::default())),
            parse("{}")
        );
    }

    #[test]
    fn malformed_fields_are_skipped_not_fatal() {
        let message = format!(
            r#"{{"{}": {{"p": "not a number", "ssrc": 7, "V": true}}}}"#,
            id(1)
        );
        match parse(&message) {
            Some(Inbound::PeerUpdates(updates)) => {
                assert_eq!(None, updates[0].1.power);
                assert_eq!(Some(7), updates[0].1.ssrc);
                assert_eq!(Some(true), updates[0].1.voice_active);
            }
            other => panic!("wrong shape: {:?}", other),
        }
        assert_eq!(None, parse("not json at all"));
    }

    #[test]
    fn dispatch_join_binds_and_raises_events() {
        let registry = registry();
        let mut events = RecordingEvents::default();
        let message = format!(
            r#"{{"{}": {{"j": {{"p": true}}, "ssrc": 99, "p": 10}}}}"#,
            id(1)
        );
        dispatch(&message, &registry, &mut events);
        assert_eq!(vec![id(1)], events.joined);
        assert_eq!(Some(id(1)), registry.lookup_by_ssrc(99));
        assert_eq!(1, events.audio.len());
        assert_eq!(
            PeerAudioState {
                power: 10,
                voice_active: false,
                joined_primary: true
            },
            events.audio[0].1
        );
    }

    #[test]
    fn dispatch_leave_is_idempotent() {
        let registry = registry();
        let mut events = RecordingEvents::default();
        registry.upsert_peer(id(1));
        let message = format!(r#"{{"{}": {{"l": true}}}}"#, id(1));
        dispatch(&message, &registry, &mut events);
        dispatch(&message, &registry, &mut events);
        assert_eq!(vec![id(1)], events.left);
    }

    #[test]
    fn snapshot_array_reconciles_and_raises_one_list_event() {
        let registry = registry();
        let mut events = RecordingEvents::default();
        for n in [1, 2, 3] {
            registry.upsert_peer(id(n));
        }
        let message = format!(r#"{{"av": ["{}", "{}", "{}"]}}"#, id(2), id(3), id(4));
        dispatch(&message, &registry, &mut events);
        assert_eq!(vec![id(4)], events.joined);
        assert_eq!(vec![id(1)], events.left);
        assert_eq!(1, events.peer_lists.len());
        assert_eq!(vec![id(2), id(3), id(4)], events.peer_lists[0]);
    }

    #[test]
    fn snapshot_object_honors_removal_markers() {
        let registry = registry();
        let mut events = RecordingEvents::default();
        registry.upsert_peer(id(1));
        registry.upsert_peer(id(2));
        let message = format!(r#"{{"a": {{"{}": {{"n": 1}}, "{}": {{}}}}}}"#, id(1), id(2));
        dispatch(&message, &registry, &mut events);
        assert_eq!(vec![id(2)], events.left);
        assert_eq!(vec![id(1)], registry.known_ids());
    }

    #[test]
    fn ping_raises_event_and_maps_render() {
        let registry = registry();
        let mut events = RecordingEvents::default();
        let message = format!(
            r#"{{"ping": true, "m": {{"{}": true}}, "ug": {{"{}": 150}}}}"#,
            id(1),
            id(2)
        );
        dispatch(&message, &registry, &mut events);
        assert_eq!(1, events.pings);
        assert_eq!(vec![vec![(id(1), true)]], events.mute_maps);
        assert_eq!(vec![vec![(id(2), 150)]], events.gain_maps);
    }

    #[test]
    fn render_shapes() {
        assert_eq!(r#"{"j":{"p":true}}"#, join_message(true));
        assert_eq!(r#"{"l":true}"#, leave_message());
        assert_eq!(r#"{"ping":true}"#, ping_message());
        assert_eq!(r#"{"pong":true}"#, pong_message());
        assert_eq!(
            format!(r#"{{"ug":{{"{}":200}}}}"#, id(1)),
            gain_message(id(1), 900)
        );
        assert_eq!(
            format!(r#"{{"m":{{"{}":true}}}}"#, id(1)),
            mute_message(id(1), true)
        );
    }
}
