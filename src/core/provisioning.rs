//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The capability-based offer/answer exchange with the region server.
//!
//! Each provisioning run POSTs the local offer to the region's voice
//! capability and retries transient failures with backoff. Rejections the
//! server will never accept on retry (bad credentials, unknown conference)
//! abort immediately with a distinct error so the caller can reset channel
//! state instead of repeating a doomed request.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::common::actor::{Actor, Stopper};
use crate::common::{ChannelInfo, Result, SessionType};
use crate::error::VoiceError;
use crate::lite::caps;
use crate::webrtc::peer_connection::IceCandidate;

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff for transient provisioning failures, kept free of I/O so the
/// schedule is testable on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// How long to wait before attempt `attempt + 1`, or None when attempt
    /// `attempt` consumed the budget. Attempts count from 1; the delay
    /// grows linearly with the attempt number up to the cap.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            None
        } else {
            Some(std::cmp::min(self.base_delay * attempt, self.max_delay))
        }
    }
}

/// What a provisioning run sends: the rewritten offer plus the
/// session-type-specific channel fields.
#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    pub session_type: SessionType,
    pub sdp_offer: String,
    /// MultiAgent only.
    pub channel: Option<ChannelInfo>,
    /// Local only.
    pub parcel_local_id: Option<i32>,
}

impl ProvisionRequest {
    fn to_body(&self) -> serde_json::Value {
        let mut body = json!({
            "channel_type": self.session_type.to_string(),
            "voice_server_type": "webrtc",
            "jsep": {
                "type": "offer",
                "sdp": self.sdp_offer,
            },
        });
        match self.session_type {
            SessionType::Local => {
                if let Some(parcel_local_id) = self.parcel_local_id {
                    body["parcel_local_id"] = parcel_local_id.into();
                }
            }
            SessionType::MultiAgent => {
                if let Some(channel) = &self.channel {
                    body["channel"] = channel.id.clone().into();
                    if let Some(credentials) = &channel.credentials {
                        body["credentials"] = credentials.clone().into();
                    }
                }
            }
        }
        body
    }
}

/// What a successful run yields: the remote answer, the server-assigned
/// session id, and (for multi-agent) possibly refreshed channel identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionAnswer {
    pub sdp: String,
    pub viewer_session: String,
    pub channel: Option<ChannelInfo>,
}

pub type ProvisionCallback = Box<dyn FnOnce(Result<ProvisionAnswer>) + Send>;

#[derive(Deserialize, Debug)]
struct Jsep {
    #[serde(rename = "type")]
    jsep_type: String,
    sdp: String,
}

#[derive(Deserialize, Debug)]
struct ProvisionResponse {
    jsep: Option<Jsep>,
    viewer_session: Option<String>,
    channel: Option<String>,
    credentials: Option<String>,
}

#[derive(Debug)]
enum AttemptOutcome {
    Answer(ProvisionAnswer),
    /// Non-retryable; the server will keep saying no.
    Rejected(String),
    /// A 2xx that isn't a valid answer is a contract violation, also
    /// non-retryable.
    Invalid(String),
    Transient(String),
}

const REJECTION_PHRASES: &[&str] = &[
    "forbidden",
    "unauthorized",
    "not authorized",
    "unknown conference",
    "expired",
];

fn classify(response: Option<caps::Response>) -> AttemptOutcome {
    let response = match response {
        Some(response) => response,
        None => return AttemptOutcome::Transient("no response from transport".to_string()),
    };
    let body = String::from_utf8_lossy(&response.body).into_owned();
    if response.status.is_success() {
        return parse_answer(&body);
    }
    if response.status.is_client_error() {
        return AttemptOutcome::Rejected(format!("status code {}", response.status.code));
    }
    let lowered = body.to_ascii_lowercase();
    if let Some(phrase) = REJECTION_PHRASES.iter().find(|p| lowered.contains(**p)) {
        return AttemptOutcome::Rejected(format!("server said {:?}", phrase));
    }
    AttemptOutcome::Transient(format!("status code {}", response.status.code))
}

fn parse_answer(body: &str) -> AttemptOutcome {
    let response: ProvisionResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(err) => return AttemptOutcome::Invalid(format!("unparseable body: {}", err)),
    };
    let jsep = match response.jsep {
        Some(jsep) => jsep,
        None => return AttemptOutcome::Invalid("no jsep in response".to_string()),
    };
    if jsep.jsep_type != "answer" {
        return AttemptOutcome::Invalid(format!("jsep type {:?} is not an answer", jsep.jsep_type));
    }
    let viewer_session = match response.viewer_session {
        Some(viewer_session) if !viewer_session.is_empty() => viewer_session,
        _ => return AttemptOutcome::Invalid("no viewer session in response".to_string()),
    };
    AttemptOutcome::Answer(ProvisionAnswer {
        sdp: jsep.sdp,
        viewer_session,
        channel: response
            .channel
            .map(|id| ChannelInfo::new(id, response.credentials)),
    })
}

struct ProvisioningState {
    actor: Actor<ProvisioningState>,
    http_client: Arc<dyn caps::Client>,
    retry_policy: RetryPolicy,
    attempt_timeout: Duration,
}

/// Runs provisioning attempts on its own actor; the HTTP transport is
/// single-shot and all retry scheduling happens here.
pub struct ProvisioningClient {
    actor: Actor<ProvisioningState>,
}

impl ProvisioningClient {
    pub fn new(
        http_client: Arc<dyn caps::Client>,
        retry_policy: RetryPolicy,
        stopper: &Stopper,
    ) -> Result<Self> {
        let actor = Actor::start("provisioning", stopper.clone(), move |actor| {
            Ok(ProvisioningState {
                actor,
                http_client,
                retry_policy,
                attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            })
        })?;
        Ok(Self { actor })
    }

    /// Starts a provisioning run against `url`. The callback fires exactly
    /// once, from the provisioning actor's thread.
    pub fn provision(&self, url: String, request: ProvisionRequest, callback: ProvisionCallback) {
        self.actor
            .send(move |state| state.start_attempt(url, request, 1, callback));
    }
}

impl ProvisioningState {
    fn start_attempt(
        &mut self,
        url: String,
        request: ProvisionRequest,
        attempt: u32,
        callback: ProvisionCallback,
    ) {
        debug!(
            "provisioning attempt {} ({} channel)",
            attempt, request.session_type
        );
        let body = request.to_body();

        // The transport callback and the attempt watchdog race for the
        // pending callback; whichever takes it settles the attempt.
        let pending = Arc::new(Mutex::new(Some(callback)));

        let actor = self.actor.clone();
        let pending_for_response = pending.clone();
        let url_for_response = url.clone();
        let request_for_response = request.clone();
        self.http_client.send_request(
            caps::Request::json_post(&url, &body),
            Box::new(move |response| {
                let callback = pending_for_response
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.take());
                if let Some(callback) = callback {
                    actor.send(move |state| {
                        state.finish_attempt(
                            url_for_response,
                            request_for_response,
                            attempt,
                            callback,
                            classify(response),
                        )
                    });
                }
            }),
        );

        self.actor.send_delayed(self.attempt_timeout, move |state| {
            let callback = pending.lock().ok().and_then(|mut pending| pending.take());
            if let Some(callback) = callback {
                warn!("provisioning attempt {} timed out", attempt);
                state.finish_attempt(
                    url,
                    request,
                    attempt,
                    callback,
                    AttemptOutcome::Transient("attempt timed out".to_string()),
                );
            }
        });
    }

    fn finish_attempt(
        &mut self,
        url: String,
        request: ProvisionRequest,
        attempt: u32,
        callback: ProvisionCallback,
        outcome: AttemptOutcome,
    ) {
        match outcome {
            AttemptOutcome::Answer(answer) => {
                info!(
                    "provisioned viewer session after {} attempt(s)",
                    attempt
                );
                callback(Ok(answer));
            }
            AttemptOutcome::Rejected(reason) => {
                warn!("provisioning rejected: {}", reason);
                callback(Err(VoiceError::ProvisioningRejected(reason).into()));
            }
            AttemptOutcome::Invalid(reason) => {
                error!("provisioning answer invalid: {}", reason);
                callback(Err(VoiceError::InvalidAnswer(reason).into()));
            }
            AttemptOutcome::Transient(reason) => match self.retry_policy.delay_after(attempt) {
                Some(delay) => {
                    debug!(
                        "provisioning attempt {} failed ({}); retrying in {:?}",
                        attempt, reason, delay
                    );
                    self.actor.send_delayed(delay, move |state| {
                        state.start_attempt(url, request, attempt + 1, callback)
                    });
                }
                None => {
                    error!(
                        "provisioning failed after {} attempts ({})",
                        attempt, reason
                    );
                    callback(Err(VoiceError::ProvisioningFailed(attempt).into()));
                }
            },
        }
    }
}

/// Body for a batched trickle POST to the signaling capability.
pub fn candidate_batch_body(viewer_session: &str, candidates: &[IceCandidate]) -> serde_json::Value {
    json!({
        "viewer_session": viewer_session,
        "candidates": candidates
            .iter()
            .map(|c| {
                json!({
                    "sdpMid": c.sdp_mid,
                    "sdpMLineIndex": c.sdp_mline_index,
                    "candidate": c.sdp,
                })
            })
            .collect::<Vec<_>>(),
    })
}

/// Body telling the server local ICE gathering finished.
pub fn trickle_complete_body(viewer_session: &str) -> serde_json::Value {
    json!({
        "viewer_session": viewer_session,
        "candidate": { "completed": true },
    })
}

/// Body for the best-effort session logout on close.
pub fn logout_body(viewer_session: &str) -> serde_json::Value {
    json!({
        "viewer_session": viewer_session,
        "logout": true,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;
    use crate::sim::FakeCapsClient;

    fn response(code: u16, body: &str) -> Option<caps::Response> {
        Some(caps::Response {
            status: code.into(),
            body: body.as_bytes().to_vec(),
        })
    }

    fn answer_body() -> String {
        json!({
            "jsep": { "type": "answer", "sdp": "v=0\r\n" },
            "viewer_session": "vs-1",
        })
        .to_string()
    }

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            session_type: SessionType::Local,
            sdp_offer: "v=0\r\n".to_string(),
            channel: None,
            parcel_local_id: Some(7),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn provision_and_wait(
        caps_client: Arc<FakeCapsClient>,
        policy: RetryPolicy,
        request: ProvisionRequest,
    ) -> Result<ProvisionAnswer> {
        let stopper = Stopper::new();
        let client = ProvisioningClient::new(caps_client, policy, &stopper).unwrap();
        let (sender, receiver) = channel();
        client.provision(
            "https://sim.example/caps/voice".to_string(),
            request,
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        );
        let result = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("provisioning never settled");
        stopper.stop_all_and_join_with_timeout(Duration::from_secs(5));
        result
    }

    #[test]
    fn retry_policy_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(Some(Duration::from_millis(200)), policy.delay_after(1));
        assert_eq!(Some(Duration::from_millis(800)), policy.delay_after(4));
        assert_eq!(Some(Duration::from_millis(1800)), policy.delay_after(9));
        // Exhausted.
        assert_eq!(None, policy.delay_after(10));

        // The cap binds once base x attempt passes it.
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        };
        assert_eq!(Some(Duration::from_millis(1500)), policy.delay_after(3));
        assert_eq!(Some(Duration::from_secs(2)), policy.delay_after(4));
        assert_eq!(Some(Duration::from_secs(2)), policy.delay_after(9));
    }

    #[test]
    fn classification() {
        assert!(matches!(classify(None), AttemptOutcome::Transient(_)));
        assert!(matches!(
            classify(response(403, "nope")),
            AttemptOutcome::Rejected(_)
        ));
        assert!(matches!(
            classify(response(500, "unknown conference")),
            AttemptOutcome::Rejected(_)
        ));
        assert!(matches!(
            classify(response(500, "try later")),
            AttemptOutcome::Transient(_)
        ));
        assert!(matches!(
            classify(response(200, &answer_body())),
            AttemptOutcome::Answer(_)
        ));
        let offer_body =
            json!({"jsep": {"type": "offer", "sdp": "v=0"}, "viewer_session": "x"}).to_string();
        assert!(matches!(
            classify(response(200, &offer_body)),
            AttemptOutcome::Invalid(_)
        ));
    }

    #[test]
    fn local_body_shape() {
        let body = request().to_body();
        assert_eq!("local", body["channel_type"]);
        assert_eq!("webrtc", body["voice_server_type"]);
        assert_eq!("offer", body["jsep"]["type"]);
        assert_eq!(7, body["parcel_local_id"]);
        assert!(body.get("channel").is_none());
    }

    #[test]
    fn multiagent_body_shape() {
        let body = ProvisionRequest {
            session_type: SessionType::MultiAgent,
            sdp_offer: "v=0\r\n".to_string(),
            channel: Some(ChannelInfo::new("group-1", Some("secret".to_string()))),
            parcel_local_id: None,
        }
        .to_body();
        assert_eq!("multiagent", body["channel_type"]);
        assert_eq!("group-1", body["channel"]);
        assert_eq!("secret", body["credentials"]);
        assert!(body.get("parcel_local_id").is_none());
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let caps_client = Arc::new(FakeCapsClient::default());
        caps_client.push_response(None);
        caps_client.push_response(response(503, "busy"));
        caps_client.push_response(response(200, &answer_body()));

        let answer = provision_and_wait(caps_client.clone(), fast_policy(), request()).unwrap();
        assert_eq!("vs-1", answer.viewer_session);
        assert_eq!(3, caps_client.request_count());
    }

    #[test]
    fn rejection_aborts_without_consuming_attempts() {
        let caps_client = Arc::new(FakeCapsClient::default());
        caps_client.push_response(response(403, "forbidden"));

        let err = provision_and_wait(caps_client.clone(), fast_policy(), request()).unwrap_err();
        let err = err.downcast::<VoiceError>().unwrap();
        assert!(err.is_provisioning_rejection());
        assert_eq!(1, caps_client.request_count());
    }

    #[test]
    fn invalid_answer_is_fatal_not_retried() {
        let caps_client = Arc::new(FakeCapsClient::default());
        caps_client.push_response(response(200, "{}"));

        let err = provision_and_wait(caps_client.clone(), fast_policy(), request()).unwrap_err();
        assert!(matches!(
            err.downcast::<VoiceError>().unwrap(),
            VoiceError::InvalidAnswer(_)
        ));
        assert_eq!(1, caps_client.request_count());
    }

    #[test]
    fn exhausted_attempts_surface_provisioning_failed() {
        let caps_client = Arc::new(FakeCapsClient::default());
        // No responses queued: every attempt sees a transport failure.
        let err = provision_and_wait(caps_client.clone(), fast_policy(), request()).unwrap_err();
        assert!(matches!(
            err.downcast::<VoiceError>().unwrap(),
            VoiceError::ProvisioningFailed(3)
        ));
        assert_eq!(3, caps_client.request_count());
    }

    #[test]
    fn signaling_bodies() {
        let candidates = vec![IceCandidate::new(
            "audio".to_string(),
            0,
            "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
        )];
        let batch = candidate_batch_body("vs-1", &candidates);
        assert_eq!("vs-1", batch["viewer_session"]);
        assert_eq!(1, batch["candidates"].as_array().unwrap().len());
        assert_eq!("audio", batch["candidates"][0]["sdpMid"]);

        assert_eq!(true, trickle_complete_body("vs-1")["candidate"]["completed"]);
        assert_eq!(true, logout_body("vs-1")["logout"]);
    }
}
