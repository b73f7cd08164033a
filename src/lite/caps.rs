//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Capability transport abstraction.
//!
//! The region server issues per-session capability URIs; the embedding
//! application provides the actual HTTP stack behind the [`Client`] trait.
//! Each request is single-shot: retries are the caller's responsibility.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Post,
    Delete,
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    /// A JSON POST, the shape every capability in this crate uses.
    pub fn json_post(url: impl Into<String>, body: &serde_json::Value) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            method: Method::Post,
            url: url.into(),
            headers,
            body: Some(body.to_string().into_bytes()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: ResponseStatus,
    pub body: Vec<u8>,
}

#[derive(Copy, Clone, Debug)]
pub struct ResponseStatus {
    pub code: u16,
}

impl From<u16> for ResponseStatus {
    fn from(code: u16) -> Self {
        Self { code }
    }
}

impl ResponseStatus {
    pub fn r#type(self) -> ResponseStatusType {
        ResponseStatusType::from_code(self.code)
    }

    pub fn is_success(self) -> bool {
        matches!(self.r#type(), ResponseStatusType::Success)
    }

    pub fn is_client_error(self) -> bool {
        matches!(self.r#type(), ResponseStatusType::ClientError)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ResponseStatusType {
    Unknown,
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
}

impl ResponseStatusType {
    pub fn from_code(code: u16) -> Self {
        match code {
            100..=199 => Self::Informational,
            200..=299 => Self::Success,
            300..=399 => Self::Redirection,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }
}

/// A None response indicates a transport-level failure (no response at all).
pub type ResponseCallback = Box<dyn FnOnce(Option<Response>) + Send>;

/// An abstract capability HTTP client. The application supplies a
/// platform-specific impl; everything in this crate goes through it.
pub trait Client: Send + Sync {
    fn send_request(&self, request: Request, callback: ResponseCallback);
}
