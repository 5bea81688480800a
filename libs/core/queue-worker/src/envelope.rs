//! Message envelope, wire headers and the reply body
//!
//! Replies are a tagged result: either an encoded message or a
//! [`RemoteException`] descriptor carried in the `x-remote-exception` header.

use crate::destination::Destination;
use crate::error::{ProcessingError, TransportError};
use crate::marshal::Payload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Stable header names shared by publishers and workers
pub mod headers {
    /// Marshal strategy name; absent means the default strategy
    pub const MARSHAL: &str = "x-marshal";
    pub const CORRELATION_ID: &str = "x-correlation-id";
    /// Reply destination in `Destination` text form
    pub const REPLY_TO: &str = "x-reply-to";
    /// JSON encoded `RemoteException`
    pub const REMOTE_EXCEPTION: &str = "x-remote-exception";
    /// Name of the worker that produced a reply
    pub const SOURCE: &str = "x-source";
}

/// Fault descriptor sent to a requester in place of a reply payload
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteException {
    pub kind: String,
    pub message: String,
    /// Chain of underlying causes, outermost first
    #[serde(default)]
    pub backtrace: Vec<String>,
}

impl RemoteException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }
}

impl From<&ProcessingError> for RemoteException {
    fn from(err: &ProcessingError) -> Self {
        let mut backtrace = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            backtrace.push(cause.to_string());
            source = cause.source();
        }

        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            backtrace,
        }
    }
}

/// Headers plus an optional payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message id assigned by the sender
    pub id: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Option<Payload>,
    /// Backend specific id of this delivery, used for acknowledgement
    pub delivery_tag: Option<String>,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            headers: BTreeMap::new(),
            payload: Some(payload),
            delivery_tag: None,
        }
    }

    /// Reply envelope reporting a fault for `correlation_id`
    pub fn remote_exception(
        exception: &RemoteException,
        correlation_id: &str,
        source: &str,
    ) -> Result<Self, TransportError> {
        let encoded = serde_json::to_string(exception)?;
        Ok(Self {
            id: Uuid::now_v7().to_string(),
            headers: BTreeMap::new(),
            payload: None,
            delivery_tag: None,
        }
        .with_header(headers::REMOTE_EXCEPTION, encoded)
        .with_header(headers::CORRELATION_ID, correlation_id)
        .with_header(headers::SOURCE, source))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn marshal(&self) -> Option<&str> {
        self.header(headers::MARSHAL)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(headers::CORRELATION_ID)
    }

    pub fn source(&self) -> Option<&str> {
        self.header(headers::SOURCE)
    }

    pub fn reply_to(&self) -> Result<Option<Destination>, TransportError> {
        self.header(headers::REPLY_TO)
            .map(str::parse::<Destination>)
            .transpose()
    }

    pub fn is_remote_exception(&self) -> bool {
        self.headers.contains_key(headers::REMOTE_EXCEPTION)
    }

    /// Interpret the envelope as a reply
    pub fn reply_body(&self) -> Result<ReplyBody, TransportError> {
        if let Some(raw) = self.header(headers::REMOTE_EXCEPTION) {
            let exception: RemoteException = serde_json::from_str(raw)?;
            return Ok(ReplyBody::RemoteException(exception));
        }

        match &self.payload {
            Some(payload) => Ok(ReplyBody::Message {
                marshal: self.marshal().map(str::to_string),
                payload: payload.clone(),
            }),
            None => Err(TransportError::Encoding(format!(
                "envelope {} has neither payload nor remote exception",
                self.id
            ))),
        }
    }
}

/// Outcome carried by a reply envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Message {
        marshal: Option<String>,
        payload: Payload,
    },
    RemoteException(RemoteException),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_accessors() {
        let envelope = Envelope::new(Payload::Text("hi".into()))
            .with_header(headers::MARSHAL, "json")
            .with_header(headers::CORRELATION_ID, "abc")
            .with_header(headers::REPLY_TO, "handle://reply.1");

        assert_eq!(envelope.marshal(), Some("json"));
        assert_eq!(envelope.correlation_id(), Some("abc"));
        assert_eq!(
            envelope.reply_to().unwrap(),
            Some(Destination::handle("reply.1"))
        );
        assert!(!envelope.is_remote_exception());
    }

    #[test]
    fn test_invalid_reply_to() {
        let envelope = Envelope::new(Payload::Text("hi".into()))
            .with_header(headers::REPLY_TO, "nowhere");
        assert!(envelope.reply_to().is_err());
    }

    #[test]
    fn test_reply_body_message() {
        let envelope = Envelope::new(Payload::Bytes(b"42".to_vec()));
        assert_eq!(
            envelope.reply_body().unwrap(),
            ReplyBody::Message {
                marshal: None,
                payload: Payload::Bytes(b"42".to_vec())
            }
        );
    }

    #[test]
    fn test_reply_body_remote_exception() {
        let err = ProcessingError::with_kind("DivideByZero", "cannot divide by zero");
        let exception = RemoteException::from(&err);
        let envelope = Envelope::remote_exception(&exception, "corr", "Calc").unwrap();

        assert!(envelope.payload.is_none());
        assert_eq!(envelope.source(), Some("Calc"));
        match envelope.reply_body().unwrap() {
            ReplyBody::RemoteException(e) => {
                assert_eq!(e.kind, "DivideByZero");
                assert_eq!(e.message, "cannot divide by zero");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_empty_envelope_is_not_a_reply() {
        let mut envelope = Envelope::new(Payload::Text(String::new()));
        envelope.payload = None;
        assert!(envelope.reply_body().is_err());
    }
}
