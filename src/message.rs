//! Message value type exchanged over the bus
//!
//! A message is an addressed unit of data: subject, optional reply subject,
//! string header map, and an opaque payload. Messages are immutable once
//! constructed; replies are derived as new values carrying the request headers.

use bytes::Bytes;
use std::collections::HashMap;

/// String header map attached to a message.
pub type Headers = HashMap<String, String>;

/// Header carrying an error marker on reply messages, allowing one reply
/// channel to transport either a success payload or an error description.
pub const ERROR_HEADER: &str = "X-Error";

/// An addressed unit of data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Destination subject.
    pub subject: String,
    /// Reply subject for request/response correlation.
    pub reply: Option<String>,
    /// Cross-cutting metadata (error markers, trace ids, ...).
    pub headers: Headers,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Create an empty message addressed to `subject`.
    pub fn new(subject: impl Into<String>) -> Self {
        Message {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: Bytes::new(),
        }
    }

    /// Create a message with a payload.
    pub fn with_payload(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Message {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    /// Create a message carrying the given headers.
    pub fn with_headers(subject: impl Into<String>, headers: Headers) -> Self {
        Message {
            subject: subject.into(),
            reply: None,
            headers,
            payload: Bytes::new(),
        }
    }

    /// Look up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Derive the reply to this message: addressed to the reply subject,
    /// inheriting the request headers. Returns `None` when the message
    /// carries no reply subject.
    pub fn reply_message(&self, payload: impl Into<Bytes>) -> Option<Message> {
        self.reply.as_ref().map(|reply| Message {
            subject: reply.clone(),
            reply: None,
            headers: self.headers.clone(),
            payload: payload.into(),
        })
    }

    /// Derive an error reply: inherited headers plus [`ERROR_HEADER`] set to
    /// `error`, and an empty payload.
    pub fn error_reply(&self, error: &str) -> Option<Message> {
        self.reply.as_ref().map(|reply| {
            let mut headers = self.headers.clone();
            headers.insert(ERROR_HEADER.to_string(), error.to_string());
            Message {
                subject: reply.clone(),
                reply: None,
                headers,
                payload: Bytes::new(),
            }
        })
    }

    /// Bytes this message accounts for against the reconnect buffer budget.
    pub fn size(&self) -> usize {
        self.subject.len() + self.payload.len()
    }
}
