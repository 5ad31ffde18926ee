//! Cluster message shapes.
//!
//! Transports deliver raw JSON values; [`Message::from_value`] is the single
//! classification path for inbound traffic. A value shaped as a response
//! (carries `result` or `error`, no `method`) is routed to response
//! correlation; everything else must parse as a request, where the presence
//! of an `id` marks it anycast and its absence marks it multicast. Wire
//! encoding and framing live in the transport, not here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{VigilError, VigilResult};

/// A topic-addressed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// The topic this request is addressed to.
    pub method: String,
    /// Optional payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Correlation ID. Present for anycast (a response is expected),
    /// absent for multicast fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A response correlated to an earlier anycast request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Result payload. `Null` when the response carries only an error.
    #[serde(default)]
    pub result: Value,
    /// Error payload, if the request failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Correlation ID of the request this answers.
    pub id: String,
}

/// The delivery mode implied by a request's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingKind {
    /// Directed delivery to exactly one resolved destination.
    Anycast,
    /// Fan-out to every subscriber of the topic.
    Multicast,
}

/// A classified cluster message.
///
/// Serializes untagged: requests and responses are told apart by shape,
/// not by an envelope tag. Inbound values are classified through
/// [`Message::from_value`] only.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// A topic-addressed request.
    Request(Request),
    /// A correlated response.
    Response(Response),
}

impl Request {
    /// Create a multicast request for a topic.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            id: None,
        }
    }

    /// Attach a payload.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Attach a correlation ID, turning the request into an anycast call.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Anycast iff the request carries a correlation ID.
    pub fn routing_kind(&self) -> RoutingKind {
        if self.id.is_some() {
            RoutingKind::Anycast
        } else {
            RoutingKind::Multicast
        }
    }
}

impl Response {
    /// Create a success response.
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            result,
            error: None,
            id: id.into(),
        }
    }

    /// Create an error response.
    pub fn failure(id: impl Into<String>, error: Value) -> Self {
        Self {
            result: Value::Null,
            error: Some(error),
            id: id.into(),
        }
    }
}

impl Message {
    /// Classify a raw inbound value.
    ///
    /// The response shape is tested first: a JSON object carrying `result`
    /// or `error` and no `method` is a response, and a response without an
    /// `id` cannot be correlated and is rejected. Anything else must parse
    /// as a request with a string `method`. Malformed values are
    /// [`VigilError::Protocol`] and affect only this message.
    pub fn from_value(value: Value) -> VigilResult<Message> {
        let response_shaped = match &value {
            Value::Object(map) => {
                (map.contains_key("result") || map.contains_key("error"))
                    && !map.contains_key("method")
            }
            _ => {
                return Err(VigilError::Protocol(
                    "message is not a JSON object".to_string(),
                ))
            }
        };

        if response_shaped {
            let response: Response = serde_json::from_value(value)
                .map_err(|e| VigilError::Protocol(format!("malformed response: {e}")))?;
            Ok(Message::Response(response))
        } else {
            let request: Request = serde_json::from_value(value)
                .map_err(|e| VigilError::Protocol(format!("malformed request: {e}")))?;
            Ok(Message::Request(request))
        }
    }

    /// Serialize for a transport.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(request) => serde_json::json!(request),
            Message::Response(response) => serde_json::json!(response),
        }
    }
}
