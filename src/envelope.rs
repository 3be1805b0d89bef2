//! Request/response envelopes exchanged over a channel.
//!
//! An envelope is a structured value, not a byte format. On the channel it
//! travels as a [`serde_json::Value`]:
//!
//! ```text
//! Request:  {"origin": "invoker", "seq": 0, "name": "max", "args": [1, 2, 3]}
//! Response: {"origin": "callee",  "seq": 0, "name": "max", "status": 0, "payload": 3}
//! ```
//!
//! The `origin` tag selects the variant. Anything that does not parse into
//! one of the two shapes is malformed and gets dropped by the receiver.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{Result, RpcError};

/// Which component produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Invoker,
    Callee,
}

/// Response status code.
///
/// Encoded as an integer. Any code other than `0` is a failure, including
/// codes a peer in another language sends outside the known range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Number", into = "i64")]
pub enum Status {
    Ok,
    Fail,
    NotFound,
    /// A code this side does not know; treated as a failure.
    Other(i64),
}

impl Status {
    #[inline]
    pub fn is_failure(self) -> bool {
        self != Status::Ok
    }
}

impl From<i64> for Status {
    fn from(code: i64) -> Self {
        match code {
            0 => Status::Ok,
            1 => Status::Fail,
            2 => Status::NotFound,
            other => Status::Other(other),
        }
    }
}

impl From<Number> for Status {
    fn from(code: Number) -> Self {
        match code.as_i64() {
            Some(code) => Status::from(code),
            // Beyond i64, or fractional.
            None => Status::Other(code.as_f64().map_or(i64::MAX, |f| f as i64)),
        }
    }
}

impl From<Status> for i64 {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => 0,
            Status::Fail => 1,
            Status::NotFound => 2,
            Status::Other(code) => code,
        }
    }
}

/// A call from the invoker side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Sequence number, unique within `name` while the call is outstanding.
    pub seq: u64,
    /// Method name.
    pub name: String,
    /// Arguments: a list, a single value, or null.
    #[serde(default)]
    pub args: Value,
}

impl Request {
    pub fn new(seq: u64, name: impl Into<String>, args: Value) -> Self {
        Self {
            seq,
            name: name.into(),
            args,
        }
    }

    /// Take the arguments as a list.
    ///
    /// A non-list value becomes a single argument; null means no arguments.
    pub fn into_args(self) -> Vec<Value> {
        match self.args {
            Value::Array(args) => args,
            Value::Null => Vec::new(),
            single => vec![single],
        }
    }
}

/// A reply from the callee side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    pub name: String,
    pub status: Status,
    /// Returned value on success, error message otherwise.
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    pub fn ok(seq: u64, name: impl Into<String>, payload: Value) -> Self {
        Self {
            seq,
            name: name.into(),
            status: Status::Ok,
            payload,
        }
    }

    pub fn fail(seq: u64, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            seq,
            name: name.into(),
            status: Status::Fail,
            payload: Value::String(message.into()),
        }
    }

    pub fn not_found(seq: u64, name: impl Into<String>) -> Self {
        let name = name.into();
        let payload = Value::String(format!("unregistered function: \"{}\"", name));
        Self {
            seq,
            name,
            status: Status::NotFound,
            payload,
        }
    }

    /// Convert into the value or error the awaiting caller receives.
    pub fn into_result(self) -> Result<Value> {
        match self.status {
            Status::Ok => Ok(self.payload),
            Status::NotFound => Err(RpcError::UnregisteredFunction(message_of(self.payload))),
            Status::Fail | Status::Other(_) => {
                Err(RpcError::RemoteInvocationFailure(message_of(self.payload)))
            }
        }
    }
}

fn message_of(payload: Value) -> String {
    match payload {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Either direction of the protocol, tagged by origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "origin")]
pub enum Envelope {
    #[serde(rename = "invoker")]
    Request(Request),
    #[serde(rename = "callee")]
    Response(Response),
}

impl Envelope {
    /// Parse an inbound channel value. `None` means malformed.
    pub fn decode(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    /// Build the channel value for this envelope.
    pub fn encode(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    #[inline]
    pub fn origin(&self) -> Origin {
        match self {
            Envelope::Request(_) => Origin::Invoker,
            Envelope::Response(_) => Origin::Callee,
        }
    }
}

impl From<Request> for Envelope {
    fn from(request: Request) -> Self {
        Envelope::Request(request)
    }
}

impl From<Response> for Envelope {
    fn from(response: Response) -> Self {
        Envelope::Response(response)
    }
}
