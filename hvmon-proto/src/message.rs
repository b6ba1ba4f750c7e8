//! Frame types exchanged with the monitor.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command that must follow the greeting before any other request.
pub const NEGOTIATE: &str = "qmp_capabilities";

/// Greeting capability for file descriptors passed as ancillary data.
pub const CAP_OOB: &str = "oob";

/// Request sent from client to monitor.
///
/// Exactly one of `execute` / `exec-oob` is set by the constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Request {
    /// Command name for in-band execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<String>,
    /// Command name for out-of-band execution.
    #[serde(rename = "exec-oob", default, skip_serializing_if = "Option::is_none")]
    pub exec_oob: Option<String>,
    /// Command arguments, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    /// Correlation id. Zero is reserved and cannot be represented.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NonZeroU32>,
}

impl Request {
    /// Creates an in-band request for `name`.
    pub fn execute(name: impl Into<String>) -> Self {
        Self {
            execute: Some(name.into()),
            exec_oob: None,
            arguments: None,
            id: None,
        }
    }

    /// Creates an out-of-band request for `name`.
    pub fn out_of_band(name: impl Into<String>) -> Self {
        Self {
            execute: None,
            exec_oob: Some(name.into()),
            arguments: None,
            id: None,
        }
    }

    /// Attaches arguments. `null` means "no arguments" and is dropped.
    #[must_use]
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = (!arguments.is_null()).then_some(arguments);
        self
    }

    /// Pre-assigns the correlation id.
    #[must_use]
    pub const fn with_id(mut self, id: NonZeroU32) -> Self {
        self.id = Some(id);
        self
    }

    /// Returns the command name, whichever execution mode is used.
    pub fn name(&self) -> &str {
        self.execute
            .as_deref()
            .or(self.exec_oob.as_deref())
            .unwrap_or_default()
    }
}

/// Error object carried by a failed reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ErrorInfo {
    /// Error class, e.g. `GenericError` or `DeviceNotFound`.
    #[serde(default)]
    pub class: String,
    /// Human-readable description.
    #[serde(default)]
    pub desc: String,
}

impl ErrorInfo {
    /// Creates an error object.
    pub fn new(class: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            desc: desc.into(),
        }
    }

    /// Returns `true` if the peer reports that the named object does not exist.
    pub fn is_not_found(&self) -> bool {
        self.class == "DeviceNotFound"
            || self.desc.contains("not found")
            || self.desc.contains("Failed to find")
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}

impl std::error::Error for ErrorInfo {}

/// Reply to a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Reply {
    /// Id of the request being answered; `0` when the peer sent none.
    #[serde(default)]
    pub id: u32,
    /// Success payload.
    #[serde(rename = "return", default, skip_serializing_if = "Value::is_null")]
    pub ret: Value,
    /// Failure reported by the peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Reply {
    /// Creates a success reply.
    pub const fn ok(id: u32, ret: Value) -> Self {
        Self {
            id,
            ret,
            error: None,
        }
    }

    /// Creates a failure reply.
    pub const fn err(id: u32, error: ErrorInfo) -> Self {
        Self {
            id,
            ret: Value::Null,
            error: Some(error),
        }
    }

    /// Splits the reply into its payload or the peer-reported error.
    pub fn into_result(self) -> Result<Value, ErrorInfo> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.ret),
        }
    }
}

/// Time at which the monitor emitted an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Sub-second part in microseconds.
    pub microseconds: i64,
}

impl Timestamp {
    /// Creates a timestamp.
    pub const fn new(seconds: i64, microseconds: i64) -> Self {
        Self {
            seconds,
            microseconds,
        }
    }
}

/// Unsolicited event, never correlated to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Event {
    /// Event name, e.g. `BLOCK_JOB_READY`.
    pub event: String,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Emission time as reported by the monitor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl Event {
    /// Creates an event without a timestamp.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: None,
        }
    }
}

/// Body of the greeting object. Unknown fields such as `version` are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GreetingBody {
    /// Advertised capabilities.
    #[serde(default)]
    capabilities: Vec<String>,
}

/// Banner the monitor sends on connect: `{"<protocol>": {"capabilities": [...]}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, GreetingBody>",
    into = "BTreeMap<String, GreetingBody>"
)]
#[non_exhaustive]
pub struct Greeting {
    /// Protocol name (the single top-level key).
    pub protocol: String,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
}

impl Greeting {
    /// Creates a greeting.
    pub fn new(protocol: impl Into<String>, capabilities: &[&str]) -> Self {
        Self {
            protocol: protocol.into(),
            capabilities: capabilities.iter().map(|c| (*c).to_owned()).collect(),
        }
    }

    /// Returns `true` if `cap` was advertised.
    pub fn has(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }
}

impl TryFrom<BTreeMap<String, GreetingBody>> for Greeting {
    type Error = &'static str;

    fn try_from(map: BTreeMap<String, GreetingBody>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err("greeting must have exactly one top-level key");
        }
        let (protocol, body) = map.into_iter().next().ok_or("empty greeting")?;
        Ok(Self {
            protocol,
            capabilities: body.capabilities,
        })
    }
}

impl From<Greeting> for BTreeMap<String, GreetingBody> {
    fn from(g: Greeting) -> Self {
        Self::from([(
            g.protocol,
            GreetingBody {
                capabilities: g.capabilities,
            },
        )])
    }
}

/// One inbound line, classified.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum Frame {
    /// Carries a non-empty event name.
    Event(Event),
    /// Anything else: a reply, possibly without id.
    Reply(Reply),
}

impl Frame {
    /// Parses and classifies one line. Only JSON objects are frames.
    pub fn parse(line: &[u8]) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_slice(line)?;
        if !value.is_object() {
            return Err(serde::de::Error::custom("frame is not a JSON object"));
        }
        let is_event = value
            .get("event")
            .and_then(Value::as_str)
            .is_some_and(|name| !name.is_empty());
        if is_event {
            serde_json::from_value(value).map(Self::Event)
        } else {
            serde_json::from_value(value).map(Self::Reply)
        }
    }
}
