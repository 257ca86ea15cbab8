//! Request encoding.
//!
//! Each request is one line: a verb followed by `name=value` parameters
//! joined by `&`, values percent-escaped. `parse` is the exact inverse of
//! `encode` and exists for the fake servers used in tests as much as for the
//! round-trip guarantees of the codec.

use std::collections::HashMap;
use std::fmt::Write as _;

use super::CodecError;
use super::escape::{escape_param, unescape};
use crate::subscription::SubscriptionMode;

/// A client request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Open a brand new session.
    CreateSession(CreateSessionRequest),
    /// Turn a created session into an active streaming or polling channel.
    BindSession(BindSessionRequest),
    /// Resume an interrupted session from the last received progressive.
    Recover(RecoverRequest),
    /// Subscription, constrain, heartbeat or destroy operation.
    Control(ControlRequest),
    /// Application message.
    Message(MessageRequest),
}

/// Parameters of `create_session`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionRequest {
    /// Client identifier and version.
    pub cid: String,
    /// Requested adapter set.
    pub adapter_set: String,
    /// Optional user name.
    pub user: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// Keepalive interval proposed by the client, in milliseconds.
    pub keepalive_millis: u64,
    /// Bandwidth cap in kilobits per second; `None` for unlimited.
    pub requested_max_bandwidth: Option<f64>,
}

/// Polling parameters carried by bind and recover requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingParams {
    /// Pause the client observes between polling cycles, in milliseconds.
    pub polling_millis: u64,
    /// Longest the server may hold the request waiting for data, in
    /// milliseconds.
    pub idle_millis: u64,
}

/// Parameters of `bind_session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSessionRequest {
    /// Server-assigned session id.
    pub session_id: String,
    /// Keepalive interval, in milliseconds.
    pub keepalive_millis: u64,
    /// Polling parameters; `None` binds a streaming channel.
    pub polling: Option<PollingParams>,
    /// Response size after which the server must close the stream, for
    /// content-length-constrained HTTP environments.
    pub content_length: Option<u64>,
}

/// Parameters of `recover`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverRequest {
    /// Session id being resumed.
    pub session_id: String,
    /// Progressive of the last notification the client received.
    pub recovery_from: u64,
    /// Keepalive interval, in milliseconds.
    pub keepalive_millis: u64,
    /// Polling parameters; `None` resumes a streaming channel.
    pub polling: Option<PollingParams>,
}

/// A `control` request: one operation plus its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    /// Correlation id echoed by `REQOK`/`REQERR`.
    pub req_id: u64,
    /// The operation.
    pub op: ControlOp,
}

/// Operations carried by `control` requests.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOp {
    /// Activate a subscription.
    Add {
        /// Client-chosen subscription id, unique within the session.
        sub_id: u64,
        /// Subscription mode.
        mode: SubscriptionMode,
        /// Item group name or space-joined item list.
        group: String,
        /// Field schema name or space-joined field list.
        schema: String,
        /// Request an initial snapshot.
        snapshot: bool,
        /// Update frequency cap in updates per second; `None` for
        /// server-decided.
        max_frequency: Option<f64>,
        /// Server-side buffer length; `None` for server-decided.
        buffer_size: Option<u64>,
    },
    /// Deactivate a subscription.
    Delete {
        /// Subscription id being removed.
        sub_id: u64,
    },
    /// Change the session bandwidth cap.
    Constrain {
        /// New cap in kilobits per second; `None` for unlimited.
        max_bandwidth: Option<f64>,
    },
    /// Reverse heartbeat keeping an idle upstream channel open.
    Heartbeat,
    /// Terminate the session server-side.
    Destroy {
        /// Session id being destroyed.
        session_id: String,
        /// Cause recorded in the server log.
        cause: String,
    },
}

/// Parameters of `msg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRequest {
    /// Correlation id echoed by `REQOK`/`REQERR`.
    pub req_id: u64,
    /// Sequence name; `UNORDERED_MESSAGES` disables ordering.
    pub sequence: String,
    /// Progressive within the sequence; `None` for fire-and-forget.
    pub prog: Option<u64>,
    /// Server-side wait budget for out-of-order delivery, in milliseconds.
    pub timeout_millis: Option<u64>,
    /// Whether the server must report the outcome (`MSGDONE`/`MSGFAIL`).
    pub needs_ack: bool,
    /// Message payload.
    pub text: String,
}

impl Request {
    /// Encode to a single wire line.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::CreateSession(create) => create.encode(),
            Self::BindSession(bind) => bind.encode(),
            Self::Recover(recover) => recover.encode(),
            Self::Control(control) => control.encode(),
            Self::Message(message) => message.encode(),
        }
    }

    /// Parse a wire line back into a request.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for unknown verbs, missing or unparseable
    /// parameters, and invalid escapes.
    pub fn parse(line: &str) -> Result<Self, CodecError> {
        let mut pieces = line.split('&');
        let verb = pieces.next().filter(|v| !v.is_empty()).ok_or(CodecError::Empty)?;
        let mut params = Params::collect(pieces)?;
        match verb {
            "create_session" => CreateSessionRequest::from_params(&mut params).map(Self::CreateSession),
            "bind_session" => BindSessionRequest::from_params(&mut params).map(Self::BindSession),
            "recover" => RecoverRequest::from_params(&mut params).map(Self::Recover),
            "control" => ControlRequest::from_params(&mut params).map(Self::Control),
            "msg" => MessageRequest::from_params(&mut params).map(Self::Message),
            other => Err(CodecError::UnknownRequest(other.to_string())),
        }
    }
}

impl CreateSessionRequest {
    fn encode(&self) -> String {
        let mut line = String::from("create_session");
        push_param(&mut line, "cid", &self.cid);
        push_param(&mut line, "adapter_set", &self.adapter_set);
        if let Some(user) = &self.user {
            push_param(&mut line, "user", user);
        }
        if let Some(password) = &self.password {
            push_param(&mut line, "password", password);
        }
        push_raw(&mut line, "keepalive", self.keepalive_millis);
        if let Some(bandwidth) = self.requested_max_bandwidth {
            push_raw(&mut line, "max_bandwidth", bandwidth);
        }
        line
    }

    fn from_params(params: &mut Params) -> Result<Self, CodecError> {
        Ok(Self {
            cid: params.require("create_session", "cid")?,
            adapter_set: params.require("create_session", "adapter_set")?,
            user: params.take("user"),
            password: params.take("password"),
            keepalive_millis: params.require_u64("create_session", "keepalive")?,
            requested_max_bandwidth: params.take_f64("create_session", "max_bandwidth")?,
        })
    }
}

impl BindSessionRequest {
    fn encode(&self) -> String {
        let mut line = String::from("bind_session");
        push_param(&mut line, "session", &self.session_id);
        push_raw(&mut line, "keepalive", self.keepalive_millis);
        if let Some(polling) = &self.polling {
            push_raw(&mut line, "polling", "true");
            push_raw(&mut line, "polling_interval", polling.polling_millis);
            push_raw(&mut line, "idle_timeout", polling.idle_millis);
        }
        if let Some(length) = self.content_length {
            push_raw(&mut line, "content_length", length);
        }
        line
    }

    fn from_params(params: &mut Params) -> Result<Self, CodecError> {
        Ok(Self {
            session_id: params.require("bind_session", "session")?,
            keepalive_millis: params.require_u64("bind_session", "keepalive")?,
            polling: take_polling(params, "bind_session")?,
            content_length: params.take_u64("bind_session", "content_length")?,
        })
    }
}

impl RecoverRequest {
    fn encode(&self) -> String {
        let mut line = String::from("recover");
        push_param(&mut line, "session", &self.session_id);
        push_raw(&mut line, "recovery_from", self.recovery_from);
        push_raw(&mut line, "keepalive", self.keepalive_millis);
        if let Some(polling) = &self.polling {
            push_raw(&mut line, "polling", "true");
            push_raw(&mut line, "polling_interval", polling.polling_millis);
            push_raw(&mut line, "idle_timeout", polling.idle_millis);
        }
        line
    }

    fn from_params(params: &mut Params) -> Result<Self, CodecError> {
        Ok(Self {
            session_id: params.require("recover", "session")?,
            recovery_from: params.require_u64("recover", "recovery_from")?,
            keepalive_millis: params.require_u64("recover", "keepalive")?,
            polling: take_polling(params, "recover")?,
        })
    }
}

impl ControlRequest {
    fn encode(&self) -> String {
        let mut line = String::from("control");
        match &self.op {
            ControlOp::Add {
                sub_id,
                mode,
                group,
                schema,
                snapshot,
                max_frequency,
                buffer_size,
            } => {
                push_raw(&mut line, "op", "add");
                push_raw(&mut line, "req_id", self.req_id);
                push_raw(&mut line, "sub_id", sub_id);
                push_raw(&mut line, "mode", mode.as_str());
                push_param(&mut line, "group", group);
                push_param(&mut line, "schema", schema);
                push_raw(&mut line, "snapshot", snapshot);
                if let Some(frequency) = max_frequency {
                    push_raw(&mut line, "max_frequency", frequency);
                }
                if let Some(size) = buffer_size {
                    push_raw(&mut line, "buffer_size", size);
                }
            }
            ControlOp::Delete { sub_id } => {
                push_raw(&mut line, "op", "delete");
                push_raw(&mut line, "req_id", self.req_id);
                push_raw(&mut line, "sub_id", sub_id);
            }
            ControlOp::Constrain { max_bandwidth } => {
                push_raw(&mut line, "op", "constrain");
                push_raw(&mut line, "req_id", self.req_id);
                match max_bandwidth {
                    Some(bandwidth) => push_raw(&mut line, "max_bandwidth", bandwidth),
                    None => push_raw(&mut line, "max_bandwidth", "unlimited"),
                }
            }
            ControlOp::Heartbeat => {
                push_raw(&mut line, "op", "heartbeat");
                push_raw(&mut line, "req_id", self.req_id);
            }
            ControlOp::Destroy { session_id, cause } => {
                push_raw(&mut line, "op", "destroy");
                push_raw(&mut line, "req_id", self.req_id);
                push_param(&mut line, "session", session_id);
                push_param(&mut line, "cause", cause);
            }
        }
        line
    }

    fn from_params(params: &mut Params) -> Result<Self, CodecError> {
        let op_name = params.require("control", "op")?;
        let req_id = params.require_u64("control", "req_id")?;
        let op = match op_name.as_str() {
            "add" => ControlOp::Add {
                sub_id: params.require_u64("control", "sub_id")?,
                mode: SubscriptionMode::parse(&params.require("control", "mode")?)
                    .ok_or(CodecError::InvalidField {
                        directive: "control",
                        field: "mode",
                    })?,
                group: params.require("control", "group")?,
                schema: params.require("control", "schema")?,
                snapshot: params.require_bool("control", "snapshot")?,
                max_frequency: params.take_f64("control", "max_frequency")?,
                buffer_size: params.take_u64("control", "buffer_size")?,
            },
            "delete" => ControlOp::Delete {
                sub_id: params.require_u64("control", "sub_id")?,
            },
            "constrain" => {
                let raw = params.require("control", "max_bandwidth")?;
                let max_bandwidth = if raw == "unlimited" {
                    None
                } else {
                    Some(raw.parse().map_err(|_| CodecError::InvalidField {
                        directive: "control",
                        field: "max_bandwidth",
                    })?)
                };
                ControlOp::Constrain { max_bandwidth }
            }
            "heartbeat" => ControlOp::Heartbeat,
            "destroy" => ControlOp::Destroy {
                session_id: params.require("control", "session")?,
                cause: params.require("control", "cause")?,
            },
            _ => {
                return Err(CodecError::InvalidField {
                    directive: "control",
                    field: "op",
                });
            }
        };
        Ok(Self { req_id, op })
    }
}

impl MessageRequest {
    fn encode(&self) -> String {
        let mut line = String::from("msg");
        push_raw(&mut line, "req_id", self.req_id);
        push_param(&mut line, "sequence", &self.sequence);
        if let Some(prog) = self.prog {
            push_raw(&mut line, "prog", prog);
        }
        if let Some(timeout) = self.timeout_millis {
            push_raw(&mut line, "timeout", timeout);
        }
        push_raw(&mut line, "ack", self.needs_ack);
        push_param(&mut line, "text", &self.text);
        line
    }

    fn from_params(params: &mut Params) -> Result<Self, CodecError> {
        Ok(Self {
            req_id: params.require_u64("msg", "req_id")?,
            sequence: params.require("msg", "sequence")?,
            prog: params.take_u64("msg", "prog")?,
            timeout_millis: params.take_u64("msg", "timeout")?,
            needs_ack: params.require_bool("msg", "ack")?,
            text: params.require("msg", "text")?,
        })
    }
}

fn push_param(line: &mut String, name: &str, value: &str) {
    let _ = write!(line, "&{name}={}", escape_param(value));
}

fn push_raw(line: &mut String, name: &str, value: impl std::fmt::Display) {
    let _ = write!(line, "&{name}={value}");
}

fn take_polling(params: &mut Params, directive: &'static str) -> Result<Option<PollingParams>, CodecError> {
    if params.take("polling").is_none() {
        return Ok(None);
    }
    Ok(Some(PollingParams {
        polling_millis: params.require_u64(directive, "polling_interval")?,
        idle_millis: params.require_u64(directive, "idle_timeout")?,
    }))
}

/// Unescaped request parameters, consumed by `from_params` builders.
struct Params(HashMap<String, String>);

impl Params {
    fn collect<'a>(pieces: impl Iterator<Item = &'a str>) -> Result<Self, CodecError> {
        let mut map = HashMap::new();
        for piece in pieces {
            let (name, value) = piece.split_once('=').ok_or(CodecError::InvalidField {
                directive: "request",
                field: "parameter",
            })?;
            map.insert(name.to_string(), unescape(value)?);
        }
        Ok(Self(map))
    }

    fn take(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    fn require(&mut self, directive: &'static str, field: &'static str) -> Result<String, CodecError> {
        self.take(field)
            .ok_or(CodecError::MissingField { directive, field })
    }

    fn require_u64(&mut self, directive: &'static str, field: &'static str) -> Result<u64, CodecError> {
        self.require(directive, field)?
            .parse()
            .map_err(|_| CodecError::InvalidField { directive, field })
    }

    fn require_bool(&mut self, directive: &'static str, field: &'static str) -> Result<bool, CodecError> {
        match self.require(directive, field)?.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(CodecError::InvalidField { directive, field }),
        }
    }

    fn take_u64(&mut self, directive: &'static str, field: &'static str) -> Result<Option<u64>, CodecError> {
        self.take(field)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| CodecError::InvalidField { directive, field })
            })
            .transpose()
    }

    fn take_f64(&mut self, directive: &'static str, field: &'static str) -> Result<Option<f64>, CodecError> {
        self.take(field)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| CodecError::InvalidField { directive, field })
            })
            .transpose()
    }
}
