//! Notification decoding.
//!
//! Every inbound line is one directive: a name followed by `,`-separated
//! fields. Decoding yields exactly one typed [`Notification`]; an unknown
//! directive surfaces as [`CodecError::UnknownDirective`], which the session
//! layer treats as a recoverable protocol error. `encode` is the inverse of
//! `parse` and feeds the fake servers used in tests.

use std::fmt::Write as _;

use super::CodecError;
use super::escape::{escape_field, escape_update, unescape};

/// One field slot of an update line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Field unchanged since the previous update of this item.
    Unchanged,
    /// Field explicitly null.
    Null,
    /// Field carries a (possibly empty) value.
    Value(String),
}

impl FieldValue {
    fn decode(raw: &str) -> Result<Self, CodecError> {
        match raw {
            "" => Ok(Self::Unchanged),
            "#" => Ok(Self::Null),
            "$" => Ok(Self::Value(String::new())),
            other => Ok(Self::Value(unescape(other)?)),
        }
    }

    fn encode(&self) -> String {
        match self {
            Self::Unchanged => String::new(),
            Self::Null => "#".to_string(),
            Self::Value(value) if value.is_empty() => "$".to_string(),
            Self::Value(value) => escape_update(value).into_owned(),
        }
    }
}

/// A decoded server notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Session created or bound.
    ConOk {
        /// Server-assigned session id.
        session_id: String,
        /// Maximum request line length accepted by the server.
        request_limit: u64,
        /// Keepalive interval granted, in milliseconds.
        keepalive_millis: u64,
        /// Address for subsequent requests; `None` when the creating address
        /// stays valid (`*` on the wire).
        control_link: Option<String>,
    },
    /// Session refused.
    ConErr {
        /// Server error code.
        code: u32,
        /// Server error message.
        message: String,
    },
    /// Session terminated by the server.
    End {
        /// Termination code.
        code: u32,
        /// Termination message.
        message: String,
    },
    /// Current channel closes; client must rebind.
    Loop {
        /// Delay the server suggests before rebinding, in milliseconds.
        expected_delay_millis: u64,
    },
    /// Keepalive probe.
    Probe,
    /// Clock synchronization hint.
    Sync {
        /// Seconds elapsed server-side since the session started.
        elapsed_secs: u64,
    },
    /// Name of the answering server instance.
    ServName {
        /// Server instance name.
        name: String,
    },
    /// Client address as seen by the server.
    ClientIp {
        /// Textual IP address.
        address: String,
    },
    /// Padding; carries no meaning.
    Noop {
        /// Raw filler payload.
        payload: String,
    },
    /// Message processed by the server.
    MsgDone {
        /// Sequence name.
        sequence: String,
        /// Progressive of the processed message.
        prog: u64,
    },
    /// Message definitively not processed.
    MsgFail {
        /// Sequence name.
        sequence: String,
        /// Progressive of the failed message.
        prog: u64,
        /// Failure code; negative codes are adapter denials.
        code: i32,
        /// Failure message.
        message: String,
    },
    /// Item update.
    Update {
        /// Subscription id.
        sub_id: u64,
        /// 1-based item position within the subscription.
        item: u64,
        /// Field slots, `|`-separated on the wire.
        fields: Vec<FieldValue>,
    },
    /// Snapshot complete for an item.
    EndOfSnapshot {
        /// Subscription id.
        sub_id: u64,
        /// 1-based item position.
        item: u64,
    },
    /// Snapshot invalidated for an item.
    ClearSnapshot {
        /// Subscription id.
        sub_id: u64,
        /// 1-based item position.
        item: u64,
    },
    /// Updates were dropped server-side for a slow consumer.
    Overflow {
        /// Subscription id.
        sub_id: u64,
        /// 1-based item position.
        item: u64,
        /// Number of lost updates.
        lost: u64,
    },
    /// Effective subscription configuration.
    Configuration {
        /// Subscription id.
        sub_id: u64,
        /// Granted frequency cap; `None` for unlimited.
        max_frequency: Option<f64>,
        /// Whether frequency filtering is applied.
        filtered: bool,
    },
    /// Subscription activated.
    SubOk {
        /// Subscription id.
        sub_id: u64,
        /// Number of items.
        num_items: u64,
        /// Number of fields.
        num_fields: u64,
    },
    /// Command-mode subscription activated.
    SubCmd {
        /// Subscription id.
        sub_id: u64,
        /// Number of items.
        num_items: u64,
        /// Number of fields.
        num_fields: u64,
        /// 1-based position of the key field.
        key_pos: u64,
        /// 1-based position of the command field.
        command_pos: u64,
    },
    /// Subscription removed.
    Unsub {
        /// Subscription id.
        sub_id: u64,
    },
    /// Control request accepted.
    ReqOk {
        /// Correlation id of the request.
        req_id: u64,
    },
    /// Control request refused.
    ReqErr {
        /// Correlation id of the request.
        req_id: u64,
        /// Refusal code.
        code: u32,
        /// Refusal message.
        message: String,
    },
    /// Asynchronous fatal error on the control channel.
    Error {
        /// Error code.
        code: u32,
        /// Error message.
        message: String,
    },
    /// Push-notification device registered.
    MpnReg {
        /// Device id assigned by the server.
        device_id: String,
        /// Adapter handling the device.
        adapter: String,
    },
    /// Push-notification subscription activated.
    MpnOk {
        /// Subscription id.
        sub_id: u64,
        /// Push-notification subscription id.
        mpn_sub_id: String,
    },
}

impl Notification {
    /// Parse one inbound line.
    ///
    /// # Errors
    ///
    /// [`CodecError::UnknownDirective`] for directives this client does not
    /// know (recoverable); other variants for malformed lines.
    pub fn parse(line: &str) -> Result<Self, CodecError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return Err(CodecError::Empty);
        }
        let (directive, rest) = match line.split_once(',') {
            Some((directive, rest)) => (directive, rest),
            None => (line, ""),
        };
        match directive {
            "CONOK" => {
                let [session_id, request_limit, keepalive, control_link] =
                    fields::<4>("CONOK", rest)?;
                Ok(Self::ConOk {
                    session_id: unescape(session_id)?,
                    request_limit: parse_u64("CONOK", "request_limit", request_limit)?,
                    keepalive_millis: parse_u64("CONOK", "keepalive", keepalive)?,
                    control_link: match control_link {
                        "*" => None,
                        link => Some(unescape(link)?),
                    },
                })
            }
            "CONERR" => {
                let [code, message] = fields::<2>("CONERR", rest)?;
                Ok(Self::ConErr {
                    code: parse_u32("CONERR", "code", code)?,
                    message: unescape(message)?,
                })
            }
            "END" => {
                let [code, message] = fields::<2>("END", rest)?;
                Ok(Self::End {
                    code: parse_u32("END", "code", code)?,
                    message: unescape(message)?,
                })
            }
            "LOOP" => {
                let [delay] = fields::<1>("LOOP", rest)?;
                Ok(Self::Loop {
                    expected_delay_millis: parse_u64("LOOP", "delay", delay)?,
                })
            }
            "PROBE" => Ok(Self::Probe),
            "SYNC" => {
                let [secs] = fields::<1>("SYNC", rest)?;
                Ok(Self::Sync {
                    elapsed_secs: parse_u64("SYNC", "seconds", secs)?,
                })
            }
            "SERVNAME" => Ok(Self::ServName {
                name: unescape(rest)?,
            }),
            "CLIENTIP" => Ok(Self::ClientIp {
                address: unescape(rest)?,
            }),
            "NOOP" => Ok(Self::Noop {
                payload: rest.to_string(),
            }),
            "MSGDONE" => {
                let [sequence, prog] = fields::<2>("MSGDONE", rest)?;
                Ok(Self::MsgDone {
                    sequence: unescape(sequence)?,
                    prog: parse_u64("MSGDONE", "prog", prog)?,
                })
            }
            "MSGFAIL" => {
                let [sequence, prog, code, message] = fields::<4>("MSGFAIL", rest)?;
                Ok(Self::MsgFail {
                    sequence: unescape(sequence)?,
                    prog: parse_u64("MSGFAIL", "prog", prog)?,
                    code: code.parse().map_err(|_| CodecError::InvalidField {
                        directive: "MSGFAIL",
                        field: "code",
                    })?,
                    message: unescape(message)?,
                })
            }
            "U" => {
                let [sub_id, item, blob] = fields::<3>("U", rest)?;
                let field_values = blob
                    .split('|')
                    .map(FieldValue::decode)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Update {
                    sub_id: parse_u64("U", "sub_id", sub_id)?,
                    item: parse_u64("U", "item", item)?,
                    fields: field_values,
                })
            }
            "EOS" => {
                let [sub_id, item] = fields::<2>("EOS", rest)?;
                Ok(Self::EndOfSnapshot {
                    sub_id: parse_u64("EOS", "sub_id", sub_id)?,
                    item: parse_u64("EOS", "item", item)?,
                })
            }
            "CS" => {
                let [sub_id, item] = fields::<2>("CS", rest)?;
                Ok(Self::ClearSnapshot {
                    sub_id: parse_u64("CS", "sub_id", sub_id)?,
                    item: parse_u64("CS", "item", item)?,
                })
            }
            "OV" => {
                let [sub_id, item, lost] = fields::<3>("OV", rest)?;
                Ok(Self::Overflow {
                    sub_id: parse_u64("OV", "sub_id", sub_id)?,
                    item: parse_u64("OV", "item", item)?,
                    lost: parse_u64("OV", "lost", lost)?,
                })
            }
            "CONF" => {
                let [sub_id, frequency, filtering] = fields::<3>("CONF", rest)?;
                let max_frequency = if frequency == "unlimited" {
                    None
                } else {
                    Some(frequency.parse().map_err(|_| CodecError::InvalidField {
                        directive: "CONF",
                        field: "max_frequency",
                    })?)
                };
                let filtered = match filtering {
                    "filtered" => true,
                    "unfiltered" => false,
                    _ => {
                        return Err(CodecError::InvalidField {
                            directive: "CONF",
                            field: "filtering",
                        });
                    }
                };
                Ok(Self::Configuration {
                    sub_id: parse_u64("CONF", "sub_id", sub_id)?,
                    max_frequency,
                    filtered,
                })
            }
            "SUBOK" => {
                let [sub_id, num_items, num_fields] = fields::<3>("SUBOK", rest)?;
                Ok(Self::SubOk {
                    sub_id: parse_u64("SUBOK", "sub_id", sub_id)?,
                    num_items: parse_u64("SUBOK", "num_items", num_items)?,
                    num_fields: parse_u64("SUBOK", "num_fields", num_fields)?,
                })
            }
            "SUBCMD" => {
                let [sub_id, num_items, num_fields, key_pos, command_pos] =
                    fields::<5>("SUBCMD", rest)?;
                Ok(Self::SubCmd {
                    sub_id: parse_u64("SUBCMD", "sub_id", sub_id)?,
                    num_items: parse_u64("SUBCMD", "num_items", num_items)?,
                    num_fields: parse_u64("SUBCMD", "num_fields", num_fields)?,
                    key_pos: parse_u64("SUBCMD", "key_pos", key_pos)?,
                    command_pos: parse_u64("SUBCMD", "command_pos", command_pos)?,
                })
            }
            "UNSUB" => {
                let [sub_id] = fields::<1>("UNSUB", rest)?;
                Ok(Self::Unsub {
                    sub_id: parse_u64("UNSUB", "sub_id", sub_id)?,
                })
            }
            "REQOK" => {
                let [req_id] = fields::<1>("REQOK", rest)?;
                Ok(Self::ReqOk {
                    req_id: parse_u64("REQOK", "req_id", req_id)?,
                })
            }
            "REQERR" => {
                let [req_id, code, message] = fields::<3>("REQERR", rest)?;
                Ok(Self::ReqErr {
                    req_id: parse_u64("REQERR", "req_id", req_id)?,
                    code: parse_u32("REQERR", "code", code)?,
                    message: unescape(message)?,
                })
            }
            "ERROR" => {
                let [code, message] = fields::<2>("ERROR", rest)?;
                Ok(Self::Error {
                    code: parse_u32("ERROR", "code", code)?,
                    message: unescape(message)?,
                })
            }
            "MPNREG" => {
                let [device_id, adapter] = fields::<2>("MPNREG", rest)?;
                Ok(Self::MpnReg {
                    device_id: unescape(device_id)?,
                    adapter: unescape(adapter)?,
                })
            }
            "MPNOK" => {
                let [sub_id, mpn_sub_id] = fields::<2>("MPNOK", rest)?;
                Ok(Self::MpnOk {
                    sub_id: parse_u64("MPNOK", "sub_id", sub_id)?,
                    mpn_sub_id: unescape(mpn_sub_id)?,
                })
            }
            other => Err(CodecError::UnknownDirective(other.to_string())),
        }
    }

    /// Encode back to a wire line. Exact inverse of [`Notification::parse`].
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::ConOk {
                session_id,
                request_limit,
                keepalive_millis,
                control_link,
            } => {
                let link = control_link
                    .as_deref()
                    .map_or_else(|| "*".to_string(), |l| escape_field(l).into_owned());
                format!(
                    "CONOK,{},{request_limit},{keepalive_millis},{link}",
                    escape_field(session_id)
                )
            }
            Self::ConErr { code, message } => {
                format!("CONERR,{code},{}", escape_field(message))
            }
            Self::End { code, message } => format!("END,{code},{}", escape_field(message)),
            Self::Loop {
                expected_delay_millis,
            } => format!("LOOP,{expected_delay_millis}"),
            Self::Probe => "PROBE".to_string(),
            Self::Sync { elapsed_secs } => format!("SYNC,{elapsed_secs}"),
            Self::ServName { name } => format!("SERVNAME,{}", escape_field(name)),
            Self::ClientIp { address } => format!("CLIENTIP,{}", escape_field(address)),
            Self::Noop { payload } => format!("NOOP,{payload}"),
            Self::MsgDone { sequence, prog } => {
                format!("MSGDONE,{},{prog}", escape_field(sequence))
            }
            Self::MsgFail {
                sequence,
                prog,
                code,
                message,
            } => format!(
                "MSGFAIL,{},{prog},{code},{}",
                escape_field(sequence),
                escape_field(message)
            ),
            Self::Update {
                sub_id,
                item,
                fields,
            } => {
                let mut line = format!("U,{sub_id},{item},");
                for (index, field) in fields.iter().enumerate() {
                    if index > 0 {
                        line.push('|');
                    }
                    let _ = write!(line, "{}", field.encode());
                }
                line
            }
            Self::EndOfSnapshot { sub_id, item } => format!("EOS,{sub_id},{item}"),
            Self::ClearSnapshot { sub_id, item } => format!("CS,{sub_id},{item}"),
            Self::Overflow { sub_id, item, lost } => format!("OV,{sub_id},{item},{lost}"),
            Self::Configuration {
                sub_id,
                max_frequency,
                filtered,
            } => {
                let frequency = max_frequency
                    .map_or_else(|| "unlimited".to_string(), |f| f.to_string());
                let filtering = if *filtered { "filtered" } else { "unfiltered" };
                format!("CONF,{sub_id},{frequency},{filtering}")
            }
            Self::SubOk {
                sub_id,
                num_items,
                num_fields,
            } => format!("SUBOK,{sub_id},{num_items},{num_fields}"),
            Self::SubCmd {
                sub_id,
                num_items,
                num_fields,
                key_pos,
                command_pos,
            } => format!("SUBCMD,{sub_id},{num_items},{num_fields},{key_pos},{command_pos}"),
            Self::Unsub { sub_id } => format!("UNSUB,{sub_id}"),
            Self::ReqOk { req_id } => format!("REQOK,{req_id}"),
            Self::ReqErr {
                req_id,
                code,
                message,
            } => format!("REQERR,{req_id},{code},{}", escape_field(message)),
            Self::Error { code, message } => format!("ERROR,{code},{}", escape_field(message)),
            Self::MpnReg { device_id, adapter } => format!(
                "MPNREG,{},{}",
                escape_field(device_id),
                escape_field(adapter)
            ),
            Self::MpnOk { sub_id, mpn_sub_id } => {
                format!("MPNOK,{sub_id},{}", escape_field(mpn_sub_id))
            }
        }
    }
}

fn fields<'a, const N: usize>(
    directive: &'static str,
    rest: &'a str,
) -> Result<[&'a str; N], CodecError> {
    let mut out = [""; N];
    let mut pieces = rest.splitn(N, ',');
    for slot in &mut out {
        *slot = pieces.next().ok_or(CodecError::MissingField {
            directive,
            field: "(positional)",
        })?;
    }
    Ok(out)
}

fn parse_u64(directive: &'static str, field: &'static str, raw: &str) -> Result<u64, CodecError> {
    raw.parse()
        .map_err(|_| CodecError::InvalidField { directive, field })
}

fn parse_u32(directive: &'static str, field: &'static str, raw: &str) -> Result<u32, CodecError> {
    raw.parse()
        .map_err(|_| CodecError::InvalidField { directive, field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_lines_round_trip() {
        let lines = [
            "CONOK,S6dbc86d7a2b4,50000,5000,*",
            "CONOK,S6dbc86d7a2b4,50000,5000,control.example.com",
            "CONERR,41,sync error",
            "END,48,session expired",
            "LOOP,0",
            "PROBE",
            "SYNC,120",
            "SERVNAME,push-node-3",
            "CLIENTIP,10.0.0.17",
            "MSGDONE,orders,4",
            "MSGFAIL,orders,2,39,timeout exceeded",
            "U,3,1,10.5|#|$|unchanged%7Cnot",
            "U,3,2,",
            "EOS,3,1",
            "CS,3,2",
            "OV,3,1,15",
            "CONF,3,unlimited,filtered",
            "CONF,3,2.5,unfiltered",
            "SUBOK,3,2,4",
            "SUBCMD,4,1,5,1,2",
            "UNSUB,3",
            "REQOK,17",
            "REQERR,17,19,invalid group",
            "ERROR,60,client version not allowed",
            "MPNREG,DEV-4412,mpn-adapter",
            "MPNOK,5,SUB-991",
        ];
        for line in lines {
            let parsed = Notification::parse(line).unwrap();
            assert_eq!(parsed.encode(), line, "round-trip failed for {line}");
        }
    }

    #[test]
    fn update_field_semantics() {
        let parsed = Notification::parse("U,1,1,|#|$|42").unwrap();
        match parsed {
            Notification::Update { fields, .. } => {
                assert_eq!(
                    fields,
                    vec![
                        FieldValue::Unchanged,
                        FieldValue::Null,
                        FieldValue::Value(String::new()),
                        FieldValue::Value("42".to_string()),
                    ]
                );
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn conok_star_means_no_control_link() {
        match Notification::parse("CONOK,Sid,50000,5000,*").unwrap() {
            Notification::ConOk { control_link, .. } => assert!(control_link.is_none()),
            other => panic!("expected CONOK, got {other:?}"),
        }
    }

    #[test]
    fn unknown_directive_is_surfaced() {
        assert!(matches!(
            Notification::parse("WARP,9"),
            Err(CodecError::UnknownDirective(name)) if name == "WARP"
        ));
    }

    #[test]
    fn trailing_carriage_return_is_tolerated() {
        assert_eq!(Notification::parse("PROBE\r").unwrap(), Notification::Probe);
    }

    #[test]
    fn escaped_message_decodes() {
        match Notification::parse("CONERR,41,sync error%2C resuming").unwrap() {
            Notification::ConErr { message, .. } => {
                assert_eq!(message, "sync error, resuming");
            }
            other => panic!("expected CONERR, got {other:?}"),
        }
    }

    #[test]
    fn empty_line_is_rejected() {
        assert!(matches!(Notification::parse(""), Err(CodecError::Empty)));
    }
}
