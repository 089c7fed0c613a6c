use serde_json::{json, Value};
use thiserror::Error;
use umbrette_core::nostr::{parse_event, RawEvent};

use crate::filters::{parse_filters, Filter};

/// The four client-to-relay message shapes defined by NIP-01 (plus NIP-45
/// COUNT). Arity and field types are validated here, once; handlers only ever
/// see well-typed values.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Event(RawEvent),
    Close {
        subscription_id: String,
    },
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
}

/// Relay-to-client message shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: RawEvent,
    },
    Eose {
        subscription_id: String,
    },
    Closed {
        subscription_id: String,
        reason: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        reason: String,
    },
    Count {
        subscription_id: String,
        count: u64,
        approximate: bool,
    },
    Notice {
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Malformed(String),
}

fn malformed(message: impl Into<String>) -> ParseError {
    ParseError::Malformed(message.into())
}

pub fn parse_client_message(raw: &str) -> Result<ClientMessage, ParseError> {
    let value: Value = serde_json::from_str(raw)?;
    let arr = value
        .as_array()
        .ok_or_else(|| malformed("message must be an array"))?;
    let tag = arr
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing message type"))?;

    match tag {
        "REQ" => {
            let subscription_id = subscription_id(arr)?;
            if arr.len() < 3 {
                return Err(malformed("missing filters"));
            }
            let filters = parse_filters(&arr[2..]).map_err(|err| malformed(err.to_string()))?;
            Ok(ClientMessage::Req {
                subscription_id,
                filters,
            })
        }
        "EVENT" => {
            if arr.len() != 2 {
                return Err(malformed("EVENT takes exactly one event"));
            }
            let event = parse_event(&arr[1]).map_err(|err| malformed(err.to_string()))?;
            Ok(ClientMessage::Event(event))
        }
        "CLOSE" => {
            if arr.len() != 2 {
                return Err(malformed("CLOSE takes exactly one subscription id"));
            }
            let subscription_id = subscription_id(arr)?;
            Ok(ClientMessage::Close { subscription_id })
        }
        "COUNT" => {
            let subscription_id = subscription_id(arr)?;
            if arr.len() < 3 {
                return Err(malformed("missing filters"));
            }
            let filters = parse_filters(&arr[2..]).map_err(|err| malformed(err.to_string()))?;
            Ok(ClientMessage::Count {
                subscription_id,
                filters,
            })
        }
        other => Err(malformed(format!("unknown message type {other}"))),
    }
}

fn subscription_id(arr: &[Value]) -> Result<String, ParseError> {
    arr.get(1)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| malformed("missing subscription id"))
}

impl RelayMessage {
    /// Pure and total: every well-formed message serializes.
    pub fn to_json(&self) -> Value {
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                reason,
            } => json!(["CLOSED", subscription_id, reason]),
            RelayMessage::Ok {
                event_id,
                accepted,
                reason,
            } => json!(["OK", event_id, accepted, reason]),
            RelayMessage::Count {
                subscription_id,
                count,
                approximate,
            } => json!([
                "COUNT",
                subscription_id,
                { "count": count, "approximate": approximate }
            ]),
            RelayMessage::Notice { message } => json!(["NOTICE", message]),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        RelayMessage::Notice {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_req_with_filters() {
        let msg = parse_client_message(r#"["REQ", "sub1", {"kinds": [1]}, {"limit": 5}]"#)
            .expect("REQ should parse");
        match msg {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(filters.len(), 2);
                assert_eq!(filters[0].kinds.as_deref(), Some(&[1][..]));
                assert_eq!(filters[1].limit, Some(5));
            }
            other => panic!("expected REQ, got {other:?}"),
        }
    }

    #[test]
    fn parses_close_and_count() {
        assert_eq!(
            parse_client_message(r#"["CLOSE", "sub1"]"#).expect("CLOSE should parse"),
            ClientMessage::Close {
                subscription_id: "sub1".into()
            }
        );

        let msg = parse_client_message(r#"["COUNT", "sub1", {}]"#).expect("COUNT should parse");
        assert!(matches!(msg, ClientMessage::Count { .. }));
    }

    #[test]
    fn parses_event_message() {
        let event = json!({
            "id": "00", "pubkey": "ab", "created_at": 1, "kind": 1,
            "tags": [], "content": "hi", "sig": "00"
        });
        let raw = json!(["EVENT", event]).to_string();
        let msg = parse_client_message(&raw).expect("EVENT should parse");
        match msg {
            ClientMessage::Event(event) => assert_eq!(event.content, "hi"),
            other => panic!("expected EVENT, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_json_and_non_array_frames() {
        assert!(parse_client_message("not json").is_err());
        assert!(parse_client_message(r#"{"type": "REQ"}"#).is_err());
        assert!(parse_client_message("[]").is_err());
    }

    #[test]
    fn rejects_unknown_message_types() {
        let err = parse_client_message(r#"["AUTH", "challenge"]"#).unwrap_err();
        assert_eq!(err.to_string(), "unknown message type AUTH");
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(parse_client_message(r#"["REQ", "sub1"]"#).is_err());
        assert!(parse_client_message(r#"["CLOSE", "sub1", "extra"]"#).is_err());
        assert!(parse_client_message(r#"["EVENT"]"#).is_err());
        assert!(parse_client_message(r#"["COUNT", "sub1"]"#).is_err());
    }

    #[test]
    fn rejects_schema_invalid_payloads() {
        assert!(parse_client_message(r#"["REQ", 42, {}]"#).is_err());
        assert!(parse_client_message(r#"["EVENT", {"id": "00"}]"#).is_err());
    }

    #[test]
    fn serializes_relay_messages_to_nip01_shapes() {
        let eose = RelayMessage::Eose {
            subscription_id: "sub1".into(),
        };
        assert_eq!(eose.to_json(), json!(["EOSE", "sub1"]));

        let ok = RelayMessage::Ok {
            event_id: "00".into(),
            accepted: false,
            reason: "duplicate: already have this event".into(),
        };
        assert_eq!(
            ok.to_json(),
            json!(["OK", "00", false, "duplicate: already have this event"])
        );

        let count = RelayMessage::Count {
            subscription_id: "sub1".into(),
            count: 12,
            approximate: false,
        };
        assert_eq!(
            count.to_json(),
            json!(["COUNT", "sub1", { "count": 12, "approximate": false }])
        );
    }
}
