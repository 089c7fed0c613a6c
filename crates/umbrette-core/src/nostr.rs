use anyhow::{anyhow, Result};
use nostr_sdk::prelude::{Event as NostrEvent, EventBuilder, JsonUtil, Keys, Kind, Tag, TagKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const KIND_DELETION: u32 = 5;

/// A NIP-01 event exactly as it appears on the wire. Never mutated by the
/// relay; signature verification goes through [`verify_event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl RawEvent {
    pub fn tag_values(&self, name: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter_map(|tag| {
                if tag.first().map(|v| v.as_str()) == Some(name) {
                    tag.get(1).cloned()
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn first_tag_value(&self, name: &str) -> Option<String> {
        self.tags.iter().find_map(|tag| {
            if tag.first().map(|v| v.as_str()) == Some(name) {
                tag.get(1).cloned()
            } else {
                None
            }
        })
    }

    pub fn d_tag(&self) -> Option<String> {
        self.first_tag_value("d")
    }

    /// NIP-40 expiration timestamp, if the event carries one.
    pub fn expiration_tag(&self) -> Option<i64> {
        self.first_tag_value("expiration")
            .and_then(|value| value.parse::<i64>().ok())
    }
}

/// Ephemeral events are broadcast but never persisted.
pub fn is_ephemeral_kind(kind: u32) -> bool {
    (20000..30000).contains(&kind)
}

/// Replaceable events supersede the stored event of the same pubkey and kind.
pub fn is_replaceable_kind(kind: u32) -> bool {
    kind == 0 || kind == 3 || (10000..20000).contains(&kind)
}

/// Parameterized replaceable events supersede on (pubkey, kind, d-tag).
pub fn is_addressable_kind(kind: u32) -> bool {
    (30000..40000).contains(&kind)
}

pub fn parse_event(value: &Value) -> Result<RawEvent> {
    serde_json::from_value(value.clone()).map_err(|err| anyhow!("invalid event json: {err}"))
}

/// Check the event id and Schnorr signature.
pub fn verify_event(raw: &RawEvent) -> Result<()> {
    let event = to_nostr_event(raw)?;
    event
        .verify()
        .map_err(|err| anyhow!("event verify failed: {err}"))?;
    Ok(())
}

pub fn to_nostr_event(raw: &RawEvent) -> Result<NostrEvent> {
    let json = serde_json::to_string(raw)?;
    NostrEvent::from_json(json).map_err(|err| anyhow!("failed to parse nostr event: {err}"))
}

pub fn build_signed_event(
    keys: &Keys,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
) -> Result<RawEvent> {
    let mut builder = EventBuilder::new(Kind::Custom(kind), content);
    for tag in tags {
        if tag.is_empty() {
            continue;
        }
        let kind = TagKind::from(tag[0].as_str());
        let values = if tag.len() > 1 {
            tag[1..].to_vec()
        } else {
            Vec::new()
        };
        builder = builder.tag(Tag::custom(kind, values));
    }
    let signed = builder.sign_with_keys(keys)?;
    let value = serde_json::to_value(&signed)?;
    parse_event(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tag_values_collects_matching_tags() {
        let event = RawEvent {
            id: "00".into(),
            pubkey: "ab".into(),
            created_at: 1,
            kind: 1,
            tags: vec![
                vec!["e".into(), "aaa".into()],
                vec!["p".into(), "bbb".into()],
                vec!["e".into(), "ccc".into()],
                vec!["e".into()],
            ],
            content: String::new(),
            sig: "00".into(),
        };
        assert_eq!(event.tag_values("e"), vec!["aaa", "ccc"]);
        assert_eq!(event.first_tag_value("p").as_deref(), Some("bbb"));
        assert_eq!(event.first_tag_value("t"), None);
    }

    #[test]
    fn parse_event_rejects_incomplete_json() {
        let err = parse_event(&json!({ "id": "00" })).unwrap_err();
        assert!(err.to_string().starts_with("invalid event json"));
    }

    #[test]
    fn kind_classes() {
        assert!(is_ephemeral_kind(20001));
        assert!(!is_ephemeral_kind(30000));
        assert!(is_replaceable_kind(0));
        assert!(is_replaceable_kind(10002));
        assert!(!is_replaceable_kind(1));
        assert!(is_addressable_kind(30023));
        assert!(!is_addressable_kind(40000));
    }

    #[test]
    fn signed_events_verify_and_tampered_events_do_not() {
        let keys = Keys::generate();
        let event = build_signed_event(&keys, 1, vec![vec!["t".into(), "test".into()]], "hi".into())
            .expect("build event");
        verify_event(&event).expect("fresh signature verifies");

        let mut tampered = event;
        tampered.content = "changed".into();
        assert!(verify_event(&tampered).is_err());
    }
}
