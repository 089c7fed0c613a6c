use nostr_sdk::prelude::{EventBuilder, Keys, Kind, Tag, TagKind, Timestamp};
use umbrette_core::nostr::{parse_event, RawEvent};

pub(crate) fn build_event_at(
    keys: &Keys,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    created_at: i64,
) -> RawEvent {
    let mut builder = EventBuilder::new(Kind::Custom(kind), content)
        .custom_created_at(Timestamp::from_secs(created_at.max(0) as u64));
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
    let signed = builder.sign_with_keys(keys).expect("sign event");
    let value = serde_json::to_value(&signed).expect("event json");
    parse_event(&value).expect("parse event")
}
