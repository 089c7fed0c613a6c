use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use umbrette_core::nostr::RawEvent;

const MAX_FILTER_VALUES: usize = 200;
const MAX_LIMIT: i64 = 1000;

/// A NIP-01 filter: a conjunction of constraints, each constraint a
/// disjunction over its listed values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<i64>,
    pub tags: HashMap<String, Vec<String>>,
}

pub fn parse_filters(values: &[Value]) -> Result<Vec<Filter>> {
    if values.is_empty() {
        return Err(anyhow!("missing filters"));
    }

    let mut filters = Vec::new();
    for value in values {
        let map = value
            .as_object()
            .ok_or_else(|| anyhow!("filter must be an object"))?;

        let ids = parse_string_list(map.get("ids"))?;
        let authors = parse_string_list(map.get("authors"))?;
        let kinds = parse_u32_list(map.get("kinds"))?;
        let since = map.get("since").and_then(|v| v.as_i64());
        let until = map.get("until").and_then(|v| v.as_i64());
        let limit = map
            .get("limit")
            .and_then(|v| v.as_i64())
            .map(|value| value.clamp(1, MAX_LIMIT));

        let mut tags = HashMap::new();
        for (key, value) in map {
            if !key.starts_with('#') {
                continue;
            }
            let tag = key.trim_start_matches('#').to_string();
            let values = parse_string_list(Some(value))?.unwrap_or_default();
            if values.len() > MAX_FILTER_VALUES {
                return Err(anyhow!("too many values for tag {tag}"));
            }
            tags.insert(tag, values);
        }

        filters.push(Filter {
            ids,
            authors,
            kinds,
            since,
            until,
            limit,
            tags,
        });
    }

    Ok(filters)
}

fn parse_string_list(value: Option<&Value>) -> Result<Option<Vec<String>>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let list = value
        .as_array()
        .ok_or_else(|| anyhow!("expected array"))?
        .iter()
        .filter_map(|item| item.as_str().map(|s| s.to_string()))
        .collect::<Vec<_>>();
    if list.len() > MAX_FILTER_VALUES {
        return Err(anyhow!("too many filter values"));
    }
    Ok(Some(list))
}

fn parse_u32_list(value: Option<&Value>) -> Result<Option<Vec<u32>>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let list = value
        .as_array()
        .ok_or_else(|| anyhow!("expected array"))?
        .iter()
        .filter_map(|item| item.as_u64().and_then(|v| u32::try_from(v).ok()))
        .collect::<Vec<_>>();
    if list.len() > MAX_FILTER_VALUES {
        return Err(anyhow!("too many filter values"));
    }
    Ok(Some(list))
}

pub fn matches_filter(filter: &Filter, event: &RawEvent) -> bool {
    if let Some(ids) = &filter.ids {
        if !ids.iter().any(|id| id == &event.id) {
            return false;
        }
    }
    if let Some(authors) = &filter.authors {
        if !authors.iter().any(|author| author == &event.pubkey) {
            return false;
        }
    }
    if let Some(kinds) = &filter.kinds {
        if !kinds.contains(&event.kind) {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if event.created_at < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if event.created_at > until {
            return false;
        }
    }

    for (tag, values) in &filter.tags {
        let event_values = event.tag_values(tag);
        if !values.iter().any(|value| event_values.contains(value)) {
            return false;
        }
    }

    true
}
