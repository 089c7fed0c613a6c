use serde::Serialize;

use crate::config::RelayConfig;

/// NIP-11 relay information document, served on `GET /` when the client asks
/// for `application/nostr+json` instead of upgrading.
#[derive(Debug, Serialize)]
pub struct RelayInformation {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub software: String,
    pub version: String,
    pub supported_nips: Vec<u16>,
    pub limitation: Limitation,
}

#[derive(Debug, Serialize)]
pub struct Limitation {
    pub max_filters: usize,
    pub max_limit: usize,
    pub max_event_bytes: usize,
    pub auth_required: bool,
    pub payment_required: bool,
}

pub fn relay_information(config: &RelayConfig) -> RelayInformation {
    RelayInformation {
        name: config.name.clone(),
        description: config.description.clone(),
        contact: config.contact.clone(),
        software: "https://github.com/umbrette/umbrette".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        supported_nips: vec![1, 9, 11, 40, 45],
        limitation: Limitation {
            max_filters: config.max_filters,
            max_limit: config.query_limit,
            max_event_bytes: config.max_event_bytes,
            auth_required: false,
            payment_required: false,
        },
    }
}
