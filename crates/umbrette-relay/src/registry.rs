use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use umbrette_core::nostr::RawEvent;

use crate::filters::{matches_filter, Filter};

/// Per-connection subscription table. Owned by exactly one connection; never
/// visible to another connection's tasks.
///
/// Each entry keeps the client's filters for live broadcast matching and, at
/// most, one cancellation handle for the in-flight backlog query. A repeated
/// REQ under the same id cancels the previous handle before installing the
/// new one.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Subscription>,
    next_generation: u64,
}

struct Subscription {
    filters: Vec<Filter>,
    query: Option<ActiveQuery>,
}

struct ActiveQuery {
    token: CancellationToken,
    generation: u64,
}

/// Handed to the query task that `begin` started. The generation ties the
/// guard to the registry entry it created, so a superseded task's cleanup
/// cannot disturb its successor.
pub struct QueryGuard {
    pub subscription_id: String,
    pub token: CancellationToken,
    generation: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription and its query cancellation handle. Any prior
    /// handle under the same id is canceled first; replacement never errors.
    pub fn begin(&mut self, subscription_id: &str, filters: Vec<Filter>) -> QueryGuard {
        self.next_generation += 1;
        let generation = self.next_generation;
        let token = CancellationToken::new();

        let previous = self.entries.insert(
            subscription_id.to_string(),
            Subscription {
                filters,
                query: Some(ActiveQuery {
                    token: token.clone(),
                    generation,
                }),
            },
        );
        if let Some(query) = previous.and_then(|sub| sub.query) {
            query.token.cancel();
        }

        QueryGuard {
            subscription_id: subscription_id.to_string(),
            token,
            generation,
        }
    }

    /// Query completed normally: drop the handle, keep the subscription live
    /// for broadcast delivery.
    pub fn finish(&mut self, guard: &QueryGuard) {
        if let Some(sub) = self.entries.get_mut(&guard.subscription_id) {
            if sub
                .query
                .as_ref()
                .is_some_and(|query| query.generation == guard.generation)
            {
                sub.query = None;
            }
        }
    }

    /// Query failed: remove the whole entry. A failed REQ leaves no dangling
    /// subscription.
    pub fn remove(&mut self, guard: &QueryGuard) {
        if let Some(sub) = self.entries.get(&guard.subscription_id) {
            if sub
                .query
                .as_ref()
                .is_some_and(|query| query.generation == guard.generation)
            {
                self.entries.remove(&guard.subscription_id);
            }
        }
    }

    /// Cancel and forget a subscription. Tolerates unknown ids.
    pub fn cancel(&mut self, subscription_id: &str) {
        if let Some(sub) = self.entries.remove(subscription_id) {
            if let Some(query) = sub.query {
                query.token.cancel();
            }
        }
    }

    /// Connection close: cancel everything, exactly once per handle.
    pub fn cancel_all(&mut self) {
        for (_, sub) in self.entries.drain() {
            if let Some(query) = sub.query {
                query.token.cancel();
            }
        }
    }

    /// Subscription ids whose filters match the event, for broadcast fan-out.
    pub fn matching(&self, event: &RawEvent) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, sub)| {
                sub.filters
                    .iter()
                    .any(|filter| matches_filter(filter, event))
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.entries.contains_key(subscription_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
