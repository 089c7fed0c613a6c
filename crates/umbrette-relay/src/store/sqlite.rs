use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, QueryBuilder, Row, Sqlite, Transaction};
use std::cmp::Ordering;
use std::collections::HashSet;
use umbrette_core::error::RelayError;
use umbrette_core::nostr::{
    is_addressable_kind, is_ephemeral_kind, is_replaceable_kind, verify_event, RawEvent,
    KIND_DELETION,
};
use umbrette_core::time;

use super::{EventStore, EventStream, QueryOptions, StoreError};
use crate::filters::Filter;

/// Ingestion limits enforced before anything touches the database.
#[derive(Clone, Copy, Debug)]
pub struct StoreLimits {
    pub max_event_bytes: usize,
    pub max_tags: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_event_bytes: 32 * 1024,
            max_tags: 200,
        }
    }
}

pub async fn connect(database_url: &str) -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Durable event storage on SQLite. Handles signature validation, duplicate
/// detection, replaceable/ephemeral/expiring kinds and NIP-09 deletions;
/// queries follow NIP-01 filter semantics.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    limits: StoreLimits,
}

impl SqliteStore {
    pub fn new(pool: Pool<Sqlite>, limits: StoreLimits) -> Self {
        Self { pool, limits }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                d_tag TEXT,
                raw_json TEXT NOT NULL,
                expires_at INTEGER,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_current INTEGER NOT NULL DEFAULT 1
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_created_at \
             ON events (created_at DESC, id ASC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_author_kind ON events (pubkey, kind)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS event_tags (
                event_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_event_tags_name_value \
             ON event_tags (name, value)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_filter(
        &self,
        filter: &Filter,
        now: i64,
        max_limit: usize,
    ) -> Result<Vec<RawEvent>, StoreError> {
        let limit = filter
            .limit
            .map(|value| (value.max(0) as usize).min(max_limit))
            .unwrap_or(max_limit);

        let mut builder = build_filter_query("raw_json", filter, now);
        builder.push(" ORDER BY created_at DESC, id ASC LIMIT ");
        builder.push_bind(limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_json: String = row.try_get("raw_json")?;
            let event: RawEvent =
                serde_json::from_str(&raw_json).map_err(|err| StoreError::Other(err.into()))?;
            events.push(event);
        }
        Ok(events)
    }

    async fn fetch_ids(&self, filter: &Filter, now: i64) -> Result<Vec<String>, StoreError> {
        let mut builder = build_filter_query("id", filter, now);
        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get::<String, _>("id")?);
        }
        Ok(ids)
    }

    fn validate(&self, event: &RawEvent, now: i64) -> Result<(), StoreError> {
        let raw_size = serde_json::to_vec(event)
            .map_err(|err| StoreError::Other(err.into()))?
            .len();
        if raw_size > self.limits.max_event_bytes {
            return Err(RelayError::invalid("event too large").into());
        }
        if event.tags.len() > self.limits.max_tags {
            return Err(RelayError::invalid("too many tags").into());
        }
        if let Err(err) = verify_event(event) {
            return Err(RelayError::invalid(format!("signature failed ({err})")).into());
        }
        if let Some(expires_at) = event.expiration_tag() {
            if expires_at <= now {
                return Err(RelayError::invalid("event expired").into());
            }
        }
        Ok(())
    }

    /// Mark the stored event of the same (pubkey, kind[, d-tag]) as no longer
    /// current; rejects the incoming event when the stored one is newer.
    async fn supersede(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event: &RawEvent,
        d_tag: Option<&str>,
    ) -> Result<(), StoreError> {
        let current = match d_tag {
            Some(d_tag) => {
                sqlx::query(
                    "SELECT id, created_at FROM events \
                     WHERE pubkey = ? AND kind = ? AND d_tag = ? AND is_current = 1",
                )
                .bind(&event.pubkey)
                .bind(event.kind as i64)
                .bind(d_tag)
                .fetch_optional(&mut **tx)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, created_at FROM events \
                     WHERE pubkey = ? AND kind = ? AND d_tag IS NULL AND is_current = 1",
                )
                .bind(&event.pubkey)
                .bind(event.kind as i64)
                .fetch_optional(&mut **tx)
                .await?
            }
        };

        if let Some(row) = current {
            let current_id: String = row.try_get("id")?;
            let current_created_at: i64 = row.try_get("created_at")?;
            if current_id == event.id {
                return Err(RelayError::duplicate("already have this event").into());
            }
            if current_created_at >= event.created_at {
                return Err(RelayError::duplicate("have a newer event").into());
            }
            sqlx::query("UPDATE events SET is_current = 0 WHERE id = ?")
                .bind(&current_id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    /// NIP-09: a deletion event hides the referenced events of its author.
    async fn apply_deletion(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event: &RawEvent,
    ) -> Result<(), StoreError> {
        let targets = event.tag_values("e");
        if targets.is_empty() {
            return Ok(());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new("UPDATE events SET is_deleted = 1 WHERE pubkey = ");
        builder.push_bind(event.pubkey.clone());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for target in targets {
            separated.push_bind(target);
        }
        separated.push_unseparated(")");
        builder.build().execute(&mut **tx).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn query(
        &self,
        filters: Vec<Filter>,
        options: QueryOptions,
    ) -> Result<EventStream, StoreError> {
        let now = time::unix_seconds().map_err(StoreError::Other)?;

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for filter in &filters {
            for event in self.fetch_filter(filter, now, options.limit).await? {
                if seen.insert(event.id.clone()) {
                    events.push(event);
                }
            }
        }
        events.sort_unstable_by(compare_stored_events);
        events.truncate(options.limit);

        Ok(futures_util::stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn save(&self, event: &RawEvent) -> Result<(), StoreError> {
        let now = time::unix_seconds().map_err(StoreError::Other)?;
        self.validate(event, now)?;

        if is_ephemeral_kind(event.kind) {
            // Accepted for broadcast, never persisted.
            return Ok(());
        }

        let d_tag = if is_addressable_kind(event.kind) {
            Some(event.d_tag().unwrap_or_default())
        } else {
            None
        };

        let mut tx = self.pool.begin().await?;

        if event.kind == KIND_DELETION {
            self.apply_deletion(&mut tx, event).await?;
        }
        if is_replaceable_kind(event.kind) || is_addressable_kind(event.kind) {
            self.supersede(&mut tx, event, d_tag.as_deref()).await?;
        }

        let raw_json =
            serde_json::to_string(event).map_err(|err| StoreError::Other(err.into()))?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO events \
             (id, pubkey, created_at, kind, d_tag, raw_json, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.created_at)
        .bind(event.kind as i64)
        .bind(&d_tag)
        .bind(&raw_json)
        .bind(event.expiration_tag())
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(RelayError::duplicate("already have this event").into());
        }

        for tag in &event.tags {
            if tag.len() < 2 || tag[0].is_empty() {
                continue;
            }
            sqlx::query("INSERT INTO event_tags (event_id, name, value) VALUES (?, ?, ?)")
                .bind(&event.id)
                .bind(&tag[0])
                .bind(&tag[1])
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn count(&self, filters: Vec<Filter>) -> Result<u64, StoreError> {
        let now = time::unix_seconds().map_err(StoreError::Other)?;
        let mut seen: HashSet<String> = HashSet::new();
        for filter in &filters {
            seen.extend(self.fetch_ids(filter, now).await?);
        }
        Ok(seen.len() as u64)
    }

    async fn ready(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn compare_stored_events(a: &RawEvent, b: &RawEvent) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

fn build_filter_query(
    columns: &str,
    filter: &Filter,
    now: i64,
) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {columns} FROM events WHERE is_deleted = 0 AND is_current = 1"
    ));
    builder.push(" AND (expires_at IS NULL OR expires_at > ");
    builder.push_bind(now);
    builder.push(")");

    push_string_list(&mut builder, "id", filter.ids.as_deref());
    push_string_list(&mut builder, "pubkey", filter.authors.as_deref());

    match filter.kinds.as_deref() {
        Some([]) => {
            builder.push(" AND 1 = 0");
        }
        Some(kinds) => {
            builder.push(" AND kind IN (");
            let mut separated = builder.separated(", ");
            for kind in kinds {
                separated.push_bind(*kind as i64);
            }
            separated.push_unseparated(")");
        }
        None => {}
    }

    if let Some(since) = filter.since {
        builder.push(" AND created_at >= ");
        builder.push_bind(since);
    }
    if let Some(until) = filter.until {
        builder.push(" AND created_at <= ");
        builder.push_bind(until);
    }

    for (name, values) in &filter.tags {
        if values.is_empty() {
            builder.push(" AND 1 = 0");
            continue;
        }
        builder.push(" AND id IN (SELECT event_id FROM event_tags WHERE name = ");
        builder.push_bind(name.clone());
        builder.push(" AND value IN (");
        let mut separated = builder.separated(", ");
        for value in values {
            separated.push_bind(value.clone());
        }
        separated.push_unseparated("))");
    }

    builder
}

fn push_string_list(
    builder: &mut QueryBuilder<'static, Sqlite>,
    column: &str,
    values: Option<&[String]>,
) {
    match values {
        Some([]) => {
            builder.push(" AND 1 = 0");
        }
        Some(values) => {
            builder.push(format!(" AND {column} IN ("));
            let mut separated = builder.separated(", ");
            for value in values {
                separated.push_bind(value.clone());
            }
            separated.push_unseparated(")");
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::build_event_at;
    use futures_util::TryStreamExt;
    use nostr_sdk::prelude::Keys;
    use std::time::Duration;

    async fn memory_store() -> SqliteStore {
        memory_store_with_limits(StoreLimits::default()).await
    }

    async fn memory_store_with_limits(limits: StoreLimits) -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory database");
        let store = SqliteStore::new(pool, limits);
        store.init().await.expect("initialize schema");
        store
    }

    fn options() -> QueryOptions {
        QueryOptions {
            limit: 100,
            timeout: Duration::from_secs(1),
        }
    }

    async fn collect(store: &SqliteStore, filter: Filter) -> Vec<RawEvent> {
        let stream = store
            .query(vec![filter], options())
            .await
            .expect("query store");
        stream.try_collect().await.expect("drain stream")
    }

    fn kind_filter(kind: u32) -> Filter {
        Filter {
            kinds: Some(vec![kind]),
            ..Filter::default()
        }
    }

    fn relay_error(err: StoreError) -> RelayError {
        match err {
            StoreError::Relay(err) => err,
            other => panic!("expected relay error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_and_query_orders_newest_first() {
        let store = memory_store().await;
        let keys = Keys::generate();
        let old = build_event_at(&keys, 1, Vec::new(), "old".into(), 100);
        let new = build_event_at(&keys, 1, Vec::new(), "new".into(), 200);

        store.save(&old).await.expect("save old");
        store.save(&new).await.expect("save new");

        let events = collect(&store, kind_filter(1)).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].content, "new");
        assert_eq!(events[1].content, "old");
    }

    #[tokio::test]
    async fn query_applies_filter_limit() {
        let store = memory_store().await;
        let keys = Keys::generate();
        for i in 0..5 {
            let event = build_event_at(&keys, 1, Vec::new(), format!("n{i}"), 100 + i);
            store.save(&event).await.expect("save event");
        }

        let filter = Filter {
            kinds: Some(vec![1]),
            limit: Some(2),
            ..Filter::default()
        };
        let events = collect(&store, filter).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].content, "n4");
    }

    #[tokio::test]
    async fn query_matches_tag_constraints() {
        let store = memory_store().await;
        let keys = Keys::generate();
        let tagged = build_event_at(
            &keys,
            1,
            vec![vec!["t".into(), "news".into()]],
            "tagged".into(),
            100,
        );
        let plain = build_event_at(&keys, 1, Vec::new(), "plain".into(), 101);
        store.save(&tagged).await.expect("save tagged");
        store.save(&plain).await.expect("save plain");

        let mut filter = kind_filter(1);
        filter.tags.insert("t".into(), vec!["news".into()]);
        let events = collect(&store, filter).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, "tagged");
    }

    #[tokio::test]
    async fn duplicate_save_is_rejected() {
        let store = memory_store().await;
        let keys = Keys::generate();
        let event = build_event_at(&keys, 1, Vec::new(), "hello".into(), 100);

        store.save(&event).await.expect("first save");
        let err = relay_error(store.save(&event).await.unwrap_err());
        assert_eq!(err.prefix, "duplicate");
    }

    #[tokio::test]
    async fn tampered_event_is_rejected_as_invalid() {
        let store = memory_store().await;
        let keys = Keys::generate();
        let mut event = build_event_at(&keys, 1, Vec::new(), "hello".into(), 100);
        event.content = "tampered".into();

        let err = relay_error(store.save(&event).await.unwrap_err());
        assert_eq!(err.prefix, "invalid");
    }

    #[tokio::test]
    async fn oversized_event_is_rejected_before_verification() {
        let store = memory_store_with_limits(StoreLimits {
            max_event_bytes: 64,
            max_tags: 200,
        })
        .await;
        let keys = Keys::generate();
        let event = build_event_at(&keys, 1, Vec::new(), "x".repeat(256), 100);

        let err = relay_error(store.save(&event).await.unwrap_err());
        assert_eq!(err.to_string(), "invalid: event too large");
    }

    #[tokio::test]
    async fn expired_event_is_rejected() {
        let store = memory_store().await;
        let keys = Keys::generate();
        let event = build_event_at(
            &keys,
            1,
            vec![vec!["expiration".into(), "1".into()]],
            "stale".into(),
            100,
        );

        let err = relay_error(store.save(&event).await.unwrap_err());
        assert_eq!(err.to_string(), "invalid: event expired");
    }

    #[tokio::test]
    async fn ephemeral_events_are_accepted_but_not_persisted() {
        let store = memory_store().await;
        let keys = Keys::generate();
        let event = build_event_at(&keys, 20001, Vec::new(), "gone".into(), 100);

        store.save(&event).await.expect("ephemeral accepted");
        assert!(collect(&store, kind_filter(20001)).await.is_empty());
    }

    #[tokio::test]
    async fn replaceable_event_supersedes_older_one() {
        let store = memory_store().await;
        let keys = Keys::generate();
        let old = build_event_at(&keys, 0, Vec::new(), "old profile".into(), 100);
        let new = build_event_at(&keys, 0, Vec::new(), "new profile".into(), 200);

        store.save(&old).await.expect("save old");
        store.save(&new).await.expect("save new");

        let events = collect(&store, kind_filter(0)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, "new profile");

        let stale = build_event_at(&keys, 0, Vec::new(), "stale profile".into(), 50);
        let err = relay_error(store.save(&stale).await.unwrap_err());
        assert_eq!(err.to_string(), "duplicate: have a newer event");
    }

    #[tokio::test]
    async fn addressable_events_replace_per_d_tag() {
        let store = memory_store().await;
        let keys = Keys::generate();
        let d_tag = |d: &str| vec![vec!["d".to_string(), d.to_string()]];
        let first = build_event_at(&keys, 30023, d_tag("post-a"), "a v1".into(), 100);
        let second = build_event_at(&keys, 30023, d_tag("post-a"), "a v2".into(), 200);
        let other = build_event_at(&keys, 30023, d_tag("post-b"), "b v1".into(), 150);

        store.save(&first).await.expect("save first");
        store.save(&other).await.expect("save other");
        store.save(&second).await.expect("replace first");

        let mut events = collect(&store, kind_filter(30023)).await;
        events.sort_by(|a, b| a.content.cmp(&b.content));
        let contents: Vec<_> = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["a v2", "b v1"]);
    }

    #[tokio::test]
    async fn deletion_hides_only_the_authors_events() {
        let store = memory_store().await;
        let author = Keys::generate();
        let stranger = Keys::generate();
        let target = build_event_at(&author, 1, Vec::new(), "to delete".into(), 100);
        let unrelated = build_event_at(&stranger, 1, Vec::new(), "stays".into(), 100);
        store.save(&target).await.expect("save target");
        store.save(&unrelated).await.expect("save unrelated");

        // A stranger cannot delete someone else's event.
        let foreign_delete = build_event_at(
            &stranger,
            5,
            vec![vec!["e".into(), target.id.clone()]],
            String::new(),
            200,
        );
        store.save(&foreign_delete).await.expect("save deletion");
        assert_eq!(collect(&store, kind_filter(1)).await.len(), 2);

        let own_delete = build_event_at(
            &author,
            5,
            vec![vec!["e".into(), target.id.clone()]],
            String::new(),
            201,
        );
        store.save(&own_delete).await.expect("save deletion");
        let remaining = collect(&store, kind_filter(1)).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "stays");
    }

    #[tokio::test]
    async fn count_deduplicates_across_filters() {
        let store = memory_store().await;
        let keys = Keys::generate();
        let event = build_event_at(&keys, 1, Vec::new(), "hello".into(), 100);
        store.save(&event).await.expect("save event");

        let by_kind = kind_filter(1);
        let by_author = Filter {
            authors: Some(vec![event.pubkey.clone()]),
            ..Filter::default()
        };
        let count = store
            .count(vec![by_kind, by_author])
            .await
            .expect("count events");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn query_deduplicates_across_filters_and_caps_total() {
        let store = memory_store().await;
        let keys = Keys::generate();
        for i in 0..4 {
            let event = build_event_at(&keys, 1, Vec::new(), format!("n{i}"), 100 + i);
            store.save(&event).await.expect("save event");
        }

        let stream = store
            .query(
                vec![kind_filter(1), kind_filter(1)],
                QueryOptions {
                    limit: 3,
                    timeout: Duration::from_secs(1),
                },
            )
            .await
            .expect("query store");
        let events: Vec<RawEvent> = stream.try_collect().await.expect("drain stream");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].content, "n3");
    }
}
