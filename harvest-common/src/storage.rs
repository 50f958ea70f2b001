//! # Storage
//!
//! Postgres persistence of crawled items and enrichment results. Every write is an upsert on
//! the record's natural key, so replaying a batch leaves one row per key.
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use thiserror::Error;

use crate::buffer::{BatchSink, FlushError, Keyed};
use crate::records::{CompanyDetail, Enriched, Profile, SearchItem};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
}

/// Durable record of crawled items, consulted by the dedup guard.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Upsert the stable attributes of `items` found in `partition_key`.
    async fn record_items(
        &self,
        partition_key: &str,
        items: &[SearchItem],
    ) -> Result<(), StoreError>;

    /// Note that the enrichment requests for `ids` were published.
    async fn mark_enqueued(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Which of `ids` were already recorded and published.
    async fn enqueued_among(&self, ids: &[String]) -> Result<HashSet<String>, StoreError>;
}

/// Keep the last record for every key, preserving first-seen order.
pub fn collapse_by_key<T: Keyed>(records: &[T]) -> Vec<&T> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut collapsed: Vec<&T> = Vec::with_capacity(records.len());

    for record in records {
        match positions.get(record.key()) {
            Some(&position) => collapsed[position] = record,
            None => {
                positions.insert(record.key(), collapsed.len());
                collapsed.push(record);
            }
        }
    }

    collapsed
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ItemStore for PgStore {
    async fn record_items(
        &self,
        partition_key: &str,
        items: &[SearchItem],
    ) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut seen = HashSet::new();
        let items: Vec<&SearchItem> = items
            .iter()
            .filter(|item| seen.insert(item.id.as_str()))
            .collect();

        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        let names: Vec<Option<&str>> = items.iter().map(|i| i.name.as_deref()).collect();
        let countries: Vec<Option<&str>> = items.iter().map(|i| i.country.as_deref()).collect();
        let states: Vec<Option<&str>> = items.iter().map(|i| i.state.as_deref()).collect();
        let cities: Vec<Option<&str>> = items.iter().map(|i| i.city.as_deref()).collect();

        sqlx::query(
            r#"
INSERT INTO search_items (source_id, partition_key, name, country, state, city)
    (SELECT source_id, $2, name, country, state, city FROM UNNEST(
        $1::text[],
        $3::text[],
        $4::text[],
        $5::text[],
        $6::text[]) AS t(source_id, name, country, state, city))
ON CONFLICT (source_id) DO UPDATE
SET
    name = EXCLUDED.name,
    country = EXCLUDED.country,
    state = EXCLUDED.state,
    city = EXCLUDED.city
            "#,
        )
        .bind(&ids)
        .bind(partition_key)
        .bind(&names)
        .bind(&countries)
        .bind(&states)
        .bind(&cities)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(())
    }

    async fn mark_enqueued(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
UPDATE search_items
SET enqueued_at = NOW()
WHERE source_id = ANY($1) AND enqueued_at IS NULL
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(())
    }

    async fn enqueued_among(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let found: Vec<String> = sqlx::query_scalar(
            r#"
SELECT source_id FROM search_items
WHERE source_id = ANY($1) AND enqueued_at IS NOT NULL
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(found.into_iter().collect())
    }
}

/// Column vectors shared by both enrichment tables.
#[derive(Default)]
struct Dispositions<'a> {
    source_ids: Vec<&'a str>,
    cins: Vec<Option<&'a str>>,
    statuses: Vec<&'static str>,
    reasons: Vec<Option<&'a str>>,
    http_statuses: Vec<Option<i32>>,
}

impl<'a> Dispositions<'a> {
    fn push<T>(&mut self, record: &'a Enriched<T>, source_id: &'a str, cin: Option<&'a str>) {
        self.source_ids.push(source_id);
        self.cins.push(cin);
        self.statuses.push(record.status());
        match record {
            Enriched::Populated(_) => {
                self.reasons.push(None);
                self.http_statuses.push(None);
            }
            Enriched::Sentinel(sentinel) => {
                self.reasons.push(Some(sentinel.reason.as_str()));
                self.http_statuses
                    .push(sentinel.status_code.map(i32::from));
            }
        }
    }
}

#[async_trait]
impl BatchSink<Enriched<Profile>> for PgStore {
    async fn write_batch(&self, records: &[Enriched<Profile>]) -> Result<(), FlushError> {
        let records = collapse_by_key(records);
        if records.is_empty() {
            return Ok(());
        }

        let mut columns = Dispositions::default();
        let mut pans: Vec<Option<&str>> = Vec::with_capacity(records.len());
        let mut members: Vec<sqlx::types::Json<&[serde_json::Value]>> =
            Vec::with_capacity(records.len());

        for record in records {
            match record {
                Enriched::Populated(profile) => {
                    columns.push(record, &profile.source_id, profile.cin.as_deref());
                    pans.push(profile.pan.as_deref());
                    members.push(sqlx::types::Json(profile.members.as_slice()));
                }
                Enriched::Sentinel(sentinel) => {
                    columns.push(record, &sentinel.id, sentinel.correlation_key.as_deref());
                    pans.push(None);
                    members.push(sqlx::types::Json(&[][..]));
                }
            }
        }

        let mut txn = self.pool.begin().await?;

        sqlx::query(
            r#"
INSERT INTO profiles (source_id, cin, pan, members, status, reason, http_status, updated_at)
    (SELECT source_id, cin, pan, members, status, reason, http_status, NOW() FROM UNNEST(
        $1::text[],
        $2::text[],
        $3::text[],
        $4::jsonb[],
        $5::text[],
        $6::text[],
        $7::int[]) AS t(source_id, cin, pan, members, status, reason, http_status))
ON CONFLICT (source_id) DO UPDATE
SET
    cin = EXCLUDED.cin,
    pan = EXCLUDED.pan,
    members = EXCLUDED.members,
    status = EXCLUDED.status,
    reason = EXCLUDED.reason,
    http_status = EXCLUDED.http_status,
    updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&columns.source_ids)
        .bind(&columns.cins)
        .bind(&pans)
        .bind(&members)
        .bind(&columns.statuses)
        .bind(&columns.reasons)
        .bind(&columns.http_statuses)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;

        Ok(())
    }
}

#[async_trait]
impl BatchSink<Enriched<CompanyDetail>> for PgStore {
    async fn write_batch(&self, records: &[Enriched<CompanyDetail>]) -> Result<(), FlushError> {
        let records = collapse_by_key(records);
        if records.is_empty() {
            return Ok(());
        }

        let mut columns = Dispositions::default();
        let mut emails: Vec<Option<&str>> = Vec::with_capacity(records.len());
        let mut incorp_dates: Vec<Option<&str>> = Vec::with_capacity(records.len());
        let mut addresses: Vec<Option<&str>> = Vec::with_capacity(records.len());
        let mut contacts: Vec<Option<&str>> = Vec::with_capacity(records.len());

        for record in records {
            match record {
                Enriched::Populated(detail) => {
                    columns.push(record, &detail.source_id, Some(detail.cin.as_str()));
                    emails.push(detail.email.as_deref());
                    incorp_dates.push(detail.incorp_date.as_deref());
                    addresses.push(detail.registered_address.as_deref());
                    contacts.push(detail.registered_contact.as_deref());
                }
                Enriched::Sentinel(sentinel) => {
                    columns.push(record, &sentinel.id, sentinel.correlation_key.as_deref());
                    emails.push(None);
                    incorp_dates.push(None);
                    addresses.push(None);
                    contacts.push(None);
                }
            }
        }

        let mut txn = self.pool.begin().await?;

        sqlx::query(
            r#"
INSERT INTO company_details
    (source_id, cin, email, incorp_date, registered_address, registered_contact,
     status, reason, http_status, updated_at)
    (SELECT source_id, cin, email, incorp_date, registered_address, registered_contact,
            status, reason, http_status, NOW()
     FROM UNNEST(
        $1::text[],
        $2::text[],
        $3::text[],
        $4::text[],
        $5::text[],
        $6::text[],
        $7::text[],
        $8::text[],
        $9::int[]) AS t(source_id, cin, email, incorp_date, registered_address,
                        registered_contact, status, reason, http_status))
ON CONFLICT (source_id) DO UPDATE
SET
    cin = EXCLUDED.cin,
    email = EXCLUDED.email,
    incorp_date = EXCLUDED.incorp_date,
    registered_address = EXCLUDED.registered_address,
    registered_contact = EXCLUDED.registered_contact,
    status = EXCLUDED.status,
    reason = EXCLUDED.reason,
    http_status = EXCLUDED.http_status,
    updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&columns.source_ids)
        .bind(&columns.cins)
        .bind(&emails)
        .bind(&incorp_dates)
        .bind(&addresses)
        .bind(&contacts)
        .bind(&columns.statuses)
        .bind(&columns.reasons)
        .bind(&columns.http_statuses)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Sentinel, SentinelStatus};

    fn profile(source_id: &str, cin: Option<&str>) -> Enriched<Profile> {
        Enriched::Populated(Profile {
            source_id: source_id.to_owned(),
            cin: cin.map(str::to_owned),
            pan: Some("PAN1".to_owned()),
            members: vec![serde_json::json!({"name": "founder"})],
        })
    }

    fn item(id: &str, name: &str) -> SearchItem {
        SearchItem {
            name: Some(name.to_owned()),
            ..SearchItem::new(id)
        }
    }

    #[test]
    fn test_collapse_by_key_keeps_last_record_in_first_position() {
        let records = vec![
            profile("1", Some("A")),
            profile("2", None),
            profile("1", Some("B")),
        ];
        let collapsed = collapse_by_key(&records);

        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].populated().unwrap().cin.as_deref(), Some("B"));
        assert_eq!(collapsed[1].key(), "2");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_enqueued_among_requires_enqueued_mark(db: PgPool) {
        let store = PgStore::new(db);
        let ids = vec!["1".to_owned(), "2".to_owned(), "3".to_owned()];

        store
            .record_items("A", &[item("1", "one"), item("2", "two")])
            .await
            .unwrap();
        assert!(store.enqueued_among(&ids).await.unwrap().is_empty());

        store.mark_enqueued(&["1".to_owned()]).await.unwrap();
        let found = store.enqueued_among(&ids).await.unwrap();

        assert_eq!(found, HashSet::from(["1".to_owned()]));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_record_items_upserts_attributes(db: PgPool) {
        let store = PgStore::new(db.clone());

        store.record_items("A", &[item("1", "old")]).await.unwrap();
        store.mark_enqueued(&["1".to_owned()]).await.unwrap();
        store.record_items("A", &[item("1", "new")]).await.unwrap();

        let (count, name, enqueued): (i64, Option<String>, bool) = sqlx::query_as(
            "SELECT COUNT(*) OVER (), name, enqueued_at IS NOT NULL FROM search_items",
        )
        .fetch_one(&db)
        .await
        .unwrap();

        assert_eq!(count, 1);
        assert_eq!(name.as_deref(), Some("new"));
        assert!(enqueued);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_profile_batch_upserts_by_source_id(db: PgPool) {
        let store = PgStore::new(db.clone());

        let first = vec![
            profile("1", Some("U1")),
            Enriched::Sentinel(Sentinel::new("2", SentinelStatus::NoData, "no data")),
        ];
        store.write_batch(&first).await.unwrap();

        // A redelivered message replays the same key with a new outcome.
        let replay = vec![profile("2", Some("U2")), profile("1", Some("U1"))];
        store.write_batch(&replay).await.unwrap();

        let rows: Vec<(String, Option<String>, String)> =
            sqlx::query_as("SELECT source_id, cin, status FROM profiles ORDER BY source_id")
                .fetch_all(&db)
                .await
                .unwrap();

        assert_eq!(
            rows,
            vec![
                ("1".to_owned(), Some("U1".to_owned()), "SUCCESS".to_owned()),
                ("2".to_owned(), Some("U2".to_owned()), "SUCCESS".to_owned()),
            ]
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_detail_sentinel_keeps_reason_and_status(db: PgPool) {
        let store = PgStore::new(db.clone());

        let mut sentinel = Sentinel::new("42", SentinelStatus::Failed, "Max retries reached")
            .with_correlation_key(Some("U42"));
        sentinel.status_code = Some(503);

        let records: Vec<Enriched<CompanyDetail>> = vec![
            Enriched::Sentinel(sentinel),
            Enriched::Populated(CompanyDetail {
                source_id: "7".to_owned(),
                cin: "U7".to_owned(),
                email: Some("a@b.c".to_owned()),
                incorp_date: None,
                registered_address: None,
                registered_contact: Some("123".to_owned()),
            }),
        ];
        store.write_batch(&records).await.unwrap();

        let (cin, status, reason, http_status): (Option<String>, String, Option<String>, Option<i32>) =
            sqlx::query_as(
                "SELECT cin, status, reason, http_status FROM company_details WHERE source_id = '42'",
            )
            .fetch_one(&db)
            .await
            .unwrap();

        assert_eq!(cin.as_deref(), Some("U42"));
        assert_eq!(status, "FAILED");
        assert_eq!(reason.as_deref(), Some("Max retries reached"));
        assert_eq!(http_status, Some(503));
    }
}
