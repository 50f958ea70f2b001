//! Rebuild of the denormalized `joined_records` table from the three stage tables.
use std::time::Instant;

use sqlx::postgres::PgPool;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> MaterializeError + '_ {
    move |error| MaterializeError::Query {
        command: command.to_owned(),
        error,
    }
}

/// Items without any details, or whose details carry neither an email nor a phone number,
/// are left out.
///
/// `company_details` is keyed by the same `source_id` as the profile it was forwarded from, so
/// joining it straight from `search_items` reaches the same row as going through `profiles`, and
/// also keeps details whose profile lacked a `cin`.
const REBUILD_QUERY: &str = r#"
INSERT INTO joined_records
    (source_id, name, country, state, city, cin, pan, email, incorp_date,
     registered_address, registered_contact, detail_status, synced_at)
SELECT
    s.source_id,
    s.name,
    s.country,
    s.state,
    s.city,
    COALESCE(p.cin, c.cin),
    p.pan,
    c.email,
    c.incorp_date,
    c.registered_address,
    c.registered_contact,
    c.status,
    NOW()
FROM search_items s
LEFT JOIN profiles p ON p.source_id = s.source_id
LEFT JOIN company_details c ON c.source_id = s.source_id
WHERE COALESCE(c.email, '') <> '' OR COALESCE(c.registered_contact, '') <> ''
ORDER BY s.source_id
"#;

/// Replace the contents of `joined_records` in one transaction. Readers see either the previous
/// snapshot or the new one. Returns the number of rows written.
pub async fn rebuild(pool: &PgPool) -> Result<u64, MaterializeError> {
    let started = Instant::now();
    let mut txn = pool.begin().await.map_err(query_error("BEGIN"))?;

    sqlx::query("TRUNCATE joined_records")
        .execute(&mut *txn)
        .await
        .map_err(query_error("TRUNCATE"))?;

    let rows = sqlx::query(REBUILD_QUERY)
        .execute(&mut *txn)
        .await
        .map_err(query_error("INSERT"))?
        .rows_affected();

    txn.commit().await.map_err(query_error("COMMIT"))?;

    let elapsed = started.elapsed();
    metrics::counter!("harvest_sync_runs_total").increment(1);
    metrics::gauge!("harvest_joined_records").set(rows as f64);
    metrics::histogram!("harvest_sync_duration_seconds").record(elapsed.as_secs_f64());
    info!(rows, elapsed_ms = elapsed.as_millis() as u64, "joined records rebuilt");

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_common::buffer::BatchSink;
    use harvest_common::records::{
        CompanyDetail, Enriched, Profile, SearchItem, Sentinel, SentinelStatus,
    };
    use harvest_common::storage::{ItemStore, PgStore};

    fn item(id: &str, name: &str) -> SearchItem {
        SearchItem {
            name: Some(name.to_owned()),
            city: Some("Pune".to_owned()),
            ..SearchItem::new(id)
        }
    }

    fn profile(id: &str, cin: &str) -> Enriched<Profile> {
        Enriched::Populated(Profile {
            source_id: id.to_owned(),
            cin: Some(cin.to_owned()),
            pan: Some(format!("PAN-{id}")),
            members: Vec::new(),
        })
    }

    fn detail(
        id: &str,
        cin: &str,
        email: Option<&str>,
        contact: Option<&str>,
    ) -> Enriched<CompanyDetail> {
        Enriched::Populated(CompanyDetail {
            source_id: id.to_owned(),
            cin: cin.to_owned(),
            email: email.map(str::to_owned),
            incorp_date: Some("2020-01-01".to_owned()),
            registered_address: None,
            registered_contact: contact.map(str::to_owned),
        })
    }

    async fn seed(store: &PgStore) {
        store
            .record_items(
                "A",
                &[
                    item("4", "no details"),
                    item("1", "email only"),
                    item("3", "no contact"),
                    item("2", "phone only"),
                    item("5", "sentinel"),
                ],
            )
            .await
            .unwrap();
        let profiles: Vec<Enriched<Profile>> = vec![
            profile("1", "C1"),
            profile("2", "C2"),
            profile("3", "C3"),
            profile("4", "C4"),
        ];
        store.write_batch(&profiles).await.unwrap();

        let details: Vec<Enriched<CompanyDetail>> = vec![
            detail("1", "C1", Some("one@example.com"), None),
            detail("2", "C2", Some(""), Some("9876543210")),
            detail("3", "C3", None, Some("")),
            Enriched::Sentinel(
                Sentinel::new("5", SentinelStatus::NoData, "No data returned from API")
                    .with_correlation_key(Some("C5")),
            ),
        ];
        store.write_batch(&details).await.unwrap();
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_rebuild_keeps_rows_with_a_contact_field(db: PgPool) {
        seed(&PgStore::new(db.clone())).await;

        assert_eq!(rebuild(&db).await.unwrap(), 2);

        let rows: Vec<(String, Option<String>, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT source_id, name, cin, email, detail_status
                 FROM joined_records ORDER BY source_id",
            )
            .fetch_all(&db)
            .await
            .unwrap();

        assert_eq!(
            rows,
            vec![
                (
                    "1".to_owned(),
                    Some("email only".to_owned()),
                    Some("C1".to_owned()),
                    Some("one@example.com".to_owned()),
                    Some("SUCCESS".to_owned()),
                ),
                (
                    "2".to_owned(),
                    Some("phone only".to_owned()),
                    Some("C2".to_owned()),
                    Some(String::new()),
                    Some("SUCCESS".to_owned()),
                ),
            ]
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_rebuild_replaces_previous_snapshot(db: PgPool) {
        let store = PgStore::new(db.clone());
        seed(&store).await;
        assert_eq!(rebuild(&db).await.unwrap(), 2);
        assert_eq!(rebuild(&db).await.unwrap(), 2);

        let late = vec![detail("3", "C3", Some("three@example.com"), None)];
        store.write_batch(&late).await.unwrap();
        assert_eq!(rebuild(&db).await.unwrap(), 3);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM joined_records")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_rebuild_of_empty_tables(db: PgPool) {
        assert_eq!(rebuild(&db).await.unwrap(), 0);
    }
}
