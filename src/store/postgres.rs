use super::DocumentStore;
use crate::error::StoreError;
use crate::normalize::StoredDocument;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;

/// Documents live in one table per collection: the capture time as text and
/// the decoded payload as `jsonb`.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    collection: String,
    insert_sql: String,
}

impl PgDocumentStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        collection: &str,
    ) -> Result<Self> {
        if !is_valid_collection_name(collection) {
            bail!("invalid collection name {collection:?}");
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("connect to document store")?;

        let store = Self::from_pool(pool, collection);
        store.ensure_collection().await?;
        Ok(store)
    }

    fn from_pool(pool: PgPool, collection: &str) -> Self {
        let insert_sql = format!(
            "INSERT INTO \"{collection}\" (capture_time, data) VALUES ($1, $2)"
        );
        Self {
            pool,
            collection: collection.to_string(),
            insert_sql,
        }
    }

    async fn ensure_collection(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                id bigserial primary key,
                capture_time text not null,
                data jsonb not null,
                inserted_at timestamptz not null default now()
            )
            "#,
            self.collection
        ))
        .execute(&self.pool)
        .await
        .with_context(|| format!("create collection {}", self.collection))?;
        Ok(())
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn insert(&self, document: &StoredDocument) -> Result<(), StoreError> {
        sqlx::query(&self.insert_sql)
            .bind(&document.capture_time)
            .bind(Json(&document.data))
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn is_valid_collection_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
        sqlx::Error::Database(db) => {
            if is_transient_sqlstate(db.code().as_deref()) {
                StoreError::Transient(err.to_string())
            } else {
                StoreError::Rejected(err.to_string())
            }
        }
        _ => StoreError::Rejected(err.to_string()),
    }
}

/// Connection exceptions (08), rollbacks such as serialization failures (40),
/// insufficient resources (53) and operator intervention like an admin
/// shutdown (57P) are worth another attempt.
fn is_transient_sqlstate(code: Option<&str>) -> bool {
    let Some(code) = code else {
        return false;
    };
    code.starts_with("08") || code.starts_with("40") || code.starts_with("53") || code.starts_with("57P")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::env;

    #[test]
    fn classifies_sqlstates() {
        assert!(is_transient_sqlstate(Some("08006")));
        assert!(is_transient_sqlstate(Some("40001")));
        assert!(is_transient_sqlstate(Some("53300")));
        assert!(is_transient_sqlstate(Some("57P01")));
        assert!(!is_transient_sqlstate(Some("23505")));
        assert!(!is_transient_sqlstate(Some("22P02")));
        assert!(!is_transient_sqlstate(None));
    }

    #[test]
    fn classifies_driver_errors() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_transient());
        assert!(classify(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        )))
        .is_transient());
        assert!(!classify(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn validates_collection_names() {
        assert!(is_valid_collection_name("sensors_data"));
        assert!(is_valid_collection_name("dry-rack"));
        assert!(!is_valid_collection_name(""));
        assert!(!is_valid_collection_name("1data"));
        assert!(!is_valid_collection_name("data\"; DROP TABLE x; --"));
    }

    #[tokio::test]
    async fn inserts_documents_into_postgres() -> Result<()> {
        if env::var("BRIDGE_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let database_url = match env::var("BRIDGE_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(()),
        };

        let collection = format!("bridge_test_{}", std::process::id());
        let store =
            PgDocumentStore::connect(&database_url, 2, Duration::from_secs(5), &collection).await?;
        store.ping().await?;

        let document = StoredDocument {
            capture_time: "01-03-2024 20:00:00".to_string(),
            data: json!({"temp": 22.5, "humidity": 60})
                .as_object()
                .cloned()
                .expect("object"),
        };
        store.insert(&document).await?;

        let (capture_time, data): (String, Json<serde_json::Value>) = sqlx::query_as(&format!(
            "SELECT capture_time, data FROM \"{collection}\" ORDER BY id LIMIT 1"
        ))
        .fetch_one(&store.pool)
        .await?;
        assert_eq!(capture_time, "01-03-2024 20:00:00");
        assert_eq!(data.0, json!({"temp": 22.5, "humidity": 60}));

        let _ = sqlx::query(&format!("DROP TABLE IF EXISTS \"{collection}\""))
            .execute(&store.pool)
            .await;
        Ok(())
    }
}
