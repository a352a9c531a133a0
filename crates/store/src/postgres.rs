use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use urlinfo_contracts::codec::version_stamp;

use crate::{RecordStore, StoreError};

#[derive(Clone)]
pub struct PgRecordStore {
    pool: sqlx::PgPool,
    op_timeout: Duration,
}

impl PgRecordStore {
    pub async fn connect(db_url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self { pool, op_timeout })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, op_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        Ok(tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)??)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.bounded(
            sqlx::query_scalar::<_, Vec<u8>>(
                "SELECT record FROM urlinfo_domain_records WHERE domain = $1",
            )
            .bind(key)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let version = version_stamp(bytes);
        self.bounded(
            sqlx::query(
                "INSERT INTO urlinfo_domain_records (domain, record, version) VALUES ($1, $2, $3) ON CONFLICT (domain) DO UPDATE SET record = EXCLUDED.record, version = EXCLUDED.version, updated_at = now()",
            )
            .bind(key)
            .bind(bytes)
            .bind(&version)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = self
            .bounded(
                sqlx::query("DELETE FROM urlinfo_domain_records WHERE domain = $1")
                    .bind(key)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.bounded(
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM urlinfo_domain_records WHERE domain = $1)",
            )
            .bind(key)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.bounded(
            sqlx::query_scalar::<_, String>(
                "SELECT domain FROM urlinfo_domain_records ORDER BY domain COLLATE \"C\"",
            )
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        bytes: &[u8],
    ) -> Result<bool, StoreError> {
        let version = version_stamp(bytes);
        let result = match expected {
            None => {
                self.bounded(
                    sqlx::query(
                        "INSERT INTO urlinfo_domain_records (domain, record, version) VALUES ($1, $2, $3) ON CONFLICT (domain) DO NOTHING",
                    )
                    .bind(key)
                    .bind(bytes)
                    .bind(&version)
                    .execute(&self.pool),
                )
                .await?
            }
            Some(expected) => {
                self.bounded(
                    sqlx::query(
                        "UPDATE urlinfo_domain_records SET record = $3, version = $4, updated_at = now() WHERE domain = $1 AND version = $2",
                    )
                    .bind(key)
                    .bind(expected)
                    .bind(bytes)
                    .bind(&version)
                    .execute(&self.pool),
                )
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let result = self
            .bounded(
                sqlx::query("DELETE FROM urlinfo_domain_records WHERE domain = $1 AND version = $2")
                    .bind(key)
                    .bind(expected)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.bounded(sqlx::query("SELECT 1").execute(&self.pool))
            .await?;
        Ok(())
    }
}

async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
