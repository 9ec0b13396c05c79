//! Persistence seam for content records, the asset catalog and their links.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsmig_core::{Asset, ContentAssetLink, ContentMetadata, ContentRecord};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("asset with file name {0:?} already exists")]
    DuplicateAsset(String),
    #[error("content {} is already linked to asset {}", .0.content_id, .0.asset_id)]
    DuplicateLink(ContentAssetLink),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, PersistenceError>;
}

/// One transaction. Dropping it without `commit` discards every change.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn count_contents(&mut self) -> Result<u64, PersistenceError>;

    /// Records ordered by id descending, each with its linked asset ids in link order.
    async fn fetch_contents(
        &mut self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ContentRecord>, PersistenceError>;

    async fn find_asset_by_file_name(
        &mut self,
        file_name: &str,
    ) -> Result<Option<Asset>, PersistenceError>;

    async fn insert_asset(
        &mut self,
        file_name: &str,
        audit_user_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Asset, PersistenceError>;

    /// Fails with `DuplicateLink` when the pair is already present.
    async fn insert_link(&mut self, link: ContentAssetLink) -> Result<(), PersistenceError>;

    /// Writes text, metadata, primary asset and the update audit columns.
    async fn update_content(&mut self, record: &ContentRecord) -> Result<(), PersistenceError>;

    /// Deletes records whose text is NULL or blank, their links first.
    async fn delete_empty_contents(&mut self) -> Result<u64, PersistenceError>;

    async fn savepoint(&mut self, name: &str) -> Result<(), PersistenceError>;

    async fn release_savepoint(&mut self, name: &str) -> Result<(), PersistenceError>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), PersistenceError>;

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Persistence for PgPersistence {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, PersistenceError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

fn checked_savepoint_name(name: &str) -> Result<&str, PersistenceError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(PersistenceError::Message(format!(
            "invalid savepoint name {name:?}"
        )))
    }
}

fn asset_from_row(row: &PgRow) -> Result<Asset, sqlx::Error> {
    Ok(Asset {
        id: row.try_get("asset_id")?,
        file_name: row.try_get("file_name")?,
        created_at: row.try_get("created_date")?,
        created_by_id: row.try_get("created_by_id")?,
        updated_at: row.try_get("updated_date")?,
        updated_by_id: row.try_get("updated_by_id")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn count_contents(&mut self) -> Result<u64, PersistenceError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM news_content")
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(total.max(0) as u64)
    }

    async fn fetch_contents(
        &mut self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ContentRecord>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT news_content_id, title, text, view_data, main_asset_id,
                   created_date, updated_date, updated_by_id
              FROM news_content
             ORDER BY news_content_id DESC
             LIMIT $2
            OFFSET $1
            "#,
        )
        .bind(to_i64(offset))
        .bind(to_i64(limit))
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let view_data: Option<serde_json::Value> = row.try_get("view_data")?;
            out.push(ContentRecord {
                id: row.try_get("news_content_id")?,
                title: row
                    .try_get::<Option<String>, _>("title")?
                    .unwrap_or_default(),
                text: row.try_get::<Option<String>, _>("text")?.unwrap_or_default(),
                metadata: ContentMetadata::from_json(view_data),
                primary_asset_id: row.try_get("main_asset_id")?,
                asset_ids: Vec::new(),
                created_at: row.try_get("created_date")?,
                updated_at: row.try_get("updated_date")?,
                updated_by_id: row.try_get("updated_by_id")?,
            });
        }
        if out.is_empty() {
            return Ok(out);
        }

        let ids: Vec<i64> = out.iter().map(|record| record.id).collect();
        let links = sqlx::query(
            r#"
            SELECT news_content_id, asset_id
              FROM news_content_assets
             WHERE news_content_id = ANY($1)
             ORDER BY news_content_asset_id
            "#,
        )
        .bind(&ids[..])
        .fetch_all(&mut *self.tx)
        .await?;
        for link in links {
            let content_id: i64 = link.try_get("news_content_id")?;
            let asset_id: i64 = link.try_get("asset_id")?;
            if let Some(record) = out.iter_mut().find(|record| record.id == content_id) {
                record.asset_ids.push(asset_id);
            }
        }
        Ok(out)
    }

    async fn find_asset_by_file_name(
        &mut self,
        file_name: &str,
    ) -> Result<Option<Asset>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT asset_id, file_name, created_date, created_by_id, updated_date, updated_by_id
              FROM assets
             WHERE file_name = $1
            "#,
        )
        .bind(file_name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.as_ref().map(asset_from_row).transpose()?)
    }

    async fn insert_asset(
        &mut self,
        file_name: &str,
        audit_user_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Asset, PersistenceError> {
        let row = sqlx::query(
            r#"
            INSERT INTO assets (file_name, created_date, created_by_id, updated_date, updated_by_id)
            VALUES ($1, $2, $3, $2, $3)
            RETURNING asset_id, file_name, created_date, created_by_id, updated_date, updated_by_id
            "#,
        )
        .bind(file_name)
        .bind(at)
        .bind(audit_user_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                PersistenceError::DuplicateAsset(file_name.to_string())
            } else {
                PersistenceError::Database(err)
            }
        })?;
        Ok(asset_from_row(&row)?)
    }

    async fn insert_link(&mut self, link: ContentAssetLink) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            INSERT INTO news_content_assets (news_content_id, asset_id)
            SELECT $1::BIGINT, $2::BIGINT
             WHERE NOT EXISTS (
                   SELECT 1 FROM news_content_assets
                    WHERE news_content_id = $1 AND asset_id = $2
             )
            "#,
        )
        .bind(link.content_id)
        .bind(link.asset_id)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::DuplicateLink(link));
        }
        Ok(())
    }

    async fn update_content(&mut self, record: &ContentRecord) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE news_content
               SET text = $2,
                   view_data = $3,
                   main_asset_id = $4,
                   updated_date = $5,
                   updated_by_id = $6
             WHERE news_content_id = $1
            "#,
        )
        .bind(record.id)
        .bind(&record.text)
        .bind(record.metadata.to_json())
        .bind(record.primary_asset_id)
        .bind(record.updated_at)
        .bind(record.updated_by_id)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::Message(format!(
                "content {} no longer exists",
                record.id
            )));
        }
        Ok(())
    }

    async fn delete_empty_contents(&mut self) -> Result<u64, PersistenceError> {
        sqlx::query(
            r#"
            DELETE FROM news_content_assets
             WHERE news_content_id IN (
                   SELECT news_content_id FROM news_content
                    WHERE text IS NULL OR text ~ '^\s*$'
             )
            "#,
        )
        .execute(&mut *self.tx)
        .await?;
        let result = sqlx::query("DELETE FROM news_content WHERE text IS NULL OR text ~ '^\\s*$'")
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), PersistenceError> {
        let sql = format!("SAVEPOINT {}", checked_savepoint_name(name)?);
        sqlx::query(&sql).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), PersistenceError> {
        let sql = format!("RELEASE SAVEPOINT {}", checked_savepoint_name(name)?);
        sqlx::query(&sql).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), PersistenceError> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", checked_savepoint_name(name)?);
        sqlx::query(&sql).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn savepoint_names_are_plain_identifiers() {
        assert!(checked_savepoint_name("reconcile_record").is_ok());
        assert!(checked_savepoint_name("sp1").is_ok());
        assert!(checked_savepoint_name("").is_err());
        assert!(checked_savepoint_name("1sp").is_err());
        assert!(checked_savepoint_name("sp; DROP TABLE assets").is_err());
    }

    #[test]
    fn offsets_saturate_into_bigint() {
        assert_eq!(to_i64(25), 25);
        assert_eq!(to_i64(u64::MAX), i64::MAX);
    }
}
