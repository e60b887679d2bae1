use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{Instance, InstanceId};

/// Durable store for instances: one full-document row per board, keyed by
/// instance id. Reads are by exact key; writes are full-document upserts.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_instances_table().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_instances_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id         TEXT PRIMARY KEY,
                document   TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure instances table exists")?;
        Ok(())
    }

    /// Insert a freshly created instance. Returns false without touching the
    /// row when an instance with the same id already exists.
    pub async fn create_instance(&self, instance: &Instance) -> Result<bool> {
        let document = encode_document(instance)?;
        let result = sqlx::query(
            "INSERT INTO instances (id, document) VALUES (?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&instance.id.0)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write-through after a mutation: replace the whole document.
    pub async fn save_instance(&self, instance: &Instance) -> Result<()> {
        let document = encode_document(instance)?;
        sqlx::query(
            "INSERT INTO instances (id, document) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE
             SET document = excluded.document, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&instance.id.0)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_instance(&self, id: &InstanceId) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT document FROM instances WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let document: String = row.get(0);
        let instance = serde_json::from_str(&document)
            .with_context(|| format!("malformed instance document for '{id}'"))?;
        Ok(Some(instance))
    }

    /// External deletion path; the live engine never calls this.
    pub async fn delete_instance(&self, id: &InstanceId) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn encode_document(instance: &Instance) -> Result<String> {
    serde_json::to_string(instance)
        .with_context(|| format!("failed to serialize instance '{}'", instance.id))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
