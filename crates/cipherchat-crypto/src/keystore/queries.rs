//! Key database queries.

use super::db::{DatabaseError, KeyDatabase};
use super::models::{IdentityRecord, StoredKeyRecord};

impl KeyDatabase {
    // =========================================================================
    // Conversation keys
    // =========================================================================

    /// Insert a conversation's key, or replace the key of an existing row.
    ///
    /// `created_at` keeps the time the conversation's first key was stored.
    pub async fn upsert_conversation_key(
        &self,
        conversation_id: &str,
        key_data: &str,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO conversation_keys (conversation_id, key_data, created_at, last_used)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(conversation_id) DO UPDATE SET
                key_data = excluded.key_data,
                last_used = excluded.last_used
            ",
        )
        .bind(conversation_id)
        .bind(key_data)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Fetch a conversation's key and mark it used, in one transaction.
    pub async fn touch_conversation_key(
        &self,
        conversation_id: &str,
        now: i64,
    ) -> Result<Option<StoredKeyRecord>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let record = sqlx::query_as::<_, StoredKeyRecord>(
            "SELECT * FROM conversation_keys WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut record) = record else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE conversation_keys SET last_used = ? WHERE conversation_id = ?")
            .bind(now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        record.last_used = now;
        Ok(Some(record))
    }

    /// Delete a conversation's key. Returns whether a row existed.
    pub async fn delete_conversation_key(
        &self,
        conversation_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM conversation_keys WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete keys not used since `cutoff`. Returns the number removed.
    pub async fn delete_keys_unused_since(&self, cutoff: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM conversation_keys WHERE last_used < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_conversation_keys(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conversation_keys")
            .fetch_one(self.pool())
            .await?;

        Ok(row.0)
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub async fn load_identity(&self) -> Result<Option<IdentityRecord>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, IdentityRecord>(
                "SELECT secret_key, created_at FROM identity WHERE id = 1",
            )
            .fetch_optional(self.pool())
            .await?,
        )
    }

    pub async fn save_identity(&self, secret_key: &str, now: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO identity (id, secret_key, created_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                secret_key = excluded.secret_key,
                created_at = excluded.created_at
            ",
        )
        .bind(secret_key)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Wipe every stored key and the persisted identity.
    pub async fn delete_all(&self) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM conversation_keys")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM identity").execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(())
    }
}
