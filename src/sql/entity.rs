//! Entity-relation operations (spec §3 `entities` table).

use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, Row};

use crate::error::EngineResult;
use crate::id::EntityId;

/// A row of the `entities` relation.
#[derive(Debug, Clone)]
pub struct EntityRow {
    /// The entity identifier.
    pub id: EntityId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last-modified time.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; `None` means live.
    pub deleted_at: Option<DateTime<Utc>>,
}

fn row_to_entity(row: sqlx::postgres::PgRow) -> EngineResult<EntityRow> {
    let bytes: Vec<u8> = row.try_get("entity_id")?;
    let id_bytes: [u8; 16] = bytes
        .try_into()
        .map_err(|_| crate::error::EngineError::Validation("invalid entity_id length".to_string()))?;
    Ok(EntityRow {
        id: EntityId::from_bytes(id_bytes),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

/// `INSERT INTO entities ... ON CONFLICT DO NOTHING` (spec §4.F save step 3).
pub async fn insert_if_absent<'e, E: PgExecutor<'e>>(executor: E, id: EntityId) -> EngineResult<()> {
    sqlx::query("INSERT INTO entities (entity_id) VALUES ($1) ON CONFLICT (entity_id) DO NOTHING")
        .bind(id.as_bytes().as_slice())
        .execute(executor)
        .await?;
    Ok(())
}

/// Fetches one entity row, including soft-deleted ones (callers filter).
pub async fn get<'e, E: PgExecutor<'e>>(executor: E, id: EntityId) -> EngineResult<Option<EntityRow>> {
    let row = sqlx::query("SELECT entity_id, created_at, updated_at, deleted_at FROM entities WHERE entity_id = $1")
        .bind(id.as_bytes().as_slice())
        .fetch_optional(executor)
        .await?;
    row.map(row_to_entity).transpose()
}

/// Bulk entity fetch for [`crate::loaders::EntityLoader`], preserving no
/// particular order — callers re-align to their key list.
pub async fn get_many<'e, E: PgExecutor<'e>>(executor: E, ids: &[EntityId]) -> EngineResult<Vec<EntityRow>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let id_bytes: Vec<Vec<u8>> = ids.iter().map(|id| id.as_bytes().to_vec()).collect();
    let rows = sqlx::query(
        "SELECT entity_id, created_at, updated_at, deleted_at FROM entities WHERE entity_id = ANY($1)",
    )
    .bind(&id_bytes)
    .fetch_all(executor)
    .await?;
    rows.into_iter().map(row_to_entity).collect()
}

/// Marks `deleted_at = now()` for a live entity. Returns whether a row changed.
pub async fn soft_delete<'e, E: PgExecutor<'e>>(executor: E, id: EntityId) -> EngineResult<bool> {
    let result = sqlx::query(
        "UPDATE entities SET deleted_at = now(), updated_at = now() WHERE entity_id = $1 AND deleted_at IS NULL",
    )
    .bind(id.as_bytes().as_slice())
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Clears `deleted_at`, resurrecting a soft-deleted entity.
pub async fn resurrect<'e, E: PgExecutor<'e>>(executor: E, id: EntityId) -> EngineResult<bool> {
    let result = sqlx::query(
        "UPDATE entities SET deleted_at = NULL, updated_at = now() WHERE entity_id = $1 AND deleted_at IS NOT NULL",
    )
    .bind(id.as_bytes().as_slice())
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Removes the entity row outright (hard delete). Components are expected to
/// have been removed by the caller in the same transaction first.
pub async fn hard_delete<'e, E: PgExecutor<'e>>(executor: E, id: EntityId) -> EngineResult<bool> {
    let result = sqlx::query("DELETE FROM entities WHERE entity_id = $1")
        .bind(id.as_bytes().as_slice())
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let pool = crate::sql::tests::setup_test_db().await;
        let id = EntityId::generate().unwrap();

        insert_if_absent(&pool, id).await.unwrap();
        let row = get(&pool, id).await.unwrap().unwrap();

        assert_eq!(row.id, id);
        assert!(row.deleted_at.is_none());
    }

    #[tokio::test]
    async fn insert_if_absent_is_idempotent() {
        let pool = crate::sql::tests::setup_test_db().await;
        let id = EntityId::generate().unwrap();

        insert_if_absent(&pool, id).await.unwrap();
        insert_if_absent(&pool, id).await.unwrap();

        let row = get(&pool, id).await.unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn soft_delete_then_resurrect() {
        let pool = crate::sql::tests::setup_test_db().await;
        let id = EntityId::generate().unwrap();
        insert_if_absent(&pool, id).await.unwrap();

        assert!(soft_delete(&pool, id).await.unwrap());
        let row = get(&pool, id).await.unwrap().unwrap();
        assert!(row.deleted_at.is_some());

        assert!(resurrect(&pool, id).await.unwrap());
        let row = get(&pool, id).await.unwrap().unwrap();
        assert!(row.deleted_at.is_none());
    }

    #[tokio::test]
    async fn hard_delete_removes_row() {
        let pool = crate::sql::tests::setup_test_db().await;
        let id = EntityId::generate().unwrap();
        insert_if_absent(&pool, id).await.unwrap();

        assert!(hard_delete(&pool, id).await.unwrap());
        assert!(get(&pool, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_many_aligns_to_existing_rows_only() {
        let pool = crate::sql::tests::setup_test_db().await;
        let a = EntityId::generate().unwrap();
        let b = EntityId::generate().unwrap();
        insert_if_absent(&pool, a).await.unwrap();

        let rows = get_many(&pool, &[a, b]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, a);
    }
}
