//! Component & `entity_components` index operations (spec §3, §4.F, §4.E).

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgExecutor, Row};

use crate::error::EngineResult;
use crate::id::{ComponentId, EntityId, TypeId};

/// A row from the `components` relation.
#[derive(Debug, Clone)]
pub struct ComponentRow {
    /// The component instance's own id.
    pub component_id: ComponentId,
    /// The owning entity.
    pub entity_id: EntityId,
    /// The component's stable type id.
    pub type_id: TypeId,
    /// JSON payload.
    pub data: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last-modified time.
    pub updated_at: DateTime<Utc>,
}

fn bytes16(row: &sqlx::postgres::PgRow, column: &str) -> EngineResult<[u8; 16]> {
    let raw: Vec<u8> = row.try_get(column)?;
    raw.try_into()
        .map_err(|_| crate::error::EngineError::Validation(format!("invalid {column} length")))
}

fn row_to_component(row: sqlx::postgres::PgRow) -> EngineResult<ComponentRow> {
    Ok(ComponentRow {
        component_id: ComponentId::from_bytes(bytes16(&row, "component_id")?),
        entity_id: EntityId::from_bytes(bytes16(&row, "entity_id")?),
        type_id: TypeId::from_bytes(bytes16(&row, "type_id")?),
        data: row.try_get("data")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// One component to insert, paired with its declared name for the partition
/// key (LIST partitioning keys on `type_id`, but `name` is kept denormalized
/// on the row itself for admin/debug readability, as the teacher's
/// `component_instances` rows do).
pub struct NewComponent {
    /// Assigned component id.
    pub component_id: ComponentId,
    /// Owning entity.
    pub entity_id: EntityId,
    /// Component type id.
    pub type_id: TypeId,
    /// Human-readable component name.
    pub name: String,
    /// JSON payload.
    pub data: Value,
}

/// Batch-inserts new component rows and their `entity_components` index rows
/// (spec §4.F save step 6). Both inserts use `ON CONFLICT DO NOTHING` so a
/// retried save after a partial failure is safe.
pub async fn insert_many<'e, E>(executor: E, components: &[NewComponent]) -> EngineResult<()>
where
    E: PgExecutor<'e> + Copy,
{
    for component in components {
        sqlx::query(
            r#"
            INSERT INTO components (component_id, entity_id, type_id, name, data)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (type_id, component_id) DO NOTHING
            "#,
        )
        .bind(component.component_id.as_bytes().as_slice())
        .bind(component.entity_id.as_bytes().as_slice())
        .bind(component.type_id.as_bytes().as_slice())
        .bind(&component.name)
        .bind(&component.data)
        .execute(executor)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO entity_components (entity_id, type_id, component_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (entity_id, type_id) DO NOTHING
            "#,
        )
        .bind(component.entity_id.as_bytes().as_slice())
        .bind(component.type_id.as_bytes().as_slice())
        .bind(component.component_id.as_bytes().as_slice())
        .execute(executor)
        .await?;
    }
    Ok(())
}

/// Updates one persisted component's payload in place (spec §4.F save step 7).
pub async fn update<'e, E: PgExecutor<'e>>(
    executor: E,
    entity_id: EntityId,
    type_id: TypeId,
    data: &Value,
) -> EngineResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE components
        SET data = $3, updated_at = now()
        WHERE entity_id = $1 AND type_id = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(entity_id.as_bytes().as_slice())
    .bind(type_id.as_bytes().as_slice())
    .bind(data)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Deletes (hard) a set of component types from one entity, plus their index
/// rows (spec §4.F save step 4, pending removals).
pub async fn delete_many<'e, E>(
    executor: E,
    entity_id: EntityId,
    type_ids: &[TypeId],
) -> EngineResult<()>
where
    E: PgExecutor<'e> + Copy,
{
    if type_ids.is_empty() {
        return Ok(());
    }
    let type_id_bytes: Vec<Vec<u8>> = type_ids.iter().map(|t| t.as_bytes().to_vec()).collect();

    sqlx::query("DELETE FROM components WHERE entity_id = $1 AND type_id = ANY($2)")
        .bind(entity_id.as_bytes().as_slice())
        .bind(&type_id_bytes)
        .execute(executor)
        .await?;

    sqlx::query("DELETE FROM entity_components WHERE entity_id = $1 AND type_id = ANY($2)")
        .bind(entity_id.as_bytes().as_slice())
        .bind(&type_id_bytes)
        .execute(executor)
        .await?;

    Ok(())
}

/// Soft-deletes every live component (and index row) belonging to an entity,
/// used by `Entity::delete(force=false)` cascade (spec §4.F, §9 open question 3).
pub async fn soft_delete_all_for_entity<'e, E>(executor: E, entity_id: EntityId) -> EngineResult<u64>
where
    E: PgExecutor<'e> + Copy,
{
    let result = sqlx::query(
        "UPDATE components SET deleted_at = now(), updated_at = now() WHERE entity_id = $1 AND deleted_at IS NULL",
    )
    .bind(entity_id.as_bytes().as_slice())
    .execute(executor)
    .await?;

    sqlx::query(
        "UPDATE entity_components SET deleted_at = now(), updated_at = now() WHERE entity_id = $1 AND deleted_at IS NULL",
    )
    .bind(entity_id.as_bytes().as_slice())
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Hard-deletes every component (and index row) belonging to an entity.
pub async fn hard_delete_all_for_entity<'e, E>(executor: E, entity_id: EntityId) -> EngineResult<u64>
where
    E: PgExecutor<'e> + Copy,
{
    let result = sqlx::query("DELETE FROM components WHERE entity_id = $1")
        .bind(entity_id.as_bytes().as_slice())
        .execute(executor)
        .await?;

    sqlx::query("DELETE FROM entity_components WHERE entity_id = $1")
        .bind(entity_id.as_bytes().as_slice())
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Bulk fetch for [`crate::loaders::ComponentLoader`] contract step 3:
/// `entity_id IN (…) AND type_id IN (…) AND deleted_at IS NULL`.
pub async fn get_many<'e, E: PgExecutor<'e>>(
    executor: E,
    entity_ids: &[EntityId],
    type_ids: &[TypeId],
) -> EngineResult<Vec<ComponentRow>> {
    if entity_ids.is_empty() || type_ids.is_empty() {
        return Ok(Vec::new());
    }
    let entity_bytes: Vec<Vec<u8>> = entity_ids.iter().map(|e| e.as_bytes().to_vec()).collect();
    let type_bytes: Vec<Vec<u8>> = type_ids.iter().map(|t| t.as_bytes().to_vec()).collect();

    let rows = sqlx::query(
        r#"
        SELECT component_id, entity_id, type_id, data, created_at, updated_at
        FROM components
        WHERE entity_id = ANY($1) AND type_id = ANY($2) AND deleted_at IS NULL
        "#,
    )
    .bind(&entity_bytes)
    .bind(&type_bytes)
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(row_to_component).collect()
}

/// All live components attached to one entity (used by `Entity::load_multiple`).
pub async fn get_all_for_entities<'e, E: PgExecutor<'e>>(
    executor: E,
    entity_ids: &[EntityId],
) -> EngineResult<Vec<ComponentRow>> {
    if entity_ids.is_empty() {
        return Ok(Vec::new());
    }
    let entity_bytes: Vec<Vec<u8>> = entity_ids.iter().map(|e| e.as_bytes().to_vec()).collect();

    let rows = sqlx::query(
        r#"
        SELECT component_id, entity_id, type_id, data, created_at, updated_at
        FROM components
        WHERE entity_id = ANY($1) AND deleted_at IS NULL
        "#,
    )
    .bind(&entity_bytes)
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(row_to_component).collect()
}

/// Finds entities whose component of `type_id` has `data ->> foreign_key`
/// equal to one of `entity_ids` (spec §4.E loader #3, relations).
pub async fn get_by_foreign_key<'e, E: PgExecutor<'e>>(
    executor: E,
    type_id: TypeId,
    foreign_key: &str,
    entity_ids: &[EntityId],
) -> EngineResult<Vec<ComponentRow>> {
    if entity_ids.is_empty() {
        return Ok(Vec::new());
    }
    let entity_strings: Vec<String> = entity_ids.iter().map(|e| e.to_string()).collect();

    let rows = sqlx::query(
        r#"
        SELECT component_id, entity_id, type_id, data, created_at, updated_at
        FROM components
        WHERE type_id = $1 AND deleted_at IS NULL AND (data ->> $2) = ANY($3)
        "#,
    )
    .bind(type_id.as_bytes().as_slice())
    .bind(foreign_key)
    .bind(&entity_strings)
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(row_to_component).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_component(entity_id: EntityId, type_id: TypeId, name: &str, data: Value) -> NewComponent {
        NewComponent {
            component_id: ComponentId::generate().unwrap(),
            entity_id,
            type_id,
            name: name.to_string(),
            data,
        }
    }

    #[tokio::test]
    async fn insert_then_fetch_round_trips() {
        let pool = crate::sql::tests::setup_test_db().await;
        let entity_id = EntityId::generate().unwrap();
        let type_id = TypeId::derive_from_name("Profile");
        crate::sql::entity::insert_if_absent(&pool, entity_id).await.unwrap();

        let component = new_component(entity_id, type_id, "Profile", json!({"name": "Ada"}));
        insert_many(&pool, std::slice::from_ref(&component)).await.unwrap();

        let rows = get_many(&pool, &[entity_id], &[type_id]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data["name"], "Ada");
    }

    #[tokio::test]
    async fn update_changes_payload_in_place() {
        let pool = crate::sql::tests::setup_test_db().await;
        let entity_id = EntityId::generate().unwrap();
        let type_id = TypeId::derive_from_name("Profile");
        crate::sql::entity::insert_if_absent(&pool, entity_id).await.unwrap();
        let component = new_component(entity_id, type_id, "Profile", json!({"name": "Ada"}));
        insert_many(&pool, std::slice::from_ref(&component)).await.unwrap();

        let updated = update(&pool, entity_id, type_id, &json!({"name": "Grace"})).await.unwrap();
        assert!(updated);

        let rows = get_many(&pool, &[entity_id], &[type_id]).await.unwrap();
        assert_eq!(rows[0].data["name"], "Grace");
    }

    #[tokio::test]
    async fn delete_many_removes_component_and_index_row() {
        let pool = crate::sql::tests::setup_test_db().await;
        let entity_id = EntityId::generate().unwrap();
        let type_id = TypeId::derive_from_name("Profile");
        crate::sql::entity::insert_if_absent(&pool, entity_id).await.unwrap();
        let component = new_component(entity_id, type_id, "Profile", json!({"name": "Ada"}));
        insert_many(&pool, std::slice::from_ref(&component)).await.unwrap();

        delete_many(&pool, entity_id, &[type_id]).await.unwrap();

        let rows = get_many(&pool, &[entity_id], &[type_id]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn get_many_respects_soft_delete() {
        let pool = crate::sql::tests::setup_test_db().await;
        let entity_id = EntityId::generate().unwrap();
        let type_id = TypeId::derive_from_name("Profile");
        crate::sql::entity::insert_if_absent(&pool, entity_id).await.unwrap();
        let component = new_component(entity_id, type_id, "Profile", json!({"name": "Ada"}));
        insert_many(&pool, std::slice::from_ref(&component)).await.unwrap();

        soft_delete_all_for_entity(&pool, entity_id).await.unwrap();

        let rows = get_many(&pool, &[entity_id], &[type_id]).await.unwrap();
        assert!(rows.is_empty());
    }
}
