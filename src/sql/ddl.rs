//! Executes the DDL text built in [`crate::schema`] against a live pool.

use crate::config::PartitionStrategy;
use crate::error::EngineResult;
use crate::registry::ComponentDescriptor;
use crate::schema;

/// Creates `entities`, `components` (with its base indexes/partitions), and
/// `entity_components`, plus the `component_types` metadata table. Safe to
/// call repeatedly — every statement is `IF NOT EXISTS`.
pub async fn initialize_base_schema(
    pool: &sqlx::PgPool,
    strategy: PartitionStrategy,
    hash_partition_count: u32,
) -> EngineResult<()> {
    sqlx::query(&schema::entities_table_ddl()).execute(pool).await?;

    for statement in schema::components_table_ddl(strategy, hash_partition_count) {
        sqlx::query(&statement).execute(pool).await?;
    }

    for statement in schema::entity_components_table_ddl() {
        sqlx::query(&statement).execute(pool).await?;
    }

    sqlx::query(&schema::component_types_table_ddl()).execute(pool).await?;

    Ok(())
}

/// Persists a component type's registration metadata and, under LIST
/// partitioning, creates its dedicated partition. Called by
/// [`crate::registry::Registry::migrate`].
pub async fn register_component_type(
    pool: &sqlx::PgPool,
    descriptor: &ComponentDescriptor,
) -> EngineResult<()> {
    let schema_json = serde_json::to_value(&descriptor.property_schema)?;

    sqlx::query(
        r#"
        INSERT INTO component_types (name, type_id, schema)
        VALUES ($1, $2, $3)
        ON CONFLICT (name) DO NOTHING
        "#,
    )
    .bind(&descriptor.name)
    .bind(descriptor.type_id.as_bytes().as_slice())
    .bind(&schema_json)
    .execute(pool)
    .await?;

    if let Some(partition_table) = &descriptor.partition_table {
        let type_id_hex = hex::encode(descriptor.type_id.as_bytes());
        let ddl = schema::component_type_partition_ddl(partition_table, &type_id_hex);
        sqlx::query(&ddl).execute(pool).await?;
    }

    for field in descriptor.property_schema.indexed_fields() {
        let table = descriptor.partition_table.as_deref().unwrap_or("components");
        let index_name = format!(
            "idx_{}_{}",
            descriptor.name.to_lowercase().replace(|c: char| !c.is_alphanumeric(), "_"),
            field.name
        );
        let ddl = schema::indexed_property_ddl(table, &field.name, &index_name);
        sqlx::query(&ddl).execute(pool).await?;
    }

    Ok(())
}

/// Minimal hex encoding, avoiding a dependency purely for DDL text assembly.
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        const DIGITS: &[u8] = b"0123456789abcdef";
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push(DIGITS[(b >> 4) as usize] as char);
            out.push(DIGITS[(b & 0x0F) as usize] as char);
        }
        out
    }
}
