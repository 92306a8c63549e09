//! # Component Registry (spec §4.A)
//!
//! Maps a component type's Rust-level name to a stable [`TypeId`], tracks
//! registration readiness, and knows each type's partition table name.
//!
//! Registration is split into two steps, mirroring the teacher's "declare
//! before the database is reachable, wait on save" note in §9: `register::<T>()`
//! is synchronous and purely in-memory (applications call it at startup, before
//! any pool exists), while [`Registry::migrate`] performs the persistent side
//! effects (writing `component_types` rows, creating LIST partitions) once a
//! pool is available, and wakes anyone blocked on [`Registry::ready`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::PartitionStrategy;
use crate::error::{EngineError, EngineResult};
use crate::id::TypeId;

/// The scalar kind of a single declared component field, used to drive
/// expression-index DDL and JSON deserialization (§9: "drive JSON
/// deserialization of special kinds, e.g. timestamps").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    /// JSON `null`/boolean.
    Bool,
    /// Whole numbers, stored and compared numerically.
    Integer,
    /// Floating point numbers.
    Float,
    /// Plain text.
    String,
    /// RFC 3339 timestamp strings, deserialized into `chrono::DateTime<Utc>`.
    Timestamp,
    /// Opaque nested JSON (arrays, objects) with no further structure assumed.
    Json,
}

/// One declared field of a component's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    /// Field name, matching the JSON key in the payload.
    pub name: String,
    /// The field's scalar kind.
    pub kind: PropertyKind,
    /// Whether an expression index should be created for this field.
    pub indexed: bool,
}

/// The full property list for one component type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    /// Declared fields, in declaration order.
    pub fields: Vec<PropertyDescriptor>,
}

impl PropertySchema {
    /// Looks up a declared field's descriptor by name.
    pub fn field(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Returns every field marked `indexed`.
    pub fn indexed_fields(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.fields.iter().filter(|f| f.indexed)
    }
}

/// Implemented by application-declared component types, normally via
/// `#[derive(entitydb_derive::Component)]`.
pub trait Component: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {
    /// The human-readable, stable component name (e.g. `"Profile"`).
    const NAME: &'static str;

    /// The declared property schema, used for DDL and indexing.
    fn property_schema() -> PropertySchema;
}

/// Everything the registry knows about one registered component type.
#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    /// Human-readable component name.
    pub name: String,
    /// Stable type identifier, derived deterministically from `name`.
    pub type_id: TypeId,
    /// Declared property schema.
    pub property_schema: PropertySchema,
    /// Partition table name under LIST partitioning; `None` under HASH.
    pub partition_table: Option<String>,
    /// Whether `migrate()` has persisted this type's metadata/partition yet.
    migrated: bool,
}

impl ComponentDescriptor {
    /// Derives the LIST-partition table name from a component name: lowercased,
    /// non-alphanumeric runs collapsed to `_`, prefixed `components_`.
    fn partition_table_name(name: &str) -> String {
        let mut out = String::from("components_");
        let mut last_was_sep = false;
        for ch in name.chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch.to_ascii_lowercase());
                last_was_sep = false;
            } else if !last_was_sep {
                out.push('_');
                last_was_sep = true;
            }
        }
        out
    }
}

struct Inner {
    by_name: HashMap<String, ComponentDescriptor>,
    by_type_id: HashMap<TypeId, String>,
    notifiers: HashMap<String, Arc<Notify>>,
}

/// Process-wide registry of component types (constructed once at startup and
/// injected into the façade, per spec §9 "Global process state").
pub struct Registry {
    inner: RwLock<Inner>,
    strategy: PartitionStrategy,
}

impl Registry {
    /// Creates an empty registry for the given partitioning strategy.
    pub fn new(strategy: PartitionStrategy) -> Self {
        Registry {
            inner: RwLock::new(Inner {
                by_name: HashMap::new(),
                by_type_id: HashMap::new(),
                notifiers: HashMap::new(),
            }),
            strategy,
        }
    }

    /// Idempotently registers a component type, returning its stable [`TypeId`].
    ///
    /// Re-registering the same name with an identical schema is a no-op; a
    /// mismatched schema is a fatal startup error (spec §4.A "Failure").
    pub fn register<T: Component>(&self) -> EngineResult<TypeId> {
        self.register_dynamic(T::NAME, T::property_schema())
    }

    /// Non-generic form of [`Registry::register`], used by tooling that works
    /// from names and schemas rather than concrete Rust types.
    pub fn register_dynamic(&self, name: &str, schema: PropertySchema) -> EngineResult<TypeId> {
        let type_id = TypeId::derive_from_name(name);
        let mut inner = self.inner.write().unwrap();

        if let Some(existing) = inner.by_name.get(name) {
            if existing.property_schema != schema {
                return Err(EngineError::Fatal(format!(
                    "component '{name}' re-registered with a mismatched schema"
                )));
            }
            return Ok(existing.type_id);
        }

        let partition_table = match self.strategy {
            PartitionStrategy::List => Some(ComponentDescriptor::partition_table_name(name)),
            PartitionStrategy::Hash => None,
        };

        inner.by_name.insert(
            name.to_string(),
            ComponentDescriptor {
                name: name.to_string(),
                type_id,
                property_schema: schema,
                partition_table,
                migrated: false,
            },
        );
        inner.by_type_id.insert(type_id, name.to_string());
        inner
            .notifiers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Notify::new()));

        Ok(type_id)
    }

    /// Looks up a registered type's stable id by name.
    pub fn type_id_of(&self, name: &str) -> Option<TypeId> {
        self.inner.read().unwrap().by_name.get(name).map(|d| d.type_id)
    }

    /// Looks up a registered type's name by id.
    pub fn name_of(&self, type_id: TypeId) -> Option<String> {
        self.inner.read().unwrap().by_type_id.get(&type_id).cloned()
    }

    /// Returns the declared property schema for a registered type.
    pub fn property_schema_of(&self, type_id: TypeId) -> Option<PropertySchema> {
        let inner = self.inner.read().unwrap();
        let name = inner.by_type_id.get(&type_id)?;
        inner.by_name.get(name).map(|d| d.property_schema.clone())
    }

    /// Returns a full descriptor by name.
    pub fn descriptor(&self, name: &str) -> Option<ComponentDescriptor> {
        self.inner.read().unwrap().by_name.get(name).cloned()
    }

    /// Returns a full descriptor by type id.
    pub fn descriptor_by_type_id(&self, type_id: TypeId) -> Option<ComponentDescriptor> {
        let inner = self.inner.read().unwrap();
        let name = inner.by_type_id.get(&type_id)?;
        inner.by_name.get(name).cloned()
    }

    /// The active partitioning strategy.
    pub fn strategy(&self) -> PartitionStrategy {
        self.strategy
    }

    /// Resolves once `migrate()` has finished persisting this component's
    /// metadata/partition. Resolves immediately if the type was never
    /// registered (callers are expected to validate registration separately).
    pub async fn ready(&self, name: &str) {
        let already_migrated = {
            let inner = self.inner.read().unwrap();
            inner.by_name.get(name).map(|d| d.migrated).unwrap_or(true)
        };
        if already_migrated {
            return;
        }
        let notify = {
            let inner = self.inner.read().unwrap();
            inner.notifiers.get(name).cloned()
        };
        if let Some(notify) = notify {
            notify.notified().await;
        }
    }

    /// Persists metadata for every not-yet-migrated registered type into
    /// `component_types`, and, under LIST partitioning, creates its partition.
    /// Safe to call repeatedly; already-migrated types are skipped.
    pub async fn migrate(&self, pool: &sqlx::PgPool) -> EngineResult<()> {
        let pending: Vec<ComponentDescriptor> = {
            let inner = self.inner.read().unwrap();
            inner
                .by_name
                .values()
                .filter(|d| !d.migrated)
                .cloned()
                .collect()
        };

        for descriptor in pending {
            crate::sql::ddl::register_component_type(pool, &descriptor).await?;

            let mut inner = self.inner.write().unwrap();
            if let Some(entry) = inner.by_name.get_mut(&descriptor.name) {
                entry.migrated = true;
            }
            if let Some(notify) = inner.notifiers.get(&descriptor.name) {
                notify.notify_waiters();
            }
        }

        Ok(())
    }
}
