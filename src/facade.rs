//! # Engine Façade (spec §6)
//!
//! `Engine` is the single entry point applications construct: one pool, one
//! [`Registry`], one [`PreparedStatementCache`], one [`ComponentCache`], one
//! [`HookDispatcher`], one [`CustomOperatorRegistry`] — built once at startup
//! from a [`Config`] and shared (via `Arc`) across every request thereafter.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::component_cache::ComponentCache;
use crate::config::{CacheProviderKind, Config};
use crate::context::RequestContext;
use crate::entity::Entity;
use crate::error::{EngineError, EngineResult};
use crate::hooks::HookDispatcher;
use crate::id::{EntityId, TypeId};
use crate::loaders::{ComponentLoader, EntityLoader, LoaderSet, RelationLoader};
use crate::prepared_cache::PreparedStatementCache;
use crate::query::{CustomOperatorFn, CustomOperatorRegistry, QueryBuilder};
use crate::registry::{Component, Registry};

/// The engine's constructed-once, shared resources (spec §6 "Global process
/// state: one per connected database").
pub struct Engine {
    pool: PgPool,
    config: Config,
    registry: Arc<Registry>,
    prepared_cache: Arc<PreparedStatementCache>,
    component_cache: Arc<ComponentCache>,
    hooks: Arc<HookDispatcher>,
    custom_operators: Arc<CustomOperatorRegistry>,
}

impl Engine {
    /// Connects to PostgreSQL, applies the base schema, and returns a ready
    /// `Engine`. Component types registered later via [`Engine::register`]
    /// still need an explicit [`Engine::migrate`] call before they're durable.
    pub async fn connect(config: Config) -> EngineResult<Self> {
        config.validate().map_err(EngineError::Fatal)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.database.pool_size())
            .acquire_timeout(Duration::from_millis(
                match &config.database {
                    crate::config::DatabaseTarget::Parameters(c) => c.connect_timeout_ms,
                    crate::config::DatabaseTarget::Url { .. } => 5_000,
                },
            ))
            .connect(&config.database.url())
            .await?;

        crate::sql::ddl::initialize_base_schema(&pool, config.partition_strategy, config.hash_partition_count)
            .await?;

        let component_cache = if config.cache.enabled && config.cache.component.enabled {
            match config.cache.provider {
                CacheProviderKind::Memory => ComponentCache::in_memory(Duration::from_millis(config.cache.component.ttl_ms)),
                CacheProviderKind::External => {
                    return Err(EngineError::Fatal(
                        "external cache provider selected but none was supplied; construct Engine::with_component_cache instead".to_string(),
                    ))
                }
            }
        } else {
            ComponentCache::new(
                Box::new(crate::component_cache::InMemoryCacheProvider::default()),
                Duration::from_millis(config.cache.component.ttl_ms),
                false,
            )
        };

        Ok(Engine {
            pool,
            registry: Arc::new(Registry::new(config.partition_strategy)),
            prepared_cache: Arc::new(PreparedStatementCache::new(config.prepared_cache_size)),
            component_cache: Arc::new(component_cache),
            hooks: Arc::new(HookDispatcher::new()),
            custom_operators: Arc::new(CustomOperatorRegistry::new()),
            config,
        })
    }

    /// Registers a component type (spec §4.A). Synchronous and purely
    /// in-memory; call [`Engine::migrate`] afterward to persist its metadata
    /// and, under LIST partitioning, create its partition.
    pub fn register<T: Component>(&self) -> EngineResult<TypeId> {
        self.registry.register::<T>()
    }

    /// Persists metadata/partitions for every not-yet-migrated registered
    /// component type.
    pub async fn migrate(&self) -> EngineResult<()> {
        self.registry.migrate(&self.pool).await
    }

    /// Registers a named custom query filter operator (spec §4.G extensible
    /// operator registry).
    pub fn register_custom_operator(&self, name: impl Into<String>, builder: CustomOperatorFn) {
        self.custom_operators.register(name, builder);
    }

    /// Direct access to the lifecycle hook dispatcher, for registering hooks
    /// (spec §4.H).
    pub fn hooks(&self) -> &HookDispatcher {
        self.hooks.as_ref()
    }

    /// The underlying connection pool, for callers that need raw access
    /// (migrations, admin tooling).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The resolved configuration this engine was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds a fresh, request-scoped loader set (spec §4.E: "constructed
    /// once per request/unit of work, never shared across requests").
    pub fn loaders(&self) -> Arc<LoaderSet> {
        Arc::new(LoaderSet {
            entities: EntityLoader::new(
                self.pool.clone(),
                Duration::from_millis(self.config.loader_batch_window_ms),
                self.config.loader_max_batch_size,
            ),
            components: ComponentLoader::new(
                self.pool.clone(),
                Arc::clone(&self.component_cache),
                Duration::from_millis(self.config.loader_batch_window_ms),
                self.config.loader_max_batch_size,
                false,
            ),
            relations: RelationLoader::new(
                self.pool.clone(),
                Duration::from_millis(self.config.loader_batch_window_ms),
                self.config.loader_max_batch_size,
            ),
        })
    }

    /// Builds a fresh request context backed by this engine's pool and a new
    /// loader set.
    pub fn context(&self) -> RequestContext {
        RequestContext::new(self.loaders()).with_pool(self.pool.clone())
    }

    /// Starts a fluent query against this engine's resources (spec §4.G).
    pub fn query(&self) -> QueryBuilder {
        QueryBuilder::new(
            self.pool.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.prepared_cache),
            Arc::clone(&self.component_cache),
            Arc::clone(&self.custom_operators),
        )
    }

    /// Loads a single entity by id (spec §9: a free function in `query`,
    /// exposed here as a convenience method on the façade).
    pub async fn find_by_id(&self, id: EntityId) -> EngineResult<Option<Entity>> {
        crate::query::find_by_id(&self.pool, id).await
    }

    /// Creates a brand-new, unpersisted entity.
    pub fn new_entity(&self) -> std::io::Result<Entity> {
        Entity::new()
    }

    /// Saves `entity`, dispatching lifecycle hooks and honoring
    /// `save_timeout_ms` (spec §4.F).
    pub async fn save(&self, entity: &mut Entity) -> EngineResult<()> {
        entity
            .save(
                &self.pool,
                &self.component_cache,
                &self.hooks,
                Duration::from_millis(self.config.save_timeout_ms),
            )
            .await
    }

    /// Deletes `entity`, soft by default (spec §4.F `delete`).
    pub async fn delete(&self, entity: &mut Entity, force: bool) -> EngineResult<()> {
        entity.delete(&self.pool, &self.component_cache, &self.hooks, force).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PropertyKind, PropertySchema, PropertyDescriptor};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Profile {
        name: String,
    }

    impl Component for Profile {
        const NAME: &'static str = "Profile";

        fn property_schema() -> PropertySchema {
            PropertySchema {
                fields: vec![PropertyDescriptor {
                    name: "name".to_string(),
                    kind: PropertyKind::String,
                    indexed: true,
                }],
            }
        }
    }

    #[tokio::test]
    async fn connect_rejects_invalid_config() {
        let mut config = Config::default();
        config.partition_strategy = crate::config::PartitionStrategy::Hash;
        config.hash_partition_count = 7;

        let result = Engine::connect(config).await;
        assert!(matches!(result, Err(EngineError::Fatal(_))));
    }

    #[tokio::test]
    async fn connect_bootstraps_schema_and_supports_save_and_query() {
        let base_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/entitydb_test".to_string());
        let mut config = Config::default();
        config.database = crate::config::DatabaseTarget::Url {
            url: base_url,
            pool_size: 5,
        };

        let engine = match Engine::connect(config).await {
            Ok(engine) => engine,
            Err(_) => return, // no reachable Postgres in this environment; skip
        };

        engine.register::<Profile>().unwrap();
        engine.migrate().await.unwrap();

        let mut entity = engine.new_entity().unwrap();
        entity.add(Profile { name: "Ada".to_string() }).unwrap();
        engine.save(&mut entity).await.unwrap();

        let found = engine.find_by_id(entity.id()).await.unwrap();
        assert!(found.is_some());
    }
}
