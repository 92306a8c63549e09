//! # entitydb: a persistent entity-component store over PostgreSQL
//!
//! This crate implements a stigmergic-style shared-data-structure engine —
//! entities are opaque identifiers, components are typed JSON payloads
//! attached to them, and coordination between independent callers happens
//! entirely through reads and writes of that shared state rather than direct
//! calls between them.
//!
//! - **Entity-Component core**: entities are 128-bit time-ordered ids;
//!   components are runtime-registered types validated against a declared
//!   [`registry::PropertySchema`] and stored as `JSONB`.
//! - **Query planner**: a fluent [`query::QueryBuilder`] compiles structural
//!   filter/sort/pagination requests into parameterized SQL, with the
//!   rendered statement text itself cached by structural shape rather than
//!   literal value.
//! - **Request-scoped batching**: [`loaders::LoaderSet`] debounces and
//!   deduplicates concurrent lookups within a unit of work.
//! - **Write-through component cache**: [`component_cache::ComponentCache`]
//!   sits in front of storage with explicit tombstones for confirmed-missing
//!   keys.
//! - **Lifecycle hooks**: [`hooks::HookDispatcher`] notifies registered
//!   callbacks of entity/component create, update, and delete events after
//!   each transaction commits.
//! - **HTTP surface**: [`http::create_entity_router`] exposes a minimal
//!   JSON API over the engine for untyped clients.
//!
//! ## Usage
//!
//! ```no_run
//! # use entitydb::{Config, Engine, Component};
//! # use entitydb::registry::{PropertySchema, PropertyDescriptor, PropertyKind};
//! # use serde::{Serialize, Deserialize};
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Position {
//!     x: f64,
//!     y: f64,
//! }
//!
//! impl Component for Position {
//!     const NAME: &'static str = "Position";
//!
//!     fn property_schema() -> PropertySchema {
//!         PropertySchema {
//!             fields: vec![
//!                 PropertyDescriptor { name: "x".to_string(), kind: PropertyKind::Float, indexed: false },
//!                 PropertyDescriptor { name: "y".to_string(), kind: PropertyKind::Float, indexed: false },
//!             ],
//!         }
//!     }
//! }
//!
//! # async fn example() -> entitydb::error::EngineResult<()> {
//! let engine = Engine::connect(Config::default()).await?;
//! engine.register::<Position>()?;
//! engine.migrate().await?;
//!
//! let mut entity = engine.new_entity().map_err(|e| entitydb::error::EngineError::Fatal(e.to_string()))?;
//! entity.add(Position { x: 1.0, y: 2.0 })?;
//! engine.save(&mut entity).await?;
//! # Ok(())
//! # }
//! ```

pub mod component_cache;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod facade;
pub mod hooks;
pub mod http;
pub mod id;
pub mod loaders;
pub mod prepared_cache;
pub mod query;
pub mod registry;
pub mod schema;
pub mod sql;

pub use component_cache::{CacheKey, CacheLookup, ComponentCache, ComponentRecord};
pub use config::{CacheProviderKind, Config, ConnectionConfig, DatabaseTarget, PartitionStrategy};
pub use context::{CacheBypass, RequestContext};
pub use entity::Entity;
pub use error::{EngineError, EngineResult};
pub use facade::Engine;
pub use hooks::{HookDispatcher, HookEvent, HookOptions};
pub use http::create_entity_router;
pub use id::{ComponentId, EntityId, IdParseError, TypeId};
pub use loaders::LoaderSet;
pub use prepared_cache::PreparedStatementCache;
pub use query::{Filter, FilterOp, OrAlternative, OrGroup, QueryBuilder, SortDirection};
pub use registry::{Component, PropertyDescriptor, PropertyKind, PropertySchema, Registry};
