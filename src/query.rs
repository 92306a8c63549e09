//! # Query Planner & Executor (spec §4.G)
//!
//! A fluent builder that assembles one dynamic SQL statement per distinct
//! *shape* — which components are required/forbidden, which fields are
//! filtered by which operator, whether a sort/limit/offset/populate is
//! present — and reuses the rendered SQL text for every execution of that
//! shape via [`crate::prepared_cache::PreparedStatementCache`]. Literal
//! filter values never enter the shape key; they're bound positionally on
//! every call, independently of whether the shape was a cache hit.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::component_cache::ComponentCache;
use crate::context::CacheBypass;
use crate::entity::Entity;
use crate::error::{EngineError, EngineResult};
use crate::id::{EntityId, TypeId};
use crate::prepared_cache::{PreparedStatementCache, ShapeKey};
use crate::registry::Registry;

/// A comparison operator applied to one JSON field path (spec §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// `=`
    Eq,
    /// `<>`
    Neq,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `LIKE`
    Like,
    /// `ILIKE`
    Ilike,
    /// `= ANY(...)`
    In,
    /// `<> ALL(...)`
    NotIn,
    /// `IS NULL`
    IsNull,
    /// `IS NOT NULL`
    IsNotNull,
}

impl FilterOp {
    fn is_numeric(self) -> bool {
        matches!(self, FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte)
    }

    fn sql_symbol(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Neq => "<>",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Like => "LIKE",
            FilterOp::Ilike => "ILIKE",
            FilterOp::In | FilterOp::NotIn | FilterOp::IsNull | FilterOp::IsNotNull => "",
        }
    }
}

/// How a filter's SQL fragment is produced: one of the built-in operators, or
/// a named entry in a [`CustomOperatorRegistry`] (spec §4.G "extensible
/// registry for custom builders").
#[derive(Debug, Clone)]
pub enum FilterKind {
    /// One of [`FilterOp`]'s built-in comparisons.
    Standard(FilterOp),
    /// A registered custom operator, looked up by name at render time.
    Custom(String),
}

/// One `(fieldPath, operator, value)` predicate on a required component.
#[derive(Debug, Clone)]
pub struct Filter {
    /// JSON field path within the component's payload.
    pub field_path: String,
    /// How to compare it.
    pub kind: FilterKind,
    /// The comparison value; `None` for `IsNull`/`IsNotNull`.
    pub value: Option<Value>,
}

impl Filter {
    /// Builds a standard-operator filter.
    pub fn new(field_path: impl Into<String>, op: FilterOp, value: impl Into<Option<Value>>) -> Self {
        Filter {
            field_path: field_path.into(),
            kind: FilterKind::Standard(op),
            value: value.into(),
        }
    }

    /// Builds a filter dispatched through a named custom operator.
    pub fn custom(field_path: impl Into<String>, operator_name: impl Into<String>, value: Value) -> Self {
        Filter {
            field_path: field_path.into(),
            kind: FilterKind::Custom(operator_name.into()),
            value: Some(value),
        }
    }
}

/// Parameter allocation handed to a [`CustomOperatorFn`] so it can reserve
/// its own `$n` placeholders within the statement under construction.
pub struct QueryParamContext<'a> {
    binds: &'a mut Vec<BindValue>,
}

impl<'a> QueryParamContext<'a> {
    /// Reserves the next placeholder for `value`, returning its 1-based `$n` index.
    pub fn allocate(&mut self, value: BindValue) -> usize {
        self.binds.push(value);
        self.binds.len()
    }
}

/// A custom filter builder: given the component's SQL alias, the field path,
/// the filter's value, and a parameter context, returns the SQL fragment to
/// AND into the WHERE clause.
pub type CustomOperatorFn = Arc<dyn Fn(&str, &str, &Value, &mut QueryParamContext) -> String + Send + Sync>;

/// Process-wide registry of named custom filter operators (e.g. a spatial
/// "within_radius" predicate), mirroring [`Registry`]'s "construct once,
/// inject" shape.
#[derive(Default)]
pub struct CustomOperatorRegistry {
    builders: RwLock<HashMap<String, CustomOperatorFn>>,
}

impl CustomOperatorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        CustomOperatorRegistry::default()
    }

    /// Registers a custom operator under `name`, replacing any prior entry.
    pub fn register(&self, name: impl Into<String>, builder: CustomOperatorFn) {
        self.builders.write().unwrap().insert(name.into(), builder);
    }

    fn get(&self, name: &str) -> Option<CustomOperatorFn> {
        self.builders.read().unwrap().get(name).cloned()
    }
}

/// Sort direction for [`QueryBuilder::sort_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

impl SortDirection {
    fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
struct SortSpec {
    type_id: TypeId,
    field: String,
    direction: SortDirection,
}

#[derive(Debug, Clone)]
struct RequiredComponent {
    type_id: TypeId,
    filters: Vec<Filter>,
}

/// One alternative in an OR-group: require `type_id` with `filters`.
#[derive(Debug, Clone)]
pub struct OrAlternative {
    /// The component required by this alternative.
    pub type_id: TypeId,
    /// Its filters.
    pub filters: Vec<Filter>,
}

/// A disjunction across alternative component requirements (spec §4.G
/// "OR-groups").
#[derive(Debug, Clone)]
pub struct OrGroup(pub Vec<OrAlternative>);

/// A bound literal value, positionally attached to the rendered SQL's `$n`
/// placeholders.
#[derive(Debug, Clone)]
pub enum BindValue {
    /// A 16-byte identifier (entity/type id).
    Bytes(Vec<u8>),
    /// A text comparison value.
    Text(String),
    /// A numeric comparison value.
    Float(f64),
    /// An array of text values, for `IN`/`NOT IN`.
    TextArray(Vec<String>),
}

enum QueryMode {
    Rows,
    Count,
}

impl QueryMode {
    fn shape_tag(&self) -> &'static str {
        match self {
            QueryMode::Rows => "rows",
            QueryMode::Count => "count",
        }
    }
}

/// The fluent query surface (spec §4.G). Built fresh per request via
/// [`crate::facade::Engine::query`]; not `Send` across awaits by design —
/// one query, one owner, matching [`Entity`]'s non-thread-safety.
pub struct QueryBuilder {
    pool: PgPool,
    registry: Arc<Registry>,
    prepared_cache: Arc<PreparedStatementCache>,
    component_cache: Arc<ComponentCache>,
    custom_operators: Arc<CustomOperatorRegistry>,

    required: Vec<RequiredComponent>,
    or_groups: Vec<OrGroup>,
    forbidden: Vec<TypeId>,
    find_id: Option<EntityId>,
    exclude_id: Option<EntityId>,
    sort: Option<SortSpec>,
    limit: Option<i64>,
    offset: Option<i64>,
    populate: bool,
    eager_load: Vec<TypeId>,
    bypass: CacheBypass,
    debug: bool,
}

impl QueryBuilder {
    /// Constructs an empty query against the given engine resources.
    pub fn new(
        pool: PgPool,
        registry: Arc<Registry>,
        prepared_cache: Arc<PreparedStatementCache>,
        component_cache: Arc<ComponentCache>,
        custom_operators: Arc<CustomOperatorRegistry>,
    ) -> Self {
        QueryBuilder {
            pool,
            registry,
            prepared_cache,
            component_cache,
            custom_operators,
            required: Vec::new(),
            or_groups: Vec::new(),
            forbidden: Vec::new(),
            find_id: None,
            exclude_id: None,
            sort: None,
            limit: None,
            offset: None,
            populate: false,
            eager_load: Vec::new(),
            bypass: CacheBypass::none(),
            debug: false,
        }
    }

    /// Requires `type_id`, optionally filtered.
    pub fn with(mut self, type_id: TypeId, filters: Vec<Filter>) -> Self {
        self.required.push(RequiredComponent { type_id, filters });
        self
    }

    /// Requires that at least one alternative in `group` hold.
    pub fn with_or(mut self, group: OrGroup) -> Self {
        self.or_groups.push(group);
        self
    }

    /// Forbids `type_id` from being attached.
    pub fn without(mut self, type_id: TypeId) -> Self {
        self.forbidden.push(type_id);
        self
    }

    /// Restricts the result to a single entity.
    pub fn find_by_id(mut self, id: EntityId) -> Self {
        self.find_id = Some(id);
        self
    }

    /// Excludes a specific entity from the result.
    pub fn exclude_entity_id(mut self, id: EntityId) -> Self {
        self.exclude_id = Some(id);
        self
    }

    /// Orders by a JSON field of a required component; ties (and a missing
    /// sort) always break on `entity_id` ascending (spec §4.G "Tie-breaks").
    pub fn sort_by(mut self, type_id: TypeId, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            type_id,
            field: field.into(),
            direction,
        });
        self
    }

    /// `LIMIT n`.
    pub fn take(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    /// `OFFSET m`.
    pub fn offset(mut self, m: i64) -> Self {
        self.offset = Some(m);
        self
    }

    /// After entity resolution, bulk-loads the components named in `with`
    /// into each returned entity.
    pub fn populate(mut self) -> Self {
        self.populate = true;
        self
    }

    /// Like `populate`, but for an explicit component list that may include
    /// types not named in `with`.
    pub fn eager_load_components(mut self, type_ids: Vec<TypeId>) -> Self {
        self.eager_load = type_ids;
        self
    }

    /// Bypasses the named caches for this execution only.
    pub fn no_cache(mut self, bypass: CacheBypass) -> Self {
        self.bypass = bypass;
        self
    }

    /// Logs the rendered SQL and bind count at `debug` level before executing.
    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    fn root_alias(&self) -> &'static str {
        if self.required.is_empty() {
            "e"
        } else {
            "c0"
        }
    }

    /// Validates `type_id` is registered and returns its `FROM` fragment.
    ///
    /// Every component type lives in the shared `components` relation — under
    /// LIST partitioning that relation is itself partitioned by `type_id`
    /// (spec §4.B), but Postgres prunes to the matching child partition on
    /// its own from the `type_id = $n` predicate; there is no separate
    /// per-type table name to address in a query.
    fn table_ref(&self, type_id: TypeId, alias: &str) -> EngineResult<String> {
        self.registry
            .descriptor_by_type_id(type_id)
            .ok_or_else(|| EngineError::Validation(format!("component type {type_id} is not registered")))?;
        Ok(format!("components {alias}"))
    }

    fn shape_key(&self, mode: QueryMode) -> ShapeKey {
        let mut parts = Vec::new();
        parts.push(mode.shape_tag().to_string());
        for component in &self.required {
            let mut fragment = format!("with({}", component.type_id);
            for filter in &component.filters {
                let op = match &filter.kind {
                    FilterKind::Standard(op) => format!("{op:?}"),
                    FilterKind::Custom(name) => format!("custom:{name}"),
                };
                fragment.push_str(&format!(":{}.{op}", filter.field_path));
            }
            fragment.push(')');
            parts.push(fragment);
        }
        for group in &self.or_groups {
            let alt_shapes: Vec<String> = group
                .0
                .iter()
                .map(|alt| format!("{}[{}]", alt.type_id, alt.filters.len()))
                .collect();
            parts.push(format!("or({})", alt_shapes.join("|")));
        }
        for type_id in &self.forbidden {
            parts.push(format!("without({type_id})"));
        }
        if self.find_id.is_some() {
            parts.push("findById".to_string());
        }
        if self.exclude_id.is_some() {
            parts.push("excludeId".to_string());
        }
        if let Some(sort) = &self.sort {
            parts.push(format!("sort({}.{}.{:?})", sort.type_id, sort.field, sort.direction));
        }
        if self.limit.is_some() {
            parts.push("limit".to_string());
        }
        if self.offset.is_some() {
            parts.push("offset".to_string());
        }
        if self.populate {
            parts.push("populate".to_string());
        }
        if !self.eager_load.is_empty() {
            parts.push(format!("eager({})", self.eager_load.len()));
        }
        ShapeKey::new(parts.join("+"))
    }

    fn render_filter(&self, alias: &str, filter: &Filter, binds: &mut Vec<BindValue>) -> EngineResult<String> {
        validate_field_path(&filter.field_path)?;
        match &filter.kind {
            FilterKind::Standard(FilterOp::IsNull) => {
                Ok(format!("({alias}.data -> '{}') IS NULL", filter.field_path))
            }
            FilterKind::Standard(FilterOp::IsNotNull) => {
                Ok(format!("({alias}.data -> '{}') IS NOT NULL", filter.field_path))
            }
            FilterKind::Standard(op @ (FilterOp::In | FilterOp::NotIn)) => {
                let values = filter
                    .value
                    .as_ref()
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| EngineError::Validation("IN/NOT_IN filter requires an array value".to_string()))?;
                let texts: Vec<String> = values.iter().map(value_to_text).collect();
                binds.push(BindValue::TextArray(texts));
                let placeholder = binds.len();
                let comparator = if *op == FilterOp::In { "= ANY" } else { "<> ALL" };
                Ok(format!(
                    "({alias}.data ->> '{}') {comparator}(${placeholder})",
                    filter.field_path
                ))
            }
            FilterKind::Standard(op) if op.is_numeric() => {
                let value = filter
                    .value
                    .as_ref()
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| EngineError::Validation("numeric filter requires a numeric value".to_string()))?;
                binds.push(BindValue::Float(value));
                let placeholder = binds.len();
                Ok(format!(
                    "({alias}.data ->> '{}')::double precision {} ${placeholder}",
                    filter.field_path,
                    op.sql_symbol()
                ))
            }
            FilterKind::Standard(op) => {
                let value = filter
                    .value
                    .as_ref()
                    .map(value_to_text)
                    .ok_or_else(|| EngineError::Validation("filter requires a value".to_string()))?;
                binds.push(BindValue::Text(value));
                let placeholder = binds.len();
                Ok(format!(
                    "({alias}.data ->> '{}') {} ${placeholder}",
                    filter.field_path,
                    op.sql_symbol()
                ))
            }
            FilterKind::Custom(name) => {
                let builder = self
                    .custom_operators
                    .get(name)
                    .ok_or_else(|| EngineError::Validation(format!("unknown custom operator '{name}'")))?;
                let value = filter
                    .value
                    .as_ref()
                    .ok_or_else(|| EngineError::Validation("custom operator requires a value".to_string()))?;
                let mut ctx = QueryParamContext { binds };
                Ok(builder(alias, &filter.field_path, value, &mut ctx))
            }
        }
    }

    fn render(&self, mode: QueryMode) -> EngineResult<(String, Vec<BindValue>)> {
        let mut binds: Vec<BindValue> = Vec::new();
        let mut from_clauses: Vec<String> = Vec::new();
        let mut where_clauses: Vec<String> = Vec::new();

        if self.required.is_empty() {
            from_clauses.push("entities e".to_string());
            where_clauses.push("e.deleted_at IS NULL".to_string());
        } else {
            for (index, component) in self.required.iter().enumerate() {
                let alias = format!("c{index}");
                from_clauses.push(self.table_ref(component.type_id, &alias)?);
                where_clauses.push(format!("{alias}.deleted_at IS NULL"));
                binds.push(BindValue::Bytes(component.type_id.as_bytes().to_vec()));
                where_clauses.push(format!("{alias}.type_id = ${}", binds.len()));
                if index > 0 {
                    where_clauses.push(format!("{alias}.entity_id = c0.entity_id"));
                }
                for filter in &component.filters {
                    where_clauses.push(self.render_filter(&alias, filter, &mut binds)?);
                }
            }
        }

        let root = self.root_alias();

        for group in &self.or_groups {
            let mut alt_fragments = Vec::new();
            for alt in &group.0 {
                let alias = format!("or{}", alt_fragments.len());
                let table = self.table_ref(alt.type_id, &alias)?;
                binds.push(BindValue::Bytes(alt.type_id.as_bytes().to_vec()));
                let mut alt_where = vec![
                    format!("{alias}.entity_id = {root}.entity_id"),
                    format!("{alias}.deleted_at IS NULL"),
                    format!("{alias}.type_id = ${}", binds.len()),
                ];
                for filter in &alt.filters {
                    alt_where.push(self.render_filter(&alias, filter, &mut binds)?);
                }
                alt_fragments.push(format!(
                    "EXISTS (SELECT 1 FROM {table} WHERE {})",
                    alt_where.join(" AND ")
                ));
            }
            where_clauses.push(format!("({})", alt_fragments.join(" OR ")));
        }

        for type_id in &self.forbidden {
            binds.push(BindValue::Bytes(type_id.as_bytes().to_vec()));
            where_clauses.push(format!(
                "NOT EXISTS (SELECT 1 FROM entity_components ec WHERE ec.entity_id = {root}.entity_id AND ec.type_id = ${} AND ec.deleted_at IS NULL)",
                binds.len()
            ));
        }

        if let Some(id) = self.find_id {
            binds.push(BindValue::Bytes(id.as_bytes().to_vec()));
            where_clauses.push(format!("{root}.entity_id = ${}", binds.len()));
        }
        if let Some(id) = self.exclude_id {
            binds.push(BindValue::Bytes(id.as_bytes().to_vec()));
            where_clauses.push(format!("{root}.entity_id <> ${}", binds.len()));
        }

        let select = match mode {
            QueryMode::Rows => format!("SELECT DISTINCT {root}.entity_id AS entity_id"),
            QueryMode::Count => format!("SELECT COUNT(DISTINCT {root}.entity_id) AS count"),
        };

        let mut sql = select;
        sql.push_str(" FROM ");
        sql.push_str(&from_clauses.join(", "));
        if !where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clauses.join(" AND "));
        }

        if let QueryMode::Rows = mode {
            let mut order_fragments = Vec::new();
            if let Some(sort) = &self.sort {
                validate_field_path(&sort.field)?;
                let sort_alias = self
                    .required
                    .iter()
                    .position(|c| c.type_id == sort.type_id)
                    .map(|i| format!("c{i}"))
                    .unwrap_or_else(|| root.to_string());
                order_fragments.push(format!(
                    "({sort_alias}.data ->> '{}') {}",
                    sort.field,
                    sort.direction.sql()
                ));
            }
            order_fragments.push(format!("{root}.entity_id ASC"));
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_fragments.join(", "));

            if let Some(limit) = self.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            if let Some(offset) = self.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        Ok((sql, binds))
    }

    fn bind_query<'q>(
        mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        binds: &'q [BindValue],
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        for bind in binds {
            query = match bind {
                BindValue::Bytes(b) => query.bind(b.as_slice()),
                BindValue::Text(t) => query.bind(t.as_str()),
                BindValue::Float(f) => query.bind(*f),
                BindValue::TextArray(arr) => query.bind(arr.as_slice()),
            };
        }
        query
    }

    /// Runs the query, returning resolved entities: bare (id only, no
    /// components in memory) unless `populate`/`eager_load_components` is
    /// set, in which case exactly one bulk component fetch follows the id
    /// query (spec §8 scenario S6: "exactly two SQL statements"). Without
    /// populate, subsequent `get()` calls lazily fetch at most once per
    /// `(entity, type)`.
    pub async fn exec(self) -> EngineResult<Vec<Entity>> {
        let (sql, binds) = self.render(QueryMode::Rows)?;
        let rendered = if self.bypass.prepared {
            sql.clone()
        } else {
            let shape = self.shape_key(QueryMode::Rows);
            self.prepared_cache.get_or_create(&shape, || sql.clone())
        };

        if self.debug {
            tracing::debug!(sql = %rendered, params = binds.len(), "executing query");
        }

        let query = sqlx::query(&rendered);
        let query = Self::bind_query(query, &binds);
        let rows = query.fetch_all(&self.pool).await?;

        let ids: Vec<EntityId> = rows
            .into_iter()
            .map(|row| {
                let bytes: Vec<u8> = row.try_get("entity_id")?;
                let array: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| EngineError::Validation("invalid entity_id length".to_string()))?;
                Ok(EntityId::from_bytes(array))
            })
            .collect::<EngineResult<Vec<_>>>()?;

        // The id query already filters soft-deleted entities (their live
        // components wouldn't have matched either), so no second metadata
        // fetch is needed just to materialize bare entities.
        let mut entities: Vec<Entity> = ids.into_iter().map(Entity::from_persisted).collect();

        let mut eager: Vec<TypeId> = self.eager_load.clone();
        if self.populate {
            eager.extend(self.required.iter().map(|c| c.type_id));
        }
        if !eager.is_empty() {
            eager.sort_by_key(|t| t.to_string());
            eager.dedup();
            Entity::load_components(&self.pool, &mut entities, &eager).await?;
        }

        Ok(entities)
    }

    /// Runs a `COUNT(DISTINCT entity_id)` for this query's shape, without
    /// ordering or pagination (spec §4.G SQL shape rule 6).
    pub async fn count(self) -> EngineResult<i64> {
        let (sql, binds) = self.render(QueryMode::Count)?;
        let rendered = if self.bypass.prepared {
            sql.clone()
        } else {
            let shape = self.shape_key(QueryMode::Count);
            self.prepared_cache.get_or_create(&shape, || sql.clone())
        };

        let query = sqlx::query(&rendered);
        let query = Self::bind_query(query, &binds);
        let row = query.fetch_one(&self.pool).await?;
        let count: i64 = row.try_get("count")?;
        Ok(count)
    }

    /// Runs `EXPLAIN ANALYZE` over this query's row-mode SQL and returns the
    /// server's plan, one line per row (spec §4.G "observability").
    pub async fn explain_analyze(self) -> EngineResult<String> {
        let (sql, binds) = self.render(QueryMode::Rows)?;
        let explain_sql = format!("EXPLAIN ANALYZE {sql}");
        let query = sqlx::query(&explain_sql);
        let query = Self::bind_query(query, &binds);
        let rows = query.fetch_all(&self.pool).await?;
        let lines: Vec<String> = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>(0).unwrap_or_default())
            .collect();
        Ok(lines.join("\n"))
    }
}

/// Field paths are spliced directly into the rendered SQL text (`data ->> '...'`)
/// rather than bound as parameters, since Postgres doesn't accept a bind
/// parameter in that position; this is the only thing standing between a
/// caller-supplied path and injection, so it only accepts dotted identifiers.
fn validate_field_path(field_path: &str) -> EngineResult<()> {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
            .expect("static field-path pattern is valid")
    });
    if pattern.is_match(field_path) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "invalid filter field path '{field_path}'"
        )))
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Loads a single entity by id directly, without going through a
/// [`QueryBuilder`] — kept as a free function (not an `Entity` method) to
/// avoid a `query` <-> `entity` import cycle (spec §9).
pub async fn find_by_id(pool: &PgPool, id: EntityId) -> EngineResult<Option<Entity>> {
    let mut entities = Entity::load_multiple(pool, &[id]).await?;
    Ok(entities.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionStrategy;

    fn builder() -> QueryBuilder {
        let registry = Arc::new(Registry::new(PartitionStrategy::List));
        registry
            .register_dynamic(
                "Profile",
                crate::registry::PropertySchema {
                    fields: vec![crate::registry::PropertyDescriptor {
                        name: "name".to_string(),
                        kind: crate::registry::PropertyKind::String,
                        indexed: true,
                    }],
                },
            )
            .unwrap();

        // A query builder needs a live pool to execute, but shape rendering
        // and the shape key are pure functions of builder state and can be
        // exercised without one. `connect_lazy` never touches the network.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/entitydb_test")
            .expect("lazy pool construction never touches the network");

        QueryBuilder::new(
            pool,
            registry,
            Arc::new(PreparedStatementCache::new(50)),
            Arc::new(ComponentCache::in_memory(std::time::Duration::from_secs(30))),
            Arc::new(CustomOperatorRegistry::new()),
        )
    }

    fn profile_type_id() -> TypeId {
        TypeId::derive_from_name("Profile")
    }

    #[test]
    fn shape_key_ignores_literal_values_but_not_operator_or_field() {
        let a = builder()
            .with(profile_type_id(), vec![Filter::new("name", FilterOp::Eq, Value::String("Ada".to_string()))])
            .shape_key(QueryMode::Rows);
        let b = builder()
            .with(profile_type_id(), vec![Filter::new("name", FilterOp::Eq, Value::String("Grace".to_string()))])
            .shape_key(QueryMode::Rows);
        assert_eq!(a, b);

        let c = builder()
            .with(profile_type_id(), vec![Filter::new("name", FilterOp::Gt, Value::String("Ada".to_string()))])
            .shape_key(QueryMode::Rows);
        assert_ne!(a, c);
    }

    #[test]
    fn shape_key_distinguishes_count_from_rows_mode() {
        let query = builder().with(profile_type_id(), Vec::new());
        let rows_key = query.shape_key(QueryMode::Rows);
        let count_key = query.shape_key(QueryMode::Count);
        assert_ne!(rows_key, count_key);
    }

    #[test]
    fn render_appends_entity_id_tie_break_even_without_sort() {
        let (sql, _binds) = builder().with(profile_type_id(), Vec::new()).render(QueryMode::Rows).unwrap();
        assert!(sql.contains("ORDER BY"));
        assert!(sql.contains("c0.entity_id ASC"));
    }

    #[test]
    fn count_mode_strips_ordering_and_pagination() {
        let (sql, _binds) = builder()
            .with(profile_type_id(), Vec::new())
            .take(10)
            .render(QueryMode::Count)
            .unwrap();
        assert!(!sql.contains("ORDER BY"));
        assert!(!sql.contains("LIMIT"));
        assert!(sql.starts_with("SELECT COUNT(DISTINCT"));
    }

    #[test]
    fn unregistered_component_is_a_validation_error() {
        let result = builder()
            .with(TypeId::derive_from_name("Nonexistent"), Vec::new())
            .render(QueryMode::Rows);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn malformed_field_path_is_rejected_before_splicing_into_sql() {
        let result = builder()
            .with(
                profile_type_id(),
                vec![Filter::new(
                    "name'; DROP TABLE components; --",
                    FilterOp::Eq,
                    Value::String("x".to_string()),
                )],
            )
            .render(QueryMode::Rows);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn in_filter_binds_a_text_array() {
        let (_sql, binds) = builder()
            .with(
                profile_type_id(),
                vec![Filter::new(
                    "name",
                    FilterOp::In,
                    Value::Array(vec![Value::String("Ada".to_string()), Value::String("Grace".to_string())]),
                )],
            )
            .render(QueryMode::Rows)
            .unwrap();
        assert!(matches!(binds.last(), Some(BindValue::TextArray(values)) if values.len() == 2));
    }

    #[test]
    fn custom_operator_is_dispatched_by_name() {
        let registry = Arc::new(Registry::new(PartitionStrategy::List));
        registry
            .register_dynamic(
                "Profile",
                crate::registry::PropertySchema {
                    fields: vec![crate::registry::PropertyDescriptor {
                        name: "location".to_string(),
                        kind: crate::registry::PropertyKind::Json,
                        indexed: false,
                    }],
                },
            )
            .unwrap();
        let custom_operators = Arc::new(CustomOperatorRegistry::new());
        custom_operators.register(
            "within_radius",
            Arc::new(|alias, field, _value, ctx| {
                let placeholder = ctx.allocate(BindValue::Float(10.0));
                format!("st_dwithin({alias}.data->'{field}', ${placeholder})")
            }),
        );

        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/entitydb_test")
            .unwrap();
        let query = QueryBuilder::new(
            pool,
            registry,
            Arc::new(PreparedStatementCache::new(50)),
            Arc::new(ComponentCache::in_memory(std::time::Duration::from_secs(30))),
            custom_operators,
        )
        .with(
            profile_type_id(),
            vec![Filter::custom("location", "within_radius", Value::Null)],
        );

        let (sql, binds) = query.render(QueryMode::Rows).unwrap();
        assert!(sql.contains("st_dwithin"));
        assert_eq!(binds.len(), 1);
    }
}
