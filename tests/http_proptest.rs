//! Property tests driving [`entitydb::http`] end to end through an
//! `axum_test::TestServer`, mirroring the teacher crate's `tests/proptest.rs`
//! harness. Skips gracefully (each case passes trivially) when no reachable
//! Postgres is configured via `TEST_DATABASE_URL`, the same convention the
//! Postgres-gated unit tests elsewhere in this crate use.

use std::sync::Arc;

use axum_test::TestServer;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use entitydb::{Component, Config, Engine, PropertyDescriptor, PropertyKind, PropertySchema};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Blob {
    #[serde(flatten)]
    value: Value,
}

impl Component for Blob {
    const NAME: &'static str = "Blob";

    fn property_schema() -> PropertySchema {
        PropertySchema {
            fields: vec![PropertyDescriptor {
                name: "value".to_string(),
                kind: PropertyKind::Json,
                indexed: false,
            }],
        }
    }
}

async fn maybe_server() -> Option<TestServer> {
    let base_url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/entitydb_test".to_string());

    let mut config = Config::default();
    config.database = entitydb::DatabaseTarget::Url {
        url: base_url,
        pool_size: 5,
    };

    let engine = Engine::connect(config).await.ok()?;
    engine.register::<Blob>().ok()?;
    engine.migrate().await.ok()?;

    let router = entitydb::create_entity_router(Arc::new(engine));
    Some(TestServer::new(router).expect("axum_test server builds from a valid router"))
}

mod strategies {
    use super::*;
    use proptest::collection::hash_map;
    use proptest::string::string_regex;

    /// Mirrors the teacher's `json_value_strategy`: a small grab-bag of
    /// scalars plus shallow string-keyed objects, enough to exercise JSONB
    /// round-tripping without needing a recursive shrinker.
    pub fn json_value_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<String>().prop_map(Value::String),
            any::<i64>().prop_map(|n| json!(n)),
            any::<bool>().prop_map(Value::Bool),
            hash_map(
                string_regex(r"[a-zA-Z][a-zA-Z0-9_]{0,15}").unwrap(),
                any::<String>().prop_map(Value::String),
                1..4,
            )
            .prop_map(|map| json!(map)),
        ]
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    #[test]
    fn entity_creation_round_trips_component_data(data in strategies::json_value_strategy()) {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let Some(server) = maybe_server().await else {
                return Ok(());
            };

            let create_response = server
                .post("/entity")
                .json(&json!({ "components": [{ "type": "Blob", "data": data }] }))
                .await;
            create_response.assert_status_ok();
            let created: Value = create_response.json();
            let entity_id = created["entityId"].as_str().unwrap().to_string();

            let get_response = server.get(&format!("/entity/{entity_id}")).await;
            get_response.assert_status_ok();
            let fetched: Value = get_response.json();
            prop_assert_eq!(fetched["persisted"].as_bool(), Some(true));
            Ok(())
        })?
    }

    #[test]
    fn deleted_entity_is_no_longer_found(data in strategies::json_value_strategy()) {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let Some(server) = maybe_server().await else {
                return Ok(());
            };

            let create_response = server
                .post("/entity")
                .json(&json!({ "components": [{ "type": "Blob", "data": data }] }))
                .await;
            create_response.assert_status_ok();
            let created: Value = create_response.json();
            let entity_id = created["entityId"].as_str().unwrap().to_string();

            let delete_response = server.delete(&format!("/entity/{entity_id}")).await;
            delete_response.assert_status(axum::http::StatusCode::NO_CONTENT);

            let get_response = server.get(&format!("/entity/{entity_id}")).await;
            get_response.assert_status_not_found();
            Ok(())
        })?
    }
}

#[tokio::test]
async fn put_component_on_missing_entity_returns_404() {
    let Some(server) = maybe_server().await else {
        return;
    };

    let response = server
        .post("/entity/ent:00000000000000000000000000/component/Blob")
        .json(&json!({ "k": "v" }))
        .await;
    response.assert_status_not_found();
}
