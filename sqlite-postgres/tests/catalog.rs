mod common;

use common::*;
use pgwire::api::query::SimpleQueryHandler;
use pgwire::api::results::Response;
use rusqlite::types::Value;

/// Startup probes psql and libpq drivers send before the first user
/// query; all of them must succeed against the catalog facade.
const INTROSPECTION_QUERIES: &[&str] = &[
    "SELECT current_schema()",
    "SELECT current_schema",
    "SELECT version()",
    "SELECT current_user, session_user",
    "SELECT datname FROM pg_catalog.pg_database",
    "SELECT oid, typname FROM pg_catalog.pg_type",
    "SELECT relname FROM pg_catalog.pg_class",
    "SELECT nspname FROM pg_catalog.pg_namespace",
    "SELECT description FROM pg_catalog.pg_description",
    "SELECT name, setting FROM pg_catalog.pg_settings",
    "SELECT rngtypid FROM pg_catalog.pg_range",
    "SHOW server_version",
    "select string_agg(word, ',') from pg_catalog.pg_get_keywords()",
];

#[tokio::test]
async fn test_introspection_queries_succeed() {
    let server = setup_service("introspection", "app").await;
    let mut client = MockClient::new();

    for query in INTROSPECTION_QUERIES {
        SimpleQueryHandler::do_query(&server.service, &mut client, query)
            .await
            .expect(&format!("failed to run sql: {query}"));
    }
}

#[tokio::test]
async fn test_pg_database_lists_data_dir() {
    let server = setup_service("pg-database", "alpha").await;
    let mut client = MockClient::new();

    // a second database file appears alongside the session's own
    SimpleQueryHandler::do_query(&server.service, &mut client, "CREATE DATABASE beta")
        .await
        .unwrap();

    let responses = SimpleQueryHandler::do_query(
        &server.service,
        &mut client,
        "SELECT datname FROM pg_catalog.pg_database",
    )
    .await
    .unwrap();
    assert!(matches!(responses[0], Response::Query(_)));

    let store = server.registry.open("alpha").await.unwrap();
    let result = store
        .query(
            "SELECT datname FROM pg_catalog.pg_database ORDER BY datname",
            &[],
        )
        .await
        .unwrap();
    let names: Vec<&Value> = result.rows.iter().map(|row| &row[0]).collect();
    assert_eq!(
        names,
        vec![
            &Value::Text("alpha".to_string()),
            &Value::Text("beta".to_string())
        ]
    );
}

#[tokio::test]
async fn test_relation_size_function() {
    let server = setup_service("relation-size", "app").await;

    let store = server.registry.open("app").await.unwrap();
    let result = store
        .query("SELECT pg_total_relation_size('app')", &[])
        .await
        .unwrap();
    match &result.rows[0][0] {
        Value::Integer(size) => assert!(*size > 0),
        other => panic!("expected integer size, got {other:?}"),
    }

    let result = store
        .query("SELECT pg_total_relation_size('missing')", &[])
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], Value::Integer(-1));
}

#[tokio::test]
async fn test_regclass_cast_is_tolerated() {
    let server = setup_service("regclass", "app").await;
    let mut client = MockClient::new();

    SimpleQueryHandler::do_query(&server.service, &mut client, "CREATE TABLE t (x INTEGER)")
        .await
        .unwrap();
    let responses = SimpleQueryHandler::do_query(
        &server.service,
        &mut client,
        "SELECT pg_total_relation_size('app'::regclass)",
    )
    .await
    .unwrap();
    assert!(matches!(responses[0], Response::Query(_)));
}
