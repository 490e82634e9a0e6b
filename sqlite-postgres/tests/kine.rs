mod common;

use common::*;
use pgwire::api::query::SimpleQueryHandler;
use pgwire::api::results::Response;
use rusqlite::types::Value;

/// The statements kine sends at startup, in order. The schema and index
/// statements are substituted wholesale, so the exact postgres-flavored
/// text only needs to carry the right fingerprint.
#[tokio::test]
async fn test_kine_bootstrap_sequence() {
    let server = setup_service("kine-bootstrap", "kubernetes").await;
    let mut client = MockClient::new();

    let create = "CREATE TABLE IF NOT EXISTS kine (\
        id SERIAL PRIMARY KEY, name VARCHAR(630), created INTEGER, deleted INTEGER, \
        create_revision INTEGER, prev_revision INTEGER, lease INTEGER, \
        value bytea, old_value bytea)";
    SimpleQueryHandler::do_query(&server.service, &mut client, create)
        .await
        .unwrap();

    let index = "CREATE INDEX IF NOT EXISTS kine_list_query_index ON kine (name, id DESC)";
    SimpleQueryHandler::do_query(&server.service, &mut client, index)
        .await
        .unwrap();

    // the substituted schema exists in the engine
    let store = server.registry.open("kubernetes").await.unwrap();
    let result = store
        .query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'kine'",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
}

#[tokio::test]
async fn test_kine_insert_and_list() {
    let server = setup_service("kine-list", "kubernetes").await;
    let mut client = MockClient::new();

    SimpleQueryHandler::do_query(
        &server.service,
        &mut client,
        "CREATE TABLE IF NOT EXISTS kine (id SERIAL PRIMARY KEY, name VARCHAR(630))",
    )
    .await
    .unwrap();

    let store = server.registry.open("kubernetes").await.unwrap();
    for (id, name, deleted) in [(1, "/registry/pods/a", 0), (2, "/registry/pods/b", 0)] {
        store
            .exec(
                "INSERT INTO kine (id, name, created, deleted, create_revision, prev_revision, lease, value, old_value) \
                 VALUES ($1, $2, 1, $3, 0, 0, 0, x'00', x'00')",
                &[
                    Value::Integer(id),
                    Value::Text(name.to_string()),
                    Value::Integer(deleted),
                ],
            )
            .await
            .unwrap();
    }

    // a list-current query by fingerprint, bound server-side
    let list = "SELECT kv.id FROM kine AS kv JOIN \
        (SELECT MAX(mkv.id) AS id FROM kine AS mkv WHERE mkv.name LIKE $1 GROUP BY mkv.name) AS maxkv \
        ON maxkv.id = kv.id";
    let rewritten = sqlite_postgres::sql::rewrite(list);
    let result = store
        .query(&rewritten, &[Value::Text("/registry/pods/%".to_string())])
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 2);

    // compact removes superseded revisions without touching the marker key
    let compact = "DELETE FROM kine AS kv WHERE kv.name != 'compact_rev_key' AND kv.prev_revision != 0 AND kv.id <= $1";
    let rewritten = sqlite_postgres::sql::rewrite(compact);
    store
        .exec(&rewritten, &[Value::Integer(100)])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_kine_index_triggers_checkpoint() {
    let server = setup_service("kine-checkpoint", "kubernetes").await;
    let mut client = MockClient::new();

    SimpleQueryHandler::do_query(
        &server.service,
        &mut client,
        "CREATE TABLE IF NOT EXISTS kine (id SERIAL PRIMARY KEY)",
    )
    .await
    .unwrap();

    let responses = SimpleQueryHandler::do_query(
        &server.service,
        &mut client,
        "CREATE INDEX IF NOT EXISTS kine_list_query_index ON kine (name, id DESC)",
    )
    .await
    .unwrap();
    // the checkpoint pragma completes as a plain command
    assert!(matches!(responses[0], Response::Execution(_)));
}
