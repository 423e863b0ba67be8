//! The postgres driver must return what the memory driver returns for the
//! same data. Needs a live server: set `POLYQL_TEST_DATABASE_URL`, otherwise
//! the test is a no-op.

use polyql::ast::{FilterArray, Record, SortField};
use polyql::driver::postgres::PostgresConfig;
use polyql::driver::{Driver, DriverContext, DriverOptions, DriverQuery, MemoryDriver, PostgresDriver};
use serde_json::{json, Value};

const URL_VAR: &str = "POLYQL_TEST_DATABASE_URL";

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn dataset() -> Vec<Record> {
    vec![
        record(json!({"id": "e1", "name": "Ada", "age": 36, "team": "core", "tags": ["rust"]})),
        record(json!({"id": "e2", "name": "bob", "age": 22, "team": "web"})),
        record(json!({"id": "e3", "name": "Cyd", "age": 29, "team": "core", "lead": true})),
        record(json!({"id": "e4", "name": "Dee", "age": 51, "team": null})),
        record(json!({"id": "e5", "name": "eli", "age": 29, "team": "ops", "lead": false})),
        record(json!({"id": "e6", "name": "École", "age": 18, "tags": ["rust", "go"], "big": 9_007_199_254_740_993_u64})),
        record(json!({"id": "e7", "name": "ÉCOLE", "age": 40.5, "big": 9_007_199_254_740_992_u64})),
    ]
}

fn strip(rows: Vec<Record>) -> Vec<Record> {
    rows.into_iter()
        .map(|mut r| {
            r.remove("created_at");
            r.remove("updated_at");
            r
        })
        .collect()
}

#[tokio::test]
async fn postgres_matches_memory() {
    let Ok(url) = std::env::var(URL_VAR) else {
        eprintln!("{URL_VAR} not set, skipping");
        return;
    };
    let table = format!("polyql_eq_{}", uuid::Uuid::new_v4().simple());
    let ctx = DriverContext::default();

    let memory = MemoryDriver::new();
    memory.load(&table, dataset()).await.unwrap();
    let postgres =
        PostgresDriver::connect(&PostgresConfig::from_url(url.clone()), DriverOptions::default())
            .unwrap();
    for row in dataset() {
        postgres.create(&table, row, &ctx).await.unwrap();
    }

    let filters = [
        json!([]),
        json!([["age", ">", 25], "or", ["team", "=", "web"]]),
        json!([["team", "=", null]]),
        json!([["team", "!=", "core"], "and", ["age", "<", 40]]),
        json!([["name", "contains", "E"]]),
        json!([["name", "startswith", "a"], "or", ["name", "endswith", "I"]]),
        json!([["age", "between", [22, 29]]]),
        json!([["team", "in", ["ops", "web"]], "or", [["age", ">=", 50], "and", ["team", "nin", ["core"]]]]),
        // Case folding is ASCII only on every backend.
        json!([["name", "contains", "éco"]]),
        json!([["name", "startswith", "École"]]),
        json!([["name", "endswith", "OLE"]]),
        // Numeric path segments index arrays, negative ones from the end.
        json!([["tags.0", "=", "rust"]]),
        json!([["tags.-1", "=", "go"]]),
        json!([["tags.2", "=", null], "and", ["tags", "!=", null]]),
        // Integers beyond 2^53 compare exactly.
        json!([["big", "=", 9_007_199_254_740_992_u64]]),
        json!([["big", "in", [9_007_199_254_740_993_u64]]]),
        json!([["big", "=", 9_007_199_254_740_992.0]]),
    ];
    let mut outcome = Ok(());
    for filter in filters {
        let filters = FilterArray::from_value(&filter).unwrap();
        let query = DriverQuery {
            sort: vec![SortField::desc("age"), SortField::asc("id")],
            ..DriverQuery::filtered(filters.clone())
        };
        let a = strip(memory.find(&table, &query, &ctx).await.unwrap());
        let b = strip(postgres.find(&table, &query, &ctx).await.unwrap());
        if a != b {
            outcome = Err(format!("find diverged for {filter}: {a:?} vs {b:?}"));
            break;
        }
        let a = memory.count(&table, &filters, &ctx).await.unwrap();
        let b = postgres.count(&table, &filters, &ctx).await.unwrap();
        if a != b {
            outcome = Err(format!("count diverged for {filter}: {a} vs {b}"));
            break;
        }
    }

    let (client, connection) = tokio_postgres::connect(&url, tokio_postgres::NoTls)
        .await
        .unwrap();
    tokio::spawn(connection);
    client
        .batch_execute(&format!("DROP TABLE IF EXISTS \"{table}\""))
        .await
        .unwrap();
    postgres.disconnect().await.unwrap();

    if let Err(message) = outcome {
        panic!("{message}");
    }
}
