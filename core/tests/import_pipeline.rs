use std::path::Path;
use std::time::Duration;

use ingest_core::config::IngestConfig;
use ingest_core::identifier::{encode, project_uuid_to_id};
use ingest_core::ingestor::{ImportState, Ingestor};
use ingest_core::open::Opener;
use ingest_core::progress::ProgressRecord;
use ingest_core::resolver::GraphqlResolver;
use ingest_core::sink::Database;
use rusqlite::types::ValueRef;
use serde_json::{Map, Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROJECT_UUID: &str = "ff0150c6-b634-472a-81b2-ef2e0c01d224";

/// Reads every row of `table` as JSON objects, rowid included.
fn table_as_json(db_path: &Path, table: &str) -> Vec<Value> {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    let mut stmt = conn
        .prepare(&format!("SELECT rowid, * FROM \"{}\" ORDER BY rowid", table))
        .unwrap();
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let rows = stmt
        .query_map([], |row| {
            let mut object = Map::new();
            for (i, name) in names.iter().enumerate() {
                let value = match row.get_ref(i)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(n) => json!(n),
                    ValueRef::Real(f) => json!(f),
                    ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
                    ValueRef::Blob(_) => Value::Null,
                };
                object.insert(name.clone(), value);
            }
            Ok(Value::Object(object))
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

async fn serve_csv(server: &MockServer, file: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/files/{}", file)))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/files/{}", file)))
        .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"abc123\""))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_open_resolves_and_imports_typed_table() {
    let server = MockServer::start().await;
    let file_url = format!("{}/files/universities_final.csv", server.uri());
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "createFileDownloadUri": {
                    "ok": { "name": "universities_final.csv", "uri": file_url },
                    "err": null
                }
            }
        })))
        .mount(&server)
        .await;
    serve_csv(&server, "universities_final.csv", "a,b,c\n1,2,3").await;

    let dir = TempDir::new().unwrap();
    let mut config = IngestConfig {
        root_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    config.resolver.graphql_url = format!("{}/graphql", server.uri());
    let resolver = GraphqlResolver::from_config(&config).unwrap();
    let opener = Opener::new(config, resolver);

    let outcome = opener
        .open(
            &project_uuid_to_id(PROJECT_UUID),
            "universities_final.csv",
            "remember-me",
        )
        .await
        .unwrap();
    assert_eq!(outcome.table_name, "universities_5f_final_2e_csv");
    assert_eq!(outcome.resolved.etag.as_deref(), Some("\"abc123\""));

    let handle = outcome.import.unwrap();
    let states = handle.subscribe();
    let summary = handle.wait().await.unwrap();
    assert_eq!(*states.borrow(), ImportState::Complete);
    assert!(summary.schema_transformed);

    let db_path = dir.path().join(format!("{}.db", PROJECT_UUID));
    assert_eq!(
        table_as_json(&db_path, "universities_5f_final_2e_csv"),
        vec![json!({"rowid": 1, "a": 1, "b": 2, "c": 3})]
    );
}

#[tokio::test]
async fn test_mixed_column_is_left_as_text() {
    let server = MockServer::start().await;
    serve_csv(&server, "mixed.csv", "a\n1\nx\n2").await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("project.db");
    let db = Database::open(&db_path, 4).unwrap();
    let ingestor = Ingestor::new(db, &Default::default()).unwrap();

    let table = encode("mixed.csv");
    let summary = ingestor
        .import_url(&format!("{}/files/mixed.csv", server.uri()), &table)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(!summary.schema_transformed);
    assert_eq!(
        table_as_json(&db_path, &table),
        vec![
            json!({"rowid": 1, "a": "1"}),
            json!({"rowid": 2, "a": "x"}),
            json!({"rowid": 3, "a": "2"}),
        ]
    );
}

#[tokio::test]
async fn test_progress_is_monotonic_while_polling() {
    let server = MockServer::start().await;
    let mut body = String::from("id,value\n");
    for n in 0..5000 {
        body.push_str(&format!("{},{}.5\n", n, n));
    }
    serve_csv(&server, "big.csv", &body).await;

    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("project.db"), 2).unwrap();
    let mut processing = ingest_core::config::ProcessingConfig::default();
    processing.batch_size = 50;
    let ingestor = Ingestor::new(db, &processing).unwrap();

    let handle = ingestor
        .import_url(&format!("{}/files/big.csv", server.uri()), "big")
        .await
        .unwrap();

    let mut seen: Vec<ProgressRecord> = Vec::new();
    while !handle.is_finished() {
        if let Some(row) = ingestor.progress().latest_for_table("big").await.unwrap() {
            seen.push(row);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let summary = handle.wait().await.unwrap();
    let last = ingestor
        .progress()
        .latest_for_table("big")
        .await
        .unwrap()
        .unwrap();
    seen.push(last.clone());

    for pair in seen.windows(2) {
        assert!(pair[1].rows_done >= pair[0].rows_done);
        assert!(pair[1].bytes_done >= pair[0].bytes_done);
    }
    assert!(last.is_complete());
    assert_eq!(last.rows_done, 5000);
    assert_eq!(last.bytes_done, body.len() as u64);
    assert_eq!(last.bytes_todo, Some(body.len() as u64));
    assert_eq!(summary.metrics.batches_written, 100);
}

#[tokio::test]
async fn test_failed_download_leaves_progress_incomplete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/gone.csv"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("project.db"), 4).unwrap();
    let ingestor = Ingestor::new(db, &Default::default()).unwrap();

    let handle = ingestor
        .import_url(&format!("{}/files/gone.csv", server.uri()), "gone")
        .await
        .unwrap();
    let task_id = handle.task_id().to_string();
    let err = handle.wait().await.unwrap_err();
    assert!(err.is_retryable());

    let row = ingestor.progress().get(&task_id).await.unwrap().unwrap();
    assert!(!row.is_complete());
    assert_eq!(row.rows_done, 0);
    assert!(!ingestor.database().table_exists("gone").await.unwrap());
}
