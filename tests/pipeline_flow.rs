// 🔄 End-to-end: HTTP source → pipeline → warehouse

use roastery_warehouse::batch::BatchStatus;
use roastery_warehouse::config::ReferenceConfig;
use roastery_warehouse::db::count_transactions;
use roastery_warehouse::{
    build_connector, get_recent_batches, get_unresolved_lines, get_watermark, open_database,
    replace_reference_data, retry_unresolved, run_with_retry, EtlError, Pipeline, ReferenceData,
    RetryPolicy, SkuMap, Source, WarehouseConfig,
};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ITEMS_CSV: &str = "\
zolo_id,product_name,variant_name,category_name,form,weight,profile_id,square_id,quickbooks_id,shopify_id
200,Latte,,Espresso Drinks,drink,,,SQ-LATTE,,
201,Drip Coffee,,Brewed,drink,,,,,
300,Ethiopia Guji,12oz,Whole Bean,whole_bean,0.75,10,,QB-GUJI,
";

const PROFILES_CSV: &str = "\
profile_id,profile_name,roast_level,single_origin,c1_origin,c1_process,c1_percent,c2_origin,c2_process,c2_percent,c3_origin,c3_procss,c3_percent
10,Guji,light,1,Ethiopia,washed,100,,,,,,
";

fn reference(dir: &Path, aliases: Option<&str>) -> ReferenceConfig {
    let items_csv = dir.join("items.csv");
    let profiles_csv = dir.join("profiles.csv");
    fs::write(&items_csv, ITEMS_CSV).unwrap();
    fs::write(&profiles_csv, PROFILES_CSV).unwrap();

    let aliases_csv = aliases.map(|content| {
        let path = dir.join("aliases.csv");
        fs::write(&path, content).unwrap();
        path
    });

    ReferenceConfig {
        items_csv,
        profiles_csv,
        aliases_csv,
    }
}

fn config(dir: &Path, server: &MockServer) -> WarehouseConfig {
    let mut config = WarehouseConfig::default();
    config.database.path = dir.join("warehouse.db");
    config.reference = reference(dir, None);
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    };

    config.sources.square.settings.enabled = true;
    config.sources.square.settings.base_url = Some(server.uri());
    config.sources.square.access_token = "sq-token".to_string();
    config.sources.square.location_id = "LOC1".to_string();

    config.sources.shopify.settings.enabled = true;
    config.sources.shopify.settings.base_url = Some(server.uri());
    config
}

fn payments() -> serde_json::Value {
    json!([
        {
            "id": "PAY-1",
            "created_at": "2024-05-01T09:30:00Z",
            "device": {"name": "Cafe"},
            "total_money": {"amount": 750},
            "itemizations": [
                {"name": "Latte", "quantity": "1.00000000", "item_detail": {"sku": "SQ-LATTE"}, "total_money": {"amount": 450}},
                {"name": "Drip Coffee", "quantity": "1.00000000", "total_money": {"amount": 300}}
            ]
        },
        {
            "id": "PAY-2",
            "created_at": "2024-05-01T10:05:00Z",
            "device": {"name": "Market Stand"},
            "total_money": {"amount": 325},
            "itemizations": [
                {"name": "Mystery Muffin", "quantity": "1", "total_money": {"amount": 325}}
            ]
        }
    ])
}

fn setup(config: &WarehouseConfig) -> Pipeline {
    let mut conn = open_database(&config.database.path).unwrap();
    let data = ReferenceData::load(&config.reference).unwrap();
    replace_reference_data(&mut conn, &data).unwrap();
    Pipeline::new(Arc::new(Mutex::new(conn)))
}

#[tokio::test]
async fn test_square_run_is_idempotent_and_quarantines_unknown_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/LOC1/payments"))
        .and(query_param("limit", "200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(payments()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), &server);
    let pipeline = setup(&config);
    let connector = build_connector(Source::Square, &config).unwrap();
    let settings = config.sources.settings(Source::Square);

    let first = run_with_retry(&pipeline, connector.as_ref(), settings, &config.retry)
        .await
        .unwrap();

    assert_eq!(first.counts.extracted, 2);
    assert_eq!(first.counts.inserted, 2);
    assert_eq!(first.counts.unresolved, 1);

    {
        let shared = pipeline.connection();
        let conn = shared.lock().unwrap();
        assert_eq!(count_transactions(&conn).unwrap(), 2);
        let pending = get_unresolved_lines(&conn, Some(Source::Square), 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].product_name.as_deref(), Some("Mystery Muffin"));
        assert_eq!(get_watermark(&conn, Source::Square).unwrap(), Some(first.window_end));
    }

    let second = run_with_retry(&pipeline, connector.as_ref(), settings, &config.retry)
        .await
        .unwrap();

    assert_eq!(second.counts.inserted, 0);
    assert_eq!(second.counts.unchanged, 2);
    assert!(second.window_start < first.window_end);

    // the catalog learns the muffin; the quarantined line moves over
    let shared = pipeline.connection();
    let mut conn = shared.lock().unwrap();
    let data = ReferenceData::load(&reference(dir.path(), Some("alias,zolo_id\nMystery Muffin,201\n"))).unwrap();
    replace_reference_data(&mut conn, &data).unwrap();

    let sku_map = SkuMap::from_db(&conn).unwrap();
    let summary = retry_unresolved(&mut conn, &sku_map).unwrap();

    assert_eq!(summary.resolved, 1);
    assert_eq!(count_transactions(&conn).unwrap(), 3);
    assert!(get_unresolved_lines(&conn, None, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_http_failure_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/LOC1/payments"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/LOC1/payments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(payments()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), &server);
    let pipeline = setup(&config);
    let connector = build_connector(Source::Square, &config).unwrap();

    let report = run_with_retry(
        &pipeline,
        connector.as_ref(),
        config.sources.settings(Source::Square),
        &config.retry,
    )
    .await
    .unwrap();

    assert_eq!(report.counts.inserted, 2);
}

#[tokio::test]
async fn test_persistent_outage_is_retried_once_per_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/LOC1/payments"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), &server);
    let pipeline = setup(&config);
    let connector = build_connector(Source::Square, &config).unwrap();

    let err = run_with_retry(
        &pipeline,
        connector.as_ref(),
        config.sources.settings(Source::Square),
        &config.retry,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EtlError::RetriesExhausted { attempts: 3, .. }));

    let shared = pipeline.connection();
    let conn = shared.lock().unwrap();
    let batches = get_recent_batches(&conn, Some(Source::Square), 10).unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].status, BatchStatus::Failed);
    drop(conn);

    server.verify().await;
}

#[tokio::test]
async fn test_short_extraction_fails_batch_and_keeps_watermark() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/admin/api/2024-01/orders/count.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 3})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/api/2024-01/orders.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"orders": [{"id": 1001}]})))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), &server);
    let pipeline = setup(&config);
    let connector = build_connector(Source::Shopify, &config).unwrap();

    let err = run_with_retry(
        &pipeline,
        connector.as_ref(),
        config.sources.settings(Source::Shopify),
        &config.retry,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EtlError::Reconciliation { origin: Source::Shopify, .. }));

    let shared = pipeline.connection();
    let conn = shared.lock().unwrap();
    assert_eq!(get_watermark(&conn, Source::Shopify).unwrap(), None);
    let batches = get_recent_batches(&conn, Some(Source::Shopify), 5).unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].status, BatchStatus::Failed);
}
