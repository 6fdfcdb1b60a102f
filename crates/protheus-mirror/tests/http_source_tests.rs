//! Integration tests for the ERP REST client using wiremock.

use chrono::{TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use protheus_mirror::source::{FetchScope, PageRequest};
use protheus_mirror::{ErpConfig, ErpSource, HttpErpSource, SourceError};

// =============================================================================
// Test Helpers
// =============================================================================

fn create_source(server: &MockServer) -> HttpErpSource {
    let mut config = ErpConfig::new(server.uri(), "admin", "s3cret");
    config.max_retries = 0;
    config.timeout_secs = 5;
    HttpErpSource::new(config).unwrap()
}

// =============================================================================
// Paging
// =============================================================================

#[tokio::test]
async fn test_fetch_page_parses_items() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tables/SA2010"))
        .and(query_param("page", "2"))
        .and(query_param("pageSize", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"R_E_C_N_O_": 51, "A2_NOME": "ACME"},
                {"R_E_C_N_O_": 52, "A2_NOME": "Globex"}
            ],
            "hasNext": true
        })))
        .mount(&server)
        .await;

    let source = create_source(&server);
    let page = source
        .fetch_page("SA2010", FetchScope::All, PageRequest::first(50).next())
        .await
        .unwrap();

    assert_eq!(page.items.len(), 2);
    assert!(page.has_next);
    assert_eq!(page.items[1]["A2_NOME"], "Globex");
}

#[tokio::test]
async fn test_fetch_page_sends_changed_since() {
    let server = MockServer::start().await;
    let since = Utc.with_ymd_and_hms(2024, 3, 15, 8, 30, 0).unwrap();

    Mock::given(method("GET"))
        .and(path("/tables/SA2010"))
        .and(query_param("changedSince", since.to_rfc3339().as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [], "hasNext": false})))
        .expect(1)
        .mount(&server)
        .await;

    let source = create_source(&server);
    let page = source
        .fetch_page("SA2010", FetchScope::ChangedSince(since), PageRequest::first(100))
        .await
        .unwrap();
    assert!(page.items.is_empty());
    assert!(!page.has_next);
}

#[tokio::test]
async fn test_basic_auth_header() {
    let server = MockServer::start().await;

    // base64("admin:s3cret")
    Mock::given(method("GET"))
        .and(path("/tables/SA2010"))
        .and(header("authorization", "Basic YWRtaW46czNjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [], "hasNext": false})))
        .expect(1)
        .mount(&server)
        .await;

    let source = create_source(&server);
    source
        .fetch_page("SA2010", FetchScope::All, PageRequest::first(10))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_describe_table_binary_fields() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tables/SA2010/structure"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "fields": [
                {"name": "A2_COD", "type": "C"},
                {"name": "A2_FOTO", "type": "M", "binary": true},
                {"name": "A2_ANEXO", "binary": true}
            ]
        })))
        .mount(&server)
        .await;

    let source = create_source(&server);
    let schema = source.describe_table("SA2010").await.unwrap();
    assert_eq!(schema.fields.len(), 3);
    assert_eq!(schema.binary_fields(), vec!["A2_ANEXO".to_string(), "A2_FOTO".to_string()]);
}

// =============================================================================
// Error Mapping
// =============================================================================

#[tokio::test]
async fn test_missing_table_maps_to_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tables/ZZ9010"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let source = create_source(&server);
    let err = source
        .fetch_page("ZZ9010", FetchScope::All, PageRequest::first(10))
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::TableNotFound { .. }));
}

#[tokio::test]
async fn test_server_error_is_connectivity() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tables/SA2010"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let source = create_source(&server);
    let err = source
        .fetch_page("SA2010", FetchScope::All, PageRequest::first(10))
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tables/SA2010"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tables/SA2010"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"R_E_C_N_O_": 1}],
            "hasNext": false
        })))
        .mount(&server)
        .await;

    let mut config = ErpConfig::new(server.uri(), "admin", "s3cret");
    config.max_retries = 2;
    config.retry_backoff_ms = 1;
    let source = HttpErpSource::new(config).unwrap();

    let page = source
        .fetch_page("SA2010", FetchScope::All, PageRequest::first(10))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn test_unauthorized() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tables/SA2010"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let source = create_source(&server);
    let err = source
        .fetch_page("SA2010", FetchScope::All, PageRequest::first(10))
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::AuthenticationFailed));
    assert!(!err.is_connectivity());
}

#[tokio::test]
async fn test_body_without_items_is_invalid() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tables/SA2010"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;

    let source = create_source(&server);
    let err = source
        .fetch_page("SA2010", FetchScope::All, PageRequest::first(10))
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::InvalidResponse { .. }));
}

#[tokio::test]
async fn test_unreachable_server_is_connectivity() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let mut config = ErpConfig::new(uri, "admin", "s3cret");
    config.max_retries = 0;
    config.connect_timeout_secs = 1;
    let source = HttpErpSource::new(config).unwrap();

    let err = source
        .fetch_page("SA2010", FetchScope::All, PageRequest::first(10))
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
}
