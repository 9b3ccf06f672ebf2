//! Integration tests for the device gateway: identity-driven check-in,
//! event upload with non-fatal validation, and inventory endpoints.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::{Extension, Router};
use fleetgate_core::db::Db;
use fleetgate_core::fs::{FsHandle, AKTOML_FILE, EVENTS_PREFIX, HW_INFO_FILE, NET_INFO_FILE};
use fleetgate_core::store::gateway::GatewayStore;
use fleetgate_core::store::operator::OperatorStore;
use fleetgate_daemon::gateway::{self, GatewayState, PeerIdentity};
use http_body_util::BodyExt;
use tower::ServiceExt;

const DEVICE_UUID: &str = "test-client-uuid";

struct TestClient {
    _dir: tempfile::TempDir,
    fs: FsHandle,
    gw: Arc<GatewayStore>,
    api: OperatorStore,
    app: Router,
}

impl TestClient {
    fn new() -> Self {
        Self::with_identity(PeerIdentity {
            uuid: DEVICE_UUID.to_string(),
            is_prod: false,
            pubkey_pem: "-----BEGIN PUBLIC KEY-----\nAA==\n-----END PUBLIC KEY-----\n"
                .to_string(),
        })
    }

    fn with_identity(identity: PeerIdentity) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsHandle::new(dir.path()).unwrap();
        let db = Db::open(&fs.config.db_file()).unwrap();
        let gw = Arc::new(GatewayStore::new(db.clone(), fs.clone()));
        let api = OperatorStore::new(db, fs.clone());
        // The TLS accept loop normally stamps the identity; tests inject
        // it the same way, as a connection-level extension.
        let app = gateway::router(GatewayState {
            store: Arc::clone(&gw),
        })
        .layer(Extension(identity));
        Self {
            _dir: dir,
            fs,
            gw,
            api,
            app,
        }
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<&str>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = match body {
            Some(content) => Body::from(content.to_string()),
            None => Body::empty(),
        };
        let res = self
            .app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }
}

#[tokio::test]
async fn first_contact_creates_device() {
    let tc = TestClient::new();
    let before = chrono::Utc::now().timestamp() - 1;

    let (status, body) = tc.request(Method::GET, "/device", None, &[]).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let device: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(device["uuid"], DEVICE_UUID);
    assert!(device["last-seen"].as_i64().unwrap() > before);

    assert!(tc.gw.device_get(DEVICE_UUID).unwrap().is_some());
}

#[tokio::test]
async fn check_in_headers_update_inventory() {
    let tc = TestClient::new();
    let headers = [
        ("x-ats-dockerapps", "a,b,c"),
        ("x-ats-ostreehash", "abcd"),
        ("x-ats-tags", "tag"),
        ("x-ats-target", "target"),
    ];
    let (status, body) = tc.request(Method::GET, "/device", None, &headers).await;
    assert_eq!(status, StatusCode::OK);
    let device: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(device["apps"], "a,b,c");
    assert_eq!(device["ostree-hash"], "abcd");
    assert_eq!(device["tag"], "tag");
    assert_eq!(device["target-name"], "target");

    // Partial update keeps the other fields.
    let partial = [("x-ats-dockerapps", "a,b,d"), ("x-ats-tags", "switch")];
    let (status, _) = tc.request(Method::GET, "/device", None, &partial).await;
    assert_eq!(status, StatusCode::OK);

    let stored = tc.gw.device_get(DEVICE_UUID).unwrap().unwrap();
    assert_eq!(stored.apps, "a,b,d");
    assert_eq!(stored.tag, "switch");
    assert_eq!(stored.ostree_hash, "abcd");
    assert_eq!(stored.target_name, "target");
}

#[tokio::test]
async fn deleted_device_is_refused() {
    let tc = TestClient::new();
    let (status, _) = tc.request(Method::GET, "/device", None, &[]).await;
    assert_eq!(status, StatusCode::OK);

    assert!(tc.api.device_delete(DEVICE_UUID).unwrap());
    let (status, body) = tc.request(Method::GET, "/device", None, &[]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("has been deleted"));
}

#[tokio::test]
async fn changed_pubkey_fails_loudly() {
    let tc = TestClient::new();
    let (status, _) = tc.request(Method::GET, "/device", None, &[]).await;
    assert_eq!(status, StatusCode::OK);

    // Same device, different key: rotation is not implemented.
    let tc2 = TestClient::with_identity(PeerIdentity {
        uuid: DEVICE_UUID.to_string(),
        is_prod: false,
        pubkey_pem: "-----BEGIN PUBLIC KEY-----\nAB==\n-----END PUBLIC KEY-----\n".to_string(),
    });
    // Recreate the original row in the fresh store, then present the new
    // key.
    tc2.gw
        .device_create(
            DEVICE_UUID,
            "-----BEGIN PUBLIC KEY-----\nAA==\n-----END PUBLIC KEY-----\n",
            false,
        )
        .unwrap();
    let (status, body) = tc2.request(Method::GET, "/device", None, &[]).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("rotation is not implemented"));
}

#[tokio::test]
async fn events_upload_buckets_and_sanitizes() {
    let tc = TestClient::new();

    let event_good_1 = r#"{"id":"dead","deviceTime":"2023-12-12T12:00:00Z","event":{"correlationId":"feed","ecu":"","targetName":"metam","version":"42"},"eventType":{"id":"satus","version":123}}"#;
    let event_good_2 = r#"{"id":"beaf","deviceTime":"2023-12-12T12:00:42Z","event":{"correlationId":"feed","ecu":"","targetName":"metam","version":"42"},"eventType":{"id":"finis","version":123}}"#;
    let event_bad_date = r#"{"id":"dodo","deviceTime":"omghf","event":{"correlationId":"feed","ecu":"","targetName":"metam","version":"42"},"eventType":{"id":"dies","version":123}}"#;
    let event_bad_id = r#"{"id":"","deviceTime":"2023-12-12T12:00:55Z","event":{"correlationId":"feed","ecu":"","targetName":"metam","version":"42"},"eventType":{"id":"fraus","version":123}}"#;
    let event_bad_corr = r#"{"id":"kiwi","deviceTime":"2023-12-12T12:00:55Z","event":{"correlationId":"","ecu":"","targetName":"metam","version":"42"},"eventType":{"id":"fraus","version":123}}"#;

    let good_batch = format!("[{event_good_1},{event_good_2}]");
    let bad_batch = format!("[{event_bad_date},{event_bad_id},{event_bad_corr}]");

    let (status, _) = tc
        .request(Method::POST, "/events", Some(&good_batch), &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = tc
        .request(Method::POST, "/events", Some(&bad_batch), &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = tc
        .request(Method::POST, "/events", Some("here we go"), &[])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let files = tc
        .fs
        .devices
        .list_files(DEVICE_UUID, EVENTS_PREFIX, true)
        .unwrap();
    assert_eq!(files, vec!["events-feed".to_string()]);

    let content = tc.fs.devices.read_file(DEVICE_UUID, "events-feed").unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], event_good_1);
    assert_eq!(lines[1], event_good_2);
    // The bad-date event survives with a rewritten deviceTime.
    let rewritten: fleetgate_core::events::DeviceUpdateEvent =
        serde_json::from_str(lines[2]).unwrap();
    assert_eq!(rewritten.id, "dodo");
    assert!(chrono::DateTime::parse_from_rfc3339(&rewritten.device_time).is_ok());
}

#[tokio::test]
async fn inventory_endpoints_validate_and_store_raw() {
    let tc = TestClient::new();

    let ak_info = "[config]\nkey=value";
    let hw_info = r#"{"key":"value"}"#;
    let nw_info = r#"{"hostname":"example.org"}"#;

    let (status, _) = tc
        .request(Method::PUT, "/system_info", Some(hw_info), &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = tc
        .request(Method::PUT, "/system_info", Some("{key=value}"), &[])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = tc
        .request(Method::PUT, "/system_info/config", Some(ak_info), &[])
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = tc
        .request(Method::PUT, "/system_info/network", Some(nw_info), &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = tc
        .request(
            Method::PUT,
            "/system_info/network",
            Some(r#"{"hostname":123}"#),
            &[],
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(tc.fs.devices.read_file(DEVICE_UUID, AKTOML_FILE).unwrap(), ak_info);
    assert_eq!(tc.fs.devices.read_file(DEVICE_UUID, HW_INFO_FILE).unwrap(), hw_info);
    assert_eq!(tc.fs.devices.read_file(DEVICE_UUID, NET_INFO_FILE).unwrap(), nw_info);
}

#[tokio::test]
async fn apps_states_validate_device_time() {
    let tc = TestClient::new();

    let (status, _) = tc
        .request(
            Method::POST,
            "/apps-states",
            Some(r#"{"deviceTime":"2025-09-12T10:00:00Z"}"#),
            &[],
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = tc
        .request(
            Method::POST,
            "/apps-states",
            Some(r#"{"deviceTime":"2025-09-12 10:00:00"}"#),
            &[],
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let states = tc
        .fs
        .devices
        .list_files(DEVICE_UUID, fleetgate_core::fs::STATES_PREFIX, true)
        .unwrap();
    assert_eq!(states.len(), 1);
    let content = tc.fs.devices.read_file(DEVICE_UUID, &states[0]).unwrap();
    assert_eq!(content, r#"{"deviceTime":"2025-09-12T10:00:00Z"}"#);
}

#[tokio::test]
async fn missing_identity_is_forbidden() {
    // A router without the connection-level identity extension behaves
    // like a connection that presented no client certificate.
    let dir = tempfile::tempdir().unwrap();
    let fs = FsHandle::new(dir.path()).unwrap();
    let db = Db::open(&fs.config.db_file()).unwrap();
    let app = gateway::router(GatewayState {
        store: Arc::new(GatewayStore::new(db, fs)),
    });

    let res = app
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/device")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}
